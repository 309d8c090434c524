//! A reference implementation of the three consumed interfaces (§6), used
//! by tests and the CLI. A real embedder supplies its own catalogs derived
//! from its kernel/runtime build instead of this one.

use std::collections::HashMap;

use crate::helpers::{ArgKind, HelperCatalog, HelperProto, RetKind};
use crate::maps::{MapCatalog, MapDef};
use crate::progtype::{ProgramType, ProgramTypeOracle};

/// A small, in-memory environment: a fixed helper catalog, a caller-supplied
/// map table, and a permissive-by-default program-type oracle.
pub struct ReferenceEnvironment {
    pub program_type: ProgramType,
    pub maps: HashMap<u32, MapDef>,
    ctx_size: i32,
}

impl ReferenceEnvironment {
    pub fn new(program_type: ProgramType, ctx_size: i32) -> Self {
        ReferenceEnvironment { program_type, maps: HashMap::new(), ctx_size }
    }

    /// Registers a map the same way [`with_map`](Self::with_map) does, plus
    /// a spin-lock offset.
    pub fn with_locked_map(mut self, mut def: MapDef, spin_lock_off: i32) -> Self {
        def.spin_lock_off = Some(spin_lock_off);
        self.maps.insert(def.id, def);
        self
    }

    pub fn with_map(mut self, def: MapDef) -> Self {
        self.maps.insert(def.id, def);
        self
    }
}

impl HelperCatalog for ReferenceEnvironment {
    fn proto(&self, func_id: u32) -> Option<HelperProto> {
        use crate::helpers::ids::*;
        let proto = match func_id {
            MAP_LOOKUP_ELEM => HelperProto {
                ret: RetKind::MapValueOrNull,
                args: [ArgKind::MapPtr, ArgKind::MapKeyPtr, ArgKind::None, ArgKind::None, ArgKind::None],
                changes_pkt_data: false,
                pkt_access: false,
                gpl_only: false,
            },
            MAP_UPDATE_ELEM => HelperProto {
                ret: RetKind::Scalar,
                args: [ArgKind::MapPtr, ArgKind::MapKeyPtr, ArgKind::MapValuePtr, ArgKind::AnyScalar, ArgKind::None],
                changes_pkt_data: false,
                pkt_access: false,
                gpl_only: false,
            },
            MAP_DELETE_ELEM => HelperProto {
                ret: RetKind::Scalar,
                args: [ArgKind::MapPtr, ArgKind::MapKeyPtr, ArgKind::None, ArgKind::None, ArgKind::None],
                changes_pkt_data: false,
                pkt_access: false,
                gpl_only: false,
            },
            TAIL_CALL => HelperProto {
                ret: RetKind::Scalar,
                args: [ArgKind::Exact(crate::helpers::RegKindFamily::Ctx), ArgKind::MapPtr, ArgKind::AnyScalar, ArgKind::None, ArgKind::None],
                changes_pkt_data: false,
                pkt_access: false,
                gpl_only: false,
            },
            SK_LOOKUP_TCP | SK_LOOKUP_UDP => HelperProto {
                ret: RetKind::AcquiredSocketOrNull,
                args: [
                    ArgKind::Exact(crate::helpers::RegKindFamily::Ctx),
                    ArgKind::MemPtr,
                    ArgKind::ConstSize,
                    ArgKind::AnyScalar,
                    ArgKind::AnyScalar,
                ],
                changes_pkt_data: false,
                pkt_access: false,
                gpl_only: true,
            },
            SK_RELEASE => HelperProto {
                ret: RetKind::Scalar,
                args: [ArgKind::ReleasableRef, ArgKind::None, ArgKind::None, ArgKind::None, ArgKind::None],
                changes_pkt_data: false,
                pkt_access: false,
                gpl_only: true,
            },
            SPIN_LOCK | SPIN_UNLOCK => HelperProto {
                ret: RetKind::Scalar,
                args: [ArgKind::MemPtr, ArgKind::None, ArgKind::None, ArgKind::None, ArgKind::None],
                changes_pkt_data: false,
                pkt_access: false,
                gpl_only: false,
            },
            _ => return None,
        };
        Some(proto)
    }
}

impl MapCatalog for ReferenceEnvironment {
    fn lookup(&self, map_id: u32) -> Option<MapDef> {
        self.maps.get(&map_id).copied()
    }
}

impl ProgramTypeOracle for ReferenceEnvironment {
    fn program_type(&self) -> ProgramType {
        self.program_type
    }

    fn ctx_field_is_readable(&self, offset: i32, size: i32) -> bool {
        offset >= 0 && offset + size <= self.ctx_size
    }

    fn helper_is_permitted(&self, func_id: u32) -> bool {
        self.proto(func_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::MapType;

    #[test]
    fn map_lookup_has_a_prototype() {
        let env = ReferenceEnvironment::new(ProgramType::SchedCls, 16);
        assert!(env.proto(crate::helpers::ids::MAP_LOOKUP_ELEM).is_some());
        assert!(env.proto(0xdead).is_none());
    }

    #[test]
    fn ctx_access_is_gated_by_ctx_size() {
        let env = ReferenceEnvironment::new(ProgramType::SchedCls, 16);
        assert!(env.ctx_field_is_readable(8, 4));
        assert!(!env.ctx_field_is_readable(16, 4));
    }

    #[test]
    fn with_map_registers_a_lookup() {
        let env = ReferenceEnvironment::new(ProgramType::SchedCls, 16).with_map(MapDef {
            id: 1,
            map_type: MapType::Hash,
            key_size: 4,
            value_size: 8,
            max_entries: 1024,
            spin_lock_off: None,
        });
        assert_eq!(env.lookup(1).unwrap().value_size, 8);
    }
}
