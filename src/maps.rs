//! Map metadata and the map/helper compatibility table (§4.6a).

use crate::error::RejectReason;
use crate::helpers::ids;

/// The map type, insofar as the verifier needs to distinguish them at all:
/// a handful of helpers are only meaningful against specific map types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
pub enum MapType {
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    StackTrace,
    SockMap,
    SockHash,
}

/// Metadata about one map handle a program references, exactly the fields
/// named in §6 Input: "Array of map handles ... each carrying its key size,
/// value size, max entries, and map type".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapDef {
    pub id: u32,
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    /// Byte offset of the embedded `bpf_spin_lock` within a value, if the map
    /// declares one (§6 Map interface: `spin_lock_off`). Direct `ldx`/`stx`
    /// access to this 4-byte sub-region is always rejected (§4.2 item 6).
    pub spin_lock_off: Option<i32>,
}

/// The external map catalog (§6): resolves a `PSEUDO_MAP_FD`/`PSEUDO_MAP_VALUE`
/// immediate to the map it names.
pub trait MapCatalog {
    fn lookup(&self, map_id: u32) -> Option<MapDef>;

    /// The direct-lookup code sequence this map type's backend can inline in
    /// place of a `call map_lookup_elem` (§4.9 step 7), or `None` when this
    /// catalog has no such generator for the map (the common case — most map
    /// types are looked up through the helper call, not inlined).
    fn direct_lookup_code(&self, _map_id: u32) -> Option<Vec<crate::insn::RawInsn>> {
        None
    }
}

/// Check that `helper_id` is compatible with `map_type` (§4.6a). Only
/// helpers with a documented map-type restriction are listed; anything else
/// is compatible with every map type.
pub fn check_map_helper_compat(helper_id: u32, map_type: MapType) -> Result<(), RejectReason> {
    let restriction: Option<&[MapType]> = match helper_id {
        ids::TAIL_CALL => Some(&[MapType::ProgArray]),
        ids::SK_LOOKUP_TCP | ids::SK_LOOKUP_UDP => Some(&[MapType::SockMap, MapType::SockHash]),
        _ => None,
    };
    match restriction {
        Some(allowed) if !allowed.contains(&map_type) => Err(RejectReason::IncompatibleMapAndHelper),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_call_requires_prog_array() {
        assert!(check_map_helper_compat(ids::TAIL_CALL, MapType::ProgArray).is_ok());
        assert!(check_map_helper_compat(ids::TAIL_CALL, MapType::Hash).is_err());
    }

    #[test]
    fn unrestricted_helper_allows_any_map() {
        assert!(check_map_helper_compat(ids::MAP_LOOKUP_ELEM, MapType::Hash).is_ok());
        assert!(check_map_helper_compat(ids::MAP_LOOKUP_ELEM, MapType::StackTrace).is_ok());
    }
}
