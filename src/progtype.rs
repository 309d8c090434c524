//! Program type: gates which context-field accesses, helper calls, and
//! return-value conventions are legal (§6 "program-type oracle").

use crate::error::RejectReason;
use crate::helpers::HelperProto;

/// The program type the loader declared this program as. Each type owns a
/// distinct context layout and a distinct subset of the helper catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter)]
pub enum ProgramType {
    SocketFilter,
    Xdp,
    SchedCls,
    SockOps,
    Tracepoint,
}

impl ProgramType {
    /// `true` iff this program type runs unprivileged, i.e. pointer
    /// leak/comparison rules (§4.3, §7 Leakage) are enforced at their
    /// strictest.
    pub fn is_unprivileged(self) -> bool {
        matches!(self, ProgramType::SocketFilter)
    }
}

/// The narrow, out-of-scope-in-detail interface §6 calls the "program type
/// oracle": what a program of this type may read from its context and which
/// helper it is entitled to call.
pub trait ProgramTypeOracle {
    fn program_type(&self) -> ProgramType;

    /// `true` iff `offset` (byte offset into the context struct, `size`
    /// bytes wide) is a legal, readable field for this program type.
    fn ctx_field_is_readable(&self, offset: i32, size: i32) -> bool;

    /// `true` iff `func_id` is in this program type's permitted helper set.
    fn helper_is_permitted(&self, func_id: u32) -> bool;

    /// The concrete-structure expansion a `ctx`/`sock*` access at `offset`
    /// lowers to (§4.9 step 3), or `None` when this program type's context
    /// is already a flat, directly-addressable layout that needs no
    /// lowering. The default is the latter; a real embedder with a layered
    /// context (e.g. `__sk_buff` fields backed by `sk_buff`) overrides this
    /// with its own field-to-offset generator.
    fn ctx_convert(&self, _offset: i32, _size: i32, _is_store: bool) -> Option<Vec<crate::insn::RawInsn>> {
        None
    }
}

/// Validate a context access against the oracle (§4.2 item 2 / §6).
pub fn check_ctx_access(
    oracle: &dyn ProgramTypeOracle,
    reg: u8,
    offset: i32,
    size: i32,
) -> Result<(), RejectReason> {
    if oracle.ctx_field_is_readable(offset, size) {
        Ok(())
    } else {
        Err(RejectReason::OffsetOutOfRange { reg, off: offset as i64, kind: "ctx" })
    }
}

/// Validate a helper call is permitted for this program type and, if the
/// prototype is GPL-only, that the caller declared GPL compatibility
/// (§4.6 item 5 / §7 Policy).
pub fn check_helper_permitted(
    oracle: &dyn ProgramTypeOracle,
    func_id: u32,
    proto: &HelperProto,
    prog_is_gpl: bool,
) -> Result<(), RejectReason> {
    if !oracle.helper_is_permitted(func_id) {
        return Err(RejectReason::MalformedInstruction);
    }
    if proto.gpl_only && !prog_is_gpl {
        return Err(RejectReason::GplIncompatibleCall);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::RetKind;

    struct Fake;
    impl ProgramTypeOracle for Fake {
        fn program_type(&self) -> ProgramType {
            ProgramType::Xdp
        }
        fn ctx_field_is_readable(&self, offset: i32, _size: i32) -> bool {
            offset == 0
        }
        fn helper_is_permitted(&self, func_id: u32) -> bool {
            func_id == 1
        }
    }

    #[test]
    fn ctx_field_gate() {
        assert!(check_ctx_access(&Fake, 1, 0, 4).is_ok());
        assert!(check_ctx_access(&Fake, 1, 8, 4).is_err());
    }

    #[test]
    fn gpl_only_helper_rejected_for_non_gpl_program() {
        let proto = HelperProto {
            ret: RetKind::Scalar,
            args: [crate::helpers::ArgKind::None; 5],
            changes_pkt_data: false,
            pkt_access: false,
            gpl_only: true,
        };
        assert!(check_helper_permitted(&Fake, 1, &proto, false).is_err());
        assert!(check_helper_permitted(&Fake, 1, &proto, true).is_ok());
    }
}
