//! Pointer arithmetic discipline and speculative-execution sanitization
//! (§4.3): mixed-sign rejection, the CVE-2018-3639 masking sequence, and the
//! speculative successor-state push on every conditional branch.

use crate::error::RejectReason;
use crate::reg::{Register, RegKind};
use crate::scalar::Scalar;

/// Result of adding a scalar offset to a pointer register: the new fixed
/// and variable offsets, plus (when the offset's sign could not be proven)
/// the alu_limit mask the rewrite pass must apply at runtime (§4.3 item 3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerAdd {
    pub fixed_off: i32,
    pub var_off_delta: Scalar,
    pub needs_speculative_mask: bool,
}

/// Add a scalar to a pointer register (§4.3 items 1-3):
/// - the pointer's kind must allow arithmetic at all;
/// - a constant offset folds directly into `fixed_off`;
/// - a variable offset whose sign straddles zero is rejected outright: the
///   masking window below is only defined once the sign is pinned down;
/// - otherwise a variable offset that may be negative triggers the masking
///   sequence instead of being rejected outright, mirroring the upstream
///   "rewrite a safety mask instead of failing the build" fix for
///   CVE-2018-3639.
pub fn add_offset(reg_idx: u8, kind: &RegKind, scalar: Scalar) -> Result<PointerAdd, RejectReason> {
    if !kind.allows_arithmetic() {
        return Err(RejectReason::ArithmeticOnDisallowedKind(reg_idx));
    }
    if let Some(c) = scalar.as_const() {
        return Ok(PointerAdd {
            fixed_off: c as i32,
            var_off_delta: Scalar::constant(0),
            needs_speculative_mask: false,
        });
    }
    if reject_mixed_sign_offset(&scalar) {
        return Err(RejectReason::ArithmeticOnDisallowedKind(reg_idx));
    }
    // Variable offset: sound as long as its sign is provably non-negative
    // (a negative offset could walk the pointer out of its region in a way
    // the bounds check below can't see coming). Anything else needs the
    // runtime mask.
    let needs_mask = scalar.bounds.may_be_negative();
    Ok(PointerAdd { fixed_off: 0, var_off_delta: scalar, needs_speculative_mask: needs_mask })
}

/// `true` iff a scalar's sign cannot be pinned to one direction (its bounds
/// straddle zero): the masking sequence in §4.3 picks a single `mask_to_left`
/// direction, so a value that could be either sign has no safe window.
pub fn reject_mixed_sign_offset(scalar: &Scalar) -> bool {
    scalar.bounds.smin < 0 && scalar.bounds.smax >= 0
}

/// 32-bit ALU ops are never legal on a pointer value (§4.3 item 2, §7 Type).
pub fn reject_if_32bit(reg_idx: u8, is64: bool, kind: &RegKind) -> Result<(), RejectReason> {
    if !is64 && kind.is_pointer() {
        return Err(RejectReason::ThirtyTwoBitPointerArithmetic(reg_idx));
    }
    Ok(())
}

/// Comparing two pointers is only defined when they share a kind and a
/// frame (same stack frame, or the same provenance id for map-value /
/// packet kinds); otherwise it's always a reject regardless of program
/// privilege (§4.3 item 5, §7 Type).
pub fn check_pointer_comparison(a: &Register, b: &Register) -> Result<(), RejectReason> {
    let comparable = match (&a.kind, &b.kind) {
        (RegKind::Stack, RegKind::Stack) => a.frame_no == b.frame_no,
        (RegKind::Scalar, _) | (_, RegKind::Scalar) => true,
        (ka, kb) if ka == kb => a.id == b.id,
        _ => false,
    };
    if comparable {
        Ok(())
    } else {
        Err(RejectReason::PointerComparisonDisallowed)
    }
}

/// Unprivileged programs may not compare two pointer values at all, even
/// same-kind ones (§4.3 item 5 continued / §7 Leakage): only scalar-vs-scalar
/// and scalar-vs-pointer null checks are allowed.
pub fn check_unprivileged_pointer_comparison(
    a: &Register,
    b: &Register,
    is_unprivileged: bool,
) -> Result<(), RejectReason> {
    if is_unprivileged && a.kind.is_pointer() && b.kind.is_pointer() {
        return Err(RejectReason::UnprivilegedPointerComparison);
    }
    Ok(())
}

/// `true` iff a conditional jump on a pointer-derived, not-provably-const
/// condition must fork a speculative successor state in addition to the two
/// architectural branches (§4.3 item 6: the verifier must explore the
/// mispredicted path too, since real CPUs do).
pub fn needs_speculative_fork(cond_is_pointer_derived: bool, cond_is_const: bool) -> bool {
    cond_is_pointer_derived && !cond_is_const
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Bounds;
    use crate::tnum::Tnum;

    fn ptr(kind: RegKind, frame_no: usize, id: u32) -> Register {
        Register {
            kind,
            fixed_off: 0,
            var_off: Tnum::constant(0),
            bounds: Bounds::constant(0),
            range: 0,
            id,
            frame_no,
            live: Default::default(),
        }
    }

    #[test]
    fn constant_offset_folds_into_fixed_off() {
        let add = add_offset(1, &RegKind::Stack, Scalar::constant(8)).unwrap();
        assert_eq!(add.fixed_off, 8);
        assert!(!add.needs_speculative_mask);
    }

    #[test]
    fn arithmetic_on_ctx_is_rejected() {
        assert!(add_offset(1, &RegKind::Ctx, Scalar::constant(8)).is_err());
    }

    #[test]
    fn negative_capable_variable_offset_needs_masking() {
        use crate::bounds::Bounds;
        use crate::tnum::Tnum;
        // Sign-known-negative but otherwise unbounded: not mixed-sign, so it
        // takes the masking path rather than being rejected outright.
        let s = Scalar { tnum: Tnum::UNKNOWN, bounds: Bounds { smin: i64::MIN, smax: -1, umin: 0, umax: u64::MAX } };
        let add = add_offset(1, &RegKind::Packet, s).unwrap();
        assert!(add.needs_speculative_mask);
    }

    #[test]
    fn mixed_sign_variable_offset_is_rejected() {
        let s = Scalar::unknown();
        assert!(s.bounds.smin < 0 && s.bounds.smax >= 0);
        assert!(add_offset(1, &RegKind::Packet, s).is_err());
    }

    #[test]
    fn same_frame_stack_pointers_are_comparable() {
        let a = ptr(RegKind::Stack, 0, 0);
        let b = ptr(RegKind::Stack, 0, 0);
        assert!(check_pointer_comparison(&a, &b).is_ok());
        let c = ptr(RegKind::Stack, 1, 0);
        assert!(check_pointer_comparison(&a, &c).is_err());
    }

    #[test]
    fn unprivileged_programs_cannot_compare_two_pointers() {
        let a = ptr(RegKind::MapValue { map_id: 1 }, 0, 5);
        let b = ptr(RegKind::MapValue { map_id: 1 }, 0, 5);
        assert!(check_unprivileged_pointer_comparison(&a, &b, true).is_err());
        assert!(check_unprivileged_pointer_comparison(&a, &b, false).is_ok());
    }

    #[test]
    fn thirty_two_bit_pointer_arithmetic_rejected() {
        assert!(reject_if_32bit(1, false, &RegKind::Stack).is_err());
        assert!(reject_if_32bit(1, true, &RegKind::Stack).is_ok());
        assert!(reject_if_32bit(1, false, &RegKind::Scalar).is_ok());
    }
}
