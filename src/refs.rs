//! Reference tracking (§4.4): acquire/release bookkeeping and the
//! interactions it has with spin locks and tail calls.

use crate::error::RejectReason;
use crate::frame::AcquiredRef;
use crate::reg::RegKind;
use crate::vstate::VerifierState;

/// Record a freshly acquired reference in the current frame (§4.4 item 1),
/// called after a helper whose prototype returns `AcquiredSocketOrNull`.
/// Rejects if already inside a locked region (§4.4 item 3 / §7 Reference).
pub fn acquire(state: &mut VerifierState, id: u32, alloc_insn: usize) -> Result<(), RejectReason> {
    if state.active_spin_lock != 0 {
        return Err(RejectReason::AcquireInsideLockedRegion);
    }
    state.curframe_mut().refs.push(AcquiredRef { id, alloc_insn });
    Ok(())
}

/// Release a previously acquired reference by id (§4.4 item 2), called by
/// the release-helper's argument-checking path. The reference may have been
/// acquired in any live frame (§4.4: refs are shared up the call chain), so
/// every frame is searched.
pub fn release(state: &mut VerifierState, id: u32) -> Result<(), RejectReason> {
    for frame in state.frames_mut().iter_mut() {
        if frame.release(id) {
            return Ok(());
        }
    }
    Err(RejectReason::ReleaseOfUnacquiredReference(id))
}

/// Split a nullable reference-typed register at a null check: the not-null
/// branch keeps the same provenance id under its non-null kind, the
/// null branch is left untouched by the caller (it simply never releases).
pub fn narrow_on_null_check(kind: RegKind) -> RegKind {
    kind.narrow_not_null()
}

/// Every outstanding reference must be released before `exit`, before a
/// tail call, and before `ld_abs`/`ld_ind` (§4.4 item 4 and §4.6 tail_call
/// notes): this checks the current frame only, since exit/tail_call/ld_*
/// can only occur in the entry frame's flow of control at that instant.
pub fn require_no_outstanding_refs(state: &VerifierState) -> Result<(), RejectReason> {
    if let Some(r) = state.curframe().refs.first() {
        return Err(RejectReason::UnreleasedReference { id: r.id, alloc_insn: r.alloc_insn });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_round_trips() {
        let mut state = VerifierState::entry();
        acquire(&mut state, 1, 3).unwrap();
        assert!(require_no_outstanding_refs(&state).is_err());
        release(&mut state, 1).unwrap();
        assert!(require_no_outstanding_refs(&state).is_ok());
    }

    #[test]
    fn acquire_while_locked_is_rejected() {
        let mut state = VerifierState::entry();
        state.active_spin_lock = 5;
        assert!(acquire(&mut state, 1, 0).is_err());
    }

    #[test]
    fn release_of_unknown_id_is_rejected() {
        let mut state = VerifierState::entry();
        assert!(release(&mut state, 42).is_err());
    }

    #[test]
    fn release_searches_every_live_frame() {
        let mut state = VerifierState::entry();
        acquire(&mut state, 1, 0).unwrap();
        state.push_frame(5).unwrap();
        // refs are shared with the callee frame (see vstate::push_frame).
        release(&mut state, 1).unwrap();
    }
}
