//! Verifier state: the full path-sensitive snapshot the explorer threads
//! through `do_check` (§3 "Verifier state", §9 design note on the parent
//! link).

use std::rc::Rc;

use crate::frame::CallFrame;

/// One path-sensitive snapshot of the whole machine: every live call frame,
/// the active spin-lock id, and whether this path is under speculative
/// execution (reached only via a predicted-mispredicted branch).
///
/// `parent` is a DAG of *immutable* snapshots used purely for liveness
/// propagation (§4.8) — never the mutable state currently being
/// interpreted. Per §9's design note, the explorer must snapshot (not
/// alias) the current state before it becomes someone's parent.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierState {
    frames: Vec<CallFrame>,
    pub parent: Option<Rc<VerifierState>>,
    pub active_spin_lock: u32,
    pub speculative: bool,
    pub insn_idx: usize,
}

impl VerifierState {
    /// The initial state: one frame, R1 will be set to `ctx` by the caller.
    pub fn entry() -> Self {
        VerifierState {
            frames: vec![CallFrame::new(0, None)],
            parent: None,
            active_spin_lock: 0,
            speculative: false,
            insn_idx: 0,
        }
    }

    pub fn curframe_idx(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn curframe(&self) -> &CallFrame {
        self.frames.last().expect("at least one frame always present")
    }

    pub fn curframe_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("at least one frame always present")
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [CallFrame] {
        &mut self.frames
    }

    pub fn frame(&self, idx: usize) -> Option<&CallFrame> {
        self.frames.get(idx)
    }

    pub fn frame_mut(&mut self, idx: usize) -> Option<&mut CallFrame> {
        self.frames.get_mut(idx)
    }

    /// Push a new call frame, inheriting the outstanding reference list
    /// (§4.4: "Call/return copy the `refs` list to the callee").
    pub fn push_frame(&mut self, callsite: usize) -> Result<(), crate::error::RejectReason> {
        if self.frames.len() >= crate::types::MAX_CALL_FRAMES {
            return Err(crate::error::RejectReason::CallStackTooDeep);
        }
        let refs = self.curframe().refs.clone();
        let mut frame = CallFrame::new(self.frames.len(), Some(callsite));
        frame.refs = refs;
        self.frames.push(frame);
        Ok(())
    }

    /// Pop the current call frame on return, copying its (possibly
    /// updated) reference list back to the caller.
    pub fn pop_frame(&mut self) -> Option<CallFrame> {
        if self.frames.len() <= 1 {
            return None;
        }
        let popped = self.frames.pop().unwrap();
        self.curframe_mut().refs = popped.refs.clone();
        Some(popped)
    }

    /// Total outstanding acquired references across every live frame.
    pub fn total_outstanding_refs(&self) -> usize {
        self.curframe().refs.len()
    }

    /// Snapshot this state as an `Rc`, suitable to become a `parent` link or
    /// a branch-stack entry; deep-copies every frame.
    pub fn snapshot(&self) -> Rc<VerifierState> {
        Rc::new(self.clone())
    }

    /// Fork a child state whose parent is an immutable snapshot of `self`
    /// as it stands right now (§9: parent must be a value-stable snapshot).
    pub fn fork_child(&self) -> VerifierState {
        let mut child = self.clone();
        child.parent = Some(self.snapshot());
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_frame_round_trips_refs() {
        let mut state = VerifierState::entry();
        state.curframe_mut().refs.push(crate::frame::AcquiredRef { id: 7, alloc_insn: 3 });
        state.push_frame(10).unwrap();
        assert_eq!(state.curframe().refs.len(), 1, "refs are shared with the callee");
        state.curframe_mut().refs.push(crate::frame::AcquiredRef { id: 8, alloc_insn: 11 });
        let popped = state.pop_frame().unwrap();
        assert_eq!(popped.refs.len(), 2);
        assert_eq!(state.curframe().refs.len(), 2, "refs copied back to the caller");
    }

    #[test]
    fn call_stack_too_deep_is_rejected() {
        let mut state = VerifierState::entry();
        for i in 0..7 {
            state.push_frame(i).unwrap();
        }
        assert!(state.push_frame(100).is_err());
    }

    #[test]
    fn fork_child_parent_is_a_frozen_snapshot() {
        let mut state = VerifierState::entry();
        let child = state.fork_child();
        state.active_spin_lock = 42;
        assert_eq!(child.parent.as_ref().unwrap().active_spin_lock, 0);
        assert_ne!(child.parent.as_ref().unwrap().active_spin_lock, state.active_spin_lock);
    }
}
