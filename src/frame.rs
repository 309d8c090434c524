//! Call frame: registers, a private stack, and acquired references (§3).

use crate::reg::Register;
use crate::stack::Stack;
use crate::types::{NUM_REGISTERS, FRAME_POINTER_REG};

/// A reference acquired by an `acquire`-kind helper, still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredRef {
    pub id: u32,
    pub alloc_insn: usize,
}

/// One call frame: R0-R9, the read-only frame pointer R10, a private stack,
/// and the references acquired (anywhere in the call chain, since §4.4
/// shares `refs` across the whole call stack) that are still outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    regs: [Register; NUM_REGISTERS],
    pub stack: Stack,
    pub refs: Vec<AcquiredRef>,
    /// Index of the `call` instruction that created this frame (absent for
    /// the entry frame).
    pub callsite: Option<usize>,
}

impl CallFrame {
    /// A fresh frame with every register `uninit` except the frame pointer.
    pub fn new(frame_no: usize, callsite: Option<usize>) -> Self {
        let mut regs: [Register; NUM_REGISTERS] =
            core::array::from_fn(|_| Register::uninit());
        regs[FRAME_POINTER_REG as usize] = Register::frame_pointer(frame_no);
        CallFrame { regs, stack: Stack::new(), refs: Vec::new(), callsite }
    }

    pub fn reg(&self, id: u8) -> &Register {
        &self.regs[id as usize]
    }

    pub fn reg_mut(&mut self, id: u8) -> &mut Register {
        assert_ne!(id, FRAME_POINTER_REG, "R10 is read-only");
        &mut self.regs[id as usize]
    }

    pub fn regs(&self) -> &[Register; NUM_REGISTERS] {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut [Register; NUM_REGISTERS] {
        &mut self.regs
    }

    /// Remove an acquired reference id from this frame's list, if present.
    pub fn release(&mut self, id: u32) -> bool {
        let before = self.refs.len();
        self.refs.retain(|r| r.id != id);
        self.refs.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_has_uninit_args_and_ro_frame_pointer() {
        let frame = CallFrame::new(0, None);
        for i in 0..10 {
            assert_eq!(frame.reg(i).kind, crate::reg::RegKind::Uninit);
        }
        assert_eq!(frame.reg(10).kind, crate::reg::RegKind::Stack);
    }

    #[test]
    fn release_removes_matching_id_only() {
        let mut frame = CallFrame::new(0, None);
        frame.refs.push(AcquiredRef { id: 1, alloc_insn: 0 });
        frame.refs.push(AcquiredRef { id: 2, alloc_insn: 1 });
        assert!(frame.release(1));
        assert_eq!(frame.refs.len(), 1);
        assert_eq!(frame.refs[0].id, 2);
        assert!(!frame.release(99));
    }
}
