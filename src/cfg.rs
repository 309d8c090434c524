//! Control-flow analysis: non-recursive DFS classifying edges, rejecting
//! back edges and malformed jumps, and discovering subprogram boundaries
//! (§4.7).

use std::collections::HashSet;

use crate::error::{RejectReason, VerifierError};
use crate::insn::{CallTarget, Instruction, JumpOp};
use crate::types::{MAX_BPF_STACK, MAX_CALL_FRAMES, STACK_FRAME_ROUND};

/// One discovered subprogram: a function-sized region entered by pseudo-call
/// and ending with `exit` (or an unconditional jump to such an ending).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subprogram {
    pub start: usize,
    /// Exclusive end, i.e. one past the last instruction belonging here.
    pub end: usize,
    pub stack_depth: i32,
}

/// Sorted table of subprogram boundaries plus the reachability map computed
/// by the same DFS pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgInfo {
    pub subprograms: Vec<Subprogram>,
    pub reachable: Vec<bool>,
}

impl CfgInfo {
    /// The subprogram owning instruction `idx`, by binary search over the
    /// sorted start offsets.
    pub fn subprogram_of(&self, idx: usize) -> Option<usize> {
        self.subprograms
            .iter()
            .position(|s| idx >= s.start && idx < s.end)
    }
}

fn successors(insns: &[Instruction], idx: usize) -> Vec<usize> {
    match &insns[idx] {
        Instruction::Jump { op: JumpOp::Ja, offset, .. } => {
            vec![(idx as i64 + 1 + *offset as i64) as usize]
        }
        Instruction::Jump { offset, .. } => {
            let taken = (idx as i64 + 1 + *offset as i64) as usize;
            vec![idx + 1, taken]
        }
        Instruction::Exit => vec![],
        Instruction::Call { target: CallTarget::Subprogram(_) } => {
            // Pseudo-calls fall through to the next instruction on return;
            // the call target itself is a separate subprogram entry reached
            // via the subprogram table, not a CFG successor edge within the
            // current function (matches the original's "calls act like NOPs
            // for intra-function reachability" treatment).
            vec![idx + 1]
        }
        _ => vec![idx + 1],
    }
}

/// Indices that a pseudo-call instruction anywhere in the program targets;
/// each becomes a subprogram entry in addition to instruction 0.
fn call_targets(insns: &[Instruction]) -> Vec<usize> {
    let mut targets = Vec::new();
    for (idx, insn) in insns.iter().enumerate() {
        if let Instruction::Call { target: CallTarget::Subprogram(off) } = insn {
            let t = idx as i64 + 1 + *off as i64;
            if t >= 0 && (t as usize) < insns.len() {
                targets.push(t as usize);
            }
        }
    }
    targets
}

/// Run the CFG analysis: iterative (non-recursive) DFS from instruction 0,
/// classifying edges, and subprogram discovery.
pub fn analyze(insns: &[Instruction]) -> Result<CfgInfo, VerifierError> {
    if insns.is_empty() {
        return Err(VerifierError::reject(0, RejectReason::MalformedInstruction));
    }

    let n = insns.len();
    // Validate every jump target is in range before the DFS even starts.
    for (idx, insn) in insns.iter().enumerate() {
        if let Instruction::Jump { offset, .. } = insn {
            let target = idx as i64 + 1 + *offset as i64;
            if target < 0 || target as usize >= n {
                return Err(VerifierError::reject(
                    idx,
                    RejectReason::JumpOutOfRange { from: idx, to: target },
                ));
            }
        }
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    let mut color = vec![Color::White; n];
    let mut reachable = vec![false; n];

    // Iterative DFS with an explicit stack of (node, next-successor-index).
    let mut starts = vec![0usize];
    for t in call_targets(insns) {
        if !starts.contains(&t) {
            starts.push(t);
        }
    }
    starts.sort_unstable();

    for &root in &starts {
        if color[root] != Color::White {
            continue;
        }
        let mut stack: Vec<(usize, usize, Vec<usize>)> = Vec::new();
        let succs = successors(insns, root);
        color[root] = Color::Gray;
        reachable[root] = true;
        stack.push((root, 0, succs));

        while let Some((node, mut si, succs)) = stack.pop() {
            if si < succs.len() {
                let succ = succs[si];
                si += 1;
                stack.push((node, si, succs));
                match color.get(succ).copied() {
                    Some(Color::White) => {
                        color[succ] = Color::Gray;
                        reachable[succ] = true;
                        let succ_succs = successors(insns, succ);
                        stack.push((succ, 0, succ_succs));
                    }
                    Some(Color::Gray) => {
                        return Err(VerifierError::reject(
                            node,
                            RejectReason::BackEdge { from: node, to: succ },
                        ));
                    }
                    Some(Color::Black) => {}
                    None => unreachable!("successor indices are range-checked above"),
                }
            } else {
                color[node] = Color::Black;
            }
        }
    }

    for (idx, r) in reachable.iter().enumerate() {
        if !r {
            return Err(VerifierError::reject(idx, RejectReason::UnreachableInstruction(idx)));
        }
    }

    let mut bounds = starts.clone();
    bounds.push(n);
    let mut subprograms = Vec::new();
    for w in 0..starts.len() {
        let start = starts[w];
        let end = bounds[w + 1];
        let last = &insns[end - 1];
        let ends_properly = matches!(last, Instruction::Exit)
            || matches!(last, Instruction::Jump { op: JumpOp::Ja, .. });
        if !ends_properly {
            return Err(VerifierError::reject(
                end - 1,
                RejectReason::JumpOutOfRange { from: end - 1, to: end as i64 },
            ));
        }
        // intra-subprogram jump containment
        for idx in start..end {
            if let Instruction::Jump { offset, .. } = &insns[idx] {
                let target = idx as i64 + 1 + *offset as i64;
                if target < start as i64 || target >= end as i64 {
                    return Err(VerifierError::reject(
                        idx,
                        RejectReason::JumpOutOfRange { from: idx, to: target },
                    ));
                }
            }
        }
        subprograms.push(Subprogram { start, end, stack_depth: 0 });
    }

    if subprograms.len() > 1024 {
        return Err(VerifierError::reject(0, RejectReason::TooManySubprograms));
    }

    Ok(CfgInfo { subprograms, reachable })
}

/// Walk the call graph iteratively, accumulating per-subprogram stack depth
/// rounded up to [`STACK_FRAME_ROUND`] bytes, bounded by
/// [`MAX_CALL_FRAMES`]; the total across any call chain must not exceed
/// [`MAX_BPF_STACK`] (§4.7).
pub fn compute_stack_depths(
    insns: &[Instruction],
    cfg: &mut CfgInfo,
    raw_frame_usage: &[i32],
) -> Result<(), VerifierError> {
    debug_assert_eq!(raw_frame_usage.len(), cfg.subprograms.len());
    for (i, sp) in cfg.subprograms.iter_mut().enumerate() {
        let rounded = (raw_frame_usage[i] + STACK_FRAME_ROUND - 1) / STACK_FRAME_ROUND * STACK_FRAME_ROUND;
        sp.stack_depth = rounded;
    }

    // DFS over the call graph from subprogram 0, tracking the path sum.
    let mut visited_path: HashSet<usize> = HashSet::new();
    fn walk(
        insns: &[Instruction],
        cfg: &CfgInfo,
        sp_idx: usize,
        depth_so_far: i32,
        call_depth: usize,
        path: &mut HashSet<usize>,
    ) -> Result<(), VerifierError> {
        if call_depth > MAX_CALL_FRAMES {
            return Err(VerifierError::reject(
                cfg.subprograms[sp_idx].start,
                RejectReason::CallStackTooDeep,
            ));
        }
        let total = depth_so_far + cfg.subprograms[sp_idx].stack_depth;
        if total > MAX_BPF_STACK {
            return Err(VerifierError::reject(
                cfg.subprograms[sp_idx].start,
                RejectReason::CombinedStackTooDeep(total),
            ));
        }
        if !path.insert(sp_idx) {
            // Call cycles would show up as CFG back-edges already (§4.7);
            // guard here defensively rather than looping forever.
            return Ok(());
        }
        let sp = &cfg.subprograms[sp_idx];
        for idx in sp.start..sp.end {
            if let Instruction::Call { target: CallTarget::Subprogram(off) } = &insns[idx] {
                let target = (idx as i64 + 1 + *off as i64) as usize;
                if let Some(callee_idx) = cfg.subprogram_of(target) {
                    walk(insns, cfg, callee_idx, total, call_depth + 1, path)?;
                }
            }
        }
        path.remove(&sp_idx);
        Ok(())
    }

    walk(insns, cfg, 0, 0, 1, &mut visited_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{AluOp, Source};

    fn mov(dst: u8, val: i32) -> Instruction {
        Instruction::Alu { op: AluOp::Mov, is64: true, dst, src: Source::Imm(val) }
    }

    #[test]
    fn smallest_valid_program_is_accepted() {
        let insns = vec![mov(0, 0), Instruction::Exit];
        let cfg = analyze(&insns).unwrap();
        assert_eq!(cfg.subprograms.len(), 1);
        assert_eq!(cfg.subprograms[0].start, 0);
        assert_eq!(cfg.subprograms[0].end, 2);
    }

    #[test]
    fn back_edge_is_rejected() {
        let insns = vec![
            mov(0, 0),
            Instruction::Jump { op: JumpOp::Ja, is64: true, dst: 0, src: Source::Imm(0), offset: -1 },
            Instruction::Exit,
        ];
        let err = analyze(&insns).unwrap_err();
        assert_eq!(
            err,
            VerifierError::reject(1, RejectReason::BackEdge { from: 1, to: 1 })
        );
    }

    #[test]
    fn unreachable_instruction_is_rejected() {
        let insns = vec![Instruction::Exit, mov(0, 0), Instruction::Exit];
        let err = analyze(&insns).unwrap_err();
        assert!(matches!(err.reason(), Some(RejectReason::UnreachableInstruction(1))));
    }

    #[test]
    fn jump_out_of_range_is_rejected() {
        let insns = vec![
            Instruction::Jump { op: JumpOp::Ja, is64: true, dst: 0, src: Source::Imm(0), offset: 50 },
            Instruction::Exit,
        ];
        let err = analyze(&insns).unwrap_err();
        assert!(matches!(err.reason(), Some(RejectReason::JumpOutOfRange { .. })));
    }
}
