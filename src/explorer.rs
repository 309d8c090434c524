//! The main verification worklist (`do_check`, §4 overview): budgeted
//! path-sensitive exploration with state-equivalence pruning, dispatching
//! each instruction's transfer function to the per-concern modules.

use crate::cfg::CfgInfo;
use crate::error::{RejectReason, VerifierError, VerifyResult};
use crate::helpers::{self, ArgKind, HelperCatalog};
use crate::insn::{AluOp, CallTarget, Instruction, JumpOp, PseudoKind, Size, Source};
use crate::log::VerifierLog;
use crate::maps::{self, MapCatalog};
use crate::mem_check::{self, Alignment};
use crate::progtype::{self, ProgramTypeOracle};
use crate::ptr_arith;
use crate::pruning;
use crate::reg::{Register, RegKind};
use crate::rewrite::InsnAux;
use crate::scalar::Scalar;
use crate::types::{COMPLEXITY_LIMIT_INSNS, COMPLEXITY_LIMIT_JMP_SEQ};
use crate::vstate::VerifierState;

/// Everything the worklist needs to resolve an instruction against the
/// program's external environment; borrowed for the duration of one
/// `do_check` call (§6 "Helper/Map/Program-type interfaces consumed").
pub struct Environment<'a> {
    pub helpers: &'a dyn HelperCatalog,
    pub maps: &'a dyn MapCatalog,
    pub oracle: &'a dyn ProgramTypeOracle,
    pub strict_alignment: bool,
    pub gpl_compatible: bool,
}

/// Attach the instruction index to a lower-layer check's bare [`RejectReason`].
fn at<T>(idx: usize, r: Result<T, RejectReason>) -> VerifyResult<T> {
    r.map_err(|e| VerifierError::reject(idx, e))
}

fn read_source(frame: &crate::frame::CallFrame, src: Source) -> Scalar {
    match src {
        Source::Imm(v) => Scalar::constant(v as i64 as u64),
        Source::Reg(r) => frame.reg(r).as_scalar(),
    }
}

/// Run the worklist to completion: `Ok(())` means the program was accepted;
/// every `(insn_idx, state)` this function actually reaches is folded
/// through the per-instruction transfer function below before its
/// successors are pushed.
pub fn do_check(
    insns: &[Instruction],
    cfg: &CfgInfo,
    env: &Environment<'_>,
    log: &mut VerifierLog,
) -> VerifyResult<Vec<InsnAux>> {
    let mut aux = vec![InsnAux::default(); insns.len()];
    let mut recorded: Vec<Vec<VerifierState>> = vec![Vec::new(); insns.len()];
    let mut worklist: Vec<VerifierState> = vec![VerifierState::entry()];
    let mut processed = 0usize;

    while let Some(mut state) = worklist.pop() {
        if worklist.len() + 1 > COMPLEXITY_LIMIT_JMP_SEQ {
            return Err(VerifierError::reject(state.insn_idx, RejectReason::BranchStackTooDeep));
        }
        let idx = state.insn_idx;
        if idx >= insns.len() {
            return Err(VerifierError::Bug(crate::error::Bug::MissingSubprogram(idx)));
        }

        if recorded[idx].iter().any(|old| pruning::states_equivalent(old, &state)) {
            log.basic(format_args!("{idx}: pruned (state equivalent to a recorded one)"));
            continue;
        }

        processed += 1;
        if processed > COMPLEXITY_LIMIT_INSNS {
            return Err(VerifierError::reject(idx, RejectReason::ProgramTooLong(processed)));
        }

        aux[idx].seen = true;
        log.basic(format_args!("{idx}: processing"));

        let outcome = step(insns, cfg, env, &mut state, &mut aux, log)?;
        recorded[idx].push(state.clone());

        match outcome {
            Step::Continue(next) => {
                let mut s = state;
                s.insn_idx = next;
                worklist.push(s);
            }
            Step::ContinueSpeculativeAlu { next, dst } => {
                let mut spec = state.fork_child();
                *spec.curframe_mut().reg_mut(dst) = Register::scalar_const(0);
                spec.curframe_mut().reg_mut(dst).mark_written();
                spec.insn_idx = next;
                worklist.push(spec);
                let mut s = state;
                s.insn_idx = next;
                worklist.push(s);
            }
            Step::Branch { fallthrough, taken, forks_speculative, null_check, packet_refine } => {
                let mut ft = state.clone();
                ft.insn_idx = fallthrough;
                let mut tk = if forks_speculative { state.fork_child() } else { state };
                tk.insn_idx = taken;

                if let Some(nc) = null_check {
                    let (null_state, notnull_state) = if nc.null_is_taken { (&mut tk, &mut ft) } else { (&mut ft, &mut tk) };
                    if nc.release_on_null {
                        let id = null_state.curframe().reg(nc.reg).id;
                        crate::refs::release(null_state, id).map_err(|r| VerifierError::reject(idx, r))?;
                    }
                    let narrowed = notnull_state.curframe().reg(nc.reg).kind.narrow_not_null();
                    notnull_state.curframe_mut().reg_mut(nc.reg).kind = narrowed;
                }
                if let Some(pr) = packet_refine {
                    let target = if pr.proven_on_taken { &mut tk } else { &mut ft };
                    let r = target.curframe_mut().reg_mut(pr.reg);
                    crate::packet::refine_range_on_compare(r, &pr.end, pr.strictly_less);
                }

                worklist.push(ft);
                worklist.push(tk);
            }
            Step::Return => {
                if state.frames().len() > 1 {
                    let mut s = state;
                    let callsite = s.curframe().callsite;
                    s.pop_frame();
                    s.insn_idx = callsite.map(|c| c + 1).unwrap_or(insns.len());
                    worklist.push(s);
                }
                // top-level exit: this path is fully verified, nothing to push.
            }
            Step::EnterSubprogram(callsite, entry) => {
                let mut s = state;
                s.push_frame(callsite).map_err(|r| VerifierError::reject(callsite, r))?;
                s.insn_idx = entry;
                worklist.push(s);
            }
        }
    }

    Ok(aux)
}

/// What the taken/fallthrough split must apply to a nullable register at a
/// null check (§4.4 item "null-check splits the state"): the not-null branch
/// narrows the kind, the null branch releases the id if it was a reference.
struct NullCheckBranch {
    reg: u8,
    /// `true` iff `taken` is the null branch (i.e. the op was `Jeq`).
    null_is_taken: bool,
    /// `true` iff the id must be released from `refs` on the null branch
    /// (only reference-tracked kinds, currently `socket_or_null`).
    release_on_null: bool,
}

/// What the taken/fallthrough split must apply to widen a packet pointer's
/// proven range after a `packet_end` comparison (§4.5 item 1).
struct PacketRefine {
    reg: u8,
    end: Register,
    /// `true` iff the bound is proven on the taken branch rather than the
    /// fallthrough.
    proven_on_taken: bool,
    strictly_less: bool,
}

/// Which branch of `op reg, packet_end_reg` proves `reg <(=) packet_end`, and
/// whether that relation is strict (§4.5 item 1). `None` for ops that don't
/// prove a one-sided bound on either branch.
fn packet_range_proof(op: JumpOp) -> Option<(bool, bool)> {
    match op {
        JumpOp::Jlt => Some((true, true)),
        JumpOp::Jle => Some((true, false)),
        JumpOp::Jgt => Some((false, false)),
        JumpOp::Jge => Some((false, true)),
        _ => None,
    }
}

enum Step {
    Continue(usize),
    /// §4.3 item 3's extra speculative successor: besides the normal
    /// continuation, push a forked state where `dst` is truncated to zero,
    /// simulating what a mispredicted runtime mask would produce.
    ContinueSpeculativeAlu { next: usize, dst: u8 },
    Branch {
        fallthrough: usize,
        taken: usize,
        forks_speculative: bool,
        null_check: Option<NullCheckBranch>,
        packet_refine: Option<PacketRefine>,
    },
    Return,
    EnterSubprogram(usize, usize),
}

fn step(
    insns: &[Instruction],
    cfg: &CfgInfo,
    env: &Environment<'_>,
    state: &mut VerifierState,
    aux: &mut [InsnAux],
    log: &mut VerifierLog,
) -> VerifyResult<Step> {
    let idx = state.insn_idx;
    match &insns[idx] {
        Instruction::Alu { op, is64, dst, src } => step_alu(state, env, aux, idx, *op, *is64, *dst, *src),
        Instruction::Jump { op, is64: _, dst, src, offset } => {
            let taken = (idx as i64 + 1 + *offset as i64) as usize;
            if *op == JumpOp::Ja {
                return Ok(Step::Continue(taken));
            }
            let dst_kind = state.curframe().reg(*dst).kind;
            let is_ptr_derived = dst_kind.is_pointer();
            if let Source::Reg(r) = src {
                at(idx, ptr_arith::check_pointer_comparison(state.curframe().reg(*dst), state.curframe().reg(*r)))?;
                at(idx, ptr_arith::check_unprivileged_pointer_comparison(
                    state.curframe().reg(*dst),
                    state.curframe().reg(*r),
                    env.oracle.program_type().is_unprivileged(),
                ))?;
            }
            let cond_is_const = state.curframe().reg(*dst).as_scalar().as_const().is_some();
            let forks_speculative = ptr_arith::needs_speculative_fork(is_ptr_derived, cond_is_const);

            let null_check = if matches!(op, JumpOp::Jeq | JumpOp::Jne)
                && matches!(src, Source::Imm(0))
                && dst_kind.is_nullable()
            {
                Some(NullCheckBranch {
                    reg: *dst,
                    null_is_taken: *op == JumpOp::Jeq,
                    release_on_null: dst_kind == RegKind::SocketOrNull,
                })
            } else {
                None
            };

            let packet_refine = if let Source::Reg(r) = src {
                let end = state.curframe().reg(*r).clone();
                if end.kind == RegKind::PacketEnd {
                    packet_range_proof(*op).map(|(proven_on_taken, strictly_less)| PacketRefine {
                        reg: *dst,
                        end,
                        proven_on_taken,
                        strictly_less,
                    })
                } else {
                    None
                }
            } else {
                None
            };

            Ok(Step::Branch { fallthrough: idx + 1, taken, forks_speculative, null_check, packet_refine })
        }
        Instruction::Load { size, dst, src, off } => {
            step_load(state, env, aux, idx, *size, *dst, *src, *off)?;
            Ok(Step::Continue(idx + 1))
        }
        Instruction::Store { size, dst, src, off } => {
            step_store(state, env, aux, idx, *size, *dst, *src, *off)?;
            Ok(Step::Continue(idx + 1))
        }
        Instruction::LoadImm64 { dst, imm, pseudo } => {
            step_load_imm64(state, env, *dst, *imm, *pseudo)?;
            Ok(Step::Continue(idx + 1))
        }
        Instruction::Call { target } => step_call(insns, cfg, env, state, aux, idx, *target, log),
        Instruction::Exit => {
            at(idx, crate::refs::require_no_outstanding_refs(state))?;
            if state.active_spin_lock != 0 {
                return Err(VerifierError::reject(idx, RejectReason::LockMismatch));
            }
            Ok(Step::Return)
        }
    }
}

fn step_alu(
    state: &mut VerifierState,
    env: &Environment<'_>,
    aux: &mut [InsnAux],
    idx: usize,
    op: AluOp,
    is64: bool,
    dst: u8,
    src: Source,
) -> VerifyResult<Step> {
    let dst_kind = state.curframe().reg(dst).kind;
    at(idx, ptr_arith::reject_if_32bit(dst, is64, &dst_kind))?;

    if let Source::Reg(r) = src {
        if state.curframe().reg(r).kind == RegKind::Uninit {
            return Err(VerifierError::reject(idx, RejectReason::KindMismatch { reg: r, expected: "initialized value", got: "uninit" }));
        }
    }

    if op == AluOp::Mov {
        let rhs = read_source(state.curframe(), src);
        let rhs_kind = match src {
            Source::Reg(r) => state.curframe().reg(r).clone(),
            Source::Imm(_) => Register::from_scalar(rhs),
        };
        *state.curframe_mut().reg_mut(dst) = rhs_kind;
        state.curframe_mut().reg_mut(dst).mark_written();
        return Ok(Step::Continue(idx + 1));
    }

    if dst_kind == RegKind::Uninit {
        return Err(VerifierError::reject(idx, RejectReason::KindMismatch { reg: dst, expected: "initialized value", got: "uninit" }));
    }

    if dst_kind.is_pointer() {
        if !matches!(op, AluOp::Add | AluOp::Sub) {
            return Err(VerifierError::reject(idx, RejectReason::ArithmeticOnDisallowedKind(dst)));
        }
        if let Source::Reg(r) = src {
            if state.curframe().reg(r).kind.is_pointer() {
                let unprivileged = env.oracle.program_type().is_unprivileged();
                if op != AluOp::Sub || unprivileged {
                    return Err(VerifierError::reject(idx, RejectReason::ArithmeticOnDisallowedKind(dst)));
                }
                // `ptr - ptr` is a scalar, privileged callers only (§4.3 item 2).
                let lhs_off = state.curframe().reg(dst).fixed_off as i64;
                let rhs_off = state.curframe().reg(r).fixed_off as i64;
                *state.curframe_mut().reg_mut(dst) = Register::scalar_const((lhs_off - rhs_off) as u64);
                state.curframe_mut().reg_mut(dst).mark_written();
                return Ok(Step::Continue(idx + 1));
            }
        }
        let mut rhs = read_source(state.curframe(), src);
        if op == AluOp::Sub {
            rhs = Scalar::constant(0).sub(rhs);
        }
        let add = at(idx, ptr_arith::add_offset(dst, &dst_kind, rhs))?;
        let reg = state.curframe_mut().reg_mut(dst);
        if add.var_off_delta.as_const() == Some(0) {
            reg.fixed_off += add.fixed_off;
        } else {
            let merged = reg.as_scalar().add(add.var_off_delta);
            reg.set_scalar(merged);
            if reg.kind.is_packet() {
                reg.id = idx as u32 + 1;
                reg.range = 0;
            }
        }
        reg.mark_written();
        if add.needs_speculative_mask {
            let final_reg = state.curframe().reg(dst).clone();
            let limit = mem_check::region_len(&final_reg.kind, map_value_size(env, &final_reg.kind), final_reg.range)
                .map(|(len, _)| len.max(0) as u32)
                .unwrap_or(0);
            aux[idx].alu_state = limit.saturating_add(1);
            return Ok(Step::ContinueSpeculativeAlu { next: idx + 1, dst });
        }
        return Ok(Step::Continue(idx + 1));
    }

    let lhs = state.curframe().reg(dst).as_scalar();
    let rhs = read_source(state.curframe(), src);
    let result = match op {
        AluOp::Add => lhs.add(rhs),
        AluOp::Sub => lhs.sub(rhs),
        AluOp::Mul => lhs.mul(rhs),
        AluOp::Or => lhs.or(rhs),
        AluOp::And => lhs.and(rhs),
        AluOp::Xor => lhs.xor(rhs),
        AluOp::Lsh => rhs.as_const().and_then(|s| lhs.lsh(s as u32)).unwrap_or_else(Scalar::unknown),
        AluOp::Rsh => rhs.as_const().and_then(|s| lhs.rsh(s as u32)).unwrap_or_else(Scalar::unknown),
        AluOp::Arsh => rhs.as_const().and_then(|s| lhs.arsh(s as u32)).unwrap_or_else(Scalar::unknown),
        AluOp::Div | AluOp::Mod => {
            aux[idx].needs_divide_guard = Some(op == AluOp::Mod);
            Scalar::unknown()
        }
        AluOp::Neg => Scalar::constant(0).sub(lhs),
        AluOp::Mov => unreachable!("handled above"),
    };
    let result = if is64 { result } else { result.narrow_to_32() };
    state.curframe_mut().reg_mut(dst).set_scalar(result);
    state.curframe_mut().reg_mut(dst).mark_written();
    Ok(Step::Continue(idx + 1))
}

fn step_load(
    state: &mut VerifierState,
    env: &Environment<'_>,
    aux: &mut [InsnAux],
    idx: usize,
    size: Size,
    dst: u8,
    src: u8,
    off: i16,
) -> VerifyResult<()> {
    state.curframe_mut().reg_mut(src).mark_read();
    let src_reg = state.curframe().reg(src).clone();
    let new_val = match &src_reg.kind {
        RegKind::Ctx => {
            at(idx, progtype::check_ctx_access(env.oracle, src, off as i32, size.bytes()))?;
            aux[idx].ctx_access = Some((off as i32, size.bytes(), false));
            Register::scalar_unknown()
        }
        RegKind::Stack => {
            let resolved = mem_check::resolved_offset(&src_reg, off as i32)
                .ok_or(VerifierError::reject(idx, RejectReason::UnboundedMemoryAccess(src)))?;
            at(idx, mem_check::check_bounds(src, "stack", -resolved, size.bytes(), crate::types::MAX_BPF_STACK as i64))?;
            mem_check::load_from_stack(&state.curframe().stack, resolved as i32, size)
                .map_err(|r| VerifierError::reject(idx, r))?
        }
        kind @ (RegKind::MapValue { .. } | RegKind::Packet | RegKind::PacketMeta) => {
            let (len, name) = mem_check::region_len(kind, map_value_size(env, kind), src_reg.range)
                .ok_or(VerifierError::reject(idx, RejectReason::UnboundedMemoryAccess(src)))?;
            let resolved = mem_check::resolved_offset(&src_reg, off as i32)
                .ok_or(VerifierError::reject(idx, RejectReason::UnboundedMemoryAccess(src)))?;
            at(idx, mem_check::check_bounds(src, name, resolved, size.bytes(), len))?;
            if let RegKind::MapValue { map_id } = *kind {
                at(idx, check_spin_lock_overlap(env, src, map_id, resolved, size.bytes()))?;
            }
            at(idx, mem_check::check_alignment(
                src,
                resolved,
                size.bytes(),
                if env.strict_alignment { Alignment::Strict } else { Alignment::Any },
                kind.is_packet(),
            ))?;
            Register::scalar_unknown()
        }
        _ => return Err(VerifierError::reject(idx, RejectReason::KindMismatch { reg: src, expected: "pointer", got: "uninit" })),
    };
    *state.curframe_mut().reg_mut(dst) = new_val;
    state.curframe_mut().reg_mut(dst).mark_written();
    Ok(())
}

fn step_store(
    state: &mut VerifierState,
    env: &Environment<'_>,
    aux: &mut [InsnAux],
    idx: usize,
    size: Size,
    dst: u8,
    src: Source,
    off: i16,
) -> VerifyResult<()> {
    let dst_reg = state.curframe().reg(dst).clone();
    let value = match src {
        Source::Imm(v) => Register::scalar_const(v as i64 as u64),
        Source::Reg(r) => {
            state.curframe_mut().reg_mut(r).mark_read();
            state.curframe().reg(r).clone()
        }
    };
    if value.kind.is_pointer() && matches!(dst_reg.kind, RegKind::Ctx | RegKind::MapValue { .. } | RegKind::Packet) {
        return Err(VerifierError::reject(idx, RejectReason::LeaksAddr(dst)));
    }
    match &dst_reg.kind {
        RegKind::Ctx => {
            at(idx, progtype::check_ctx_access(env.oracle, dst, off as i32, size.bytes()))?;
            aux[idx].ctx_access = Some((off as i32, size.bytes(), true));
        }
        RegKind::Stack => {
            let resolved = mem_check::resolved_offset(&dst_reg, off as i32)
                .ok_or(VerifierError::reject(idx, RejectReason::UnboundedMemoryAccess(dst)))?;
            at(idx, mem_check::check_bounds(dst, "stack", -resolved, size.bytes(), crate::types::MAX_BPF_STACK as i64))?;
            let aligned8 = resolved % 8 == 0;
            mem_check::store_to_stack(&mut state.curframe_mut().stack, resolved as i32, size, value, aligned8);
        }
        kind @ (RegKind::MapValue { .. } | RegKind::Packet) => {
            let (len, name) = mem_check::region_len(kind, map_value_size(env, kind), dst_reg.range)
                .ok_or(VerifierError::reject(idx, RejectReason::UnboundedMemoryAccess(dst)))?;
            let resolved = mem_check::resolved_offset(&dst_reg, off as i32)
                .ok_or(VerifierError::reject(idx, RejectReason::UnboundedMemoryAccess(dst)))?;
            at(idx, mem_check::check_bounds(dst, name, resolved, size.bytes(), len))?;
            if let RegKind::MapValue { map_id } = *kind {
                at(idx, check_spin_lock_overlap(env, dst, map_id, resolved, size.bytes()))?;
            }
            at(idx, mem_check::check_alignment(
                dst,
                resolved,
                size.bytes(),
                if env.strict_alignment { Alignment::Strict } else { Alignment::Any },
                kind.is_packet(),
            ))?;
        }
        _ => return Err(VerifierError::reject(idx, RejectReason::KindMismatch { reg: dst, expected: "pointer", got: "uninit" })),
    }
    Ok(())
}

/// The region length `region_len` should bound a `MapValue` access by: the
/// real map's `value_size` when the catalog still knows about it, otherwise
/// the stack-sized fallback `region_len` uses for packet kinds.
fn map_value_size(env: &Environment<'_>, kind: &RegKind) -> u32 {
    match kind {
        RegKind::MapValue { map_id } => env.maps.lookup(*map_id).map(|d| d.value_size).unwrap_or(0),
        _ => crate::types::MAX_BPF_STACK as u32,
    }
}

/// A direct `ldx`/`stx` against a map value may never touch the embedded
/// spin-lock's 4-byte sub-region, if the map declares one (§4.2 item 6).
fn check_spin_lock_overlap(env: &Environment<'_>, reg_idx: u8, map_id: u32, off: i64, size: i32) -> Result<(), RejectReason> {
    let Some(def) = env.maps.lookup(map_id) else { return Ok(()) };
    let Some(lock_off) = def.spin_lock_off else { return Ok(()) };
    if mem_check::overlaps_spin_lock(off, size, lock_off as i64) {
        return Err(RejectReason::OffsetOutOfRange { reg: reg_idx, off, kind: "map value spin lock" });
    }
    Ok(())
}

fn step_load_imm64(
    state: &mut VerifierState,
    env: &Environment<'_>,
    dst: u8,
    imm: i64,
    pseudo: PseudoKind,
) -> VerifyResult<()> {
    let reg = match pseudo {
        PseudoKind::None => Register::scalar_const(imm as u64),
        PseudoKind::MapFd => {
            let map_id = imm as u32;
            let def = env.maps.lookup(map_id).ok_or(VerifierError::reject(state.insn_idx, RejectReason::TooManyMaps))?;
            Register { kind: RegKind::ConstMap { map_id: def.id }, var_off: crate::tnum::Tnum::constant(0), ..Register::uninit() }
        }
        PseudoKind::MapValue { value_off } => {
            let map_id = imm as u32;
            let def = env.maps.lookup(map_id).ok_or(VerifierError::reject(state.insn_idx, RejectReason::TooManyMaps))?;
            Register {
                kind: RegKind::MapValue { map_id: def.id },
                fixed_off: value_off as i32,
                var_off: crate::tnum::Tnum::constant(0),
                bounds: crate::bounds::Bounds::constant(0),
                ..Register::uninit()
            }
        }
    };
    *state.curframe_mut().reg_mut(dst) = reg;
    state.curframe_mut().reg_mut(dst).mark_written();
    Ok(())
}

fn step_call(
    insns: &[Instruction],
    cfg: &CfgInfo,
    env: &Environment<'_>,
    state: &mut VerifierState,
    aux: &mut [InsnAux],
    idx: usize,
    target: CallTarget,
    log: &mut VerifierLog,
) -> VerifyResult<Step> {
    match target {
        CallTarget::Subprogram(off) => {
            let entry = (idx as i64 + 1 + off as i64) as usize;
            let _ = cfg.subprogram_of(entry).ok_or(VerifierError::Bug(crate::error::Bug::MissingSubprogram(entry)))?;
            let _ = insns;
            Ok(Step::EnterSubprogram(idx, entry))
        }
        CallTarget::Helper(func_id) => {
            let proto = env
                .helpers
                .proto(func_id)
                .ok_or(VerifierError::reject(idx, RejectReason::MalformedInstruction))?;
            at(idx, helpers::check_arity_rules(&proto))?;
            at(idx, progtype::check_helper_permitted(env.oracle, func_id, &proto, env.gpl_compatible))?;

            if func_id == helpers::ids::SPIN_LOCK || func_id == helpers::ids::SPIN_UNLOCK {
                let is_lock = func_id == helpers::ids::SPIN_LOCK;
                let id = state.curframe().reg(1).id.max(1);
                if is_lock {
                    if state.active_spin_lock != 0 {
                        return Err(VerifierError::reject(idx, RejectReason::LockMismatch));
                    }
                    state.active_spin_lock = id;
                } else {
                    if state.active_spin_lock != id {
                        return Err(VerifierError::reject(idx, RejectReason::LockMismatch));
                    }
                    state.active_spin_lock = 0;
                }
            }

            let mut lookup_map_id = 0u32;
            for (i, expected) in proto.args.iter().enumerate() {
                if *expected == ArgKind::None {
                    continue;
                }
                let reg_id = (i + 1) as u8;
                let actual = state.curframe().reg(reg_id).kind;
                at(idx, helpers::check_arg_kind(reg_id, *expected, &actual))?;
                if *expected == ArgKind::ReleasableRef {
                    let id = state.curframe().reg(reg_id).id;
                    at(idx, crate::refs::release(state, id))?;
                }
                if let RegKind::ConstMap { map_id } = actual {
                    if let Some(def) = env.maps.lookup(map_id) {
                        at(idx, maps::check_map_helper_compat(func_id, def.map_type))?;
                    }
                    if *expected == ArgKind::MapPtr {
                        lookup_map_id = map_id;
                    }
                }
            }

            if func_id == helpers::ids::TAIL_CALL {
                aux[idx].tail_call_map = Some(lookup_map_id);
            }
            if func_id == helpers::ids::MAP_LOOKUP_ELEM {
                aux[idx].map_lookup = Some(lookup_map_id);
            }

            if proto.changes_pkt_data {
                crate::packet::invalidate_all_packet_ranges(state.curframe_mut().regs_mut());
            }

            let ret = match proto.ret {
                helpers::RetKind::Scalar => Register::scalar_unknown(),
                helpers::RetKind::MapValueOrNull => Register {
                    kind: RegKind::MapValueOrNull { map_id: lookup_map_id },
                    var_off: crate::tnum::Tnum::constant(0),
                    bounds: crate::bounds::Bounds::constant(0),
                    ..Register::uninit()
                },
                helpers::RetKind::AcquiredSocketOrNull => {
                    let id = idx as u32 + 1;
                    at(idx, crate::refs::acquire(state, id, idx))?;
                    Register {
                        kind: RegKind::SocketOrNull,
                        id,
                        var_off: crate::tnum::Tnum::constant(0),
                        bounds: crate::bounds::Bounds::constant(0),
                        ..Register::uninit()
                    }
                }
            };
            *state.curframe_mut().reg_mut(0) = ret;
            state.curframe_mut().reg_mut(0).mark_written();
            log.verbose(format_args!("{idx}: call helper {func_id}"));
            Ok(Step::Continue(idx + 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg;
    use crate::helpers::HelperProto;
    use crate::maps::MapDef;
    use crate::progtype::ProgramType;

    struct NoHelpers;
    impl HelperCatalog for NoHelpers {
        fn proto(&self, _func_id: u32) -> Option<HelperProto> {
            None
        }
    }
    struct NoMaps;
    impl MapCatalog for NoMaps {
        fn lookup(&self, _map_id: u32) -> Option<MapDef> {
            None
        }
    }
    struct PermissiveOracle;
    impl ProgramTypeOracle for PermissiveOracle {
        fn program_type(&self) -> ProgramType {
            ProgramType::SchedCls
        }
        fn ctx_field_is_readable(&self, _offset: i32, _size: i32) -> bool {
            true
        }
        fn helper_is_permitted(&self, _func_id: u32) -> bool {
            true
        }
    }

    fn env() -> Environment<'static> {
        Environment {
            helpers: &NoHelpers,
            maps: &NoMaps,
            oracle: &PermissiveOracle,
            strict_alignment: false,
            gpl_compatible: true,
        }
    }

    fn mov(dst: u8, val: i32) -> Instruction {
        Instruction::Alu { op: AluOp::Mov, is64: true, dst, src: Source::Imm(val) }
    }

    #[test]
    fn smallest_valid_program_is_accepted() {
        let insns = vec![mov(0, 0), Instruction::Exit];
        let cfg = cfg::analyze(&insns).unwrap();
        let mut log = VerifierLog::default();
        let aux = do_check(&insns, &cfg, &env(), &mut log).unwrap();
        assert!(aux.iter().all(|a| a.seen));
    }

    #[test]
    fn arithmetic_on_ctx_register_is_rejected() {
        let insns = vec![
            Instruction::Alu { op: AluOp::Add, is64: true, dst: 1, src: Source::Imm(8) },
            Instruction::Exit,
        ];
        let cfg = cfg::analyze(&insns).unwrap();
        let mut log = VerifierLog::default();
        // R1 starts uninit in this harness (no ctx wiring yet), so this
        // exercises the "can't do arithmetic on a non-pointer, non-scalar
        // register" rejection path instead; a full ctx-carrying entry state
        // is wired up once the top-level `verify()` entry point sets R1.
        let err = do_check(&insns, &cfg, &env(), &mut log).unwrap_err();
        assert!(matches!(err.reason(), Some(RejectReason::KindMismatch { .. }) | Some(RejectReason::ArithmeticOnDisallowedKind(_))));
    }

    struct UnprivilegedOracle;
    impl ProgramTypeOracle for UnprivilegedOracle {
        fn program_type(&self) -> ProgramType {
            ProgramType::SocketFilter
        }
        fn ctx_field_is_readable(&self, _offset: i32, _size: i32) -> bool {
            true
        }
        fn helper_is_permitted(&self, _func_id: u32) -> bool {
            true
        }
    }

    fn frame_ptr_copy(dst: u8) -> Instruction {
        Instruction::Alu { op: AluOp::Mov, is64: true, dst, src: Source::Reg(10) }
    }

    #[test]
    fn ptr_plus_ptr_is_always_rejected() {
        let insns = vec![frame_ptr_copy(1), frame_ptr_copy(2), Instruction::Alu { op: AluOp::Add, is64: true, dst: 1, src: Source::Reg(2) }, Instruction::Exit];
        let cfg = cfg::analyze(&insns).unwrap();
        let mut log = VerifierLog::default();
        let err = do_check(&insns, &cfg, &env(), &mut log).unwrap_err();
        assert!(matches!(err.reason(), Some(RejectReason::ArithmeticOnDisallowedKind(_))));
    }

    #[test]
    fn ptr_minus_ptr_is_a_scalar_for_privileged_programs() {
        let insns = vec![frame_ptr_copy(1), frame_ptr_copy(2), Instruction::Alu { op: AluOp::Sub, is64: true, dst: 1, src: Source::Reg(2) }, Instruction::Exit];
        let cfg = cfg::analyze(&insns).unwrap();
        let mut log = VerifierLog::default();
        do_check(&insns, &cfg, &env(), &mut log).unwrap();
    }

    #[test]
    fn ptr_minus_ptr_is_rejected_for_unprivileged_programs() {
        let insns = vec![frame_ptr_copy(1), frame_ptr_copy(2), Instruction::Alu { op: AluOp::Sub, is64: true, dst: 1, src: Source::Reg(2) }, Instruction::Exit];
        let cfg = cfg::analyze(&insns).unwrap();
        let mut log = VerifierLog::default();
        let unprivileged_env = Environment {
            helpers: &NoHelpers,
            maps: &NoMaps,
            oracle: &UnprivilegedOracle,
            strict_alignment: false,
            gpl_compatible: true,
        };
        let err = do_check(&insns, &cfg, &unprivileged_env, &mut log).unwrap_err();
        assert!(matches!(err.reason(), Some(RejectReason::ArithmeticOnDisallowedKind(_))));
    }

    /// `r1 = map_fd; r2 = r10; r0 = map_lookup_elem(r1, r2); if r0 == 0 goto
    /// exit; *(u32*)(r0 + 0) = 5; exit` — exercises a null-check narrowing a
    /// `MapValueOrNull` to `MapValue` so the store on the not-null path is
    /// actually allowed (§4.4), and optionally a locked map to exercise the
    /// spin-lock-overlap rejection end to end (§4.2 item 6) instead of only
    /// at `mem_check::overlaps_spin_lock`'s own unit level.
    fn map_lookup_then_store_program() -> Vec<Instruction> {
        vec![
            Instruction::LoadImm64 { dst: 1, imm: 7, pseudo: PseudoKind::MapFd },
            frame_ptr_copy(2),
            Instruction::Call { target: CallTarget::Helper(helpers::ids::MAP_LOOKUP_ELEM) },
            Instruction::Jump { op: JumpOp::Jeq, is64: true, dst: 0, src: Source::Imm(0), offset: 2 },
            Instruction::Store { size: Size::B4, dst: 0, src: Source::Imm(5), off: 0 },
            Instruction::Exit,
            Instruction::Exit,
        ]
    }

    #[test]
    fn null_check_narrows_map_value_and_allows_the_store() {
        let insns = map_lookup_then_store_program();
        let cfg = cfg::analyze(&insns).unwrap();
        let mut log = VerifierLog::default();
        let map_env = crate::reference::ReferenceEnvironment::new(ProgramType::SchedCls, 16).with_map(MapDef {
            id: 7,
            map_type: crate::maps::MapType::Hash,
            key_size: 4,
            value_size: 8,
            max_entries: 64,
            spin_lock_off: None,
        });
        let env = Environment { helpers: &map_env, maps: &map_env, oracle: &map_env, strict_alignment: false, gpl_compatible: true };
        let aux = do_check(&insns, &cfg, &env, &mut log).unwrap();
        assert!(aux.iter().all(|a| a.seen));
    }

    #[test]
    fn store_overlapping_the_spin_lock_is_rejected() {
        let insns = map_lookup_then_store_program();
        let cfg = cfg::analyze(&insns).unwrap();
        let mut log = VerifierLog::default();
        let map_env = crate::reference::ReferenceEnvironment::new(ProgramType::SchedCls, 16).with_locked_map(
            MapDef { id: 7, map_type: crate::maps::MapType::Hash, key_size: 4, value_size: 8, max_entries: 64, spin_lock_off: None },
            0,
        );
        let env = Environment { helpers: &map_env, maps: &map_env, oracle: &map_env, strict_alignment: false, gpl_compatible: true };
        let err = do_check(&insns, &cfg, &env, &mut log).unwrap_err();
        assert!(matches!(err.reason(), Some(RejectReason::OffsetOutOfRange { .. })));
    }
}
