//! Post-verification instruction rewriting (§4.9): nine ordered passes run
//! only after a successful `do_check`, all splicing through [`Patcher`] so
//! the parallel aux array and subprogram table never drift out of sync with
//! the instruction vector (§4.9a).

use crate::cfg::CfgInfo;
use crate::insn::RawInsn;

/// Per-instruction bookkeeping threaded alongside the raw instruction
/// vector through every pass (§4.9a), the aux-data array of the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsnAux {
    /// Set by `do_check` on every instruction actually reached; unseen
    /// instructions are nopped by pass 1.
    pub seen: bool,
    /// `alu_limit + 1` iff pass 4 must emit the speculative masking sequence
    /// here, zero otherwise (§4.3 item 3: the ALU op that needs a runtime
    /// `alu_limit` mask); `alu_limit` is the statically proven upper bound on
    /// the register's variable offset at this point.
    pub alu_state: u32,
    /// Non-zero iff pass 4 must emit the pre-store zero sanitizer here
    /// (§4.3 item 4: a scalar spilled adjacent to where a pointer was).
    pub sanitize_stack_off: i32,
    /// `true` iff the map this instruction's pseudo-ld resolves to was
    /// marked poisoned (§9 design note): blocks both map-lookup inlining
    /// (pass 7) and tail-call-bounds patching (pass 6) unconditionally.
    pub map_poisoned: bool,
    /// Set by `do_check` whenever this instruction's pointer operand was
    /// `ctx`/`sock*`: `(resolved offset, size in bytes, is_store)`, for
    /// pass 3 to hand to the program type's [`crate::progtype::ProgramTypeOracle::ctx_convert`].
    pub ctx_access: Option<(i32, i32, bool)>,
    /// Set by `do_check` on a `tail_call` helper call to the map id its
    /// first argument resolved to, for pass 6 to look up `max_entries`.
    pub tail_call_map: Option<u32>,
    /// Set by `do_check` on a `div`/`mod` instruction to whether it's the
    /// `mod` form, for pass 5 to prepend the matching zero-divisor guard.
    pub needs_divide_guard: Option<bool>,
    /// Set by `do_check` on a `map_lookup_elem` helper call to the map id its
    /// first argument resolved to, for pass 7 to ask the catalog for a
    /// direct-lookup code sequence.
    pub map_lookup: Option<u32>,
    /// Set once, before any pass runs, on a pseudo-call instruction: the
    /// index (stable across splices) of the subprogram it targets, for
    /// pass 9 to re-derive the call's relative offset after earlier passes
    /// may have shifted instruction positions around it.
    pub call_target_subprogram: Option<usize>,
}

/// The single primitive through which every pass inserts, removes, or
/// replaces instructions (§4.9a): owns the instruction vector, the aux
/// array, and the subprogram start table as one atomic splice.
pub struct Patcher<'a> {
    insns: &'a mut Vec<RawInsn>,
    aux: &'a mut Vec<InsnAux>,
    cfg: &'a mut CfgInfo,
}

impl<'a> Patcher<'a> {
    pub fn new(insns: &'a mut Vec<RawInsn>, aux: &'a mut Vec<InsnAux>, cfg: &'a mut CfgInfo) -> Self {
        debug_assert_eq!(insns.len(), aux.len());
        Patcher { insns, aux, cfg }
    }

    /// Replace the instruction at `idx` in place (no length change, no
    /// subprogram-table adjustment needed).
    pub fn replace(&mut self, idx: usize, insn: RawInsn) {
        self.insns[idx] = insn;
    }

    /// Splice `replacement` in place of the single instruction at `idx`,
    /// shifting every later instruction, aux entry, and subprogram boundary
    /// past `idx` forward by `replacement.len() - 1`.
    pub fn expand(&mut self, idx: usize, replacement: Vec<RawInsn>) {
        let delta = replacement.len() as i64 - 1;
        let extra_aux = vec![InsnAux::default(); replacement.len() - 1];
        self.insns.splice(idx..=idx, replacement);
        self.aux.splice(idx + 1..idx + 1, extra_aux);
        if delta != 0 {
            for sp in &mut self.cfg.subprograms {
                if sp.start > idx {
                    sp.start = (sp.start as i64 + delta) as usize;
                }
                if sp.end > idx {
                    sp.end = (sp.end as i64 + delta) as usize;
                }
            }
        }
    }

    pub fn insn(&self, idx: usize) -> RawInsn {
        self.insns[idx]
    }

    pub fn aux(&self, idx: usize) -> InsnAux {
        self.aux[idx]
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Current (possibly shifted by earlier `expand` calls) start offset of
    /// subprogram `sp_idx`.
    pub fn subprogram_start(&self, sp_idx: usize) -> usize {
        self.cfg.subprograms[sp_idx].start
    }
}

/// Pass 1: replace every instruction the worklist never visited with
/// `mov r0,r0` (dead-code nopping, §4.9 step 1).
pub fn nop_dead_code(p: &mut Patcher<'_>) {
    for idx in 0..p.len() {
        if !p.aux(idx).seen {
            p.replace(idx, RawInsn::nop());
        }
    }
}

/// Pass 2: commit each subprogram's computed stack depth (§4.9 step 2).
/// Returns the table for the caller to surface in the verification output.
pub fn commit_stack_depths(cfg: &CfgInfo) -> Vec<(usize, i32)> {
    cfg.subprograms.iter().map(|sp| (sp.start, sp.stack_depth)).collect()
}

/// Pass 3: for every `ldx`/`stx` whose pointer was `ctx`/`sock*` (flagged on
/// its aux entry by the worklist), ask the program type's oracle to expand
/// it into a sequence over the concrete underlying structure (§4.9 step 3).
/// Instructions the oracle declines to convert are left untouched — their
/// context layout is already concrete.
pub fn lower_context_access(p: &mut Patcher<'_>, oracle: &dyn crate::progtype::ProgramTypeOracle) {
    let mut idx = 0;
    while idx < p.len() {
        if let Some((off, size, is_store)) = p.aux(idx).ctx_access {
            if let Some(replacement) = oracle.ctx_convert(off, size, is_store) {
                let grew = replacement.len();
                p.expand(idx, replacement);
                idx += grew;
                continue;
            }
        }
        idx += 1;
    }
}

/// Scratch register the masking sequence uses to hold intermediate values,
/// distinct from every general-purpose register a program can reference.
const MASK_SCRATCH_REG: u8 = 11;

fn mov64_imm(dst: u8, imm: i32) -> RawInsn {
    RawInsn { opcode: 0xb7, dst, src: 0, offset: 0, imm }
}
fn sub64_reg(dst: u8, src: u8) -> RawInsn {
    RawInsn { opcode: 0x1f, dst, src, offset: 0, imm: 0 }
}
fn or64_reg(dst: u8, src: u8) -> RawInsn {
    RawInsn { opcode: 0x4f, dst, src, offset: 0, imm: 0 }
}
fn arsh64_imm(dst: u8, imm: i32) -> RawInsn {
    RawInsn { opcode: 0xc7, dst, src: 0, offset: 0, imm }
}
fn xor64_imm(dst: u8, imm: i32) -> RawInsn {
    RawInsn { opcode: 0xa7, dst, src: 0, offset: 0, imm }
}
fn and64_reg(dst: u8, src: u8) -> RawInsn {
    RawInsn { opcode: 0x5f, dst, src, offset: 0, imm: 0 }
}
fn mul64_imm(dst: u8, imm: i32) -> RawInsn {
    RawInsn { opcode: 0x27, dst, src: 0, offset: 0, imm }
}

/// Pass 4 (masking half): the eight-instruction CVE-2018-3639 sequence that
/// clamps `off_reg`'s value to the proven-safe `[0, alu_limit]` window right
/// before the (unchanged) original add/sub instruction consumes it, emitted
/// wherever aux carries a non-zero `alu_state` (§4.3 item 3, §4.9 step 4).
///
/// `limit - off` and `off` are OR'd together so the combined sign bit is set
/// iff either `off` is negative or `off` exceeds `limit`; an arithmetic shift
/// by 63 turns that single sign bit into an all-ones/all-zeros mask, which is
/// inverted (xor -1) and AND'd into `off_reg` so an out-of-range offset reads
/// back as zero instead of whatever a mispredicted branch computed. `sub`
/// negates `off_reg` before the check and again after (§4.3: "multiplying by
/// −1 around the mask"), since what's actually applied to the pointer by a
/// `sub` is `-off_reg`, not `off_reg` itself.
pub fn speculative_mask_sequence(off_reg: u8, limit: u32, is_sub: bool) -> [RawInsn; 8] {
    let sign = if is_sub { -1 } else { 1 };
    let ax = MASK_SCRATCH_REG;
    [
        mul64_imm(off_reg, sign),
        mov64_imm(ax, limit as i32),
        sub64_reg(ax, off_reg),
        or64_reg(ax, off_reg),
        arsh64_imm(ax, 63),
        xor64_imm(ax, -1),
        and64_reg(off_reg, ax),
        mul64_imm(off_reg, sign),
    ]
}

/// Pass 4 (sanitizer half): zero out the stack slot before a scalar spill
/// lands where a pointer spill used to be, so a speculatively-executed
/// mispredicted branch can't read stale pointer bits back out (§4.3 item 4).
pub fn pre_store_zero_sanitizer(stack_off: i32) -> RawInsn {
    RawInsn { opcode: 0x7b, dst: 10, src: 0, offset: stack_off as i16, imm: 0 }
}

/// Pass 5: prepend a zero-divisor guard before a `div`/`mod` instruction —
/// `div` by zero returns 0, `mod` by zero leaves the dividend unchanged
/// (§4.9 step 5).
pub fn divide_guard(is_mod: bool) -> RawInsn {
    RawInsn { opcode: if is_mod { 0x9f } else { 0x97 }, dst: 0, src: 0, offset: 0, imm: 0 }
}

/// Pass 6: rewrite a `tail_call` to mask its index against `max_entries`
/// before the jump (§4.9 step 6, §4.6 tail_call notes). Skipped entirely
/// when the instruction's map cache is poisoned (§9 design note).
pub fn tail_call_bounds_patch(max_entries: u32, map_poisoned: bool) -> Option<Vec<RawInsn>> {
    if map_poisoned {
        return None;
    }
    Some(vec![
        RawInsn { opcode: 0x9f, dst: 0, src: 0, offset: 0, imm: max_entries as i32 },
        RawInsn { opcode: 0x97, dst: 0, src: 0, offset: 0, imm: 0 },
    ])
}

/// Pass 7: inline a map's direct-lookup code generator in place of the
/// `call map_lookup_elem` instruction, when the map type provides one and
/// this call site's cached map isn't poisoned (§4.9 step 7).
pub fn inline_map_lookup(direct_lookup_code: Option<&[RawInsn]>, map_poisoned: bool) -> Option<Vec<RawInsn>> {
    if map_poisoned {
        return None;
    }
    direct_lookup_code.map(|code| code.to_vec())
}

/// Pass 8: replace a `PSEUDO_MAP_FD`/`PSEUDO_MAP_VALUE` immediate with the
/// resolved kernel map pointer, plus the direct-value offset when present
/// (§4.9 step 8).
pub fn resolve_pseudo_map_ld(map_ptr: u64, value_off: u32) -> (i32, i32) {
    ((map_ptr & 0xffff_ffff) as i32, ((map_ptr >> 32) as i32).wrapping_add(value_off as i32))
}

/// Pass 9: convert a pseudo-call's relative-to-subprogram-table immediate
/// into a relative-to-compiled-entry offset (§4.9 step 9).
pub fn fixup_call_target(from_insn: usize, subprogram_start: usize) -> i32 {
    subprogram_start as i32 - from_insn as i32 - 1
}

/// Drive pass 4's masking half over every flagged instruction: the mask must
/// run *before* the pointer op so the op consumes the clamped offset, so the
/// eight-instruction sequence goes first and the original instruction (still
/// carrying its own aux entry, now at the end of the splice) follows it.
pub fn apply_speculative_masking(p: &mut Patcher<'_>) {
    let mut idx = 0;
    while idx < p.len() {
        let limit_plus_one = p.aux(idx).alu_state;
        if limit_plus_one != 0 {
            let insn = p.insn(idx);
            let mask = speculative_mask_sequence(insn.src, limit_plus_one - 1, crate::insn::is_alu_sub(&insn));
            let mut replacement = mask.to_vec();
            replacement.push(insn);
            let grown = replacement.len();
            p.expand(idx, replacement);
            idx += grown;
            continue;
        }
        idx += 1;
    }
}

/// Drive pass 5 over every flagged `div`/`mod`: the guard must run before
/// the division, so it's placed ahead of the (kept) original instruction.
pub fn apply_divide_guards(p: &mut Patcher<'_>) {
    let mut idx = 0;
    while idx < p.len() {
        if let Some(is_mod) = p.aux(idx).needs_divide_guard {
            p.expand(idx, vec![divide_guard(is_mod), p.insn(idx)]);
            idx += 2;
            continue;
        }
        idx += 1;
    }
}

/// Drive pass 6 over every flagged `tail_call`: looks up the resolved map's
/// `max_entries` and prepends the bounds-mask sequence ahead of the call,
/// skipping call sites whose map was poisoned (§9 design note).
pub fn apply_tail_call_patches(p: &mut Patcher<'_>, maps: &dyn crate::maps::MapCatalog) {
    let mut idx = 0;
    while idx < p.len() {
        if let Some(map_id) = p.aux(idx).tail_call_map {
            let max_entries = maps.lookup(map_id).map(|d| d.max_entries).unwrap_or(0);
            if let Some(mut guard) = tail_call_bounds_patch(max_entries, p.aux(idx).map_poisoned) {
                guard.push(p.insn(idx));
                let grown = guard.len();
                p.expand(idx, guard);
                idx += grown;
                continue;
            }
        }
        idx += 1;
    }
}

/// Drive pass 7 over every flagged `map_lookup_elem` call: replaces the call
/// outright with the map's direct-lookup code when the catalog offers one
/// and the call site's map cache isn't poisoned.
pub fn apply_map_lookup_inlining(p: &mut Patcher<'_>, maps: &dyn crate::maps::MapCatalog) {
    let mut idx = 0;
    while idx < p.len() {
        if let Some(map_id) = p.aux(idx).map_lookup {
            let code = maps.direct_lookup_code(map_id);
            if let Some(replacement) = inline_map_lookup(code.as_deref(), p.aux(idx).map_poisoned) {
                let grown = replacement.len();
                p.expand(idx, replacement);
                idx += grown;
                continue;
            }
        }
        idx += 1;
    }
}

/// Drive pass 9 over every pseudo-call: earlier passes never expand a
/// `Call{Subprogram}` instruction itself (they only ever touch ALU,
/// `div`/`mod`, and helper-call sites), so each pseudo-call's position and
/// `call_target_subprogram` aux ride along unchanged through any splicing
/// that happened elsewhere in the stream; only the subprogram table's
/// `start` offsets move, and the patcher already tracks those.
pub fn apply_call_target_fixups(p: &mut Patcher<'_>) {
    for idx in 0..p.len() {
        let insn = p.insn(idx);
        if !crate::insn::is_pseudo_call(&insn) {
            continue;
        }
        if let Some(sp_idx) = p.aux(idx).call_target_subprogram {
            let mut patched = insn;
            patched.imm = fixup_call_target(idx, p.subprogram_start(sp_idx));
            p.replace(idx, patched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CfgInfo, Subprogram};

    fn insns(n: usize) -> Vec<RawInsn> {
        vec![RawInsn { opcode: 0x07, dst: 0, src: 0, offset: 0, imm: 1 }; n]
    }

    #[test]
    fn unseen_instructions_become_nops() {
        let mut raw = insns(3);
        let mut aux = vec![InsnAux { seen: true, ..Default::default() }; 3];
        aux[1].seen = false;
        let mut cfg = CfgInfo { subprograms: vec![Subprogram { start: 0, end: 3, stack_depth: 0 }], reachable: vec![true; 3] };
        let mut p = Patcher::new(&mut raw, &mut aux, &mut cfg);
        nop_dead_code(&mut p);
        assert_ne!(raw[0], RawInsn::nop());
        assert_eq!(raw[1], RawInsn::nop());
        assert_ne!(raw[2], RawInsn::nop());
    }

    struct LoweringOracle;
    impl crate::progtype::ProgramTypeOracle for LoweringOracle {
        fn program_type(&self) -> crate::progtype::ProgramType {
            crate::progtype::ProgramType::SchedCls
        }
        fn ctx_field_is_readable(&self, _offset: i32, _size: i32) -> bool {
            true
        }
        fn helper_is_permitted(&self, _func_id: u32) -> bool {
            true
        }
        fn ctx_convert(&self, offset: i32, _size: i32, _is_store: bool) -> Option<Vec<RawInsn>> {
            if offset == 4 {
                Some(vec![RawInsn::nop(); 2])
            } else {
                None
            }
        }
    }

    #[test]
    fn context_lowering_expands_only_flagged_offsets() {
        let mut raw = insns(3);
        let mut aux = vec![InsnAux::default(); 3];
        aux[1].ctx_access = Some((4, 4, false));
        let mut cfg = CfgInfo { subprograms: vec![Subprogram { start: 0, end: 3, stack_depth: 0 }], reachable: vec![true; 3] };
        let mut p = Patcher::new(&mut raw, &mut aux, &mut cfg);
        lower_context_access(&mut p, &LoweringOracle);
        assert_eq!(p.len(), 4);
        assert_eq!(p.insn(1), RawInsn::nop());
        assert_eq!(p.insn(2), RawInsn::nop());
    }

    #[test]
    fn expand_shifts_later_subprogram_boundaries() {
        let mut raw = insns(4);
        let mut aux = vec![InsnAux::default(); 4];
        let mut cfg = CfgInfo {
            subprograms: vec![
                Subprogram { start: 0, end: 2, stack_depth: 0 },
                Subprogram { start: 2, end: 4, stack_depth: 0 },
            ],
            reachable: vec![true; 4],
        };
        let mut p = Patcher::new(&mut raw, &mut aux, &mut cfg);
        p.expand(1, vec![RawInsn::nop(); 3]);
        assert_eq!(p.len(), 6);
        assert_eq!(cfg.subprograms[1].start, 4);
        assert_eq!(cfg.subprograms[1].end, 6);
    }

    #[test]
    fn tail_call_patch_is_skipped_for_poisoned_map() {
        assert!(tail_call_bounds_patch(64, true).is_none());
        assert!(tail_call_bounds_patch(64, false).is_some());
    }

    #[test]
    fn zero_divisor_guard_differs_for_div_and_mod() {
        assert_ne!(divide_guard(true), divide_guard(false));
    }

    #[test]
    fn speculative_mask_sequence_has_eight_real_instructions() {
        let seq = speculative_mask_sequence(3, 64, false);
        assert_eq!(seq.len(), 8);
        assert!(seq.iter().all(|i| *i != RawInsn::nop()));
        assert_eq!(seq[0].dst, 3);
        assert_eq!(seq.last().unwrap().dst, 3);
    }

    /// Mirrors the exact op sequence `speculative_mask_sequence` emits, as
    /// plain 64-bit arithmetic, to check the masking algebra itself rather
    /// than the `RawInsn` encoding of it.
    fn simulate_mask(off: i64, limit: u32, is_sub: bool) -> i64 {
        let sign: i64 = if is_sub { -1 } else { 1 };
        let mut r = off.wrapping_mul(sign);
        let mut ax = limit as i64;
        ax = ax.wrapping_sub(r);
        ax |= r;
        ax >>= 63;
        ax ^= -1;
        r &= ax;
        r.wrapping_mul(sign)
    }

    #[test]
    fn masking_formula_preserves_in_range_offsets() {
        assert_eq!(simulate_mask(5, 10, false), 5);
        assert_eq!(simulate_mask(10, 10, false), 10);
        assert_eq!(simulate_mask(-5, 10, true), -5);
    }

    #[test]
    fn masking_formula_clears_out_of_range_offsets() {
        assert_eq!(simulate_mask(15, 10, false), 0);
        assert_eq!(simulate_mask(-1, 10, false), 0);
        assert_eq!(simulate_mask(-15, 10, true), 0);
        assert_eq!(simulate_mask(1, 10, true), 0);
    }

    #[test]
    fn apply_speculative_masking_runs_the_mask_before_the_original_op() {
        let mut raw = vec![RawInsn { opcode: 0x1f, dst: 6, src: 3, offset: 0, imm: 0 }, RawInsn::nop()];
        let mut aux = vec![InsnAux::default(); 2];
        aux[0].alu_state = 65;
        let mut cfg = CfgInfo { subprograms: vec![Subprogram { start: 0, end: 2, stack_depth: 0 }], reachable: vec![true; 2] };
        let mut p = Patcher::new(&mut raw, &mut aux, &mut cfg);
        apply_speculative_masking(&mut p);
        assert_eq!(p.len(), 10);
        assert_eq!(p.insn(8), RawInsn { opcode: 0x1f, dst: 6, src: 3, offset: 0, imm: 0 });
        assert_eq!(p.insn(9), RawInsn::nop());
        assert_eq!(p.insn(0).imm, -1);
    }
}
