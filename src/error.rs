//! Diagnostic taxonomy (§7). `RejectReason` enumerates every *kind* of
//! rejection the verifier can report; `VerifierError` wraps one with the
//! offending instruction index, mirroring `fuel-vm`'s split between
//! `PanicReason` (the taxonomy) and `InterpreterError` (the occurrence).

/// One taxonomy entry from §7. Kept intentionally flat (no nested structs)
/// so that callers can match on it without reaching into payloads they
/// don't care about; the offending instruction index lives on
/// [`VerifierError`], not here.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum RejectReason {
    // -- Structural --
    /// An instruction's opcode/field encoding is not well-formed.
    #[display(fmt = "malformed instruction")]
    MalformedInstruction,
    /// A reserved field was non-zero.
    #[display(fmt = "reserved field is not zero")]
    ReservedFieldNonZero,
    /// A jump target is outside the instruction stream.
    #[display(fmt = "jump out of range from insn {from} to {to}")]
    JumpOutOfRange {
        /// Index of the jump instruction.
        from: usize,
        /// Computed (out-of-range) target.
        to: i64,
    },
    /// An instruction is never reached by any path from the entry point.
    #[display(fmt = "unreachable instruction {_0}")]
    UnreachableInstruction(usize),
    /// The CFG DFS found an edge back to an already-open ancestor.
    #[display(fmt = "back-edge from insn {from} to {to}")]
    BackEdge {
        /// Index of the instruction with the back edge.
        from: usize,
        /// Index of the ancestor it jumps to.
        to: usize,
    },
    /// More subprograms than the verifier is willing to track.
    #[display(fmt = "too many subprograms")]
    TooManySubprograms,

    // -- Resource limits --
    /// More instructions processed than [`crate::types::COMPLEXITY_LIMIT_INSNS`].
    #[display(fmt = "program too long: exceeded {_0} processed instructions")]
    ProgramTooLong(usize),
    /// More than [`crate::types::COMPLEXITY_LIMIT_JMP_SEQ`] branch-stack entries.
    #[display(fmt = "branch stack too deep")]
    BranchStackTooDeep,
    /// More than [`crate::types::MAX_CALL_FRAMES`] nested calls.
    #[display(fmt = "call stack too deep")]
    CallStackTooDeep,
    /// Combined per-call-chain stack usage exceeds [`crate::types::MAX_BPF_STACK`].
    #[display(fmt = "combined stack depth {_0} exceeds the limit")]
    CombinedStackTooDeep(i32),
    /// More map handles referenced than the loader is willing to track.
    #[display(fmt = "too many maps for one program")]
    TooManyMaps,

    // -- Type --
    /// An operand or helper argument had the wrong register kind.
    #[display(fmt = "R{reg} invalid mem access: expected {expected}, got {got}")]
    KindMismatch {
        /// Register id that mismatched.
        reg: u8,
        /// What was required.
        expected: &'static str,
        /// What the register actually held.
        got: &'static str,
    },
    /// Two pointers were compared where that relation is undefined.
    #[display(fmt = "comparison of pointers of different kinds or frames is not allowed")]
    PointerComparisonDisallowed,
    /// Arithmetic on an opaque or nullable pointer kind (§4.3).
    #[display(fmt = "R{_0} pointer arithmetic not allowed on this register kind")]
    ArithmeticOnDisallowedKind(u8),
    /// 32-bit ALU op on a pointer value.
    #[display(fmt = "R{_0}: 32-bit pointer arithmetic is not allowed")]
    ThirtyTwoBitPointerArithmetic(u8),

    // -- Bounds --
    /// A computed signed minimum fell below zero where the kind forbids it.
    #[display(fmt = "R{_0} min value is negative")]
    NegativeSignedMin(u8),
    /// A memory access could not be proven within any valid range.
    #[display(fmt = "unbounded memory access to R{_0}")]
    UnboundedMemoryAccess(u8),
    /// An access's offset (fixed + variable) left the valid region for its kind.
    #[display(fmt = "R{reg} offset {off} is outside the valid {kind} range")]
    OffsetOutOfRange {
        /// Register id.
        reg: u8,
        /// Computed offset.
        off: i64,
        /// Which region was violated (e.g. "map value", "packet", "stack", "ctx").
        kind: &'static str,
    },
    /// An access was not aligned to its size under the active alignment rule.
    #[display(fmt = "misaligned access to R{_0}")]
    MisalignedAccess(u8),

    // -- Leakage --
    /// A pointer value was written into map, ctx, or packet memory.
    #[display(fmt = "R{_0} leaks addr into mem")]
    LeaksAddr(u8),
    /// A pointer value would be returned in R0 to an unprivileged caller.
    #[display(fmt = "cannot return pointer to the caller")]
    LeaksAddrInReturn,
    /// An unprivileged program compared two pointers by value.
    #[display(fmt = "unprivileged pointer comparison")]
    UnprivilegedPointerComparison,

    // -- Reference --
    /// The program exited (or a cross-subprogram boundary was reached) with
    /// an acquired reference never released.
    #[display(fmt = "Unreleased reference id={id} alloc_insn={alloc_insn}")]
    UnreleasedReference {
        /// The leaked reference's id.
        id: u32,
        /// Index of the instruction that acquired it.
        alloc_insn: usize,
    },
    /// A release helper's argument id does not match any acquired reference.
    #[display(fmt = "release of unacquired reference id={_0}")]
    ReleaseOfUnacquiredReference(u32),
    /// An acquire helper was called while holding a spin lock.
    #[display(fmt = "cannot acquire a reference while holding a spin lock")]
    AcquireInsideLockedRegion,
    /// A lock/unlock pair didn't match (wrong id, or unlock without lock).
    #[display(fmt = "spin lock mismatch")]
    LockMismatch,

    // -- Policy --
    /// A non-GPL-compatible program called a GPL-only helper.
    #[display(fmt = "cannot call GPL-only function from non-GPL compatible program")]
    GplIncompatibleCall,
    /// A map type and helper id are not compatible (§4.6a).
    #[display(fmt = "cannot use helper with this map type")]
    IncompatibleMapAndHelper,
    /// `tail_call` was used in a program with bpf-to-bpf calls.
    #[display(fmt = "tail_calls are not allowed in programs with bpf-to-bpf calls")]
    TailCallWithSubprogramCalls,
}

/// An internal invariant violation: if the verifier itself is correct, these
/// are unreachable. Mirrors `fuel-vm`'s `error::Bug`/`BugVariant` split
/// between "the guest program is unsafe" and "our own bookkeeping broke".
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Bug {
    /// A subprogram table lookup for an in-range instruction index failed.
    #[display(fmt = "insn {_0} has no owning subprogram")]
    MissingSubprogram(usize),
    /// The branch stack was popped while empty.
    #[display(fmt = "popped an empty branch stack")]
    EmptyBranchStack,
    /// An id bijection saw the same old id mapped to two different new ids.
    #[display(fmt = "id bijection conflict for id {_0}")]
    IdBijectionConflict(u32),
}

/// Every way `verify()` can fail: either the guest program is rejected
/// (`Reject`) or the verifier's own bookkeeping broke (`Bug`).
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum VerifierError {
    /// The program was rejected at a specific instruction.
    #[display(fmt = "insn {insn}: {reason}")]
    Reject {
        /// Index of the instruction that triggered the rejection.
        insn: usize,
        /// Which taxonomy entry applies.
        reason: RejectReason,
    },
    /// An internal invariant was violated.
    #[display(fmt = "verifier bug: {_0}")]
    Bug(Bug),
}

impl VerifierError {
    pub fn reject(insn: usize, reason: RejectReason) -> Self {
        VerifierError::Reject { insn, reason }
    }

    /// The taxonomy entry, if this is a program rejection rather than a bug.
    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            VerifierError::Reject { reason, .. } => Some(reason),
            VerifierError::Bug(_) => None,
        }
    }
}

impl From<Bug> for VerifierError {
    fn from(bug: Bug) -> Self {
        VerifierError::Bug(bug)
    }
}

impl std::error::Error for VerifierError {}

/// Result of an operation that can reject the guest program.
pub type VerifyResult<T> = Result<T, VerifierError>;
