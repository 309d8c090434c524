//! Primitive aliases and hard budgets shared across the verifier.

/// A 64-bit scalar word, matching the target machine's register width.
pub type Word = u64;

/// Index of a register within a call frame, `0..=10`.
pub type RegisterId = u8;

/// Number of general-purpose registers per frame (R0..=R9).
pub const NUM_ARG_REGISTERS: usize = 10;

/// Total number of registers per frame including the read-only frame pointer R10.
pub const NUM_REGISTERS: usize = 11;

/// Register id of the read-only frame pointer.
pub const FRAME_POINTER_REG: RegisterId = 10;

/// Register id of the return-value / first-argument register.
pub const RETURN_REG: RegisterId = 0;

/// Maximum combined stack a call chain may use, in bytes.
pub const MAX_BPF_STACK: i32 = 512;

/// Maximum depth of the call-frame stack (main frame + nested calls).
pub const MAX_CALL_FRAMES: usize = 8;

/// Instruction processing budget for a single verification run.
pub const COMPLEXITY_LIMIT_INSNS: usize = 131_072;

/// Maximum number of entries ever live on the branch stack at once.
pub const COMPLEXITY_LIMIT_JMP_SEQ: usize = 1_024;

/// Additional alignment offset applied to packet-kind accesses, mirroring
/// `NET_IP_ALIGN` on the reference platform.
pub const NET_IP_ALIGN: i32 = 2;

/// Stack frames are rounded up to this many bytes when accounted in the
/// call-graph stack-depth analysis.
pub const STACK_FRAME_ROUND: i32 = 32;

/// Width, in bytes, of an 8-byte spill/fill slot.
pub const BPF_REG_SIZE: i32 = 8;
