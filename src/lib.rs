//! A static verifier for a small BPF-like bytecode: an abstract-interpretation
//! pass over register/stack state (tracked bits plus signed/unsigned
//! intervals), non-recursive control-flow analysis, reference tracking, and
//! a post-verification instruction-rewriting pipeline.

pub mod bounds;
pub mod cfg;
pub mod error;
pub mod explorer;
pub mod frame;
pub mod helpers;
pub mod insn;
pub mod log;
pub mod maps;
pub mod mem_check;
pub mod packet;
pub mod progtype;
pub mod pruning;
pub mod ptr_arith;
pub mod reference;
pub mod reg;
pub mod refs;
pub mod rewrite;
pub mod scalar;
pub mod stack;
pub mod tnum;
pub mod types;
pub mod verifier;
pub mod vstate;

pub use error::{Bug, RejectReason, VerifierError, VerifyResult};
pub use verifier::{verify, VerifyFlags, VerifyReport};
