//! Dynamic binary translator for the Espresso guest CPU.
//!
//! The crate is split along the translation pipeline:
//! - [`regs`]: the immutable host-register role table and the byte-offset
//!   operand map over [`espresso_cpu::Core`].
//! - [`emit`]: the x86-64 byte emitter with deferred, bind-once labels and
//!   the codegen error sink.
//! - [`block`]: one translation unit; target bookkeeping, forward-label
//!   resolution, the instruction ceiling, and finalize checks.
//! - [`cache`]: the shared code cache keyed by block start address.
//! - [`runtime`]: the executable buffer plus the process-scoped entry and
//!   finale thunks that move control between host and translated code.
//!
//! The instruction decoder is an external collaborator: it drives
//! translation one guest instruction at a time through [`BlockDecoder`],
//! emitting host code against the operand map and reporting control flow
//! back as a [`Step`].

pub mod block;
pub mod cache;
pub mod emit;
pub mod regs;
pub mod runtime;

pub use block::{
    translate_unit, BlockDecoder, BlockEnd, BlockLimits, CodePtr, JitBlock, PendingBlock, Step,
    TranslateError, GUEST_INSTR_BYTES, MAX_BLOCK_INSTRUCTIONS,
};
pub use cache::CodeCache;
pub use emit::{Assembler, CodegenError, Cond, ErrorPolicy, Label};
pub use regs::{HostReg, MemOperand, RegisterMap};
pub use runtime::{ExecBuffer, JitRuntime, RuntimeError};
