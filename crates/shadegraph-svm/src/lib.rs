//! Bytecode backend: compiles finalized shader graphs to the stack-machine
//! programs the kernel interprets.
//!
//! - [`opcode`]: opcode numbering, operand packing, stack constants
//! - [`stack`]: slot allocator with optional access tracing
//! - [`compiler`]: per-entry-point compilation and program layout
//! - [`summary`]: compile statistics
//! - [`hash`]: content hashes of programs

pub mod compiler;
mod emit;
pub mod error;
pub mod hash;
pub mod opcode;
pub mod stack;
pub mod summary;

pub use compiler::{EntryFailure, Phase, SvmCompiler, SvmOptions, SvmOutput};
pub use error::SvmError;
pub use opcode::{Opcode, STACK_INVALID, STACK_SIZE};
pub use stack::{SlotEvent, SlotEventKind, StackAllocator};
pub use summary::Summary;
