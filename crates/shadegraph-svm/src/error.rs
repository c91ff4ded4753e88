//! Error types for bytecode compilation.
//!
//! Errors are scoped to one entry point: the compiler records the failure,
//! drops that entry point's instructions, and keeps compiling the others.

use shadegraph_core::{CoreError, NodeId, SocketType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SvmError {
    /// No contiguous run of free stack slots is large enough.
    #[error("out of SVM stack space: {requested} slot(s) requested, {live} in use")]
    StackOverflow { requested: u32, live: usize },

    /// The socket's type has no stack representation.
    #[error("socket '{socket}' on node {node} has type {ty:?}, which cannot live on the stack")]
    UnsupportedSocketType { node: NodeId, socket: String, ty: SocketType },

    /// A slot was read after its last user released it.
    #[error("stack slot {offset} read after release")]
    StaleSlot { offset: u32 },

    /// A linked input was compiled before its upstream output got a slot.
    #[error("input '{socket}' on node {node} reads an output that has no stack slot")]
    UnassignedLink { node: NodeId, socket: String },

    /// An operand does not fit in a packed byte.
    #[error("operand {value} does not fit in a packed byte")]
    OperandOverflow { value: u32 },

    #[error(transparent)]
    Core(#[from] CoreError),
}
