//! Core error types for shadegraph-core.
//!
//! Uses `thiserror` for structured, matchable variants covering graph
//! construction, socket lookup, and scheduling failures.

use crate::id::NodeId;
use crate::types::SocketType;
use thiserror::Error;

/// Errors produced by the shader graph data model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A node index was not found in the graph.
    #[error("node not found: NodeId({id})", id = id.0)]
    NodeNotFound { id: NodeId },

    /// A named input socket does not exist on the node.
    #[error("node {node} has no input named '{name}'")]
    InputNotFound { node: NodeId, name: String },

    /// A named output socket does not exist on the node.
    #[error("node {node} has no output named '{name}'")]
    OutputNotFound { node: NodeId, name: String },

    /// The two ends of a link carry incompatible socket types.
    #[error("cannot link {from:?} output to {to:?} input")]
    IncompatibleLink { from: SocketType, to: SocketType },

    /// Adding the link would close a cycle.
    #[error("linking node {from} into node {to} would create a cycle")]
    WouldCreateCycle { from: NodeId, to: NodeId },

    /// A value of the wrong type was assigned to a socket.
    #[error("input '{name}' expects {expected:?}")]
    ValueTypeMismatch { name: String, expected: SocketType },

    /// The output node was removed or never created.
    #[error("graph has no output node")]
    MissingOutput,

    /// A graph loaded from raw parts contains a link cycle.
    #[error("shader graph contains a cycle")]
    CyclicGraph,

    /// The fixed-point scheduler made no progress; the remaining nodes form
    /// a cycle or depend on a node outside the scheduled set.
    #[error("cannot schedule {} node(s), cycle detected: {remaining:?}", remaining.len())]
    Unschedulable { remaining: Vec<NodeId> },
}
