//! Shader graph data model shared by every shading backend.
//!
//! # Modules
//!
//! - [`id`] -- Node and shader identifiers
//! - [`types`] -- Socket types, socket values, and small math types
//! - [`node`] -- Node kinds, socket templates, and per-node feature queries
//! - [`graph`] -- The [`ShaderGraph`](graph::ShaderGraph) container and finalization
//! - [`walk`] -- Dependency collection and fixed-point scheduling
//! - [`attribute`] -- Attribute requests and the shared attribute ID map
//! - [`shader`] -- [`Shader`](shader::Shader), feature flags, and compiled programs
//! - [`error`] -- Error types for graph construction and walking

pub mod attribute;
pub mod error;
pub mod graph;
pub mod id;
pub mod node;
pub mod shader;
pub mod types;
pub mod walk;

// Re-export commonly used types
pub use attribute::{AttributeIdMap, AttributeKey, AttributeRequestSet, AttributeStandard};
pub use error::CoreError;
pub use graph::{FinalizeOptions, Link, ShaderGraph};
pub use id::{NodeId, ShaderId};
pub use node::{NodeKind, ShaderInput, ShaderNode, ShaderOutput, SpecialType};
pub use shader::{
    BytecodeProgram, CompiledProgram, DisplacementMethod, EntryPoint, ExternalProgram,
    Instruction, Shader, ShaderFlags, ShaderGroupRef,
};
pub use types::{Float2, Float3, SocketType, SocketValue, Transform};
