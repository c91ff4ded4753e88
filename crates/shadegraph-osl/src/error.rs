//! Error types for the external shading engine bridge.

use std::path::PathBuf;

use shadegraph_core::{CoreError, SocketType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OslError {
    /// A script path that is neither `.osl`, `.oso`, nor a bare shader name.
    #[error("unknown shader file type: {}", path.display())]
    UnknownShaderFile { path: PathBuf },

    /// A bare shader name was given but no user shader directory is set.
    #[error("no user shader path configured to resolve '{name}'")]
    NoSearchPath { name: String },

    #[error("failed to read shader {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile shader source {}: {message}", path.display())]
    SourceCompile { path: PathBuf, message: String },

    /// The shader failed to load earlier in this session and is not retried.
    #[error("shader {key} failed to load earlier in this session")]
    PreviouslyFailed { key: String },

    /// A bytecode script refers to a hash that was never registered.
    #[error("no shader bytecode registered under {hash}")]
    BytecodeNotLoaded { hash: String },

    #[error("socket '{name}' of type {ty:?} has no engine parameter form")]
    UnsupportedParameter { name: String, ty: SocketType },

    #[error("value of socket '{name}' does not match its type {ty:?}")]
    ValueMismatch { name: String, ty: SocketType },

    #[error("malformed shader bytecode at line {line}: {message}")]
    Query { line: usize, message: String },

    /// The shading engine rejected a call.
    #[error("shading engine rejected {call}: {message}")]
    Engine { call: &'static str, message: String },

    #[error(transparent)]
    Core(#[from] CoreError),
}
