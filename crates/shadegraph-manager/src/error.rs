//! Error types for the shader manager.

use std::path::PathBuf;

use shadegraph_core::{CoreError, ShaderId};
use shadegraph_osl::OslError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown shading system '{value}', expected 'svm' or 'osl'")]
    UnknownShadingSystem { value: String },

    #[error("invalid value '{value}' for {var}")]
    InvalidSetting { var: &'static str, value: String },

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The OSL backend was selected without an engine registry to share.
    #[error("the OSL shading system needs a shared engine registry")]
    NoEngineRegistry,

    /// Script nodes only exist on the OSL backend.
    #[error("script nodes need the OSL shading system")]
    ScriptsNeedOsl,

    #[error("shader {id} not found")]
    ShaderNotFound { id: ShaderId },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Osl(#[from] OslError),
}
