//! Manager configuration.
//!
//! Read from the environment by hosts that have no settings of their own:
//! - `SHADEGRAPH_SHADING_SYSTEM`: `svm` or `osl` (default: `svm`)
//! - `SHADEGRAPH_SHADER_PATH`: built-in shaders and their headers
//! - `SHADEGRAPH_USER_SHADER_PATH`: directory searched for bare script names
//! - `SHADEGRAPH_OSLC`: shader source compiler (default: `oslc`)
//! - `SHADEGRAPH_PARALLEL_COMPILE`: `0` compiles bytecode on one thread

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shadegraph_core::Float3;
use shadegraph_osl::{EngineFactory, EngineRegistry, LoaderSettings, Oslc};

use crate::error::ManagerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadingSystem {
    #[default]
    Svm,
    Osl,
}

impl FromStr for ShadingSystem {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "svm" => Ok(ShadingSystem::Svm),
            "osl" => Ok(ShadingSystem::Osl),
            _ => Err(ManagerError::UnknownShadingSystem { value: s.to_string() }),
        }
    }
}

impl fmt::Display for ShadingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadingSystem::Svm => f.write_str("svm"),
            ShadingSystem::Osl => f.write_str("osl"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub shading_system: ShadingSystem,

    /// Directory of the built-in shaders and the headers scripts include.
    pub shader_path: Option<PathBuf>,

    /// Directory searched for scripts referenced by bare name.
    pub user_shader_path: Option<PathBuf>,

    /// Executable that compiles shader sources.
    pub oslc: PathBuf,

    /// Compile bytecode for independent shaders on several threads.
    pub parallel_compile: bool,

    /// Keep per-slot stack traces of every bytecode compile.
    pub record_stack_trace: bool,

    /// Luminance weights of the scene's linear RGB space.
    pub rgb_to_y: Float3,

    /// The device samples volumes with decoupled ray marching, which makes
    /// the volume sampling method meaningful.
    pub volume_decoupled: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            shading_system: ShadingSystem::Svm,
            shader_path: None,
            user_shader_path: None,
            oslc: PathBuf::from("oslc"),
            parallel_compile: true,
            record_stack_trace: false,
            rgb_to_y: Float3::new(0.212_672_9, 0.715_152_2, 0.072_175),
            volume_decoupled: true,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ManagerError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds a config from a variable lookup, starting from the defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ManagerError> {
        let mut config = ManagerConfig::default();
        if let Some(value) = var("SHADEGRAPH_SHADING_SYSTEM") {
            config.shading_system = value.parse()?;
        }
        config.shader_path = var("SHADEGRAPH_SHADER_PATH").map(PathBuf::from);
        config.user_shader_path = var("SHADEGRAPH_USER_SHADER_PATH").map(PathBuf::from);
        if let Some(value) = var("SHADEGRAPH_OSLC") {
            config.oslc = PathBuf::from(value);
        }
        if let Some(value) = var("SHADEGRAPH_PARALLEL_COMPILE") {
            config.parallel_compile = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => return Err(ManagerError::InvalidSetting { var: "SHADEGRAPH_PARALLEL_COMPILE", value }),
            };
        }
        Ok(config)
    }

    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ManagerError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ManagerError::ConfigRead { path: path.to_path_buf(), source })?;
        serde_json::from_str(&text)
            .map_err(|source| ManagerError::ConfigParse { path: path.to_path_buf(), source })
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            user_shader_path: self.user_shader_path.clone(),
            source_compiler: Arc::new(Oslc { program: self.oslc.clone(), include_dir: self.shader_path.clone() }),
        }
    }

    /// Registry for the shared engine, configured from this config.
    pub fn engine_registry(&self, factory: EngineFactory) -> EngineRegistry {
        EngineRegistry::new(factory, self.loader_settings(), self.shader_path.clone())
    }
}
