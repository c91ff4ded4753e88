//! Shader manager: keeps a scene's shaders compiled with the selected
//! backend and uploads them for the rendering kernel.
//!
//! # Modules
//!
//! - [`config`] -- [`ManagerConfig`](config::ManagerConfig) from files or the environment
//! - [`defaults`] -- Shaders every scene starts with
//! - [`device`] -- Device-side shader tables and the bytecode jump table
//! - [`manager`] -- The [`ShaderManager`](manager::ShaderManager) facade
//! - [`error`] -- Error types

pub mod config;
pub mod defaults;
pub mod device;
pub mod error;
pub mod manager;

pub use config::{ManagerConfig, ShadingSystem};
pub use defaults::DefaultShaders;
pub use device::{shader_flags, DeviceScene, KernelShader, OslGlobals};
pub use error::ManagerError;
pub use manager::{shader_id, update, Backend, HostUpdate, ShaderFailure, ShaderManager};
