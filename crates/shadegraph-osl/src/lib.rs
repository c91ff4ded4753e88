//! Bridge from shader graphs to an external shading language engine.
//!
//! # Modules
//!
//! - [`engine`] -- The [`ShadingEngine`](engine::ShadingEngine) interface and a recording engine
//! - [`registry`] -- The engine instance shared by concurrent renders, and texture handles
//! - [`params`] -- Socket value to engine parameter marshaling
//! - [`query`] -- Parameter query over compiled shaders and script node synthesis
//! - [`loader`] -- Loaded-shader cache with source auto-compile and failure memo
//! - [`compiler`] -- Graph to shader group compilation
//! - [`error`] -- Error types

pub mod compiler;
pub mod engine;
pub mod error;
pub mod loader;
pub mod params;
pub mod query;
pub mod registry;

pub use compiler::{OslCompiler, OslEntryFailure, OslOptions, OslOutput};
pub use engine::{CallLog, EngineCall, ParamData, ParamValue, RecordingEngine, ShaderUsage, ShadingEngine, TypeDesc};
pub use error::OslError;
pub use loader::{LoaderSettings, OslSourceCompiler, Oslc, ShaderCache};
pub use query::ShaderQuery;
pub use registry::{EngineFactory, EngineRegistry, RenderServices, ScriptInput, SharedEngine, TextureHandle};
