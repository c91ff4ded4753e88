//! The shading engine instance shared by every open render.
//!
//! Engine setup is expensive, so renders share one [`SharedEngine`]. An
//! [`EngineRegistry`] creates it when the first render acquires it and
//! drops it when the last [`Arc`] goes away. Renders hold the registry
//! itself behind an `Arc` to share it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use shadegraph_core::node::ScriptSource;
use shadegraph_core::ShaderNode;

use crate::engine::{ParamData, ParamValue, ShadingEngine, TypeDesc};
use crate::error::OslError;
use crate::loader::{LoaderSettings, ShaderCache};

/// Ray type names in kernel ray-flag bit order. Both shadow flags map to
/// the same name.
pub const RAY_TYPES: [&str; 13] = [
    "camera",
    "reflection",
    "refraction",
    "diffuse",
    "glossy",
    "singular",
    "transparent",
    "volume_scatter",
    "shadow",
    "shadow",
    "__unused__",
    "__unused__",
    "diffuse_ancestor",
];

/// How a texture name used by a shader resolves at render time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureHandle {
    /// An image already held by the bytecode image manager.
    Svm { slot: u32 },
    Ao,
    Bevel,
}

/// Texture lookups the engine calls back into while shading. Shared by
/// every render along with the engine.
#[derive(Debug, Default)]
pub struct RenderServices {
    textures: DashMap<String, TextureHandle>,
    next_unique: AtomicU64,
}

impl RenderServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an image slot under a fresh `@svmN` name. Names are unique
    /// for the lifetime of the services, across every render sharing them.
    pub fn register_svm(&self, slot: u32) -> String {
        let name = format!("@svm{}", self.next_unique.fetch_add(1, Ordering::Relaxed));
        self.textures.insert(name.clone(), TextureHandle::Svm { slot });
        name
    }

    /// Adds the `@ao` and `@bevel` handles.
    pub fn add_builtin_handles(&self) {
        self.textures.insert("@ao".to_string(), TextureHandle::Ao);
        self.textures.insert("@bevel".to_string(), TextureHandle::Bevel);
    }

    pub fn texture(&self, name: &str) -> Option<TextureHandle> {
        self.textures.get(name).map(|h| *h)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }
}

/// Engine state guarded by one lock: the engine builds one group at a time
/// and the shader cache mirrors what the engine has loaded.
pub struct EngineState {
    pub engine: Box<dyn ShadingEngine>,
    pub cache: ShaderCache,
}

pub struct SharedEngine {
    state: Mutex<EngineState>,
    services: RenderServices,
}

impl SharedEngine {
    /// Locks the engine for a compile, recovering a poisoned lock.
    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn services(&self) -> &RenderServices {
        &self.services
    }

    /// Runs the engine's JIT over every group built so far.
    pub fn optimize_all_groups(&self) {
        self.lock().engine.optimize_all_groups();
    }

    /// Loads a script shader and builds a node whose sockets mirror its
    /// parameters.
    pub fn script_node(&self, input: ScriptInput<'_>) -> Result<ShaderNode, OslError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let (key, source) = match input {
            ScriptInput::File(path) => (
                state.cache.load_file(state.engine.as_mut(), path)?,
                ScriptSource::File(path.to_path_buf()),
            ),
            ScriptInput::Bytecode { hash, bytecode } => (
                state.cache.load_bytecode(state.engine.as_mut(), hash, bytecode)?,
                ScriptSource::Bytecode { hash: hash.to_string() },
            ),
        };
        let query = state
            .cache
            .info(&key)
            .and_then(|info| info.query.as_ref())
            .ok_or_else(|| OslError::Query { line: 0, message: format!("shader {key} has no parameters") })?;
        Ok(query.script_node(source))
    }
}

/// Where a script node's shader comes from.
#[derive(Debug, Clone, Copy)]
pub enum ScriptInput<'a> {
    /// A `.osl` source, a `.oso` file, or a bare shader name.
    File(&'a Path),
    /// Bytecode registered under an explicit hash.
    Bytecode { hash: &'a str, bytecode: &'a str },
}

impl Drop for SharedEngine {
    fn drop(&mut self) {
        tracing::debug!("shared shading engine released");
    }
}

pub type EngineFactory = Box<dyn Fn() -> Box<dyn ShadingEngine> + Send + Sync>;

pub struct EngineRegistry {
    factory: EngineFactory,
    loader: LoaderSettings,
    /// Directory of the renderer's built-in shaders.
    shader_path: Option<PathBuf>,
    shared: Mutex<Weak<SharedEngine>>,
    created: AtomicUsize,
}

impl EngineRegistry {
    pub fn new(factory: EngineFactory, loader: LoaderSettings, shader_path: Option<PathBuf>) -> Self {
        EngineRegistry {
            factory,
            loader,
            shader_path,
            shared: Mutex::new(Weak::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Returns the live shared engine, creating and configuring one if no
    /// render holds it.
    pub fn acquire(&self) -> Result<Arc<SharedEngine>, OslError> {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(engine) = shared.upgrade() {
            return Ok(engine);
        }

        let mut engine = (self.factory)();
        configure(engine.as_mut(), self.shader_path.as_ref())?;
        let instance = Arc::new(SharedEngine {
            state: Mutex::new(EngineState { engine, cache: ShaderCache::new(self.loader.clone()) }),
            services: RenderServices::new(),
        });
        *shared = Arc::downgrade(&instance);
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(created, "created shared shading engine");
        Ok(instance)
    }

    /// Number of renders currently holding the shared engine.
    pub fn users(&self) -> usize {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner).strong_count()
    }

    /// Number of engines created over the registry's lifetime.
    pub fn instances_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

fn configure(engine: &mut dyn ShadingEngine, shader_path: Option<&PathBuf>) -> Result<(), OslError> {
    engine.attribute("lockgeom", ParamValue::int(1))?;
    engine.attribute("commonspace", ParamValue::string("world"))?;
    engine.attribute("greedyjit", ParamValue::int(1))?;
    if let Some(path) = shader_path {
        engine.attribute("searchpath:shader", ParamValue::string(path.display().to_string()))?;
        tracing::debug!(path = %path.display(), "using shader search path");
    }
    let ray_types = ParamValue {
        ty: TypeDesc::STRING.array(RAY_TYPES.len()),
        data: ParamData::String(RAY_TYPES.iter().map(|s| s.to_string()).collect()),
    };
    engine.attribute("raytypes", ray_types)
}
