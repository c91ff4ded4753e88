//! The shader manager: owns a scene's shaders, recompiles modified ones
//! with the selected backend, and uploads the results.
//!
//! Bytecode compiles of independent shaders run in parallel. External
//! engine compiles run one shader at a time, since the engine has a single
//! build state. Cancellation is checked between shaders; a shader skipped
//! by cancellation stays modified and compiles on the next update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use shadegraph_core::node::feature;
use shadegraph_core::{
    AttributeIdMap, AttributeKey, AttributeStandard, CompiledProgram, DisplacementMethod, EntryPoint,
    Float3, Shader, ShaderId, ShaderNode,
};
use shadegraph_osl::{EngineRegistry, OslCompiler, OslOptions, ScriptInput, SharedEngine};
use shadegraph_svm::hash::program_hash;
use shadegraph_svm::{SvmCompiler, SvmOptions, Summary};

use crate::config::{ManagerConfig, ShadingSystem};
use crate::defaults::{default_shaders, DefaultShaders};
use crate::device::{build_svm_nodes, DeviceScene, KernelShader, OslGlobals};
use crate::error::ManagerError;

// ---------------------------------------------------------------------------
// Shader id bits
// ---------------------------------------------------------------------------

/// Flag bits packed above the shader index in kernel shader ids.
pub mod shader_id {
    pub const SMOOTH_NORMAL: u32 = 1 << 31;
    pub const CAST_SHADOW: u32 = 1 << 30;
    pub const AREA_LIGHT: u32 = 1 << 29;
    pub const USE_MIS: u32 = 1 << 28;
    pub const EXCLUDE_DIFFUSE: u32 = 1 << 27;
    pub const EXCLUDE_GLOSSY: u32 = 1 << 26;
    pub const EXCLUDE_TRANSMIT: u32 = 1 << 25;
    pub const EXCLUDE_CAMERA: u32 = 1 << 24;
    pub const EXCLUDE_SCATTER: u32 = 1 << 23;
    pub const EXCLUDE_ANY: u32 =
        EXCLUDE_DIFFUSE | EXCLUDE_GLOSSY | EXCLUDE_TRANSMIT | EXCLUDE_CAMERA | EXCLUDE_SCATTER;
    /// Strips the flag bits, leaving the shader index.
    pub const SHADER_MASK: u32 = !(SMOOTH_NORMAL | CAST_SHADOW | AREA_LIGHT | USE_MIS | EXCLUDE_ANY);
}

/// Reasons passed to [`ShaderManager::tag_update`].
pub mod update {
    pub const SHADER_ADDED: u32 = 1 << 0;
    pub const SHADER_MODIFIED: u32 = 1 << 1;
    pub const BACKGROUND_MODIFIED: u32 = 1 << 2;
    pub const CONFIG_MODIFIED: u32 = 1 << 3;
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

pub enum Backend {
    Svm,
    /// Holds the shared engine for the manager's lifetime.
    Osl(Arc<SharedEngine>),
}

impl Backend {
    pub fn shading_system(&self) -> ShadingSystem {
        match self {
            Backend::Svm => ShadingSystem::Svm,
            Backend::Osl(_) => ShadingSystem::Osl,
        }
    }
}

// ---------------------------------------------------------------------------
// Update results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShaderFailure {
    pub shader: ShaderId,
    pub entry: EntryPoint,
    pub message: String,
}

/// What a host update did.
#[derive(Debug, Default, Serialize)]
pub struct HostUpdate {
    pub compiled: Vec<ShaderId>,
    pub failures: Vec<ShaderFailure>,
    /// Recompiled shaders that emit with MIS, now or before the update. The
    /// light distribution must be rebuilt for them.
    pub emission_changed: Vec<ShaderId>,
    /// Shaders whose attribute requests changed, so geometry must upload
    /// different attributes.
    pub attributes_changed: Vec<ShaderId>,
    /// Recompiled shaders whose bytecode came out identical.
    pub unchanged_programs: Vec<ShaderId>,
    pub summaries: Vec<(ShaderId, Summary)>,
    pub cancelled: bool,
}

/// Result of compiling one shader, gathered before it is merged back.
struct Compiled {
    index: usize,
    program: CompiledProgram,
    failures: Vec<(EntryPoint, String)>,
    summary: Option<Summary>,
}

// ---------------------------------------------------------------------------
// ShaderManager
// ---------------------------------------------------------------------------

pub struct ShaderManager {
    config: ManagerConfig,
    backend: Backend,
    attributes: AttributeIdMap,
    shaders: Vec<Shader>,
    defaults: DefaultShaders,
    background: ShaderId,
    update_flags: u32,
    device_dirty: bool,
    program_hashes: Vec<Option<String>>,
    /// Whether each shader emitted with MIS when it was last compiled.
    emitting: Vec<bool>,
}

impl ShaderManager {
    /// Creates a manager holding the default shaders. The OSL shading
    /// system needs `registry` to acquire the shared engine from.
    pub fn new(config: ManagerConfig, registry: Option<&EngineRegistry>) -> Result<Self, ManagerError> {
        let backend = match config.shading_system {
            ShadingSystem::Svm => Backend::Svm,
            ShadingSystem::Osl => {
                let registry = registry.ok_or(ManagerError::NoEngineRegistry)?;
                Backend::Osl(registry.acquire()?)
            }
        };
        tracing::info!(shading_system = %backend.shading_system(), "created shader manager");

        let mut manager = ShaderManager {
            config,
            backend,
            attributes: AttributeIdMap::new(),
            shaders: Vec::new(),
            defaults: DefaultShaders {
                surface: ShaderId(0),
                volume: ShaderId(1),
                light: ShaderId(2),
                background: ShaderId(3),
                empty: ShaderId(4),
            },
            background: ShaderId(3),
            update_flags: 0,
            device_dirty: true,
            program_hashes: Vec::new(),
            emitting: Vec::new(),
        };
        manager.add_default()?;
        Ok(manager)
    }

    /// Adds the default shaders, in the order their ids assume.
    fn add_default(&mut self) -> Result<(), ManagerError> {
        for shader in default_shaders()? {
            self.add_shader(shader);
        }
        Ok(())
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn defaults(&self) -> DefaultShaders {
        self.defaults
    }

    // -----------------------------------------------------------------------
    // Shaders
    // -----------------------------------------------------------------------

    pub fn add_shader(&mut self, mut shader: Shader) -> ShaderId {
        let id = ShaderId(self.shaders.len() as u32);
        shader.id = Some(id);
        shader.tag_modified();
        self.shaders.push(shader);
        self.program_hashes.push(None);
        self.emitting.push(false);
        self.tag_update(update::SHADER_ADDED);
        id
    }

    pub fn shader(&self, id: ShaderId) -> Option<&Shader> {
        self.shaders.get(id.0 as usize)
    }

    /// Mutable access; the caller tags the shader modified if the edit
    /// needs a recompile.
    pub fn shader_mut(&mut self, id: ShaderId) -> Option<&mut Shader> {
        self.shaders.get_mut(id.0 as usize)
    }

    pub fn shaders(&self) -> &[Shader] {
        &self.shaders
    }

    pub fn background(&self) -> ShaderId {
        self.background
    }

    /// Selects the world shader. It compiles with background semantics, so
    /// both the old and new world shaders recompile.
    pub fn set_background(&mut self, id: ShaderId) -> Result<(), ManagerError> {
        if self.shader(id).is_none() {
            return Err(ManagerError::ShaderNotFound { id });
        }
        if id != self.background {
            for old_or_new in [self.background, id] {
                if let Some(shader) = self.shader_mut(old_or_new) {
                    shader.tag_modified();
                }
            }
            self.background = id;
            self.tag_update(update::BACKGROUND_MODIFIED);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Update tagging
    // -----------------------------------------------------------------------

    pub fn tag_update(&mut self, flags: u32) {
        self.update_flags |= flags;
    }

    pub fn need_update(&self) -> bool {
        self.update_flags != 0 || self.shaders.iter().any(Shader::is_modified)
    }

    // -----------------------------------------------------------------------
    // Host update
    // -----------------------------------------------------------------------

    /// Recompiles every modified shader. `cancel` is polled between
    /// shaders.
    pub fn host_update(&mut self, cancel: &AtomicBool) -> HostUpdate {
        let mut result = HostUpdate::default();
        if !self.need_update() {
            return result;
        }

        let modified: Vec<usize> = (0..self.shaders.len()).filter(|&i| self.shaders[i].is_modified()).collect();
        tracing::debug!(shaders = modified.len(), "compiling modified shaders");

        let osl_engine = match &self.backend {
            Backend::Svm => None,
            Backend::Osl(engine) => Some(Arc::clone(engine)),
        };
        let compiled = match osl_engine {
            None => self.compile_svm(&modified, cancel),
            Some(engine) => {
                let compiled = self.compile_osl(&engine, &modified, cancel);
                engine.services().add_builtin_handles();
                engine.optimize_all_groups();
                compiled
            }
        };
        result.cancelled = compiled.len() < modified.len();

        for Compiled { index, program, failures, summary } in compiled {
            let id = ShaderId(index as u32);
            let hash = match &program {
                CompiledProgram::Bytecode(p) => Some(program_hash(p).to_hex().to_string()),
                CompiledProgram::External(_) => None,
            };
            if hash.is_some() && hash == self.program_hashes[index] {
                result.unchanged_programs.push(id);
            }
            self.program_hashes[index] = hash;

            let shader = &mut self.shaders[index];
            shader.compiled = Some(program);
            shader.clear_modified();
            let emits = emits_with_mis(shader);
            if emits || self.emitting[index] {
                result.emission_changed.push(id);
            }
            self.emitting[index] = emits;
            if shader.need_update_attribute {
                result.attributes_changed.push(id);
            }
            result.failures.extend(failures.into_iter().map(|(entry, message)| ShaderFailure {
                shader: id,
                entry,
                message,
            }));
            if let Some(summary) = summary {
                result.summaries.push((id, summary));
            }
            result.compiled.push(id);
        }
        result.compiled.sort();
        result.summaries.sort_by_key(|(id, _)| *id);

        if !result.compiled.is_empty() {
            self.device_dirty = true;
        }
        if !result.cancelled {
            self.update_flags = 0;
        }
        tracing::info!(
            compiled = result.compiled.len(),
            failed = result.failures.len(),
            cancelled = result.cancelled,
            "shader host update finished"
        );
        result
    }

    fn compile_svm(&mut self, modified: &[usize], cancel: &AtomicBool) -> Vec<Compiled> {
        let background = self.background.0 as usize;
        let record_stack_trace = self.config.record_stack_trace;
        let attributes = &self.attributes;

        let compile_one = |index: usize, shader: &mut Shader| {
            let options = SvmOptions { background: index == background, record_stack_trace };
            let output = SvmCompiler::new(attributes, options).compile(shader);
            tracing::debug!(shader = %shader.name, report = %output.summary.full_report(), "bytecode summary");
            Compiled {
                index,
                failures: output.failures.iter().map(|f| (f.entry, f.error.to_string())).collect(),
                program: CompiledProgram::Bytecode(output.program),
                summary: Some(output.summary),
            }
        };

        let mut selected = vec![false; self.shaders.len()];
        for &index in modified {
            if let Some(slot) = selected.get_mut(index) {
                *slot = true;
            }
        }
        let mut work: Vec<(usize, &mut Shader)> = self
            .shaders
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| selected[*i])
            .collect();

        let threads = if self.config.parallel_compile {
            thread::available_parallelism().map_or(1, |n| n.get()).min(work.len().max(1))
        } else {
            1
        };
        if threads <= 1 {
            let mut out = Vec::new();
            for (index, shader) in work {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                out.push(compile_one(index, shader));
            }
            return out;
        }

        let chunk = work.len().div_ceil(threads);
        let compile_one = &compile_one;
        thread::scope(|s| {
            let handles: Vec<_> = work
                .chunks_mut(chunk)
                .map(|batch| {
                    s.spawn(move || {
                        let mut out = Vec::new();
                        for (index, shader) in batch.iter_mut() {
                            if cancel.load(Ordering::Relaxed) {
                                break;
                            }
                            out.push(compile_one(*index, &mut **shader));
                        }
                        out
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| match h.join() {
                    Ok(out) => out,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    fn compile_osl(&mut self, engine: &SharedEngine, modified: &[usize], cancel: &AtomicBool) -> Vec<Compiled> {
        let background = self.background.0 as usize;
        let mut out = Vec::new();
        for &index in modified {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let options = OslOptions { background: index == background };
            let output = OslCompiler::new(engine, options).compile(&mut self.shaders[index]);
            out.push(Compiled {
                index,
                failures: output.failures.iter().map(|f| (f.entry, f.error.to_string())).collect(),
                program: CompiledProgram::External(output.program),
                summary: None,
            });
        }
        out
    }

    // -----------------------------------------------------------------------
    // Device update
    // -----------------------------------------------------------------------

    /// Uploads compiled shaders. Does nothing when nothing changed since
    /// the last upload; returns whether it uploaded.
    pub fn device_update(&mut self, scene: &mut DeviceScene) -> bool {
        if !self.device_dirty && scene.is_uploaded() {
            return false;
        }
        let volume_decoupled = self.config.volume_decoupled;
        scene.shaders = self.shaders.iter().map(|s| KernelShader::from_shader(s, volume_decoupled)).collect();
        scene.rgb_to_y = self.config.rgb_to_y;

        match &self.backend {
            Backend::Svm => {
                let programs: Vec<_> =
                    self.shaders.iter().map(|s| s.compiled.as_ref().and_then(|c| c.as_bytecode())).collect();
                scene.svm_nodes = build_svm_nodes(&programs);
                scene.osl = None;
            }
            Backend::Osl(_) => {
                scene.svm_nodes = Vec::new();
                scene.osl = Some(OslGlobals::from_shaders(
                    &self.shaders,
                    self.background.0 as usize,
                    self.defaults.surface.0 as usize,
                ));
            }
        }
        scene.mark_uploaded();
        self.device_dirty = false;
        tracing::debug!(shaders = scene.shaders.len(), nodes = scene.svm_nodes.len(), "uploaded shaders");
        true
    }

    /// Frees device shader state. The next device update uploads again.
    pub fn device_free(&mut self, scene: &mut DeviceScene) {
        scene.free();
        self.device_dirty = true;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Kernel shader id of `id`, with the flags every object shader
    /// carries.
    pub fn get_shader_id(&self, id: ShaderId, smooth: bool) -> Result<u32, ManagerError> {
        if self.shader(id).is_none() {
            return Err(ManagerError::ShaderNotFound { id });
        }
        let mut kernel_id = id.0 | shader_id::CAST_SHADOW | shader_id::AREA_LIGHT;
        if smooth {
            kernel_id |= shader_id::SMOOTH_NORMAL;
        }
        Ok(kernel_id)
    }

    pub fn get_attribute_id(&self, name: &str) -> u32 {
        self.attributes.id_for_name(name)
    }

    pub fn get_attribute_id_standard(&self, std: AttributeStandard) -> u32 {
        self.attributes.id(&AttributeKey::Standard(std))
    }

    pub fn attribute_map(&self) -> &AttributeIdMap {
        &self.attributes
    }

    /// Kernel features needed by every shader as last compiled.
    pub fn get_kernel_features(&self) -> u32 {
        let mut features = feature::NODE_BSDF | feature::NODE_EMISSION;
        for shader in &self.shaders {
            let graph = shader.graph();
            for id in graph.node_ids() {
                if let Some(node) = graph.node(id) {
                    features |= node.kind.feature_bits();
                }
            }
            let flags = &shader.flags;
            if flags.has_volume {
                features |= feature::VOLUME;
            }
            if flags.has_surface_transparent {
                features |= feature::TRANSPARENT;
            }
            if flags.has_surface_bssrdf {
                features |= feature::SUBSURFACE;
            }
            if flags.has_surface_raytrace {
                features |= feature::NODE_RAYTRACE;
            }
            if flags.has_bump && shader.displacement_method == DisplacementMethod::Both {
                features |= feature::NODE_BUMP_STATE;
            }
        }
        if let Backend::Osl(_) = self.backend {
            features |= feature::OSL;
        }
        features
    }

    pub fn linear_rgb_to_gray(&self, c: Float3) -> f32 {
        let w = self.config.rgb_to_y;
        c.x * w.x + c.y * w.y + c.z * w.z
    }

    /// Builds a script node from a shader file or bytecode.
    pub fn script_node(&self, input: ScriptInput<'_>) -> Result<ShaderNode, ManagerError> {
        match &self.backend {
            Backend::Osl(engine) => Ok(engine.script_node(input)?),
            Backend::Svm => Err(ManagerError::ScriptsNeedOsl),
        }
    }
}

fn emits_with_mis(shader: &Shader) -> bool {
    shader.use_mis && shader.flags.has_surface_emission
}
