//! Graph compilation into shader groups of the external engine.
//!
//! Every compiled entry point becomes one group. Nodes are visited with the
//! same dependency collection and scheduling as the bytecode backend; each
//! node binds its unlinked inputs as parameters, instantiates its
//! precompiled shader as a layer, and connects its linked inputs to the
//! layers feeding them. A script node whose shader cannot be loaded is
//! dropped from the group as if it were not in the graph.
//!
//! The whole compile of one shader holds the engine lock.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use shadegraph_core::node::{ScriptSource, SpecialType};
use shadegraph_core::walk::{find_dependencies, schedule, DependencySet, GraphWalk, NodeFlags};
use shadegraph_core::{
    AttributeRequestSet, CoreError, EntryPoint, ExternalProgram, NodeId, NodeKind, Shader,
    ShaderFlags, ShaderGraph, ShaderGroupRef, ShaderNode, SocketType,
};

use crate::engine::{ParamValue, ShaderUsage};
use crate::error::OslError;
use crate::params::{attribute_param, socket_param};
use crate::registry::{EngineState, RenderServices, SharedEngine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OslOptions {
    /// Compiling the world shader.
    pub background: bool,
}

#[derive(Debug)]
pub struct OslEntryFailure {
    pub entry: EntryPoint,
    pub error: OslError,
}

#[derive(Debug)]
pub struct OslOutput {
    pub program: ExternalProgram,
    pub failures: Vec<OslEntryFailure>,
    pub time: Duration,
}

impl OslOutput {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Layer name of a node inside a group.
pub fn layer_name(node: &ShaderNode, id: NodeId) -> String {
    format!("node_{}_{}", node.kind.type_name(), id)
}

/// Engine name of an input: whitespace removed, with an `In` suffix when
/// an output shares the name.
pub fn compatible_input_name(node: &ShaderNode, input: usize) -> String {
    let name = &node.inputs[input].name;
    let mut out = name.replace(' ', "");
    if node.outputs.iter().any(|o| o.name == *name) {
        out.push_str("In");
    }
    out
}

/// Engine name of an output, with an `Out` suffix when an input shares the
/// name.
pub fn compatible_output_name(node: &ShaderNode, output: usize) -> String {
    let name = &node.outputs[output].name;
    let mut out = name.replace(' ', "");
    if node.inputs.iter().any(|i| i.name == *name) {
        out.push_str("Out");
    }
    out
}

pub struct OslCompiler<'a> {
    engine: &'a SharedEngine,
    options: OslOptions,
}

impl<'a> OslCompiler<'a> {
    pub fn new(engine: &'a SharedEngine, options: OslOptions) -> Self {
        OslCompiler { engine, options }
    }

    /// Finalizes and compiles `shader` into one group per linked entry
    /// point, updating its flags and attribute requests.
    pub fn compile(&self, shader: &mut Shader) -> OslOutput {
        let start = Instant::now();
        let mut state = self.engine.lock();

        let has_bump = shader.prepare_compile();
        let mut flags = ShaderFlags { has_bump, has_bssrdf_bump: has_bump, ..ShaderFlags::default() };
        let mut requests = AttributeRequestSet::new();
        let mut groups = BTreeMap::new();
        let mut failures = Vec::new();

        for entry in [EntryPoint::Surface, EntryPoint::Bump, EntryPoint::Volume, EntryPoint::Displacement] {
            if !shader.is_terminal_linked(entry) {
                continue;
            }
            if entry == EntryPoint::Bump && !groups.contains_key(&EntryPoint::Surface) {
                continue;
            }
            let mut builder = GroupBuilder {
                graph: shader.graph(),
                entry,
                state: &mut *state,
                services: self.engine.services(),
                background: self.options.background,
                done: NodeFlags::with_capacity(shader.graph().node_bound()),
                absent: NodeFlags::with_capacity(shader.graph().node_bound()),
                flags: ShaderFlags::default(),
                requests: AttributeRequestSet::new(),
            };
            match builder.build(&shader.name) {
                Ok(group) => {
                    match entry {
                        EntryPoint::Surface => builder.flags.has_surface = true,
                        EntryPoint::Volume => builder.flags.has_volume = true,
                        EntryPoint::Displacement => builder.flags.has_displacement = true,
                        EntryPoint::Bump => {}
                    }
                    flags |= builder.flags;
                    requests.merge(&builder.requests);
                    groups.insert(entry, group);
                }
                Err(error) => {
                    tracing::error!(shader = %shader.name, %entry, %error, "shader group failed to build");
                    failures.push(OslEntryFailure { entry, error });
                }
            }
        }
        drop(state);

        shader.flags = flags;
        shader.update_attributes(requests);
        let time = start.elapsed();
        tracing::debug!(shader = %shader.name, groups = groups.len(), ?time, "compiled shader groups");

        OslOutput { program: ExternalProgram { groups }, failures, time }
    }
}

struct GroupBuilder<'c> {
    graph: &'c ShaderGraph,
    entry: EntryPoint,
    state: &'c mut EngineState,
    services: &'c RenderServices,
    background: bool,
    done: NodeFlags,
    /// Script nodes left out of the group.
    absent: NodeFlags,
    flags: ShaderFlags,
    requests: AttributeRequestSet,
}

impl GroupBuilder<'_> {
    fn build(&mut self, name: &str) -> Result<ShaderGroupRef, OslError> {
        let group = self.state.engine.shader_group_begin(name)?;
        let result = self.generate();
        // Close the group even when generation failed.
        let end = self.state.engine.shader_group_end();
        result?;
        end?;
        Ok(group)
    }

    fn generate(&mut self) -> Result<(), OslError> {
        let output = self.graph.output();
        let terminal = self
            .graph
            .require(output)?
            .input_index(self.entry.terminal())
            .ok_or_else(|| CoreError::InputNotFound {
                node: output,
                name: self.entry.terminal().to_string(),
            })?;
        let mut deps = DependencySet::new();
        find_dependencies(self, &mut deps, output, terminal, None);
        schedule(self, &deps)?;
        self.compile_node(output)
    }

    fn usage(&self) -> ShaderUsage {
        match self.entry {
            EntryPoint::Surface | EntryPoint::Volume => ShaderUsage::Surface,
            EntryPoint::Bump | EntryPoint::Displacement => ShaderUsage::Displacement,
        }
    }

    fn skips_input(&self, id: NodeId, input: usize) -> bool {
        let Some(node) = self.graph.node(id) else {
            return true;
        };
        if node.inputs.get(input).map_or(true, |i| i.internal) {
            return true;
        }
        if node.kind.special_type() == SpecialType::Output {
            return node.inputs[input].name != self.entry.terminal();
        }
        self.entry == EntryPoint::Displacement
            && self
                .graph
                .input_link(id, input)
                .and_then(|(src, _)| self.graph.node(src))
                .is_some_and(|n| n.kind.special_type() == SpecialType::Bump)
    }

    fn param(&mut self, name: &str, value: ParamValue) -> Result<(), OslError> {
        self.state.engine.parameter(name, value)
    }

    /// Binds parameters specific to a built-in node kind and returns the
    /// name of the shader implementing it.
    fn bind_node_params(&mut self, node: &ShaderNode) -> Result<String, OslError> {
        let builtin = |kind: &NodeKind| format!("node_{}", kind.type_name());
        let name = match &node.kind {
            NodeKind::Output => match self.entry {
                EntryPoint::Surface => "node_output_surface".to_string(),
                EntryPoint::Volume => "node_output_volume".to_string(),
                EntryPoint::Displacement => "node_output_displacement".to_string(),
                EntryPoint::Bump => "node_output_bump".to_string(),
            },
            NodeKind::Value { value } => {
                self.param("value_value", ParamValue::float(*value))?;
                builtin(&node.kind)
            }
            NodeKind::Rgb { color } => {
                self.param("color_value", ParamValue::color(*color))?;
                builtin(&node.kind)
            }
            NodeKind::Math { op, use_clamp } => {
                self.param("math_type", ParamValue::string(op.name()))?;
                self.param("use_clamp", ParamValue::int(i32::from(*use_clamp)))?;
                builtin(&node.kind)
            }
            NodeKind::VectorMath { op } => {
                self.param("math_type", ParamValue::string(op.name()))?;
                builtin(&node.kind)
            }
            NodeKind::MixRgb { blend, use_clamp } => {
                self.param("mix_type", ParamValue::string(blend.name()))?;
                self.param("use_clamp", ParamValue::int(i32::from(*use_clamp)))?;
                builtin(&node.kind)
            }
            NodeKind::Attribute { attribute } => {
                self.param("name", attribute_param(attribute))?;
                builtin(&node.kind)
            }
            NodeKind::TextureCoordinate { from_dupli, object_transform } => {
                self.param("is_background", ParamValue::int(i32::from(self.background)))?;
                self.param("from_dupli", ParamValue::int(i32::from(*from_dupli)))?;
                self.param("use_transform", ParamValue::int(i32::from(object_transform.is_some())))?;
                if let Some(tfm) = object_transform {
                    self.param("object_itfm", ParamValue::matrix(tfm))?;
                }
                builtin(&node.kind)
            }
            NodeKind::ImageTexture { slot, colorspace, .. } => {
                let handle = self.services.register_svm(*slot);
                self.param("filename", ParamValue::string(handle))?;
                self.param("colorspace", ParamValue::string(colorspace.clone()))?;
                builtin(&node.kind)
            }
            NodeKind::AmbientOcclusion { samples, only_local } => {
                self.param("samples", ParamValue::int(*samples as i32))?;
                self.param("only_local", ParamValue::int(i32::from(*only_local)))?;
                builtin(&node.kind)
            }
            NodeKind::Bump { invert, use_object_space } => {
                self.param("invert", ParamValue::int(i32::from(*invert)))?;
                self.param("use_object_space", ParamValue::int(i32::from(*use_object_space)))?;
                builtin(&node.kind)
            }
            NodeKind::BumpFromDisplacement { use_object_space }
            | NodeKind::Displacement { use_object_space } => {
                self.param("use_object_space", ParamValue::int(i32::from(*use_object_space)))?;
                builtin(&node.kind)
            }
            _ => builtin(&node.kind),
        };
        Ok(name)
    }

    fn load_script(&mut self, source: &ScriptSource) -> Result<String, OslError> {
        let state = &mut *self.state;
        match source {
            ScriptSource::File(path) => state.cache.load_file(state.engine.as_mut(), path),
            ScriptSource::Bytecode { hash } if state.cache.is_loaded(hash) => Ok(hash.clone()),
            ScriptSource::Bytecode { hash } => Err(OslError::BytecodeNotLoaded { hash: hash.clone() }),
        }
    }

    fn compile_node(&mut self, id: NodeId) -> Result<(), OslError> {
        let graph = self.graph;
        let node = graph.require(id)?;
        let layer = layer_name(node, id);
        let shader_name = match &node.kind {
            NodeKind::Script { source } => match self.load_script(source) {
                Ok(name) => name,
                Err(error) => {
                    tracing::warn!(node = %id, entry = %self.entry, %error, "dropping script node without a shader");
                    self.absent.insert(id);
                    return Ok(());
                }
            },
            _ => self.bind_node_params(node)?,
        };

        for (index, input) in node.inputs.iter().enumerate() {
            if input.ty == SocketType::Closure
                || graph.is_input_linked(id, index)
                || self.skips_input(id, index)
            {
                continue;
            }
            let name = compatible_input_name(node, index);
            let value = socket_param(&name, input.ty, &input.value)?;
            self.param(&name, value)?;
        }

        let usage = self.usage();
        self.state.engine.shader(usage, &shader_name, &layer)?;

        for index in 0..node.inputs.len() {
            if self.skips_input(id, index) {
                continue;
            }
            let Some((src, out)) = graph.input_link(id, index) else {
                continue;
            };
            if self.absent.contains(src) {
                continue;
            }
            let src_node = graph.require(src)?;
            self.state.engine.connect_shaders(
                &layer_name(src_node, src),
                &compatible_output_name(src_node, out),
                &layer,
                &compatible_input_name(node, index),
            )?;
        }

        if let NodeKind::Script { .. } = node.kind {
            self.script_flags(&shader_name);
        }
        Ok(())
    }

    /// Script closures cannot be inspected, so a surface script is assumed
    /// to bump and raytrace.
    fn script_flags(&mut self, key: &str) {
        if self.entry != EntryPoint::Surface {
            return;
        }
        if let Some(info) = self.state.cache.info(key) {
            self.flags.has_surface_emission |= info.has_surface_emission;
            self.flags.has_surface_transparent |= info.has_surface_transparent;
            if info.has_surface_bssrdf {
                self.flags.has_surface_bssrdf = true;
                self.flags.has_bssrdf_bump = true;
            }
            self.flags.has_bump = true;
            self.flags.has_surface_raytrace = true;
        }
    }

    fn node_flags(&mut self, id: NodeId) -> Result<(), OslError> {
        let graph = self.graph;
        let kind = &graph.require(id)?.kind;
        match self.entry {
            EntryPoint::Surface => {
                self.flags.has_surface_emission |= kind.has_surface_emission();
                self.flags.has_surface_transparent |= kind.has_surface_transparent();
                self.flags.has_surface_raytrace |= kind.has_raytrace();
                self.flags.has_surface_spatial_varying |= kind.has_spatial_varying();
                if kind.has_surface_bssrdf() {
                    self.flags.has_surface_bssrdf = true;
                    self.flags.has_bssrdf_bump |= graph.node_has_bump(id);
                }
                self.flags.has_bump |= graph.node_has_bump(id);
            }
            EntryPoint::Volume => {
                self.flags.has_volume_spatial_varying |= kind.has_spatial_varying();
                self.flags.has_volume_attribute_dependency |= kind.has_attribute_dependency();
            }
            EntryPoint::Bump | EntryPoint::Displacement => {}
        }
        self.flags.has_integrator_dependency |= kind.has_integrator_dependency();
        graph.node_attributes(id, &mut self.requests, self.background);
        Ok(())
    }
}

impl GraphWalk for GroupBuilder<'_> {
    type Error = OslError;

    fn graph(&self) -> &ShaderGraph {
        self.graph
    }

    fn skip_input(&self, node: NodeId, input: usize) -> bool {
        self.skips_input(node, input)
    }

    fn is_done(&self, node: NodeId) -> bool {
        self.done.contains(node)
    }

    fn emit_node(&mut self, node: NodeId) -> Result<(), OslError> {
        self.compile_node(node)?;
        if !self.absent.contains(node) {
            self.node_flags(node)?;
        }
        self.done.insert(node);
        Ok(())
    }
}
