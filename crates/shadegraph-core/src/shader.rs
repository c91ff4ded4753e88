//! Shaders, their feature flags, and the programs compiled from them.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOrAssign, Range};

use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeRequestSet, AttributeStandard};
use crate::graph::{FinalizeOptions, ShaderGraph};
use crate::id::ShaderId;
use crate::node::NodeKind;
use crate::types::Float3;

/// One bytecode instruction: an opcode or data word plus three operands.
pub type Instruction = [i32; 4];

/// A terminal of the output node compiled into its own program section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryPoint {
    Surface,
    /// Normal evaluation derived from displacement; runs ahead of surface.
    Bump,
    Volume,
    Displacement,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 4] =
        [EntryPoint::Surface, EntryPoint::Bump, EntryPoint::Volume, EntryPoint::Displacement];

    /// Output node input that drives this entry point.
    pub fn terminal(self) -> &'static str {
        match self {
            EntryPoint::Surface => "Surface",
            EntryPoint::Bump => "Normal",
            EntryPoint::Volume => "Volume",
            EntryPoint::Displacement => "Displacement",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryPoint::Surface => "surface",
            EntryPoint::Bump => "bump",
            EntryPoint::Volume => "volume",
            EntryPoint::Displacement => "displacement",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplacementMethod {
    /// Displacement only perturbs the shading normal.
    #[default]
    Bump,
    /// Geometry is displaced; no bump.
    True,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeSampling {
    Distance,
    Equiangular,
    #[default]
    MultipleImportance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeInterpolation {
    #[default]
    Linear,
    Cubic,
}

/// Feature flags derived while compiling a shader. Reset at the start of
/// every compile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderFlags {
    pub has_surface: bool,
    pub has_surface_emission: bool,
    pub has_surface_transparent: bool,
    pub has_surface_raytrace: bool,
    pub has_surface_bssrdf: bool,
    pub has_bssrdf_bump: bool,
    pub has_surface_spatial_varying: bool,
    pub has_bump: bool,
    pub has_volume: bool,
    pub has_volume_spatial_varying: bool,
    pub has_volume_attribute_dependency: bool,
    pub has_displacement: bool,
    pub has_integrator_dependency: bool,
}

impl BitOrAssign for ShaderFlags {
    fn bitor_assign(&mut self, rhs: ShaderFlags) {
        self.has_surface |= rhs.has_surface;
        self.has_surface_emission |= rhs.has_surface_emission;
        self.has_surface_transparent |= rhs.has_surface_transparent;
        self.has_surface_raytrace |= rhs.has_surface_raytrace;
        self.has_surface_bssrdf |= rhs.has_surface_bssrdf;
        self.has_bssrdf_bump |= rhs.has_bssrdf_bump;
        self.has_surface_spatial_varying |= rhs.has_surface_spatial_varying;
        self.has_bump |= rhs.has_bump;
        self.has_volume |= rhs.has_volume;
        self.has_volume_spatial_varying |= rhs.has_volume_spatial_varying;
        self.has_volume_attribute_dependency |= rhs.has_volume_attribute_dependency;
        self.has_displacement |= rhs.has_displacement;
        self.has_integrator_dependency |= rhs.has_integrator_dependency;
    }
}

/// Opaque handle to a shader group linked by an external shading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShaderGroupRef(u64);

impl ShaderGroupRef {
    pub fn new(raw: u64) -> Self {
        ShaderGroupRef(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ShaderGroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Bytecode for one shader, laid out as a header jump instruction followed
/// by the entry-point sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytecodeProgram {
    pub instructions: Vec<Instruction>,
    /// Instruction range of each compiled entry point. Absent entry points
    /// have no instructions.
    pub entries: BTreeMap<EntryPoint, Range<usize>>,
    pub peak_stack_usage: u32,
}

impl BytecodeProgram {
    pub fn entry(&self, entry: EntryPoint) -> &[Instruction] {
        match self.entries.get(&entry) {
            Some(range) => &self.instructions[range.clone()],
            None => &[],
        }
    }

    pub fn entry_len(&self, entry: EntryPoint) -> usize {
        self.entry(entry).len()
    }
}

/// Shader groups produced by an external shading engine, one per compiled
/// entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProgram {
    pub groups: BTreeMap<EntryPoint, ShaderGroupRef>,
}

impl ExternalProgram {
    pub fn group(&self, entry: EntryPoint) -> Option<ShaderGroupRef> {
        self.groups.get(&entry).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompiledProgram {
    Bytecode(BytecodeProgram),
    External(ExternalProgram),
}

impl CompiledProgram {
    pub fn as_bytecode(&self) -> Option<&BytecodeProgram> {
        match self {
            CompiledProgram::Bytecode(p) => Some(p),
            CompiledProgram::External(_) => None,
        }
    }

    pub fn as_external(&self) -> Option<&ExternalProgram> {
        match self {
            CompiledProgram::External(p) => Some(p),
            CompiledProgram::Bytecode(_) => None,
        }
    }
}

/// A named shader: a node graph plus the settings and compile results the
/// renderer needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shader {
    pub name: String,
    graph: ShaderGraph,
    pub pass_id: i32,
    pub use_mis: bool,
    pub use_transparent_shadow: bool,
    pub heterogeneous_volume: bool,
    pub volume_sampling_method: VolumeSampling,
    pub volume_interpolation_method: VolumeInterpolation,
    pub volume_step_rate: f32,
    pub displacement_method: DisplacementMethod,
    /// Assigned by the shader manager on each host update.
    pub id: Option<ShaderId>,
    pub flags: ShaderFlags,
    pub has_volume_connected: bool,
    pub attributes: AttributeRequestSet,
    /// Set when the last compile changed the attribute requests.
    pub need_update_attribute: bool,
    pub compiled: Option<CompiledProgram>,
    modified: bool,
}

impl Shader {
    pub fn new(name: &str) -> Self {
        Self::with_graph(name, ShaderGraph::new())
    }

    pub fn with_graph(name: &str, graph: ShaderGraph) -> Self {
        let mut shader = Shader {
            name: name.to_string(),
            graph: ShaderGraph::new(),
            pass_id: 0,
            use_mis: true,
            use_transparent_shadow: true,
            heterogeneous_volume: true,
            volume_sampling_method: VolumeSampling::default(),
            volume_interpolation_method: VolumeInterpolation::default(),
            volume_step_rate: 1.0,
            displacement_method: DisplacementMethod::default(),
            id: None,
            flags: ShaderFlags::default(),
            has_volume_connected: false,
            attributes: AttributeRequestSet::new(),
            need_update_attribute: false,
            compiled: None,
            modified: true,
        };
        shader.set_graph(graph);
        shader
    }

    pub fn graph(&self) -> &ShaderGraph {
        &self.graph
    }

    /// Mutable graph access; marks the shader modified.
    pub fn graph_mut(&mut self) -> &mut ShaderGraph {
        self.modified = true;
        &mut self.graph
    }

    pub fn set_graph(&mut self, graph: ShaderGraph) {
        self.has_volume_connected = graph.input_link_by_name(graph.output(), "Volume").is_some();
        self.graph = graph;
        self.modified = true;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn tag_modified(&mut self) {
        self.modified = true;
    }

    pub fn clear_modified(&mut self) {
        self.modified = false;
    }

    pub fn is_terminal_linked(&self, entry: EntryPoint) -> bool {
        self.graph.input_link_by_name(self.graph.output(), entry.terminal()).is_some()
    }

    /// Whether compiling this shader produces a bump entry point.
    pub fn needs_bump_entry(&self) -> bool {
        self.displacement_method != DisplacementMethod::True
            && self.is_terminal_linked(EntryPoint::Surface)
            && self.is_terminal_linked(EntryPoint::Displacement)
    }

    /// Resets per-compile state and finalizes the graph. Both backends call
    /// this before walking the graph.
    pub fn prepare_compile(&mut self) -> bool {
        let has_bump = self.needs_bump_entry();
        self.graph.finalize(FinalizeOptions {
            do_bump: has_bump,
            bump_in_object_space: has_bump && self.displacement_method == DisplacementMethod::Both,
        });
        self.flags = ShaderFlags::default();
        self.has_volume_connected = self.is_terminal_linked(EntryPoint::Volume);
        has_bump
    }

    /// Stores the attribute requests found by the last compile.
    pub fn update_attributes(&mut self, mut requests: AttributeRequestSet) {
        if self.flags.has_displacement && self.displacement_method == DisplacementMethod::Both {
            requests.add_standard(AttributeStandard::PositionUndisplaced);
        }
        self.need_update_attribute = requests.modified(&self.attributes);
        self.attributes = requests;
    }

    /// Emission of a shader whose surface is a single unlinked emission or
    /// background closure, which lets lights skip shader evaluation.
    pub fn constant_emission(&self) -> Option<Float3> {
        let (src, _) = self.graph.input_link_by_name(self.graph.output(), "Surface")?;
        let node = self.graph.node(src)?;
        if !matches!(node.kind, NodeKind::Emission | NodeKind::Background) {
            return None;
        }
        if self.graph.input_link_by_name(src, "Color").is_some()
            || self.graph.input_link_by_name(src, "Strength").is_some()
        {
            return None;
        }
        Some(node.float3("Color").scale(node.float("Strength")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SocketValue;

    #[test]
    fn constant_emission_requires_unlinked_inputs() {
        let mut shader = Shader::new("light");
        let g = shader.graph_mut();
        let emission = g.add(NodeKind::Emission);
        g.set_input(emission, "Color", SocketValue::Float3(Float3::ONE)).unwrap();
        g.set_input(emission, "Strength", SocketValue::Float(2.0)).unwrap();
        let out = g.output();
        g.connect(emission, "Emission", out, "Surface").unwrap();
        assert_eq!(shader.constant_emission(), Some(Float3::splat(2.0)));

        let g = shader.graph_mut();
        let tex = g.add(NodeKind::CheckerTexture);
        g.connect(tex, "Fac", emission, "Strength").unwrap();
        assert_eq!(shader.constant_emission(), None);
    }

    #[test]
    fn bump_entry_needs_surface_and_displacement() {
        let mut graph = ShaderGraph::new();
        let out = graph.output();
        let diffuse = graph.add(NodeKind::DiffuseBsdf);
        let disp = graph.add(NodeKind::Displacement { use_object_space: false });
        graph.connect(diffuse, "BSDF", out, "Surface").unwrap();
        let mut shader = Shader::with_graph("s", graph.clone());
        assert!(!shader.needs_bump_entry());

        graph.connect(disp, "Displacement", out, "Displacement").unwrap();
        shader.set_graph(graph);
        assert!(shader.needs_bump_entry());
        shader.displacement_method = DisplacementMethod::True;
        assert!(!shader.needs_bump_entry());
    }

    #[test]
    fn volume_connection_tracked_on_set_graph() {
        let mut graph = ShaderGraph::new();
        let out = graph.output();
        let volume = graph.add(NodeKind::AbsorptionVolume);
        graph.connect(volume, "Volume", out, "Volume").unwrap();
        let shader = Shader::with_graph("fog", graph);
        assert!(shader.has_volume_connected);
        assert!(shader.is_modified());
    }

    #[test]
    fn entry_lookup_of_absent_entry_is_empty() {
        let program = BytecodeProgram::default();
        assert_eq!(program.entry_len(EntryPoint::Volume), 0);
    }
}
