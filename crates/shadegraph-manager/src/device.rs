//! Device-side shader state read by the rendering kernel.
//!
//! The bytecode backend uploads one global instruction array: a jump table
//! with one `ShaderJump` per shader, indexed by shader id, followed by every
//! shader's program without its header. The external backend uploads one
//! group handle per shader and entry point instead. Both upload a
//! [`KernelShader`] per shader.

use serde::{Deserialize, Serialize};
use shadegraph_core::shader::{VolumeInterpolation, VolumeSampling};
use shadegraph_core::{
    BytecodeProgram, DisplacementMethod, EntryPoint, Float3, Instruction, Shader, ShaderGroupRef,
};
use shadegraph_svm::Opcode;

/// Bits of [`KernelShader::flags`].
pub mod shader_flags {
    pub const USE_MIS: u32 = 1 << 0;
    pub const HAS_EMISSION: u32 = 1 << 1;
    pub const HAS_TRANSPARENT_SHADOW: u32 = 1 << 2;
    pub const HAS_VOLUME: u32 = 1 << 3;
    pub const HAS_ONLY_VOLUME: u32 = 1 << 4;
    pub const HETEROGENEOUS_VOLUME: u32 = 1 << 5;
    pub const NEED_VOLUME_ATTRIBUTES: u32 = 1 << 6;
    pub const HAS_BSSRDF_BUMP: u32 = 1 << 7;
    pub const VOLUME_EQUIANGULAR: u32 = 1 << 8;
    pub const VOLUME_MIS: u32 = 1 << 9;
    pub const VOLUME_CUBIC: u32 = 1 << 10;
    pub const HAS_BUMP: u32 = 1 << 11;
    pub const HAS_DISPLACEMENT: u32 = 1 << 12;
    pub const HAS_CONSTANT_EMISSION: u32 = 1 << 13;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelShader {
    pub flags: u32,
    pub pass_id: i32,
    /// Emission of a constant-emission shader, zero otherwise.
    pub constant_emission: [f32; 3],
}

impl KernelShader {
    /// Kernel entry for a compiled shader. Volume sampling flags only apply
    /// on devices with decoupled volume sampling.
    pub fn from_shader(shader: &Shader, volume_decoupled: bool) -> Self {
        use shader_flags::*;

        let f = &shader.flags;
        let mut flags = 0;
        if shader.use_mis {
            flags |= USE_MIS;
        }
        if f.has_surface_emission {
            flags |= HAS_EMISSION;
        }
        if f.has_surface_transparent && shader.use_transparent_shadow {
            flags |= HAS_TRANSPARENT_SHADOW;
        }
        if f.has_volume {
            flags |= HAS_VOLUME;
            if !f.has_surface {
                flags |= HAS_ONLY_VOLUME;
            }
            if shader.heterogeneous_volume && f.has_volume_spatial_varying {
                flags |= HETEROGENEOUS_VOLUME;
            }
        }
        if f.has_volume_attribute_dependency {
            flags |= NEED_VOLUME_ATTRIBUTES;
        }
        if f.has_bssrdf_bump {
            flags |= HAS_BSSRDF_BUMP;
        }
        if volume_decoupled {
            match shader.volume_sampling_method {
                VolumeSampling::Equiangular => flags |= VOLUME_EQUIANGULAR,
                VolumeSampling::MultipleImportance => flags |= VOLUME_MIS,
                VolumeSampling::Distance => {}
            }
        }
        if shader.volume_interpolation_method == VolumeInterpolation::Cubic {
            flags |= VOLUME_CUBIC;
        }
        if f.has_bump {
            flags |= HAS_BUMP;
        }
        if shader.displacement_method != DisplacementMethod::Bump {
            flags |= HAS_DISPLACEMENT;
        }

        let mut constant_emission = [0.0; 3];
        if let Some(emission) = shader.constant_emission() {
            flags |= HAS_CONSTANT_EMISSION;
            constant_emission = emission.to_array();
        }

        KernelShader { flags, pass_id: shader.pass_id, constant_emission }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Lays out the global instruction array for `programs`, indexed by shader
/// id. A shader without a program jumps straight to a terminator.
pub fn build_svm_nodes(programs: &[Option<&BytecodeProgram>]) -> Vec<Instruction> {
    let mut nodes: Vec<Instruction> = vec![[0; 4]; programs.len()];
    for (index, program) in programs.iter().enumerate() {
        let offset = nodes.len();
        match program.filter(|p| !p.instructions.is_empty()) {
            Some(program) => {
                let header = program.instructions[0];
                // Local targets count the header, which is not copied.
                let rebase = |target: i32| target - 1 + offset as i32;
                nodes[index] =
                    [Opcode::ShaderJump as i32, rebase(header[1]), rebase(header[2]), rebase(header[3])];
                nodes.extend_from_slice(&program.instructions[1..]);
            }
            None => {
                let end = offset as i32;
                nodes[index] = [Opcode::ShaderJump as i32, end, end, end];
                nodes.push([Opcode::End as i32, 0, 0, 0]);
            }
        }
    }
    nodes
}

/// Group handles of every shader, indexed by shader id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OslGlobals {
    pub surface_state: Vec<Option<ShaderGroupRef>>,
    pub bump_state: Vec<Option<ShaderGroupRef>>,
    pub volume_state: Vec<Option<ShaderGroupRef>>,
    pub displacement_state: Vec<Option<ShaderGroupRef>>,
    pub background_state: Option<ShaderGroupRef>,
    pub default_surface_state: Option<ShaderGroupRef>,
}

impl OslGlobals {
    pub fn from_shaders(shaders: &[Shader], background: usize, default_surface: usize) -> Self {
        let group = |shader: &Shader, entry: EntryPoint| {
            shader.compiled.as_ref().and_then(|c| c.as_external()).and_then(|p| p.group(entry))
        };
        let state = |entry: EntryPoint| shaders.iter().map(|s| group(s, entry)).collect::<Vec<_>>();

        let surface_state = state(EntryPoint::Surface);
        OslGlobals {
            background_state: surface_state.get(background).copied().flatten(),
            default_surface_state: surface_state.get(default_surface).copied().flatten(),
            surface_state,
            bump_state: state(EntryPoint::Bump),
            volume_state: state(EntryPoint::Volume),
            displacement_state: state(EntryPoint::Displacement),
        }
    }
}

/// Everything the manager uploads for the kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceScene {
    pub svm_nodes: Vec<Instruction>,
    pub shaders: Vec<KernelShader>,
    pub osl: Option<OslGlobals>,
    pub rgb_to_y: Float3,
    uploaded: bool,
    uploads: usize,
}

impl DeviceScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded
    }

    /// Number of uploads since creation.
    pub fn uploads(&self) -> usize {
        self.uploads
    }

    pub(crate) fn mark_uploaded(&mut self) {
        self.uploaded = true;
        self.uploads += 1;
    }

    /// Drops all shader state. Safe on a scene that was never uploaded.
    pub fn free(&mut self) {
        self.svm_nodes = Vec::new();
        self.shaders = Vec::new();
        self.osl = None;
        self.uploaded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadegraph_core::{NodeKind, ShaderFlags};

    fn program(instructions: Vec<Instruction>) -> BytecodeProgram {
        BytecodeProgram { instructions, ..BytecodeProgram::default() }
    }

    #[test]
    fn jump_table_is_rebased_past_the_table() {
        let jump = Opcode::ShaderJump as i32;
        let end = Opcode::End as i32;
        // Surface at 1, no volume or displacement: both jump to the terminator at 3.
        let a = program(vec![[jump, 1, 3, 3], [7, 0, 0, 0], [end, 0, 0, 0], [end, 0, 0, 0]]);
        let b = program(vec![[jump, 1, 2, 2], [end, 0, 0, 0], [end, 0, 0, 0]]);
        let nodes = build_svm_nodes(&[Some(&a), None, Some(&b)]);

        // Table of three, then a (3 nodes), then the empty shader's terminator, then b.
        assert_eq!(nodes[0], [jump, 3, 5, 5]);
        assert_eq!(nodes[3], [7, 0, 0, 0]);
        assert_eq!(nodes[1], [jump, 6, 6, 6]);
        assert_eq!(nodes[6], [end, 0, 0, 0]);
        assert_eq!(nodes[2], [jump, 7, 8, 8]);
        assert_eq!(nodes.len(), 9);
    }

    #[test]
    fn flags_follow_shader_settings() {
        let mut shader = Shader::new("fog");
        shader.flags = ShaderFlags { has_volume: true, has_volume_spatial_varying: true, ..ShaderFlags::default() };
        shader.volume_sampling_method = VolumeSampling::Equiangular;
        shader.volume_interpolation_method = VolumeInterpolation::Cubic;

        let k = KernelShader::from_shader(&shader, true);
        assert!(k.has(shader_flags::HAS_VOLUME));
        assert!(k.has(shader_flags::HAS_ONLY_VOLUME));
        assert!(k.has(shader_flags::HETEROGENEOUS_VOLUME));
        assert!(k.has(shader_flags::VOLUME_EQUIANGULAR));
        assert!(k.has(shader_flags::VOLUME_CUBIC));
        assert!(!k.has(shader_flags::HAS_DISPLACEMENT));

        let coupled = KernelShader::from_shader(&shader, false);
        assert!(!coupled.has(shader_flags::VOLUME_EQUIANGULAR));
    }

    #[test]
    fn constant_emission_is_uploaded() {
        let mut shader = Shader::new("lamp");
        let g = shader.graph_mut();
        let emission = g.add(NodeKind::Emission);
        let out = g.output();
        g.connect(emission, "Emission", out, "Surface").unwrap();

        let k = KernelShader::from_shader(&shader, true);
        assert!(k.has(shader_flags::HAS_CONSTANT_EMISSION));
        assert_eq!(k.constant_emission, [8.0, 8.0, 8.0]);
    }

    #[test]
    fn freeing_an_unused_scene_is_harmless() {
        let mut scene = DeviceScene::new();
        scene.free();
        scene.free();
        assert!(!scene.is_uploaded());
        assert_eq!(scene.uploads(), 0);
    }
}
