//! Bytecode opcodes, operand encodings, and stack constants.
//!
//! An instruction is four `i32` words. The first word of an opcode
//! instruction is the opcode; some opcodes are followed by raw data
//! instructions whose words are all operands.

use serde::{Deserialize, Serialize};

/// Number of float slots on the evaluation stack.
pub const STACK_SIZE: usize = 255;

/// Operand value meaning "no stack slot".
pub const STACK_INVALID: u32 = 255;

/// Slots reserved to save shading state while evaluating bump.
pub const BUMP_EVAL_STATE_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Opcode {
    End = 0,
    ShaderJump,
    ClosureBsdf,
    ClosureEmission,
    ClosureBackground,
    ClosureHoldout,
    ClosureVolume,
    ClosureSetWeight,
    ClosureWeight,
    EmissionWeight,
    ClosureSetNormal,
    MixClosure,
    JumpIfZero,
    JumpIfOne,
    ValueF,
    ValueV,
    Attr,
    Geometry,
    TexCoord,
    LightPath,
    Math,
    VectorMath,
    Mix,
    TexImage,
    TexChecker,
    AmbientOcclusion,
    SetBump,
    BumpFromDisplacement,
    Displacement,
    SetDisplacement,
    EnterBumpEval,
    LeaveBumpEval,
}

impl Opcode {
    const ALL: [Opcode; 32] = [
        Opcode::End,
        Opcode::ShaderJump,
        Opcode::ClosureBsdf,
        Opcode::ClosureEmission,
        Opcode::ClosureBackground,
        Opcode::ClosureHoldout,
        Opcode::ClosureVolume,
        Opcode::ClosureSetWeight,
        Opcode::ClosureWeight,
        Opcode::EmissionWeight,
        Opcode::ClosureSetNormal,
        Opcode::MixClosure,
        Opcode::JumpIfZero,
        Opcode::JumpIfOne,
        Opcode::ValueF,
        Opcode::ValueV,
        Opcode::Attr,
        Opcode::Geometry,
        Opcode::TexCoord,
        Opcode::LightPath,
        Opcode::Math,
        Opcode::VectorMath,
        Opcode::Mix,
        Opcode::TexImage,
        Opcode::TexChecker,
        Opcode::AmbientOcclusion,
        Opcode::SetBump,
        Opcode::BumpFromDisplacement,
        Opcode::Displacement,
        Opcode::SetDisplacement,
        Opcode::EnterBumpEval,
        Opcode::LeaveBumpEval,
    ];

    pub fn from_i32(value: i32) -> Option<Opcode> {
        Self::ALL.get(usize::try_from(value).ok()?).copied()
    }
}

/// Closure kinds encoded in the first byte of a closure instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClosureType {
    Diffuse = 1,
    Glossy,
    Transparent,
    Bssrdf,
    VolumeAbsorption,
    VolumeHenyeyGreenstein,
}

/// Output width selector for attribute reads.
pub mod attr_output {
    pub const FLOAT3: i32 = 0;
    pub const FLOAT: i32 = 1;
}

/// Geometry quantities read by [`Opcode::Geometry`].
pub mod geom {
    pub const POSITION: i32 = 0;
    pub const NORMAL: i32 = 1;
    pub const INCOMING: i32 = 2;
    pub const BACKFACING: i32 = 3;
}

/// Coordinates read by [`Opcode::TexCoord`].
pub mod texco {
    pub const NORMAL: i32 = 0;
    pub const OBJECT: i32 = 1;
}

/// Ray state read by [`Opcode::LightPath`].
pub mod light_path {
    pub const IS_CAMERA_RAY: i32 = 0;
    pub const IS_SHADOW_RAY: i32 = 1;
    pub const RAY_LENGTH: i32 = 2;
}

/// Flags packed into [`Opcode::TexImage`].
pub mod image_flags {
    pub const COMPRESS_AS_SRGB: u32 = 1;
    pub const ALPHA_OUTPUT: u32 = 2;
}

/// Bit pattern of a float stored in an instruction word.
pub fn float_bits(value: f32) -> i32 {
    value.to_bits() as i32
}

pub fn bits_float(word: i32) -> f32 {
    f32::from_bits(word as u32)
}

/// Packs four byte-sized operands into one word, `x` in the low byte.
/// Returns `None` if any operand exceeds 255.
pub fn encode_uchar4(x: u32, y: u32, z: u32, w: u32) -> Option<i32> {
    if x > 255 || y > 255 || z > 255 || w > 255 {
        return None;
    }
    Some((x | (y << 8) | (z << 16) | (w << 24)) as i32)
}

pub fn decode_uchar4(word: i32) -> [u32; 4] {
    let v = word as u32;
    [v & 0xff, (v >> 8) & 0xff, (v >> 16) & 0xff, (v >> 24) & 0xff]
}
