//! Shader node kinds and their socket templates.
//!
//! Every [`NodeKind`] except [`NodeKind::Script`] has a fixed socket layout
//! produced by [`NodeKind::sockets`]. Script nodes get their sockets from a
//! compiled shader's parameter query instead.
//!
//! Feature queries (`has_surface_emission`, `has_spatial_varying`, ...) live
//! here so both backends derive shader flags from the same source of truth.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::{Float3, SocketType, SocketValue, Transform};

/// Name of the closure weight input a backend fills in for surface closures.
pub const SURFACE_MIX_WEIGHT: &str = "SurfaceMixWeight";
/// Name of the closure weight input for volume closures.
pub const VOLUME_MIX_WEIGHT: &str = "VolumeMixWeight";

/// Kernel feature bits requested by nodes.
pub mod feature {
    pub const NODE_BSDF: u32 = 1 << 0;
    pub const NODE_EMISSION: u32 = 1 << 1;
    pub const NODE_VOLUME: u32 = 1 << 2;
    pub const NODE_BUMP: u32 = 1 << 3;
    pub const NODE_BUMP_STATE: u32 = 1 << 4;
    pub const NODE_RAYTRACE: u32 = 1 << 5;
    pub const NODE_LIGHT_PATH: u32 = 1 << 6;
    pub const TRANSPARENT: u32 = 1 << 7;
    pub const SUBSURFACE: u32 = 1 << 8;
    pub const VOLUME: u32 = 1 << 9;
    pub const OSL: u32 = 1 << 10;
}

/// Role a node plays for the graph compilers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialType {
    None,
    Output,
    CombineClosure,
    Bump,
    Geometry,
    Closure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Minimum,
    Maximum,
    LessThan,
    GreaterThan,
    Absolute,
    Sine,
    Cosine,
}

impl MathOp {
    /// Evaluates the operation on constants. Division by zero yields zero.
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            MathOp::Add => a + b,
            MathOp::Subtract => a - b,
            MathOp::Multiply => a * b,
            MathOp::Divide => {
                if b != 0.0 {
                    a / b
                } else {
                    0.0
                }
            }
            MathOp::Power => a.powf(b),
            MathOp::Minimum => a.min(b),
            MathOp::Maximum => a.max(b),
            MathOp::LessThan => (a < b) as i32 as f32,
            MathOp::GreaterThan => (a > b) as i32 as f32,
            MathOp::Absolute => a.abs(),
            MathOp::Sine => a.sin(),
            MathOp::Cosine => a.cos(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MathOp::Add => "add",
            MathOp::Subtract => "subtract",
            MathOp::Multiply => "multiply",
            MathOp::Divide => "divide",
            MathOp::Power => "power",
            MathOp::Minimum => "minimum",
            MathOp::Maximum => "maximum",
            MathOp::LessThan => "less_than",
            MathOp::GreaterThan => "greater_than",
            MathOp::Absolute => "absolute",
            MathOp::Sine => "sine",
            MathOp::Cosine => "cosine",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorMathOp {
    Add,
    Subtract,
    DotProduct,
    CrossProduct,
    Normalize,
}

impl VectorMathOp {
    pub fn name(self) -> &'static str {
        match self {
            VectorMathOp::Add => "add",
            VectorMathOp::Subtract => "subtract",
            VectorMathOp::DotProduct => "dot_product",
            VectorMathOp::CrossProduct => "cross_product",
            VectorMathOp::Normalize => "normalize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixBlend {
    Mix,
    Add,
    Multiply,
    Screen,
}

impl MixBlend {
    pub fn name(self) -> &'static str {
        match self {
            MixBlend::Mix => "mix",
            MixBlend::Add => "add",
            MixBlend::Multiply => "multiply",
            MixBlend::Screen => "screen",
        }
    }
}

/// Where a script node's compiled shader comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptSource {
    /// A `.osl` source, a `.oso` object, or a bare shader name.
    File(PathBuf),
    /// Bytecode already registered with the shading engine under this hash.
    Bytecode { hash: String },
}

/// The closed set of node kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
    Output,
    Value { value: f32 },
    Rgb { color: Float3 },
    Math { op: MathOp, use_clamp: bool },
    VectorMath { op: VectorMathOp },
    MixRgb { blend: MixBlend, use_clamp: bool },
    Attribute { attribute: String },
    TextureCoordinate { from_dupli: bool, object_transform: Option<Transform> },
    Geometry,
    LightPath,
    /// `slot` is the image slot interned by the host's image manager.
    ImageTexture { slot: u32, filename: String, colorspace: String },
    CheckerTexture,
    AmbientOcclusion { samples: u32, only_local: bool },
    DiffuseBsdf,
    GlossyBsdf,
    TransparentBsdf,
    SubsurfaceScattering,
    Emission,
    Background,
    Holdout,
    AbsorptionVolume,
    ScatterVolume,
    MixClosure,
    AddClosure,
    /// Inserted by finalization to split a closure weight between the two
    /// branches of a mix.
    MixClosureWeight,
    Bump { invert: bool, use_object_space: bool },
    /// Inserted by finalization to derive a shading normal from the
    /// displacement network.
    BumpFromDisplacement { use_object_space: bool },
    Displacement { use_object_space: bool },
    Script { source: ScriptSource },
}

fn input(name: &str, ty: SocketType, value: SocketValue) -> ShaderInput {
    ShaderInput { name: name.to_string(), ty, value, internal: false }
}

fn float_in(name: &str, v: f32) -> ShaderInput {
    input(name, SocketType::Float, SocketValue::Float(v))
}

fn color_in(name: &str, v: f32) -> ShaderInput {
    input(name, SocketType::Color, SocketValue::Float3(Float3::splat(v)))
}

fn vec_in(name: &str, ty: SocketType) -> ShaderInput {
    input(name, ty, SocketValue::Float3(Float3::ZERO))
}

fn closure_in(name: &str) -> ShaderInput {
    input(name, SocketType::Closure, SocketValue::None)
}

/// Backend-private weight input; never shown to users or passed to OSL.
fn weight_in(name: &str) -> ShaderInput {
    ShaderInput { internal: true, ..float_in(name, 0.0) }
}

fn output(name: &str, ty: SocketType) -> ShaderOutput {
    ShaderOutput { name: name.to_string(), ty }
}

impl NodeKind {
    /// Default socket layout for this kind.
    pub fn sockets(&self) -> (Vec<ShaderInput>, Vec<ShaderOutput>) {
        use SocketType as T;
        let closure_out = |name: &str| vec![output(name, T::Closure)];
        match self {
            NodeKind::Output => (
                vec![
                    closure_in("Surface"),
                    closure_in("Volume"),
                    vec_in("Displacement", T::Vector),
                    vec_in("Normal", T::Normal),
                ],
                vec![],
            ),
            NodeKind::Value { .. } => (vec![], vec![output("Value", T::Float)]),
            NodeKind::Rgb { .. } => (vec![], vec![output("Color", T::Color)]),
            NodeKind::Math { .. } => (
                vec![float_in("Value1", 0.5), float_in("Value2", 0.5)],
                vec![output("Value", T::Float)],
            ),
            NodeKind::VectorMath { .. } => (
                vec![vec_in("Vector1", T::Vector), vec_in("Vector2", T::Vector)],
                vec![output("Value", T::Float), output("Vector", T::Vector)],
            ),
            NodeKind::MixRgb { .. } => (
                vec![float_in("Fac", 0.5), color_in("Color1", 0.5), color_in("Color2", 0.5)],
                vec![output("Color", T::Color)],
            ),
            NodeKind::Attribute { .. } => (
                vec![],
                vec![
                    output("Color", T::Color),
                    output("Vector", T::Vector),
                    output("Fac", T::Float),
                ],
            ),
            NodeKind::TextureCoordinate { .. } => (
                vec![],
                vec![
                    output("Generated", T::Point),
                    output("Normal", T::Normal),
                    output("UV", T::Point),
                    output("Object", T::Point),
                ],
            ),
            NodeKind::Geometry => (
                vec![],
                vec![
                    output("Position", T::Point),
                    output("Normal", T::Normal),
                    output("Incoming", T::Vector),
                    output("Backfacing", T::Float),
                ],
            ),
            NodeKind::LightPath => (
                vec![],
                vec![
                    output("IsCameraRay", T::Float),
                    output("IsShadowRay", T::Float),
                    output("RayLength", T::Float),
                ],
            ),
            NodeKind::ImageTexture { .. } => (
                vec![vec_in("Vector", T::Point)],
                vec![output("Color", T::Color), output("Alpha", T::Float)],
            ),
            NodeKind::CheckerTexture => (
                vec![
                    vec_in("Vector", T::Point),
                    color_in("Color1", 0.8),
                    color_in("Color2", 0.2),
                    float_in("Scale", 5.0),
                ],
                vec![output("Color", T::Color), output("Fac", T::Float)],
            ),
            NodeKind::AmbientOcclusion { .. } => (
                vec![color_in("Color", 1.0), float_in("Distance", 1.0), vec_in("Normal", T::Normal)],
                vec![output("Color", T::Color), output("AO", T::Float)],
            ),
            NodeKind::DiffuseBsdf => (
                vec![
                    color_in("Color", 0.8),
                    float_in("Roughness", 0.0),
                    vec_in("Normal", T::Normal),
                    weight_in(SURFACE_MIX_WEIGHT),
                ],
                closure_out("BSDF"),
            ),
            NodeKind::GlossyBsdf => (
                vec![
                    color_in("Color", 0.8),
                    float_in("Roughness", 0.5),
                    vec_in("Normal", T::Normal),
                    weight_in(SURFACE_MIX_WEIGHT),
                ],
                closure_out("BSDF"),
            ),
            NodeKind::TransparentBsdf => (
                vec![color_in("Color", 1.0), weight_in(SURFACE_MIX_WEIGHT)],
                closure_out("BSDF"),
            ),
            NodeKind::SubsurfaceScattering => (
                vec![
                    color_in("Color", 0.8),
                    float_in("Scale", 1.0),
                    input("Radius", T::Vector, SocketValue::Float3(Float3::splat(0.1))),
                    vec_in("Normal", T::Normal),
                    weight_in(SURFACE_MIX_WEIGHT),
                ],
                closure_out("BSSRDF"),
            ),
            NodeKind::Emission => (
                vec![color_in("Color", 0.8), float_in("Strength", 10.0), weight_in(SURFACE_MIX_WEIGHT)],
                closure_out("Emission"),
            ),
            NodeKind::Background => (
                vec![color_in("Color", 0.8), float_in("Strength", 1.0), weight_in(SURFACE_MIX_WEIGHT)],
                closure_out("Background"),
            ),
            NodeKind::Holdout => (
                vec![weight_in(SURFACE_MIX_WEIGHT), weight_in(VOLUME_MIX_WEIGHT)],
                closure_out("Holdout"),
            ),
            NodeKind::AbsorptionVolume => (
                vec![color_in("Color", 0.8), float_in("Density", 1.0), weight_in(VOLUME_MIX_WEIGHT)],
                closure_out("Volume"),
            ),
            NodeKind::ScatterVolume => (
                vec![
                    color_in("Color", 0.8),
                    float_in("Density", 1.0),
                    float_in("Anisotropy", 0.0),
                    weight_in(VOLUME_MIX_WEIGHT),
                ],
                closure_out("Volume"),
            ),
            NodeKind::MixClosure => (
                vec![float_in("Fac", 0.5), closure_in("Closure1"), closure_in("Closure2")],
                closure_out("Closure"),
            ),
            NodeKind::AddClosure => {
                (vec![closure_in("Closure1"), closure_in("Closure2")], closure_out("Closure"))
            }
            NodeKind::MixClosureWeight => (
                vec![float_in("Weight", 1.0), float_in("Fac", 1.0)],
                vec![output("Weight1", T::Float), output("Weight2", T::Float)],
            ),
            NodeKind::Bump { .. } => (
                vec![
                    float_in("Strength", 1.0),
                    float_in("Distance", 0.1),
                    float_in("Height", 1.0),
                    vec_in("Normal", T::Normal),
                ],
                vec![output("Normal", T::Normal)],
            ),
            NodeKind::BumpFromDisplacement { .. } => (
                vec![vec_in("Displacement", T::Vector)],
                vec![output("Normal", T::Normal)],
            ),
            NodeKind::Displacement { .. } => (
                vec![
                    float_in("Height", 0.0),
                    float_in("Midlevel", 0.5),
                    float_in("Scale", 1.0),
                    vec_in("Normal", T::Normal),
                ],
                vec![output("Displacement", T::Vector)],
            ),
            NodeKind::Script { .. } => (vec![], vec![]),
        }
    }

    /// Snake-case type name, used for layer names and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Output => "output",
            NodeKind::Value { .. } => "value",
            NodeKind::Rgb { .. } => "rgb",
            NodeKind::Math { .. } => "math",
            NodeKind::VectorMath { .. } => "vector_math",
            NodeKind::MixRgb { .. } => "mix",
            NodeKind::Attribute { .. } => "attribute",
            NodeKind::TextureCoordinate { .. } => "texture_coordinate",
            NodeKind::Geometry => "geometry",
            NodeKind::LightPath => "light_path",
            NodeKind::ImageTexture { .. } => "image_texture",
            NodeKind::CheckerTexture => "checker_texture",
            NodeKind::AmbientOcclusion { .. } => "ambient_occlusion",
            NodeKind::DiffuseBsdf => "diffuse_bsdf",
            NodeKind::GlossyBsdf => "glossy_bsdf",
            NodeKind::TransparentBsdf => "transparent_bsdf",
            NodeKind::SubsurfaceScattering => "subsurface_scattering",
            NodeKind::Emission => "emission",
            NodeKind::Background => "background",
            NodeKind::Holdout => "holdout",
            NodeKind::AbsorptionVolume => "absorption_volume",
            NodeKind::ScatterVolume => "scatter_volume",
            NodeKind::MixClosure => "mix_closure",
            NodeKind::AddClosure => "add_closure",
            NodeKind::MixClosureWeight => "mix_closure_weight",
            NodeKind::Bump { .. } => "bump",
            NodeKind::BumpFromDisplacement { .. } => "bump_from_displacement",
            NodeKind::Displacement { .. } => "displacement",
            NodeKind::Script { .. } => "script",
        }
    }

    pub fn special_type(&self) -> SpecialType {
        match self {
            NodeKind::Output => SpecialType::Output,
            NodeKind::MixClosure | NodeKind::AddClosure => SpecialType::CombineClosure,
            NodeKind::Bump { .. } => SpecialType::Bump,
            NodeKind::Geometry => SpecialType::Geometry,
            k if k.is_closure() => SpecialType::Closure,
            _ => SpecialType::None,
        }
    }

    /// Leaf closures; combine nodes are not closures themselves.
    pub fn is_closure(&self) -> bool {
        matches!(
            self,
            NodeKind::DiffuseBsdf
                | NodeKind::GlossyBsdf
                | NodeKind::TransparentBsdf
                | NodeKind::SubsurfaceScattering
                | NodeKind::Emission
                | NodeKind::Background
                | NodeKind::Holdout
                | NodeKind::AbsorptionVolume
                | NodeKind::ScatterVolume
        )
    }

    pub fn has_surface_emission(&self) -> bool {
        matches!(self, NodeKind::Emission)
    }

    pub fn has_surface_transparent(&self) -> bool {
        matches!(self, NodeKind::TransparentBsdf)
    }

    pub fn has_surface_bssrdf(&self) -> bool {
        matches!(self, NodeKind::SubsurfaceScattering)
    }

    /// Output depends on shading position.
    pub fn has_spatial_varying(&self) -> bool {
        matches!(
            self,
            NodeKind::Attribute { .. }
                | NodeKind::TextureCoordinate { .. }
                | NodeKind::Geometry
                | NodeKind::ImageTexture { .. }
                | NodeKind::CheckerTexture
                | NodeKind::AmbientOcclusion { .. }
                | NodeKind::Bump { .. }
                | NodeKind::BumpFromDisplacement { .. }
        )
    }

    pub fn has_attribute_dependency(&self) -> bool {
        matches!(self, NodeKind::Attribute { .. } | NodeKind::TextureCoordinate { .. })
    }

    /// Output depends on integrator state such as the ray type.
    pub fn has_integrator_dependency(&self) -> bool {
        matches!(self, NodeKind::LightPath)
    }

    pub fn has_raytrace(&self) -> bool {
        matches!(self, NodeKind::AmbientOcclusion { .. })
    }

    /// Kernel features this node needs when compiled.
    pub fn feature_bits(&self) -> u32 {
        match self {
            NodeKind::Emission | NodeKind::Background => feature::NODE_EMISSION,
            NodeKind::TransparentBsdf => feature::NODE_BSDF | feature::TRANSPARENT,
            NodeKind::SubsurfaceScattering => feature::NODE_BSDF | feature::SUBSURFACE,
            NodeKind::DiffuseBsdf | NodeKind::GlossyBsdf | NodeKind::Holdout => feature::NODE_BSDF,
            NodeKind::AbsorptionVolume | NodeKind::ScatterVolume => {
                feature::NODE_VOLUME | feature::VOLUME
            }
            NodeKind::Bump { .. } | NodeKind::BumpFromDisplacement { .. } => feature::NODE_BUMP,
            NodeKind::AmbientOcclusion { .. } => feature::NODE_RAYTRACE,
            NodeKind::LightPath => feature::NODE_LIGHT_PATH,
            NodeKind::Script { .. } => feature::OSL,
            _ => 0,
        }
    }
}

/// An input socket with the value used while it is unlinked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderInput {
    pub name: String,
    pub ty: SocketType,
    pub value: SocketValue,
    /// Backend-private input, hidden from the external shading engine.
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderOutput {
    pub name: String,
    pub ty: SocketType,
}

/// A node in a shader graph: its kind plus socket state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderNode {
    pub kind: NodeKind,
    pub inputs: SmallVec<[ShaderInput; 4]>,
    pub outputs: SmallVec<[ShaderOutput; 2]>,
}

impl ShaderNode {
    /// Creates a node with the kind's default sockets.
    pub fn new(kind: NodeKind) -> Self {
        let (inputs, outputs) = kind.sockets();
        ShaderNode { kind, inputs: inputs.into(), outputs: outputs.into() }
    }

    /// Creates a node with explicit sockets (script nodes).
    pub fn with_sockets(kind: NodeKind, inputs: Vec<ShaderInput>, outputs: Vec<ShaderOutput>) -> Self {
        ShaderNode { kind, inputs: inputs.into(), outputs: outputs.into() }
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|i| i.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn input(&self, name: &str) -> Option<&ShaderInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Float value of an unlinked input, zero when absent or not a float.
    pub fn float(&self, name: &str) -> f32 {
        self.input(name).and_then(|i| i.value.as_float()).unwrap_or(0.0)
    }

    /// Float3 value of an unlinked input, zero when absent or not a float3.
    pub fn float3(&self, name: &str) -> Float3 {
        self.input(name).and_then(|i| i.value.as_float3()).unwrap_or(Float3::ZERO)
    }

    /// Name of the closure weight input for this node's closure class.
    pub fn weight_input(&self, volume: bool) -> Option<usize> {
        self.input_index(if volume { VOLUME_MIX_WEIGHT } else { SURFACE_MIX_WEIGHT })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_nodes_carry_internal_weight_inputs() {
        let node = ShaderNode::new(NodeKind::DiffuseBsdf);
        let idx = node.weight_input(false).unwrap();
        assert!(node.inputs[idx].internal);
        assert!(node.weight_input(true).is_none());

        let volume = ShaderNode::new(NodeKind::ScatterVolume);
        assert!(volume.weight_input(true).is_some());
        assert!(volume.weight_input(false).is_none());
    }

    #[test]
    fn combine_nodes_are_not_leaf_closures() {
        assert_eq!(NodeKind::MixClosure.special_type(), SpecialType::CombineClosure);
        assert!(!NodeKind::MixClosure.is_closure());
        assert_eq!(NodeKind::Emission.special_type(), SpecialType::Closure);
        assert_eq!(
            NodeKind::Bump { invert: false, use_object_space: false }.special_type(),
            SpecialType::Bump
        );
    }

    #[test]
    fn math_folding_guards_division() {
        assert_eq!(MathOp::Divide.apply(1.0, 0.0), 0.0);
        assert_eq!(MathOp::GreaterThan.apply(2.0, 1.0), 1.0);
        assert_eq!(MathOp::Add.apply(0.25, 0.5), 0.75);
    }

    #[test]
    fn output_node_has_the_four_terminals() {
        let node = ShaderNode::new(NodeKind::Output);
        let names: Vec<_> = node.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["Surface", "Volume", "Displacement", "Normal"]);
        assert!(node.outputs.is_empty());
    }
}
