//! Socket types and the values carried by unlinked inputs.
//!
//! [`SocketType`] is the closed set of types a socket may have. Backends
//! match on it exhaustively; anything a backend cannot express surfaces as
//! a typed error rather than a silent skip.

use serde::{Deserialize, Serialize};

/// Three-component float vector used for colors, points, vectors, normals.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Float3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Float3 {
    pub const ZERO: Float3 = Float3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const ONE: Float3 = Float3 { x: 1.0, y: 1.0, z: 1.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Float3 { x, y, z }
    }

    pub const fn splat(v: f32) -> Self {
        Float3 { x: v, y: v, z: v }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn scale(self, s: f32) -> Self {
        Float3::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn is_zero(self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

/// Two-component float vector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Float2 {
    pub x: f32,
    pub y: f32,
}

/// Affine transform stored as three rows of a 3x4 matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub rows: [[f32; 4]; 3],
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Extends to a 4x4 projection matrix and returns it transposed, in
    /// row-major order. This is the layout matrix shader parameters expect.
    pub fn to_transposed_projection(&self) -> [f32; 16] {
        let full = [self.rows[0], self.rows[1], self.rows[2], [0.0, 0.0, 0.0, 1.0]];
        let mut out = [0.0; 16];
        for (i, row) in full.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                out[j * 4 + i] = *v;
            }
        }
        out
    }

    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        let mut t = Transform::IDENTITY;
        t.rows[0][3] = x;
        t.rows[1][3] = y;
        t.rows[2][3] = z;
        t
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::IDENTITY
    }
}

/// Type of a node socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketType {
    Boolean,
    Float,
    Int,
    UInt,
    Color,
    Vector,
    Point,
    Normal,
    Point2,
    Closure,
    String,
    Enum,
    Transform,
    BooleanArray,
    FloatArray,
    IntArray,
    ColorArray,
    VectorArray,
    PointArray,
    NormalArray,
    Point2Array,
    StringArray,
    TransformArray,
}

impl SocketType {
    /// Number of bytecode stack slots a value of this type occupies, or
    /// `None` when the type never lives on the stack.
    pub fn stack_size(self) -> Option<u32> {
        match self {
            SocketType::Float | SocketType::Int => Some(1),
            SocketType::Color | SocketType::Vector | SocketType::Point | SocketType::Normal => {
                Some(3)
            }
            SocketType::Closure => Some(0),
            _ => None,
        }
    }

    pub fn is_float3(self) -> bool {
        matches!(
            self,
            SocketType::Color | SocketType::Vector | SocketType::Point | SocketType::Normal
        )
    }

    pub fn is_array(self) -> bool {
        matches!(
            self,
            SocketType::BooleanArray
                | SocketType::FloatArray
                | SocketType::IntArray
                | SocketType::ColorArray
                | SocketType::VectorArray
                | SocketType::PointArray
                | SocketType::NormalArray
                | SocketType::Point2Array
                | SocketType::StringArray
                | SocketType::TransformArray
        )
    }

    /// Whether an output of type `self` may feed an input of type `to`.
    ///
    /// Closures only link to closures. Other stack types link when they
    /// occupy the same number of slots; anything else requires an exact
    /// match.
    pub fn links_to(self, to: SocketType) -> bool {
        if self == to {
            return true;
        }
        match (self.stack_size(), to.stack_size()) {
            (Some(a), Some(b)) => a == b && a > 0,
            _ => false,
        }
    }
}

/// Value held by an unlinked input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SocketValue {
    /// Closures carry no value.
    None,
    Bool(bool),
    Float(f32),
    Int(i32),
    UInt(u32),
    Float3(Float3),
    Float2(Float2),
    String(String),
    Transform(Transform),
    BoolArray(Vec<bool>),
    FloatArray(Vec<f32>),
    IntArray(Vec<i32>),
    Float3Array(Vec<Float3>),
    Float2Array(Vec<Float2>),
    StringArray(Vec<String>),
    TransformArray(Vec<Transform>),
}

impl SocketValue {
    /// Zero value of the given socket type.
    pub fn default_for(ty: SocketType) -> Self {
        match ty {
            SocketType::Boolean => SocketValue::Bool(false),
            SocketType::Float => SocketValue::Float(0.0),
            SocketType::Int => SocketValue::Int(0),
            SocketType::UInt => SocketValue::UInt(0),
            SocketType::Color | SocketType::Vector | SocketType::Point | SocketType::Normal => {
                SocketValue::Float3(Float3::ZERO)
            }
            SocketType::Point2 => SocketValue::Float2(Float2::default()),
            SocketType::Closure => SocketValue::None,
            SocketType::String | SocketType::Enum => SocketValue::String(String::new()),
            SocketType::Transform => SocketValue::Transform(Transform::IDENTITY),
            SocketType::BooleanArray => SocketValue::BoolArray(Vec::new()),
            SocketType::FloatArray => SocketValue::FloatArray(Vec::new()),
            SocketType::IntArray => SocketValue::IntArray(Vec::new()),
            SocketType::ColorArray
            | SocketType::VectorArray
            | SocketType::PointArray
            | SocketType::NormalArray => SocketValue::Float3Array(Vec::new()),
            SocketType::Point2Array => SocketValue::Float2Array(Vec::new()),
            SocketType::StringArray => SocketValue::StringArray(Vec::new()),
            SocketType::TransformArray => SocketValue::TransformArray(Vec::new()),
        }
    }

    /// Whether this value may be stored in a socket of type `ty`.
    pub fn fits(&self, ty: SocketType) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(&SocketValue::default_for(ty))
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            SocketValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            SocketValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float3(&self) -> Option<Float3> {
        match self {
            SocketValue::Float3(v) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_sizes() {
        assert_eq!(SocketType::Float.stack_size(), Some(1));
        assert_eq!(SocketType::Int.stack_size(), Some(1));
        assert_eq!(SocketType::Normal.stack_size(), Some(3));
        assert_eq!(SocketType::Closure.stack_size(), Some(0));
        assert_eq!(SocketType::String.stack_size(), None);
        assert_eq!(SocketType::FloatArray.stack_size(), None);
    }

    #[test]
    fn closures_only_link_to_closures() {
        assert!(SocketType::Closure.links_to(SocketType::Closure));
        assert!(!SocketType::Color.links_to(SocketType::Closure));
        assert!(!SocketType::Closure.links_to(SocketType::Float));
        assert!(!SocketType::Float.links_to(SocketType::Color));
        assert!(SocketType::Color.links_to(SocketType::Normal));
        assert!(SocketType::Int.links_to(SocketType::Float));
        assert!(!SocketType::String.links_to(SocketType::Float));
    }

    #[test]
    fn default_values_fit_their_type() {
        for ty in [
            SocketType::Boolean,
            SocketType::Float,
            SocketType::Color,
            SocketType::Closure,
            SocketType::Transform,
            SocketType::VectorArray,
        ] {
            assert!(SocketValue::default_for(ty).fits(ty), "{ty:?}");
        }
        assert!(!SocketValue::Float(1.0).fits(SocketType::Color));
    }

    #[test]
    fn transposed_projection_puts_translation_in_last_row() {
        let t = Transform::translation(1.0, 2.0, 3.0);
        let m = t.to_transposed_projection();
        assert_eq!(&m[12..16], &[1.0, 2.0, 3.0, 1.0]);
        assert_eq!(m[0], 1.0);
        assert_eq!(m[3], 0.0);
    }
}
