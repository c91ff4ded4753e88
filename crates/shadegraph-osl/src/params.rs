//! Conversion of socket values into engine parameters.
//!
//! The engine has no booleans, so they travel as ints. Transforms become
//! transposed 4x4 projection matrices. Vector arrays are packed three
//! floats per element.

use shadegraph_core::{Float3, SocketType, SocketValue, Transform};

use crate::engine::{ParamData, ParamValue, TypeDesc};
use crate::error::OslError;

impl ParamValue {
    pub fn float(v: f32) -> Self {
        ParamValue { ty: TypeDesc::FLOAT, data: ParamData::Float(vec![v]) }
    }

    pub fn int(v: i32) -> Self {
        ParamValue { ty: TypeDesc::INT, data: ParamData::Int(vec![v]) }
    }

    pub fn string(s: impl Into<String>) -> Self {
        ParamValue { ty: TypeDesc::STRING, data: ParamData::String(vec![s.into()]) }
    }

    /// A float3 with the given color, point, vector, or normal type.
    pub fn float3(ty: TypeDesc, v: Float3) -> Self {
        ParamValue { ty, data: ParamData::Float(v.to_array().to_vec()) }
    }

    pub fn color(v: Float3) -> Self {
        Self::float3(TypeDesc::COLOR, v)
    }

    pub fn matrix(tfm: &Transform) -> Self {
        ParamValue { ty: TypeDesc::MATRIX, data: ParamData::Float(tfm.to_transposed_projection().to_vec()) }
    }

    pub fn float_array(values: &[f32]) -> Self {
        ParamValue {
            ty: TypeDesc::FLOAT.array(values.len()),
            data: ParamData::Float(values.to_vec()),
        }
    }

    pub fn color_array(values: &[Float3]) -> Self {
        float3_array(TypeDesc::COLOR, values)
    }
}

fn float3_array(elem: TypeDesc, values: &[Float3]) -> ParamValue {
    ParamValue {
        ty: elem.array(values.len()),
        data: ParamData::Float(values.iter().flat_map(|v| v.to_array()).collect()),
    }
}

fn float3_type(ty: SocketType) -> Option<TypeDesc> {
    match ty {
        SocketType::Color | SocketType::ColorArray => Some(TypeDesc::COLOR),
        SocketType::Point | SocketType::PointArray => Some(TypeDesc::POINT),
        SocketType::Vector | SocketType::VectorArray => Some(TypeDesc::VECTOR),
        SocketType::Normal | SocketType::NormalArray => Some(TypeDesc::NORMAL),
        _ => None,
    }
}

/// Marshals the value of a socket named `name` with type `ty`.
///
/// Closures and unsigned ints have no parameter form and fail with
/// [`OslError::UnsupportedParameter`].
pub fn socket_param(name: &str, ty: SocketType, value: &SocketValue) -> Result<ParamValue, OslError> {
    let mismatch = || OslError::ValueMismatch { name: name.to_string(), ty };
    let param = match (ty, value) {
        (SocketType::Boolean, SocketValue::Bool(b)) => ParamValue::int(i32::from(*b)),
        (SocketType::Float, SocketValue::Float(v)) => ParamValue::float(*v),
        (SocketType::Int, SocketValue::Int(v)) => ParamValue::int(*v),
        (
            SocketType::Color | SocketType::Point | SocketType::Vector | SocketType::Normal,
            SocketValue::Float3(v),
        ) => ParamValue::float3(float3_type(ty).ok_or_else(mismatch)?, *v),
        (SocketType::Point2, SocketValue::Float2(v)) => {
            ParamValue { ty: TypeDesc::POINT2, data: ParamData::Float(vec![v.x, v.y]) }
        }
        (SocketType::String | SocketType::Enum, SocketValue::String(s)) => ParamValue::string(s.clone()),
        (SocketType::Transform, SocketValue::Transform(t)) => ParamValue::matrix(t),
        (SocketType::BooleanArray, SocketValue::BoolArray(v)) => ParamValue {
            ty: TypeDesc::INT.array(v.len()),
            data: ParamData::Int(v.iter().map(|b| i32::from(*b)).collect()),
        },
        (SocketType::FloatArray, SocketValue::FloatArray(v)) => ParamValue::float_array(v),
        (SocketType::IntArray, SocketValue::IntArray(v)) => ParamValue {
            ty: TypeDesc::INT.array(v.len()),
            data: ParamData::Int(v.clone()),
        },
        (
            SocketType::ColorArray
            | SocketType::VectorArray
            | SocketType::PointArray
            | SocketType::NormalArray,
            SocketValue::Float3Array(v),
        ) => float3_array(float3_type(ty).ok_or_else(mismatch)?, v),
        (SocketType::Point2Array, SocketValue::Float2Array(v)) => ParamValue {
            ty: TypeDesc::POINT2.array(v.len()),
            data: ParamData::Float(v.iter().flat_map(|p| [p.x, p.y]).collect()),
        },
        (SocketType::StringArray, SocketValue::StringArray(v)) => ParamValue {
            ty: TypeDesc::STRING.array(v.len()),
            data: ParamData::String(v.clone()),
        },
        (SocketType::TransformArray, SocketValue::TransformArray(v)) => ParamValue {
            ty: TypeDesc::MATRIX.array(v.len()),
            data: ParamData::Float(v.iter().flat_map(|t| t.to_transposed_projection()).collect()),
        },
        (SocketType::Closure | SocketType::UInt, _) => {
            return Err(OslError::UnsupportedParameter { name: name.to_string(), ty });
        }
        _ => return Err(mismatch()),
    };
    Ok(param)
}

/// Attribute name as a shader sees it: standard attributes are read through
/// the `geom:` namespace.
pub fn attribute_param(name: &str) -> ParamValue {
    match shadegraph_core::AttributeStandard::from_name(name) {
        Some(_) => ParamValue::string(format!("geom:{name}")),
        None => ParamValue::string(name),
    }
}

#[cfg(test)]
mod tests {
    use shadegraph_core::Float2;

    use super::*;

    #[test]
    fn booleans_travel_as_ints() {
        let p = socket_param("use_clamp", SocketType::Boolean, &SocketValue::Bool(true)).unwrap();
        assert_eq!(p, ParamValue::int(1));
        let p = socket_param(
            "flags",
            SocketType::BooleanArray,
            &SocketValue::BoolArray(vec![true, false, true]),
        )
        .unwrap();
        assert_eq!(p.ty, TypeDesc::INT.array(3));
        assert_eq!(p.data, ParamData::Int(vec![1, 0, 1]));
    }

    #[test]
    fn vector_arrays_are_packed_without_padding() {
        let colors = vec![Float3::new(1.0, 2.0, 3.0), Float3::new(4.0, 5.0, 6.0)];
        let p = socket_param("ramp", SocketType::ColorArray, &SocketValue::Float3Array(colors)).unwrap();
        assert_eq!(p.ty, TypeDesc::COLOR.array(2));
        assert_eq!(p.data, ParamData::Float(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        assert!(p.is_consistent());
    }

    #[test]
    fn transforms_become_transposed_matrices() {
        let t = Transform::translation(1.0, 2.0, 3.0);
        let p = socket_param("tfm", SocketType::Transform, &SocketValue::Transform(t)).unwrap();
        let ParamData::Float(m) = &p.data else { panic!("expected floats") };
        assert_eq!(p.ty, TypeDesc::MATRIX);
        assert_eq!(&m[12..16], &[1.0, 2.0, 3.0, 1.0]);

        let p = socket_param(
            "tfms",
            SocketType::TransformArray,
            &SocketValue::TransformArray(vec![t, Transform::IDENTITY]),
        )
        .unwrap();
        assert_eq!(p.ty.value_count(), 32);
        assert!(p.is_consistent());
    }

    #[test]
    fn normals_keep_their_semantics() {
        let p = socket_param("N", SocketType::Normal, &SocketValue::Float3(Float3::new(0.0, 0.0, 1.0)))
            .unwrap();
        assert_eq!(p.ty, TypeDesc::NORMAL);
        let p = socket_param("uv", SocketType::Point2, &SocketValue::Float2(Float2 { x: 0.5, y: 0.25 }))
            .unwrap();
        assert_eq!(p.data, ParamData::Float(vec![0.5, 0.25]));
    }

    #[test]
    fn closures_and_uints_have_no_parameter_form() {
        assert!(matches!(
            socket_param("BSDF", SocketType::Closure, &SocketValue::None),
            Err(OslError::UnsupportedParameter { ty: SocketType::Closure, .. })
        ));
        assert!(matches!(
            socket_param("seed", SocketType::UInt, &SocketValue::UInt(3)),
            Err(OslError::UnsupportedParameter { ty: SocketType::UInt, .. })
        ));
        assert!(matches!(
            socket_param("Fac", SocketType::Float, &SocketValue::Int(3)),
            Err(OslError::ValueMismatch { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn vector_arrays_always_match_their_type(
            values in proptest::collection::vec((-1e3f32..1e3, -1e3f32..1e3, -1e3f32..1e3), 1..32),
        ) {
            let values: Vec<Float3> = values.into_iter().map(|(x, y, z)| Float3::new(x, y, z)).collect();
            for ty in [SocketType::ColorArray, SocketType::PointArray, SocketType::VectorArray, SocketType::NormalArray] {
                let p = socket_param("v", ty, &SocketValue::Float3Array(values.clone())).unwrap();
                proptest::prop_assert!(p.is_consistent());
                proptest::prop_assert_eq!(p.ty.value_count(), values.len() * 3);
            }
        }
    }

    #[test]
    fn standard_attributes_use_the_geom_namespace() {
        assert_eq!(attribute_param("uv"), ParamValue::string("geom:uv"));
        assert_eq!(attribute_param("wetness"), ParamValue::string("wetness"));
    }
}
