//! The external shading engine seen from the graph compiler.
//!
//! A [`ShadingEngine`] builds shader groups from precompiled shader layers:
//! parameters are bound first, then the layer is instantiated, then its
//! inputs are connected to earlier layers. The engine keeps one mutable
//! build state, so callers serialize every group build.
//!
//! [`RecordingEngine`] is an in-process engine that validates call order and
//! records every call. Renders without a native engine use it, and tests
//! inspect what the compiler asked for.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use shadegraph_core::ShaderGroupRef;

use crate::error::OslError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseType {
    Int,
    Float,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregate {
    Scalar,
    Vec2,
    Vec3,
    Matrix44,
}

/// How a vector-valued parameter transforms between spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VecSemantics {
    None,
    Color,
    Point,
    Vector,
    Normal,
}

/// Type of an engine parameter. `arraylen` is zero for non-arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDesc {
    pub base: BaseType,
    pub aggregate: Aggregate,
    pub semantics: VecSemantics,
    pub arraylen: usize,
}

impl TypeDesc {
    const fn scalar(base: BaseType) -> Self {
        TypeDesc { base, aggregate: Aggregate::Scalar, semantics: VecSemantics::None, arraylen: 0 }
    }

    const fn vec3(semantics: VecSemantics) -> Self {
        TypeDesc { base: BaseType::Float, aggregate: Aggregate::Vec3, semantics, arraylen: 0 }
    }

    pub const INT: TypeDesc = TypeDesc::scalar(BaseType::Int);
    pub const FLOAT: TypeDesc = TypeDesc::scalar(BaseType::Float);
    pub const STRING: TypeDesc = TypeDesc::scalar(BaseType::String);
    pub const COLOR: TypeDesc = TypeDesc::vec3(VecSemantics::Color);
    pub const POINT: TypeDesc = TypeDesc::vec3(VecSemantics::Point);
    pub const VECTOR: TypeDesc = TypeDesc::vec3(VecSemantics::Vector);
    pub const NORMAL: TypeDesc = TypeDesc::vec3(VecSemantics::Normal);
    pub const POINT2: TypeDesc = TypeDesc {
        base: BaseType::Float,
        aggregate: Aggregate::Vec2,
        semantics: VecSemantics::Point,
        arraylen: 0,
    };
    pub const MATRIX: TypeDesc = TypeDesc {
        base: BaseType::Float,
        aggregate: Aggregate::Matrix44,
        semantics: VecSemantics::None,
        arraylen: 0,
    };

    pub const fn array(self, len: usize) -> Self {
        TypeDesc { arraylen: len, ..self }
    }

    pub fn is_array(self) -> bool {
        self.arraylen > 0
    }

    /// Scalars per element.
    pub fn components(self) -> usize {
        match self.aggregate {
            Aggregate::Scalar => 1,
            Aggregate::Vec2 => 2,
            Aggregate::Vec3 => 3,
            Aggregate::Matrix44 => 16,
        }
    }

    /// Scalars in the whole value, arrays included.
    pub fn value_count(self) -> usize {
        self.components() * self.arraylen.max(1)
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match (self.base, self.aggregate, self.semantics) {
            (BaseType::Int, _, _) => "int",
            (BaseType::String, _, _) => "string",
            (BaseType::Float, Aggregate::Scalar, _) => "float",
            (BaseType::Float, Aggregate::Matrix44, _) => "matrix",
            (BaseType::Float, Aggregate::Vec2, _) => "point2",
            (BaseType::Float, Aggregate::Vec3, VecSemantics::Color) => "color",
            (BaseType::Float, Aggregate::Vec3, VecSemantics::Point) => "point",
            (BaseType::Float, Aggregate::Vec3, VecSemantics::Normal) => "normal",
            (BaseType::Float, Aggregate::Vec3, _) => "vector",
        };
        if self.is_array() {
            write!(f, "{name}[{}]", self.arraylen)
        } else {
            f.write_str(name)
        }
    }
}

/// Flat parameter storage. Vector and matrix elements are packed with no
/// padding between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamData {
    Int(Vec<i32>),
    Float(Vec<f32>),
    String(Vec<String>),
}

impl ParamData {
    pub fn len(&self) -> usize {
        match self {
            ParamData::Int(v) => v.len(),
            ParamData::Float(v) => v.len(),
            ParamData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn base(&self) -> BaseType {
        match self {
            ParamData::Int(_) => BaseType::Int,
            ParamData::Float(_) => BaseType::Float,
            ParamData::String(_) => BaseType::String,
        }
    }
}

/// A typed parameter value ready to hand to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub ty: TypeDesc,
    pub data: ParamData,
}

impl ParamValue {
    /// Whether the storage matches the declared type.
    pub fn is_consistent(&self) -> bool {
        self.data.base() == self.ty.base && self.data.len() == self.ty.value_count()
    }
}

/// Kind of group a layer is instantiated into. The engine only tells
/// surface-like groups from displacement-like ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShaderUsage {
    Surface,
    Displacement,
}

impl ShaderUsage {
    pub fn name(self) -> &'static str {
        match self {
            ShaderUsage::Surface => "surface",
            ShaderUsage::Displacement => "displacement",
        }
    }
}

pub trait ShadingEngine: Send {
    /// Sets an engine-wide option.
    fn attribute(&mut self, name: &str, value: ParamValue) -> Result<(), OslError>;

    fn shader_group_begin(&mut self, name: &str) -> Result<ShaderGroupRef, OslError>;

    /// Binds a parameter of the next layer instantiated by [`shader`].
    ///
    /// [`shader`]: ShadingEngine::shader
    fn parameter(&mut self, name: &str, value: ParamValue) -> Result<(), OslError>;

    fn shader(&mut self, usage: ShaderUsage, shader: &str, layer: &str) -> Result<(), OslError>;

    fn connect_shaders(
        &mut self,
        from_layer: &str,
        from_param: &str,
        to_layer: &str,
        to_param: &str,
    ) -> Result<(), OslError>;

    fn shader_group_end(&mut self) -> Result<(), OslError>;

    /// Registers compiled shader bytecode under `name`.
    fn load_memory_compiled_shader(&mut self, name: &str, bytecode: &str) -> Result<(), OslError>;

    /// JIT-compiles every group built so far.
    fn optimize_all_groups(&mut self);
}

// ---------------------------------------------------------------------------
// Recording engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineCall {
    Attribute { name: String, value: ParamValue },
    GroupBegin { name: String, group: ShaderGroupRef },
    Parameter { name: String, value: ParamValue },
    Shader { usage: ShaderUsage, shader: String, layer: String },
    Connect { from_layer: String, from_param: String, to_layer: String, to_param: String },
    GroupEnd,
    LoadBytecode { name: String },
    OptimizeAll,
}

/// Call history shared between a [`RecordingEngine`] and whoever created it.
pub type CallLog = Arc<Mutex<Vec<EngineCall>>>;

#[derive(Debug, Default)]
pub struct RecordingEngine {
    calls: CallLog,
    open: Option<ShaderGroupRef>,
    layers: HashSet<String>,
    pending_params: usize,
    next_group: u64,
    loaded: HashSet<String>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records into `log` instead of a private history.
    pub fn with_log(log: CallLog) -> Self {
        RecordingEngine { calls: log, ..Self::default() }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn log(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains(name)
    }

    /// Number of groups built so far.
    pub fn group_count(&self) -> u64 {
        self.next_group
    }

    fn require_open(&self, call: &'static str) -> Result<(), OslError> {
        match self.open {
            Some(_) => Ok(()),
            None => Err(OslError::Engine { call, message: "no shader group is open".into() }),
        }
    }
}

impl ShadingEngine for RecordingEngine {
    fn attribute(&mut self, name: &str, value: ParamValue) -> Result<(), OslError> {
        self.record(EngineCall::Attribute { name: name.to_string(), value });
        Ok(())
    }

    fn shader_group_begin(&mut self, name: &str) -> Result<ShaderGroupRef, OslError> {
        if self.open.is_some() {
            return Err(OslError::Engine {
                call: "shader_group_begin",
                message: "a shader group is already open".into(),
            });
        }
        let group = ShaderGroupRef::new(self.next_group);
        self.next_group += 1;
        self.open = Some(group);
        self.layers.clear();
        self.pending_params = 0;
        self.record(EngineCall::GroupBegin { name: name.to_string(), group });
        Ok(group)
    }

    fn parameter(&mut self, name: &str, value: ParamValue) -> Result<(), OslError> {
        self.require_open("parameter")?;
        if !value.is_consistent() {
            return Err(OslError::Engine {
                call: "parameter",
                message: format!("'{name}' declared {} but holds {} values", value.ty, value.data.len()),
            });
        }
        self.pending_params += 1;
        self.record(EngineCall::Parameter { name: name.to_string(), value });
        Ok(())
    }

    fn shader(&mut self, usage: ShaderUsage, shader: &str, layer: &str) -> Result<(), OslError> {
        self.require_open("shader")?;
        if !self.layers.insert(layer.to_string()) {
            return Err(OslError::Engine {
                call: "shader",
                message: format!("duplicate layer '{layer}'"),
            });
        }
        self.pending_params = 0;
        self.record(EngineCall::Shader {
            usage,
            shader: shader.to_string(),
            layer: layer.to_string(),
        });
        Ok(())
    }

    fn connect_shaders(
        &mut self,
        from_layer: &str,
        from_param: &str,
        to_layer: &str,
        to_param: &str,
    ) -> Result<(), OslError> {
        self.require_open("connect_shaders")?;
        for layer in [from_layer, to_layer] {
            if !self.layers.contains(layer) {
                return Err(OslError::Engine {
                    call: "connect_shaders",
                    message: format!("unknown layer '{layer}'"),
                });
            }
        }
        self.record(EngineCall::Connect {
            from_layer: from_layer.to_string(),
            from_param: from_param.to_string(),
            to_layer: to_layer.to_string(),
            to_param: to_param.to_string(),
        });
        Ok(())
    }

    fn shader_group_end(&mut self) -> Result<(), OslError> {
        self.require_open("shader_group_end")?;
        if self.pending_params > 0 {
            tracing::warn!(count = self.pending_params, "parameters bound without a layer");
        }
        self.open = None;
        self.record(EngineCall::GroupEnd);
        Ok(())
    }

    fn load_memory_compiled_shader(&mut self, name: &str, _bytecode: &str) -> Result<(), OslError> {
        self.loaded.insert(name.to_string());
        self.record(EngineCall::LoadBytecode { name: name.to_string() });
        Ok(())
    }

    fn optimize_all_groups(&mut self) {
        self.record(EngineCall::OptimizeAll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float(v: f32) -> ParamValue {
        ParamValue { ty: TypeDesc::FLOAT, data: ParamData::Float(vec![v]) }
    }

    #[test]
    fn type_desc_counts_packed_values() {
        assert_eq!(TypeDesc::COLOR.value_count(), 3);
        assert_eq!(TypeDesc::COLOR.array(4).value_count(), 12);
        assert_eq!(TypeDesc::MATRIX.value_count(), 16);
        assert_eq!(TypeDesc::NORMAL.array(2).to_string(), "normal[2]");
    }

    #[test]
    fn groups_must_be_opened_before_layers() {
        let mut engine = RecordingEngine::new();
        assert!(matches!(
            engine.shader(ShaderUsage::Surface, "node_value", "a"),
            Err(OslError::Engine { call: "shader", .. })
        ));
        let g0 = engine.shader_group_begin("s").unwrap();
        assert!(engine.shader_group_begin("t").is_err());
        engine.parameter("value_value", float(1.0)).unwrap();
        engine.shader(ShaderUsage::Surface, "node_value", "a").unwrap();
        engine.shader_group_end().unwrap();
        let g1 = engine.shader_group_begin("t").unwrap();
        assert_ne!(g0, g1);
        assert_eq!(engine.group_count(), 2);
    }

    #[test]
    fn connections_need_known_layers() {
        let mut engine = RecordingEngine::new();
        engine.shader_group_begin("s").unwrap();
        engine.shader(ShaderUsage::Surface, "node_value", "a").unwrap();
        assert!(engine.connect_shaders("a", "Value", "b", "Fac").is_err());
        engine.shader(ShaderUsage::Surface, "node_math", "b").unwrap();
        engine.connect_shaders("a", "Value", "b", "Value1").unwrap();
    }

    #[test]
    fn inconsistent_parameters_are_rejected() {
        let mut engine = RecordingEngine::new();
        engine.shader_group_begin("s").unwrap();
        let bad = ParamValue { ty: TypeDesc::COLOR, data: ParamData::Float(vec![1.0]) };
        assert!(engine.parameter("Color", bad).is_err());
    }
}
