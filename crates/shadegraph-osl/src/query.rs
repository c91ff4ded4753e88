//! Parameter query over compiled shader bytecode, and script nodes built
//! from it.
//!
//! Compiled shaders are line-oriented text. After the version line comes a
//! `<shadertype> <name>` line, then one tab-separated line per parameter:
//!
//! ```text
//! param   color   Color   0.8 0.8 0.8     %read{0,0} %write{...}
//! oparam  closure color   BSDF            %read{...}
//! ```
//!
//! Only `param` and `oparam` lines matter here; everything from the first
//! `code` line on is ignored.

use serde::{Deserialize, Serialize};
use shadegraph_core::{Float3, NodeKind, ShaderInput, ShaderNode, ShaderOutput, SocketType, SocketValue};
use shadegraph_core::node::ScriptSource;

use crate::error::OslError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamBase {
    Int,
    Float,
    String,
    Color,
    Point,
    Vector,
    Normal,
    Matrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    Int(Vec<i32>),
    Float(Vec<f32>),
    String(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OslParam {
    pub name: String,
    /// `None` for struct parameters.
    pub base: Option<ParamBase>,
    pub is_output: bool,
    pub is_closure: bool,
    pub is_struct: bool,
    /// Declared as `T[]`.
    pub varlen: bool,
    /// Zero for non-arrays.
    pub arraylen: usize,
    pub default: Option<DefaultValue>,
}

impl OslParam {
    /// Whether a script node can expose this parameter as a socket.
    pub fn is_supported(&self) -> bool {
        !self.varlen && !self.is_struct && self.arraylen <= 1
    }

    /// Socket type of a supported parameter, `None` when it has no socket
    /// form.
    pub fn socket_type(&self) -> Option<SocketType> {
        if self.is_closure {
            return Some(SocketType::Closure);
        }
        match self.base? {
            ParamBase::Color => Some(SocketType::Color),
            ParamBase::Point => Some(SocketType::Point),
            ParamBase::Vector => Some(SocketType::Vector),
            ParamBase::Normal => Some(SocketType::Normal),
            ParamBase::Int => Some(SocketType::Int),
            ParamBase::Float => Some(SocketType::Float),
            ParamBase::String => Some(SocketType::String),
            ParamBase::Matrix => None,
        }
    }

    fn default_value(&self, ty: SocketType) -> SocketValue {
        let value = match (&self.default, ty) {
            (Some(DefaultValue::Float(v)), t) if t.is_float3() && v.len() >= 3 => {
                Some(SocketValue::Float3(Float3::new(v[0], v[1], v[2])))
            }
            (Some(DefaultValue::Float(v)), SocketType::Float) => v.first().map(|f| SocketValue::Float(*f)),
            (Some(DefaultValue::Int(v)), SocketType::Int) => v.first().map(|i| SocketValue::Int(*i)),
            (Some(DefaultValue::String(v)), SocketType::String) => {
                v.first().map(|s| SocketValue::String(s.clone()))
            }
            _ => None,
        };
        value.unwrap_or_else(|| SocketValue::default_for(ty))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderQuery {
    pub shader_type: String,
    pub shader_name: String,
    pub params: Vec<OslParam>,
}

impl ShaderQuery {
    pub fn parse(bytecode: &str) -> Result<Self, OslError> {
        let mut header: Option<(String, String)> = None;
        let mut params = Vec::new();

        for (index, raw) in bytecode.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim_end();
            if line.is_empty() || line.starts_with('#') || line.starts_with("OpenShadingLanguage") {
                continue;
            }
            let keyword = line.split_whitespace().next().unwrap_or_default();
            match keyword {
                "shader" | "surface" | "displacement" | "volume" | "light" if header.is_none() => {
                    let name = line[keyword.len()..].trim();
                    if name.is_empty() {
                        return Err(OslError::Query { line: line_no, message: "shader has no name".into() });
                    }
                    header = Some((keyword.to_string(), name.to_string()));
                }
                "param" | "oparam" => {
                    if header.is_none() {
                        return Err(OslError::Query {
                            line: line_no,
                            message: "parameter before shader declaration".into(),
                        });
                    }
                    params.push(parse_param(line, keyword == "oparam", line_no)?);
                }
                "code" => break,
                _ => {}
            }
        }

        let (shader_type, shader_name) = header.ok_or(OslError::Query {
            line: 0,
            message: "no shader declaration".into(),
        })?;
        Ok(ShaderQuery { shader_type, shader_name, params })
    }

    pub fn param(&self, name: &str) -> Option<&OslParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Builds a script node whose sockets mirror the supported parameters.
    pub fn script_node(&self, source: ScriptSource) -> ShaderNode {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for param in self.params.iter().filter(|p| p.is_supported()) {
            let Some(ty) = param.socket_type() else {
                continue;
            };
            if param.is_output {
                outputs.push(ShaderOutput { name: param.name.clone(), ty });
            } else {
                inputs.push(ShaderInput {
                    name: param.name.clone(),
                    ty,
                    value: param.default_value(ty),
                    internal: false,
                });
            }
        }
        ShaderNode::with_sockets(NodeKind::Script { source }, inputs, outputs)
    }
}

fn parse_param(line: &str, is_output: bool, line_no: usize) -> Result<OslParam, OslError> {
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let bad = |message: &str| OslError::Query { line: line_no, message: message.to_string() };
    if fields.len() < 3 {
        return Err(bad("parameter needs a type and a name"));
    }
    let ty = fields[1];
    let name = fields[2];
    if name.is_empty() {
        return Err(bad("parameter has no name"));
    }

    let (is_closure, ty) = match ty.strip_prefix("closure ") {
        Some(rest) => (true, rest.trim()),
        None => (false, ty),
    };
    let is_struct = ty.starts_with("struct");
    let (elem, varlen, arraylen) = match ty.split_once('[') {
        Some((elem, rest)) => {
            let len = rest.trim_end_matches(']');
            if len.is_empty() {
                (elem, true, 0)
            } else {
                let n = len.parse::<usize>().map_err(|_| bad("bad array length"))?;
                (elem, false, n)
            }
        }
        None => (ty, false, 0),
    };
    let base = match elem {
        "int" => Some(ParamBase::Int),
        "float" => Some(ParamBase::Float),
        "string" => Some(ParamBase::String),
        "color" => Some(ParamBase::Color),
        "point" => Some(ParamBase::Point),
        "vector" => Some(ParamBase::Vector),
        "normal" => Some(ParamBase::Normal),
        "matrix" => Some(ParamBase::Matrix),
        _ if is_struct => None,
        other => return Err(bad(&format!("unknown type '{other}'"))),
    };

    let default = match (fields.get(3), base) {
        (Some(text), Some(base)) if !text.is_empty() && !text.starts_with('%') && !is_closure => {
            parse_default(text, base)
        }
        _ => None,
    };

    Ok(OslParam {
        name: name.to_string(),
        base,
        is_output,
        is_closure,
        is_struct,
        varlen,
        arraylen,
        default,
    })
}

fn parse_default(text: &str, base: ParamBase) -> Option<DefaultValue> {
    match base {
        ParamBase::Int => text.split_whitespace().map(|t| t.parse().ok()).collect::<Option<Vec<i32>>>().map(DefaultValue::Int),
        ParamBase::String => Some(DefaultValue::String(quoted_strings(text))),
        _ => text
            .split_whitespace()
            .map(|t| t.parse().ok())
            .collect::<Option<Vec<f32>>>()
            .map(DefaultValue::Float),
    }
}

fn quoted_strings(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('"') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('"') else {
            break;
        };
        out.push(after[..end].to_string());
        rest = &after[end + 1..];
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    const OSO: &str = "OpenShadingLanguage 1.00\n\
# Compiled by oslc 1.11\n\
shader wood\n\
param\tfloat\tScale\t5\t\t%read{0,0} %write{2147483647,-1}\n\
param\tcolor\tColor\t0.8 0.5 0.2\t\t%read{1,1} %write{2147483647,-1}\n\
param\tstring\tfilename\t\"wood grain.png\"\t\t%read{2,2} %write{2147483647,-1}\n\
param\tint\tOctaves\t4\t\t%read{3,3} %write{2147483647,-1}\n\
param\tfloat[3]\tweights\t1 2 3\t\t%read{4,4} %write{2147483647,-1}\n\
param\tfloat[]\tramp\t\t%initexpr\n\
param\tstruct Settings\tsettings\t\t%structfields{a,b}\n\
param\tmatrix\tspace\t1 0 0 0 0 1 0 0 0 0 1 0 0 0 0 1\t\t%read{5,5}\n\
oparam\tclosure color\tBSDF\t\t%read{2147483647,-1} %write{6,6}\n\
oparam\tcolor\tColor\t0 0 0\t\t%read{2147483647,-1} %write{7,7}\n\
code ___main___\n\
param\tfloat\tnot_a_param\t0\n";

    #[test]
    fn parses_header_and_params() {
        let q = ShaderQuery::parse(OSO).unwrap();
        assert_eq!(q.shader_type, "shader");
        assert_eq!(q.shader_name, "wood");
        assert_eq!(q.params.len(), 10);
        assert!(q.param("not_a_param").is_none());

        let filename = q.param("filename").unwrap();
        assert_eq!(filename.default, Some(DefaultValue::String(vec!["wood grain.png".into()])));
        let weights = q.param("weights").unwrap();
        assert_eq!(weights.arraylen, 3);
        assert!(!weights.is_supported());
        assert!(q.param("ramp").unwrap().varlen);
        assert!(q.param("settings").unwrap().is_struct);
        let bsdf = q.params.iter().find(|p| p.name == "BSDF").unwrap();
        assert!(bsdf.is_closure && bsdf.is_output);
    }

    #[test]
    fn script_node_skips_unsupported_params() {
        let q = ShaderQuery::parse(OSO).unwrap();
        let node = q.script_node(ScriptSource::File(PathBuf::from("wood.oso")));
        let inputs: Vec<_> = node.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(inputs, ["Scale", "Color", "filename", "Octaves"]);
        let outputs: Vec<_> = node.outputs.iter().map(|o| (o.name.as_str(), o.ty)).collect();
        assert_eq!(outputs, [("BSDF", SocketType::Closure), ("Color", SocketType::Color)]);

        assert_eq!(node.float("Scale"), 5.0);
        assert_eq!(node.float3("Color"), Float3::new(0.8, 0.5, 0.2));
        assert_eq!(node.input("Octaves").unwrap().value, SocketValue::Int(4));
    }

    #[test]
    fn missing_declaration_is_an_error() {
        let err = ShaderQuery::parse("OpenShadingLanguage 1.00\nparam\tfloat\tx\t0\n").unwrap_err();
        assert!(matches!(err, OslError::Query { line: 2, .. }));
        assert!(ShaderQuery::parse("").is_err());
    }

    #[test]
    fn unknown_types_are_rejected() {
        let err = ShaderQuery::parse("shader s\nparam\tquaternion\tq\t0\n").unwrap_err();
        assert!(matches!(err, OslError::Query { line: 2, .. }));
    }
}
