//! Shaders every scene starts with.

use serde::{Deserialize, Serialize};
use shadegraph_core::{CoreError, Float3, NodeKind, Shader, ShaderId, SocketValue};

/// Ids of the default shaders within a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultShaders {
    pub surface: ShaderId,
    pub volume: ShaderId,
    pub light: ShaderId,
    pub background: ShaderId,
    pub empty: ShaderId,
}

/// Builds the default shaders in id order: surface, volume, light,
/// background, empty.
pub fn default_shaders() -> Result<[Shader; 5], CoreError> {
    Ok([
        default_surface()?,
        default_volume()?,
        default_light()?,
        Shader::new("default_background"),
        Shader::new("default_empty"),
    ])
}

/// Gray diffuse.
fn default_surface() -> Result<Shader, CoreError> {
    let mut shader = Shader::new("default_surface");
    let g = shader.graph_mut();
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.set_input(diffuse, "Color", SocketValue::Float3(Float3::splat(0.8)))?;
    g.connect(diffuse, "BSDF", out, "Surface")?;
    Ok(shader)
}

fn default_volume() -> Result<Shader, CoreError> {
    let mut shader = Shader::new("default_volume");
    let g = shader.graph_mut();
    let scatter = g.add(NodeKind::ScatterVolume);
    let out = g.output();
    g.connect(scatter, "Volume", out, "Volume")?;
    Ok(shader)
}

/// Unit-strength emission; lights scale it by their own strength.
fn default_light() -> Result<Shader, CoreError> {
    let mut shader = Shader::new("default_light");
    let g = shader.graph_mut();
    let emission = g.add(NodeKind::Emission);
    let out = g.output();
    g.set_input(emission, "Color", SocketValue::Float3(Float3::splat(0.8)))?;
    g.set_input(emission, "Strength", SocketValue::Float(1.0))?;
    g.connect(emission, "Emission", out, "Surface")?;
    Ok(shader)
}
