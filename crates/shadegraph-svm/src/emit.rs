//! Instruction emitters, one per node kind.

use shadegraph_core::{AttributeKey, AttributeStandard, EntryPoint, Float3, NodeId, NodeKind, Transform};

use crate::compiler::EntryContext;
use crate::error::SvmError;
use crate::opcode::{
    attr_output, float_bits, geom, image_flags, light_path, texco, ClosureType, Opcode, STACK_INVALID,
};

const INV: i32 = STACK_INVALID as i32;

fn float3_words(v: Float3) -> [i32; 4] {
    [float_bits(v.x), float_bits(v.y), float_bits(v.z), 0]
}

impl EntryContext<'_> {
    pub(crate) fn emit_node_code(&mut self, id: NodeId) -> Result<(), SvmError> {
        let node = self.graph().require(id)?;
        match &node.kind {
            // The output node is handled once per entry by `emit_output`.
            NodeKind::Output | NodeKind::MixClosure | NodeKind::AddClosure => Ok(()),
            NodeKind::Value { value } => {
                let out = self.assign_output(id, "Value")?;
                self.add_node(Opcode::ValueF, float_bits(*value), out as i32, 0);
                Ok(())
            }
            NodeKind::Rgb { color } => {
                let out = self.assign_output(id, "Color")?;
                self.add_node(Opcode::ValueV, out as i32, 0, 0);
                self.push(float3_words(*color));
                Ok(())
            }
            NodeKind::Math { op, use_clamp } => {
                let v1 = self.assign_input(id, "Value1")?;
                let v2 = self.assign_input(id, "Value2")?;
                let out = self.assign_output(id, "Value")?;
                let operands = self.encode(v1, v2, *use_clamp as u32, 0)?;
                self.add_node(Opcode::Math, *op as i32, operands, out as i32);
                Ok(())
            }
            NodeKind::VectorMath { op } => {
                let v1 = self.assign_input(id, "Vector1")?;
                let v2 = self.assign_input(id, "Vector2")?;
                let value = self.assign_output_if_linked(id, "Value")?;
                let vector = self.assign_output_if_linked(id, "Vector")?;
                let operands = self.encode(v1, v2, value, vector)?;
                self.add_node(Opcode::VectorMath, *op as i32, operands, 0);
                Ok(())
            }
            NodeKind::MixRgb { blend, use_clamp } => {
                let fac = self.assign_input(id, "Fac")?;
                let c1 = self.assign_input(id, "Color1")?;
                let c2 = self.assign_input(id, "Color2")?;
                let out = self.assign_output(id, "Color")?;
                self.add_node(Opcode::Mix, fac as i32, c1 as i32, c2 as i32);
                self.add_node(Opcode::Mix, *blend as i32, *use_clamp as i32, out as i32);
                Ok(())
            }
            NodeKind::Attribute { attribute } => self.emit_attribute(id, attribute),
            NodeKind::TextureCoordinate { object_transform, .. } => {
                self.emit_texture_coordinate(id, object_transform.as_ref())
            }
            NodeKind::Geometry => self.emit_queries(
                id,
                Opcode::Geometry,
                &[
                    ("Position", geom::POSITION),
                    ("Normal", geom::NORMAL),
                    ("Incoming", geom::INCOMING),
                    ("Backfacing", geom::BACKFACING),
                ],
            ),
            NodeKind::LightPath => self.emit_queries(
                id,
                Opcode::LightPath,
                &[
                    ("IsCameraRay", light_path::IS_CAMERA_RAY),
                    ("IsShadowRay", light_path::IS_SHADOW_RAY),
                    ("RayLength", light_path::RAY_LENGTH),
                ],
            ),
            NodeKind::ImageTexture { slot, colorspace, .. } => self.emit_image(id, *slot, colorspace),
            NodeKind::CheckerTexture => self.emit_checker(id),
            NodeKind::AmbientOcclusion { samples, only_local } => {
                let color = self.assign_input(id, "Color")?;
                let distance = self.assign_input(id, "Distance")?;
                let normal = self.assign_input_if_linked(id, "Normal")?;
                let color_out = self.assign_output_if_linked(id, "Color")?;
                let ao_out = self.assign_output_if_linked(id, "AO")?;
                let inputs = self.encode(*only_local as u32, color, distance, normal)?;
                let outputs = self.encode(color_out, ao_out, 0, 0)?;
                self.add_node(Opcode::AmbientOcclusion, inputs, outputs, *samples as i32);
                Ok(())
            }
            NodeKind::DiffuseBsdf => self.emit_bsdf(id, ClosureType::Diffuse, Some("Roughness"), None),
            NodeKind::GlossyBsdf => self.emit_bsdf(id, ClosureType::Glossy, Some("Roughness"), None),
            NodeKind::TransparentBsdf => self.emit_bsdf(id, ClosureType::Transparent, None, None),
            NodeKind::SubsurfaceScattering => {
                self.emit_bsdf(id, ClosureType::Bssrdf, Some("Scale"), Some("Radius"))
            }
            NodeKind::Emission => self.emit_emission(id, Opcode::ClosureEmission),
            NodeKind::Background => self.emit_emission(id, Opcode::ClosureBackground),
            NodeKind::Holdout => {
                let mix_weight = self.closure_mix_weight()?;
                self.push([Opcode::ClosureSetWeight as i32, float_bits(1.0), float_bits(1.0), float_bits(1.0)]);
                self.add_node(Opcode::ClosureHoldout, mix_weight as i32, 0, 0);
                Ok(())
            }
            NodeKind::AbsorptionVolume => self.emit_volume(id, ClosureType::VolumeAbsorption, None),
            NodeKind::ScatterVolume => {
                self.emit_volume(id, ClosureType::VolumeHenyeyGreenstein, Some("Anisotropy"))
            }
            NodeKind::MixClosureWeight => {
                let fac = self.assign_input(id, "Fac")?;
                let weight = self.assign_input(id, "Weight")?;
                let w1 = self.assign_output(id, "Weight1")?;
                let w2 = self.assign_output(id, "Weight2")?;
                let operands = self.encode(fac, weight, w1, w2)?;
                self.add_node(Opcode::MixClosure, operands, 0, 0);
                Ok(())
            }
            NodeKind::Bump { invert, use_object_space } => self.emit_bump(id, *invert, *use_object_space),
            NodeKind::BumpFromDisplacement { use_object_space } => {
                let displacement = self.assign_input(id, "Displacement")?;
                let out = self.assign_output(id, "Normal")?;
                self.add_node(
                    Opcode::BumpFromDisplacement,
                    displacement as i32,
                    out as i32,
                    *use_object_space as i32,
                );
                Ok(())
            }
            NodeKind::Displacement { use_object_space } => {
                let height = self.assign_input(id, "Height")?;
                let midlevel = self.assign_input(id, "Midlevel")?;
                let scale = self.assign_input(id, "Scale")?;
                let normal = self.assign_input_if_linked(id, "Normal")?;
                let out = self.assign_output(id, "Displacement")?;
                let operands = self.encode(height, midlevel, scale, normal)?;
                self.add_node(Opcode::Displacement, operands, out as i32, *use_object_space as i32);
                Ok(())
            }
            NodeKind::Script { .. } => self.emit_script(id),
        }
    }

    /// Terminal writes of the output node for the current entry point.
    pub(crate) fn emit_output(&mut self, output: NodeId) -> Result<(), SvmError> {
        let (terminal, opcode) = match self.entry() {
            EntryPoint::Displacement => ("Displacement", Opcode::SetDisplacement),
            EntryPoint::Bump => ("Normal", Opcode::ClosureSetNormal),
            EntryPoint::Surface | EntryPoint::Volume => return Ok(()),
        };
        if self.is_linked(output, terminal) {
            let slot = self.assign_input(output, terminal)?;
            self.add_node(opcode, slot as i32, 0, 0);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    fn emit_attribute(&mut self, id: NodeId, attribute: &str) -> Result<(), SvmError> {
        let attr = self.attribute_id(&AttributeKey::from_name(attribute)) as i32;
        for (name, width) in
            [("Color", attr_output::FLOAT3), ("Vector", attr_output::FLOAT3), ("Fac", attr_output::FLOAT)]
        {
            if self.is_output_linked(id, name) {
                let out = self.assign_output(id, name)?;
                self.add_node(Opcode::Attr, attr, out as i32, width);
            }
        }
        Ok(())
    }

    fn emit_texture_coordinate(&mut self, id: NodeId, object_transform: Option<&Transform>) -> Result<(), SvmError> {
        if self.is_output_linked(id, "Generated") {
            let out = self.assign_output(id, "Generated")?;
            self.emit_generated(out);
        }
        if self.is_output_linked(id, "Normal") {
            let out = self.assign_output(id, "Normal")?;
            self.add_node(Opcode::TexCoord, texco::NORMAL, out as i32, 0);
        }
        if self.is_output_linked(id, "UV") {
            let out = self.assign_output(id, "UV")?;
            let uv = self.attribute_id(&AttributeKey::Standard(AttributeStandard::Uv)) as i32;
            self.add_node(Opcode::Attr, uv, out as i32, attr_output::FLOAT3);
        }
        if self.is_output_linked(id, "Object") {
            let out = self.assign_output(id, "Object")?;
            self.add_node(Opcode::TexCoord, texco::OBJECT, out as i32, object_transform.is_some() as i32);
            if let Some(tfm) = object_transform {
                for row in tfm.rows {
                    self.push(row.map(float_bits));
                }
            }
        }
        Ok(())
    }

    /// Generated coordinates: the shading position for the world shader,
    /// the generated attribute everywhere else.
    fn emit_generated(&mut self, out: u32) {
        if self.background() {
            self.add_node(Opcode::Geometry, geom::POSITION, out as i32, 0);
        } else {
            let generated = self.attribute_id(&AttributeKey::Standard(AttributeStandard::Generated)) as i32;
            self.add_node(Opcode::Attr, generated, out as i32, attr_output::FLOAT3);
        }
    }

    fn emit_queries(&mut self, id: NodeId, opcode: Opcode, outputs: &[(&str, i32)]) -> Result<(), SvmError> {
        for (name, query) in outputs {
            if self.is_output_linked(id, name) {
                let out = self.assign_output(id, name)?;
                self.add_node(opcode, *query, out as i32, 0);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Textures
    // -----------------------------------------------------------------------

    fn emit_image(&mut self, id: NodeId, slot: u32, colorspace: &str) -> Result<(), SvmError> {
        let (vector, temp) = if self.is_linked(id, "Vector") {
            (self.assign_input(id, "Vector")?, None)
        } else {
            let temp = self.temp_slot(3)?;
            let uv = self.attribute_id(&AttributeKey::Standard(AttributeStandard::Uv)) as i32;
            self.add_node(Opcode::Attr, uv, temp as i32, attr_output::FLOAT3);
            (temp, Some(temp))
        };
        let color = self.assign_output_if_linked(id, "Color")?;
        let alpha = self.assign_output_if_linked(id, "Alpha")?;

        let mut flags = 0;
        if colorspace.eq_ignore_ascii_case("srgb") {
            flags |= image_flags::COMPRESS_AS_SRGB;
        }
        if alpha != STACK_INVALID {
            flags |= image_flags::ALPHA_OUTPUT;
        }
        let operands = self.encode(vector, color, alpha, flags)?;
        self.add_node(Opcode::TexImage, slot as i32, operands, 0);

        if let Some(temp) = temp {
            self.release_temp(temp, 3);
        }
        Ok(())
    }

    fn emit_checker(&mut self, id: NodeId) -> Result<(), SvmError> {
        let (vector, temp) = if self.is_linked(id, "Vector") {
            (self.assign_input(id, "Vector")?, None)
        } else {
            let temp = self.temp_slot(3)?;
            self.emit_generated(temp);
            (temp, Some(temp))
        };
        let c1 = self.assign_input(id, "Color1")?;
        let c2 = self.assign_input(id, "Color2")?;
        let scale = self.assign_input(id, "Scale")?;
        let color = self.assign_output_if_linked(id, "Color")?;
        let fac = self.assign_output_if_linked(id, "Fac")?;

        let inputs = self.encode(vector, c1, c2, scale)?;
        let outputs = self.encode(color, fac, 0, 0)?;
        self.add_node(Opcode::TexChecker, inputs, outputs, 0);

        if let Some(temp) = temp {
            self.release_temp(temp, 3);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Closures
    // -----------------------------------------------------------------------

    /// Closure color: read from the stack when linked, baked in otherwise.
    fn emit_closure_color(&mut self, id: NodeId) -> Result<(), SvmError> {
        if self.is_linked(id, "Color") {
            let color = self.assign_input(id, "Color")?;
            self.add_node(Opcode::ClosureWeight, color as i32, 0, 0);
        } else {
            let color = self.graph().require(id)?.float3("Color");
            let [x, y, z, _] = float3_words(color);
            self.push([Opcode::ClosureSetWeight as i32, x, y, z]);
        }
        Ok(())
    }

    fn emit_bsdf(
        &mut self,
        id: NodeId,
        closure: ClosureType,
        param1: Option<&str>,
        param2: Option<&str>,
    ) -> Result<(), SvmError> {
        self.emit_closure_color(id)?;
        let normal = self.assign_input_if_linked(id, "Normal")?;
        let p1 = match param1 {
            Some(name) => self.assign_input(id, name)?,
            None => STACK_INVALID,
        };
        let p2 = match param2 {
            Some(name) => self.assign_input(id, name)?,
            None => STACK_INVALID,
        };
        let mix_weight = self.closure_mix_weight()?;

        let node = self.graph().require(id)?;
        let constant = |param: Option<&str>| param.map(|name| float_bits(node.float(name))).unwrap_or(0);
        let operands = self.encode(closure as u32, p1, p2, mix_weight)?;
        self.add_node(Opcode::ClosureBsdf, operands, constant(param1), constant(param2));
        self.push([normal as i32, INV, INV, INV]);
        Ok(())
    }

    fn emit_emission(&mut self, id: NodeId, opcode: Opcode) -> Result<(), SvmError> {
        if self.is_linked(id, "Color") || self.is_linked(id, "Strength") {
            let color = self.assign_input(id, "Color")?;
            let strength = self.assign_input(id, "Strength")?;
            self.add_node(Opcode::EmissionWeight, color as i32, strength as i32, 0);
        } else {
            let node = self.graph().require(id)?;
            let [x, y, z, _] = float3_words(node.float3("Color").scale(node.float("Strength")));
            self.push([Opcode::ClosureSetWeight as i32, x, y, z]);
        }
        let mix_weight = self.closure_mix_weight()?;
        self.add_node(opcode, mix_weight as i32, 0, 0);
        Ok(())
    }

    fn emit_volume(&mut self, id: NodeId, closure: ClosureType, param2: Option<&str>) -> Result<(), SvmError> {
        self.emit_closure_color(id)?;
        let density = self.assign_input(id, "Density")?;
        let p2 = match param2 {
            Some(name) => self.assign_input(id, name)?,
            None => STACK_INVALID,
        };
        let mix_weight = self.closure_mix_weight()?;

        let node = self.graph().require(id)?;
        let density_value = float_bits(node.float("Density"));
        let p2_value = param2.map(|name| float_bits(node.float(name))).unwrap_or(0);
        let operands = self.encode(closure as u32, density, p2, mix_weight)?;
        self.add_node(Opcode::ClosureVolume, operands, density_value, p2_value);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bump and scripts
    // -----------------------------------------------------------------------

    fn emit_bump(&mut self, id: NodeId, invert: bool, object_space: bool) -> Result<(), SvmError> {
        // Zero strength leaves a linked normal untouched.
        let node = self.graph().require(id)?;
        if !self.is_linked(id, "Strength") && node.float("Strength") == 0.0 && self.is_linked(id, "Normal") {
            return self.link_output(id, "Normal", "Normal");
        }

        let normal = self.assign_input_if_linked(id, "Normal")?;
        let distance = self.assign_input(id, "Distance")?;
        let height = self.assign_input(id, "Height")?;
        let strength = self.assign_input(id, "Strength")?;
        let out = self.assign_output(id, "Normal")?;
        let settings = self.encode(normal, distance, invert as u32, object_space as u32)?;
        let values = self.encode(height, strength, 0, 0)?;
        self.add_node(Opcode::SetBump, settings, values, out as i32);
        Ok(())
    }

    /// Bytecode cannot run scripts; linked outputs read as zero.
    fn emit_script(&mut self, id: NodeId) -> Result<(), SvmError> {
        let node = self.graph().require(id)?;
        tracing::debug!(node = %id, "script node compiled to zero outputs");
        for output in &node.outputs {
            if !self.is_output_linked(id, &output.name) {
                continue;
            }
            let out = self.assign_output(id, &output.name)?;
            if output.ty.is_float3() {
                self.add_node(Opcode::ValueV, out as i32, 0, 0);
                self.push(float3_words(Float3::ZERO));
            } else {
                self.add_node(Opcode::ValueF, float_bits(0.0), out as i32, 0);
            }
        }
        Ok(())
    }
}
