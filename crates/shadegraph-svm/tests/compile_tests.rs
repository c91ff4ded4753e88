//! End-to-end tests for bytecode compilation.
//!
//! Each test builds a shader graph, compiles it with `SvmCompiler`, and
//! checks the emitted program: section layout, jump targets, stack
//! discipline, flags, and attribute requests. A small evaluator runs the
//! value and mix-weight opcodes to check closure weights numerically.

use std::path::PathBuf;

use proptest::prelude::*;
use shadegraph_core::node::{MathOp, ScriptSource};
use shadegraph_core::{
    AttributeIdMap, AttributeKey, AttributeStandard, CoreError, DisplacementMethod, EntryPoint,
    Instruction, NodeId, NodeKind, Shader, ShaderFlags, ShaderInput, ShaderNode, ShaderOutput,
    SocketType, SocketValue,
};
use shadegraph_svm::hash::program_hash;
use shadegraph_svm::opcode::{bits_float, decode_uchar4};
use shadegraph_svm::{
    Opcode, Phase, SlotEventKind, SvmCompiler, SvmError, SvmOptions, SvmOutput, STACK_INVALID, STACK_SIZE,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn compile_with(shader: &mut Shader, options: SvmOptions) -> SvmOutput {
    let attributes = AttributeIdMap::new();
    SvmCompiler::new(&attributes, options).compile(shader)
}

fn compile(shader: &mut Shader) -> SvmOutput {
    compile_with(shader, SvmOptions::default())
}

fn op(instruction: &Instruction) -> Option<Opcode> {
    Opcode::from_i32(instruction[0])
}

fn count(code: &[Instruction], opcode: Opcode) -> usize {
    code.iter().filter(|i| op(i) == Some(opcode)).count()
}

/// Shader whose surface is `a` and `b` mixed by `fac`, or by the constant
/// 0.5 when `fac` is `None`.
fn mixed_surface(a: NodeKind, b: NodeKind, fac: Option<(NodeKind, &str)>) -> Shader {
    let mut shader = Shader::new("mix");
    let g = shader.graph_mut();
    let a_out = if a == NodeKind::Emission { "Emission" } else { "BSDF" };
    let b_out = if b == NodeKind::Emission { "Emission" } else { "BSDF" };
    let a = g.add(a);
    let b = g.add(b);
    let mix = g.add(NodeKind::MixClosure);
    let out = g.output();
    g.connect(a, a_out, mix, "Closure1").unwrap();
    g.connect(b, b_out, mix, "Closure2").unwrap();
    g.connect(mix, "Closure", out, "Surface").unwrap();
    if let Some((kind, socket)) = fac {
        let src = g.add(kind);
        g.connect(src, socket, mix, "Fac").unwrap();
    }
    shader
}

/// Runs the value, mix-weight, and closure opcodes of a section and
/// returns the weight each closure would be evaluated with.
fn closure_weights(code: &[Instruction]) -> Vec<f32> {
    let mut stack = [0.0f32; STACK_SIZE + 1];
    let mut weights = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let [_, a, b, c] = code[pc];
        match op(&code[pc]) {
            Some(Opcode::ValueF) => stack[b as usize] = bits_float(a),
            Some(Opcode::ValueV) => {
                let data = code[pc + 1];
                for k in 0..3 {
                    stack[a as usize + k] = bits_float(data[k]);
                }
                pc += 1;
            }
            Some(Opcode::MixClosure) => {
                let [fac, weight, w1, w2] = decode_uchar4(a);
                let (fac, weight) = (stack[fac as usize], stack[weight as usize]);
                stack[w1 as usize] = weight * (1.0 - fac);
                stack[w2 as usize] = weight * fac;
            }
            Some(Opcode::ClosureBsdf) => {
                let mix_weight = decode_uchar4(a)[3];
                weights.push(if mix_weight == STACK_INVALID { 1.0 } else { stack[mix_weight as usize] });
                pc += 1;
            }
            Some(Opcode::ClosureEmission) | Some(Opcode::ClosureBackground) => {
                let mix_weight = a as u32;
                weights.push(if mix_weight == STACK_INVALID { 1.0 } else { stack[mix_weight as usize] });
            }
            Some(Opcode::TexCoord) if c != 0 => pc += 3,
            _ => {}
        }
        pc += 1;
    }
    weights
}

// ---------------------------------------------------------------------------
// Layout and flags
// ---------------------------------------------------------------------------

#[test]
fn two_node_surface_round_trip() {
    let mut shader = Shader::new("red");
    let g = shader.graph_mut();
    let rgb = g.add(NodeKind::Rgb { color: shadegraph_core::Float3::new(1.0, 0.0, 0.0) });
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(rgb, "Color", diffuse, "Color").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();

    let compiled = compile(&mut shader);
    assert!(compiled.is_complete());
    assert_eq!(shader.flags, ShaderFlags { has_surface: true, ..ShaderFlags::default() });

    let program = &compiled.program;
    assert!(program.entry_len(EntryPoint::Surface) > 0);
    assert_eq!(program.entry_len(EntryPoint::Volume), 0);
    assert_eq!(program.entry_len(EntryPoint::Displacement), 0);

    // Surface starts right after the header; the others share the trailing End.
    let header = program.instructions[0];
    let last = program.instructions.len() as i32 - 1;
    assert_eq!(header, [Opcode::ShaderJump as i32, 1, last, last]);
    assert_eq!(op(&program.instructions[last as usize]), Some(Opcode::End));

    // The folded color is baked into the closure weight.
    let surface = program.entry(EntryPoint::Surface);
    let set_weight = surface.iter().find(|i| op(i) == Some(Opcode::ClosureSetWeight)).unwrap();
    assert_eq!(bits_float(set_weight[1]), 1.0);
    assert_eq!(bits_float(set_weight[2]), 0.0);
}

#[test]
fn unlinked_surface_produces_no_instructions() {
    let mut shader = Shader::new("fog");
    let g = shader.graph_mut();
    let volume = g.add(NodeKind::ScatterVolume);
    let out = g.output();
    g.connect(volume, "Volume", out, "Volume").unwrap();

    let compiled = compile(&mut shader);
    assert_eq!(compiled.program.entry_len(EntryPoint::Surface), 0);
    assert!(compiled.program.entry_len(EntryPoint::Volume) > 0);
    assert!(!shader.flags.has_surface);
    assert!(shader.flags.has_volume);
    assert!(shader.has_volume_connected);

    let volume_code = compiled.program.entry(EntryPoint::Volume);
    assert_eq!(count(volume_code, Opcode::ClosureVolume), 1);
    assert_eq!(op(volume_code.last().unwrap()), Some(Opcode::End));
}

#[test]
fn unlinked_volume_produces_no_instructions() {
    let mut shader = mixed_surface(NodeKind::DiffuseBsdf, NodeKind::GlossyBsdf, None);
    let compiled = compile(&mut shader);
    assert_eq!(compiled.program.entry_len(EntryPoint::Volume), 0);
    assert!(!shader.flags.has_volume);
}

#[test]
fn emission_behind_a_mix_sets_surface_emission() {
    let mut shader =
        mixed_surface(NodeKind::DiffuseBsdf, NodeKind::Emission, Some((NodeKind::LightPath, "IsCameraRay")));
    compile(&mut shader);
    assert!(shader.flags.has_surface);
    assert!(shader.flags.has_surface_emission);
    assert!(shader.flags.has_integrator_dependency);
    assert!(!shader.flags.has_surface_transparent);
}

#[test]
fn world_shader_reads_position_for_generated_coordinates() {
    let mut shader = Shader::new("world");
    let g = shader.graph_mut();
    let checker = g.add(NodeKind::CheckerTexture);
    let background = g.add(NodeKind::Background);
    let out = g.output();
    g.connect(checker, "Color", background, "Color").unwrap();
    g.connect(background, "Background", out, "Surface").unwrap();

    let compiled = compile_with(&mut shader, SvmOptions { background: true, ..SvmOptions::default() });
    let surface = compiled.program.entry(EntryPoint::Surface);
    assert_eq!(count(surface, Opcode::Geometry), 1);
    assert_eq!(count(surface, Opcode::Attr), 0);
    assert!(shader.attributes.is_empty());

    let compiled = compile(&mut shader.clone());
    assert_eq!(count(compiled.program.entry(EntryPoint::Surface), Opcode::Attr), 1);
}

#[test]
fn attribute_requests_follow_linked_outputs() {
    let mut shader = Shader::new("painted");
    let g = shader.graph_mut();
    let attr = g.add(NodeKind::Attribute { attribute: "paint".to_string() });
    let image = g.add(NodeKind::ImageTexture {
        slot: 3,
        filename: "wood.png".to_string(),
        colorspace: "sRGB".to_string(),
    });
    let mix = g.add(NodeKind::MixRgb { blend: shadegraph_core::node::MixBlend::Mix, use_clamp: false });
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(attr, "Color", mix, "Color1").unwrap();
    g.connect(image, "Color", mix, "Color2").unwrap();
    g.connect(mix, "Color", diffuse, "Color").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();

    let attributes = AttributeIdMap::new();
    let compiled = SvmCompiler::new(&attributes, SvmOptions::default()).compile(&mut shader);
    assert!(compiled.is_complete());
    assert!(shader.attributes.contains(&AttributeKey::Name("paint".to_string())));
    assert!(shader.attributes.contains(&AttributeKey::Standard(AttributeStandard::Uv)));
    assert!(shader.need_update_attribute);
    assert!(shader.flags.has_surface_spatial_varying);

    let surface = compiled.program.entry(EntryPoint::Surface);
    let paint = attributes.id_for_name("paint") as i32;
    assert!(surface.iter().any(|i| op(i) == Some(Opcode::Attr) && i[1] == paint));
    let image_op = surface.iter().find(|i| op(i) == Some(Opcode::TexImage)).unwrap();
    assert_eq!(image_op[1], 3);

    // Same requests again: nothing to update.
    SvmCompiler::new(&attributes, SvmOptions::default()).compile(&mut shader);
    assert!(!shader.need_update_attribute);
}

// ---------------------------------------------------------------------------
// Multi-closure weights and jumps
// ---------------------------------------------------------------------------

#[test]
fn constant_half_mix_splits_weight_evenly() {
    let mut shader = mixed_surface(NodeKind::DiffuseBsdf, NodeKind::GlossyBsdf, None);
    let compiled = compile(&mut shader);
    let surface = compiled.program.entry(EntryPoint::Surface);
    assert_eq!(count(surface, Opcode::JumpIfZero) + count(surface, Opcode::JumpIfOne), 0);
    assert_eq!(closure_weights(surface), vec![0.5, 0.5]);
}

#[test]
fn nested_constant_mixes_multiply_weights() {
    let mut shader = Shader::new("nested");
    let g = shader.graph_mut();
    let a = g.add(NodeKind::DiffuseBsdf);
    let b = g.add(NodeKind::GlossyBsdf);
    let c = g.add(NodeKind::TransparentBsdf);
    let inner = g.add(NodeKind::MixClosure);
    let outer = g.add(NodeKind::MixClosure);
    let out = g.output();
    g.connect(a, "BSDF", inner, "Closure1").unwrap();
    g.connect(b, "BSDF", inner, "Closure2").unwrap();
    g.connect(inner, "Closure", outer, "Closure1").unwrap();
    g.connect(c, "BSDF", outer, "Closure2").unwrap();
    g.set_input(outer, "Fac", SocketValue::Float(0.2)).unwrap();
    g.connect(outer, "Closure", out, "Surface").unwrap();

    let compiled = compile(&mut shader);
    let weights = closure_weights(compiled.program.entry(EntryPoint::Surface));
    let expected = [0.4, 0.4, 0.2];
    assert_eq!(weights.len(), 3);
    for (w, e) in weights.iter().zip(expected) {
        assert!((w - e).abs() < 1e-6, "{weights:?}");
    }
    assert!(shader.flags.has_surface_transparent);
}

#[test]
fn varying_factor_guards_each_branch_with_a_jump() {
    let mut shader =
        mixed_surface(NodeKind::DiffuseBsdf, NodeKind::Emission, Some((NodeKind::Geometry, "Backfacing")));
    let compiled = compile(&mut shader);
    assert!(compiled.is_complete());
    let program = &compiled.program;
    let code = &program.instructions;
    let range = program.entries[&EntryPoint::Surface].clone();

    let jump_at = |opcode: Opcode| range.clone().find(|i| op(&code[*i]) == Some(opcode)).unwrap();
    let skip_one = jump_at(Opcode::JumpIfOne);
    let skip_zero = jump_at(Opcode::JumpIfZero);
    assert!(skip_one < skip_zero);
    // Both jumps test the same factor slot.
    assert_eq!(code[skip_one][2], code[skip_zero][2]);

    // Each jump skips exactly its own branch.
    let one_target = skip_one + 1 + code[skip_one][1] as usize;
    let zero_target = skip_zero + 1 + code[skip_zero][1] as usize;
    assert_eq!(one_target, skip_zero);
    assert_eq!(count(&code[skip_one + 1..one_target], Opcode::ClosureBsdf), 1);
    assert_eq!(count(&code[skip_zero + 1..zero_target], Opcode::ClosureEmission), 1);
    assert_eq!(op(&code[zero_target]), Some(Opcode::End));

    // The weight split is hoisted above both jumps.
    let mix_weight = range.clone().find(|i| op(&code[*i]) == Some(Opcode::MixClosure)).unwrap();
    assert!(mix_weight < skip_one);
}

#[test]
fn node_shared_by_both_branches_is_emitted_once_before_the_jumps() {
    let mut shader = Shader::new("shared");
    let g = shader.graph_mut();
    let geometry = g.add(NodeKind::Geometry);
    let attr = g.add(NodeKind::Attribute { attribute: "rough".to_string() });
    let a = g.add(NodeKind::DiffuseBsdf);
    let b = g.add(NodeKind::GlossyBsdf);
    let mix = g.add(NodeKind::MixClosure);
    let out = g.output();
    g.connect(attr, "Fac", a, "Roughness").unwrap();
    g.connect(attr, "Fac", b, "Roughness").unwrap();
    g.connect(a, "BSDF", mix, "Closure1").unwrap();
    g.connect(b, "BSDF", mix, "Closure2").unwrap();
    g.connect(geometry, "Backfacing", mix, "Fac").unwrap();
    g.connect(mix, "Closure", out, "Surface").unwrap();

    let compiled = compile(&mut shader);
    assert!(compiled.is_complete(), "{:?}", compiled.failures);
    let surface = compiled.program.entry(EntryPoint::Surface);
    assert_eq!(count(surface, Opcode::Attr), 1);
    let attr_at = surface.iter().position(|i| op(i) == Some(Opcode::Attr)).unwrap();
    let jump_at = surface.iter().position(|i| op(i) == Some(Opcode::JumpIfOne)).unwrap();
    assert!(attr_at < jump_at);
}

// ---------------------------------------------------------------------------
// Bump and displacement
// ---------------------------------------------------------------------------

#[test]
fn displacement_with_both_methods_emits_bump_entry() {
    let mut shader = Shader::new("rocky");
    shader.displacement_method = DisplacementMethod::Both;
    let g = shader.graph_mut();
    let height = g.add(NodeKind::Attribute { attribute: "height".to_string() });
    let displacement = g.add(NodeKind::Displacement { use_object_space: false });
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(height, "Fac", displacement, "Height").unwrap();
    g.connect(displacement, "Displacement", out, "Displacement").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();

    let compiled = compile(&mut shader);
    assert!(compiled.is_complete(), "{:?}", compiled.failures);
    let program = &compiled.program;

    let bump = program.entry(EntryPoint::Bump);
    assert_eq!(op(&bump[0]), Some(Opcode::EnterBumpEval));
    assert_eq!(count(bump, Opcode::BumpFromDisplacement), 1);
    assert_eq!(count(bump, Opcode::ClosureSetNormal), 1);
    assert_eq!(op(bump.last().unwrap()), Some(Opcode::LeaveBumpEval));
    assert_eq!(count(bump, Opcode::End), 0);

    // Surface entry starts with bump and falls through into the surface code.
    let bump_range = program.entries[&EntryPoint::Bump].clone();
    assert_eq!(program.instructions[0][1], bump_range.start as i32);
    assert_eq!(program.entries[&EntryPoint::Surface].start, bump_range.end);

    let displace = program.entry(EntryPoint::Displacement);
    assert_eq!(count(displace, Opcode::SetDisplacement), 1);
    assert_eq!(count(displace, Opcode::BumpFromDisplacement), 0);

    assert!(shader.flags.has_bump);
    assert!(shader.flags.has_displacement);
    assert!(shader.attributes.contains(&AttributeKey::Standard(AttributeStandard::PositionUndisplaced)));
}

#[test]
fn true_displacement_has_no_bump_entry() {
    let mut shader = Shader::new("terrain");
    shader.displacement_method = DisplacementMethod::True;
    let g = shader.graph_mut();
    let height = g.add(NodeKind::Attribute { attribute: "height".to_string() });
    let displacement = g.add(NodeKind::Displacement { use_object_space: true });
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(height, "Fac", displacement, "Height").unwrap();
    g.connect(displacement, "Displacement", out, "Displacement").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();

    let compiled = compile(&mut shader);
    assert_eq!(compiled.program.entry_len(EntryPoint::Bump), 0);
    assert!(!shader.flags.has_bump);
    assert_eq!(compiled.program.instructions[0][1], compiled.program.entries[&EntryPoint::Surface].start as i32);
}

#[test]
fn switching_displacement_method_recompiles_bump() {
    let mut shader = Shader::new("terrain");
    shader.displacement_method = DisplacementMethod::True;
    let g = shader.graph_mut();
    let height = g.add(NodeKind::Attribute { attribute: "height".to_string() });
    let displacement = g.add(NodeKind::Displacement { use_object_space: false });
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(height, "Fac", displacement, "Height").unwrap();
    g.connect(displacement, "Displacement", out, "Displacement").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();

    let compiled = compile(&mut shader);
    assert_eq!(compiled.program.entry_len(EntryPoint::Bump), 0);
    assert!(!shader.flags.has_bump);

    shader.displacement_method = DisplacementMethod::Bump;
    shader.tag_modified();
    let compiled = compile(&mut shader);
    assert!(compiled.is_complete(), "{:?}", compiled.failures);
    assert!(shader.flags.has_bump);
    assert_eq!(count(compiled.program.entry(EntryPoint::Bump), Opcode::BumpFromDisplacement), 1);

    shader.displacement_method = DisplacementMethod::True;
    shader.tag_modified();
    let compiled = compile(&mut shader);
    assert_eq!(compiled.program.entry_len(EntryPoint::Bump), 0);
    assert!(!shader.flags.has_bump);
    assert_eq!(count(compiled.program.entry(EntryPoint::Surface), Opcode::BumpFromDisplacement), 0);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[test]
fn cyclic_graph_is_rejected_before_compile() {
    use petgraph::stable_graph::StableGraph;
    use shadegraph_core::{Link, ShaderGraph};

    let mut raw = StableGraph::new();
    let out = raw.add_node(ShaderNode::new(NodeKind::Output));
    let geometry = raw.add_node(ShaderNode::new(NodeKind::Geometry));
    let a = raw.add_node(ShaderNode::new(NodeKind::Math { op: MathOp::Add, use_clamp: false }));
    let b = raw.add_node(ShaderNode::new(NodeKind::Math { op: MathOp::Add, use_clamp: false }));
    let diffuse = raw.add_node(ShaderNode::new(NodeKind::DiffuseBsdf));
    raw.add_edge(geometry, a, Link { from_output: 3, to_input: 0 });
    raw.add_edge(a, b, Link { from_output: 0, to_input: 0 });
    raw.add_edge(b, a, Link { from_output: 0, to_input: 1 });
    raw.add_edge(b, diffuse, Link { from_output: 0, to_input: 1 });
    raw.add_edge(diffuse, out, Link { from_output: 0, to_input: 0 });

    let err = ShaderGraph::from_parts(raw, NodeId::from(out)).unwrap_err();
    assert!(matches!(err, CoreError::CyclicGraph));
}

#[test]
fn unsupported_socket_type_fails_loudly() {
    let mut shader = Shader::new("scripted");
    let g = shader.graph_mut();
    let source = || NodeKind::Script { source: ScriptSource::File(PathBuf::from("noise.oso")) };
    let producer = g.add_node(ShaderNode::with_sockets(
        source(),
        vec![],
        vec![ShaderOutput { name: "Matrix".to_string(), ty: SocketType::Transform }],
    ));
    let consumer = g.add_node(ShaderNode::with_sockets(
        source(),
        vec![ShaderInput {
            name: "Matrix".to_string(),
            ty: SocketType::Transform,
            value: SocketValue::default_for(SocketType::Transform),
            internal: false,
        }],
        vec![ShaderOutput { name: "Rough".to_string(), ty: SocketType::Float }],
    ));
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(producer, "Matrix", consumer, "Matrix").unwrap();
    g.connect(consumer, "Rough", diffuse, "Roughness").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();

    let compiled = compile(&mut shader);
    assert_eq!(compiled.failures.len(), 1);
    assert!(matches!(
        compiled.failures[0].error,
        SvmError::UnsupportedSocketType { ty: SocketType::Transform, .. }
    ));
    assert_eq!(compiled.failures[0].phase, Phase::Emitting);
    assert!(!shader.flags.has_surface);
}

// ---------------------------------------------------------------------------
// Stack discipline and determinism
// ---------------------------------------------------------------------------

#[test]
fn stack_trace_never_reads_a_released_slot() {
    let mut shader = Shader::new("busy");
    let g = shader.graph_mut();
    let geometry = g.add(NodeKind::Geometry);
    let checker = g.add(NodeKind::CheckerTexture);
    let ao = g.add(NodeKind::AmbientOcclusion { samples: 8, only_local: false });
    let math = g.add(NodeKind::Math { op: MathOp::Multiply, use_clamp: true });
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let glossy = g.add(NodeKind::GlossyBsdf);
    let emission = g.add(NodeKind::Emission);
    let inner = g.add(NodeKind::MixClosure);
    let outer = g.add(NodeKind::MixClosure);
    let out = g.output();
    g.connect(geometry, "Position", checker, "Vector").unwrap();
    g.connect(checker, "Color", diffuse, "Color").unwrap();
    g.connect(checker, "Fac", math, "Value1").unwrap();
    g.connect(ao, "AO", math, "Value2").unwrap();
    g.connect(math, "Value", glossy, "Roughness").unwrap();
    g.connect(checker, "Color", emission, "Color").unwrap();
    g.connect(diffuse, "BSDF", inner, "Closure1").unwrap();
    g.connect(glossy, "BSDF", inner, "Closure2").unwrap();
    g.connect(geometry, "Backfacing", inner, "Fac").unwrap();
    g.connect(inner, "Closure", outer, "Closure1").unwrap();
    g.connect(emission, "Emission", outer, "Closure2").unwrap();
    g.connect(math, "Value", outer, "Fac").unwrap();
    g.connect(outer, "Closure", out, "Surface").unwrap();

    let compiled = compile_with(&mut shader, SvmOptions { record_stack_trace: true, ..SvmOptions::default() });
    assert!(compiled.is_complete(), "{:?}", compiled.failures);
    assert!(shader.flags.has_surface_raytrace);

    let trace = &compiled.traces[&EntryPoint::Surface];
    assert!(!trace.is_empty());
    let mut live = vec![false; STACK_SIZE];
    for event in trace {
        let slots = event.offset as usize..(event.offset + event.size) as usize;
        match event.kind {
            SlotEventKind::Write => {
                assert!(slots.clone().all(|s| !live[s]), "overlapping write {event:?}");
                slots.for_each(|s| live[s] = true);
            }
            SlotEventKind::Read => assert!(slots.clone().all(|s| live[s]), "stale read {event:?}"),
            SlotEventKind::Release => slots.for_each(|s| live[s] = false),
        }
    }
    assert!(compiled.program.peak_stack_usage as usize <= STACK_SIZE);
    assert!(compiled.program.peak_stack_usage > 0);
}

fn math_chain(ops: &[(u8, bool)], use_attribute: bool) -> Shader {
    const OPS: [MathOp; 6] =
        [MathOp::Add, MathOp::Subtract, MathOp::Multiply, MathOp::Maximum, MathOp::Sine, MathOp::Power];
    let mut shader = Shader::new("chain");
    let g = shader.graph_mut();
    let (source, socket) = if use_attribute {
        (g.add(NodeKind::Attribute { attribute: "weight".to_string() }), "Fac")
    } else {
        (g.add(NodeKind::Geometry), "Backfacing")
    };
    let mut prev = (source, socket);
    for (op, clamp) in ops {
        let node = g.add(NodeKind::Math { op: OPS[*op as usize % OPS.len()], use_clamp: *clamp });
        g.connect(prev.0, prev.1, node, "Value1").unwrap();
        g.connect(source, socket, node, "Value2").unwrap();
        prev = (node, "Value");
    }
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(prev.0, prev.1, diffuse, "Roughness").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();
    shader
}

proptest! {
    #[test]
    fn compilation_is_deterministic(
        ops in prop::collection::vec((0u8..6, any::<bool>()), 1..24),
        use_attribute in any::<bool>(),
    ) {
        let shader = math_chain(&ops, use_attribute);
        let first = compile(&mut shader.clone());
        let second = compile(&mut shader.clone());
        prop_assert!(first.is_complete());
        prop_assert_eq!(&first.program, &second.program);
        prop_assert_eq!(program_hash(&first.program), program_hash(&second.program));
        prop_assert_eq!(count(first.program.entry(EntryPoint::Surface), Opcode::Math), ops.len());
    }
}
