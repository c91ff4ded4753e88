//! Integration tests for graph construction, finalization, and
//! serialization through the public API.

use proptest::prelude::*;
use shadegraph_core::node::MathOp;
use shadegraph_core::{
    CoreError, EntryPoint, FinalizeOptions, NodeKind, Shader, ShaderGraph, SocketType, SocketValue,
};

const OPS: [MathOp; 8] = [
    MathOp::Add,
    MathOp::Subtract,
    MathOp::Multiply,
    MathOp::Divide,
    MathOp::Minimum,
    MathOp::Maximum,
    MathOp::LessThan,
    MathOp::Absolute,
];

/// Value -> math chain -> diffuse roughness, returning the graph and the
/// value the chain should fold to.
fn constant_chain(seed: f32, steps: &[(usize, f32, bool)]) -> (ShaderGraph, f32) {
    let mut g = ShaderGraph::new();
    let value = g.add(NodeKind::Value { value: seed });
    let mut prev = (value, "Value");
    let mut expected = seed;
    for (op, operand, clamp) in steps {
        let op = OPS[op % OPS.len()];
        let node = g.add(NodeKind::Math { op, use_clamp: *clamp });
        g.connect(prev.0, prev.1, node, "Value1").unwrap();
        g.set_input(node, "Value2", SocketValue::Float(*operand)).unwrap();
        expected = op.apply(expected, *operand);
        if *clamp {
            expected = expected.clamp(0.0, 1.0);
        }
        prev = (node, "Value");
    }
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    let out = g.output();
    g.connect(prev.0, prev.1, diffuse, "Roughness").unwrap();
    g.connect(diffuse, "BSDF", out, "Surface").unwrap();
    (g, expected)
}

proptest! {
    #[test]
    fn constant_math_folds_to_direct_evaluation(
        seed in -4.0f32..4.0,
        steps in prop::collection::vec((0usize..8, -4.0f32..4.0, any::<bool>()), 0..12),
    ) {
        let (mut g, expected) = constant_chain(seed, &steps);
        g.finalize(FinalizeOptions::default());

        let (diffuse, _) = g.input_link_by_name(g.output(), "Surface").unwrap();
        prop_assert!(g.input_link_by_name(diffuse, "Roughness").is_none());
        let folded = g.node(diffuse).unwrap().float("Roughness");
        prop_assert!(folded == expected || (folded.is_nan() && expected.is_nan()));
        // Output, diffuse, and nothing else survives.
        prop_assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn finalize_is_idempotent(
        seed in -4.0f32..4.0,
        steps in prop::collection::vec((0usize..8, -4.0f32..4.0, any::<bool>()), 0..12),
    ) {
        let (mut g, _) = constant_chain(seed, &steps);
        g.finalize(FinalizeOptions::default());
        let once = serde_json::to_value(&g).unwrap();
        g.finalize(FinalizeOptions::default());
        prop_assert_eq!(once, serde_json::to_value(&g).unwrap());
    }
}

#[test]
fn incompatible_and_cyclic_links_are_rejected() {
    let mut g = ShaderGraph::new();
    let a = g.add(NodeKind::Math { op: MathOp::Add, use_clamp: false });
    let b = g.add(NodeKind::Math { op: MathOp::Add, use_clamp: false });
    let diffuse = g.add(NodeKind::DiffuseBsdf);
    g.connect(a, "Value", b, "Value1").unwrap();

    let err = g.connect(b, "Value", a, "Value1").unwrap_err();
    assert!(matches!(err, CoreError::WouldCreateCycle { .. }));

    let err = g.connect(a, "Value", diffuse, "Color").unwrap_err();
    assert!(matches!(err, CoreError::IncompatibleLink { from: SocketType::Float, to: SocketType::Color }));

    let err = g.connect(diffuse, "BSDF", a, "Value2").unwrap_err();
    assert!(matches!(err, CoreError::IncompatibleLink { from: SocketType::Closure, .. }));
}

#[test]
fn shader_survives_json_round_trip() {
    let mut shader = Shader::new("glass");
    let g = shader.graph_mut();
    let attr = g.add(NodeKind::Attribute { attribute: "tint".to_string() });
    let glossy = g.add(NodeKind::GlossyBsdf);
    let out = g.output();
    g.connect(attr, "Color", glossy, "Color").unwrap();
    g.connect(glossy, "BSDF", out, "Surface").unwrap();

    let json = serde_json::to_string(&shader).unwrap();
    let back: Shader = serde_json::from_str(&json).unwrap();
    assert_eq!(back.name, "glass");
    assert!(back.is_terminal_linked(EntryPoint::Surface));
    assert_eq!(back.graph().node_count(), 3);
    assert_eq!(back.graph().link_count(), 2);
    assert_eq!(serde_json::to_string(&back).unwrap(), json);
}
