//! ShaderGraph: the node/link container compiled by every backend.
//!
//! The graph is a `StableGraph` whose edges run from a producing output to a
//! consuming input. Each input holds at most one link; connecting an input
//! that is already linked replaces the previous link. Links that would close
//! a cycle are rejected at construction time.
//!
//! [`ShaderGraph::finalize`] prepares a graph for compilation:
//! 1. Constant folding of value nodes, constant math, zero emission, and
//!    mixes with a constant factor of 0 or 1
//! 2. Removal of nodes that cannot reach the output node
//! 3. Optional synthesis of a bump node from the displacement network
//! 4. Rewriting of mix/add closure trees into per-closure weight inputs

use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeRef, NodeIndexable};
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeRequestSet, AttributeStandard};
use crate::error::CoreError;
use crate::id::NodeId;
use crate::node::{MathOp, NodeKind, ShaderInput, ShaderNode, SpecialType};
use crate::types::{SocketType, SocketValue};

/// A link from output `from_output` of the source node to input `to_input`
/// of the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub from_output: u16,
    pub to_input: u16,
}

/// Options for [`ShaderGraph::finalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeOptions {
    /// Derive the surface normal from the displacement network.
    pub do_bump: bool,
    pub bump_in_object_space: bool,
}

/// A shader node graph with a single output node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawShaderGraph")]
pub struct ShaderGraph {
    nodes: StableGraph<ShaderNode, Link, Directed, u32>,
    output: NodeId,
    /// Options of the last finalize; cleared by any edit.
    finalized: Option<FinalizeOptions>,
    /// The graph as it was before the last finalize.
    unfinalized: Option<StableGraph<ShaderNode, Link, Directed, u32>>,
}

/// Wire form of [`ShaderGraph`], validated on the way in.
#[derive(Deserialize)]
struct RawShaderGraph {
    nodes: StableGraph<ShaderNode, Link, Directed, u32>,
    output: NodeId,
    #[serde(default)]
    finalized: Option<FinalizeOptions>,
    #[serde(default)]
    unfinalized: Option<StableGraph<ShaderNode, Link, Directed, u32>>,
}

impl TryFrom<RawShaderGraph> for ShaderGraph {
    type Error = CoreError;

    fn try_from(raw: RawShaderGraph) -> Result<Self, CoreError> {
        if let Some(unfinalized) = &raw.unfinalized {
            if is_cyclic_directed(unfinalized) {
                return Err(CoreError::CyclicGraph);
            }
        }
        let mut graph = ShaderGraph::from_parts(raw.nodes, raw.output)?;
        graph.finalized = raw.finalized;
        graph.unfinalized = raw.unfinalized;
        Ok(graph)
    }
}

impl Default for ShaderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderGraph {
    /// Creates a graph holding only its output node.
    pub fn new() -> Self {
        let mut nodes = StableGraph::new();
        let output = NodeId::from(nodes.add_node(ShaderNode::new(NodeKind::Output)));
        ShaderGraph { nodes, output, finalized: None, unfinalized: None }
    }

    /// Builds a graph from raw parts produced elsewhere.
    ///
    /// Socket types are not checked, but the output node must exist and the
    /// links must not form a cycle.
    pub fn from_parts(
        nodes: StableGraph<ShaderNode, Link, Directed, u32>,
        output: NodeId,
    ) -> Result<Self, CoreError> {
        match nodes.node_weight(output.into()) {
            Some(node) if node.kind == NodeKind::Output => {}
            _ => return Err(CoreError::MissingOutput),
        }
        if is_cyclic_directed(&nodes) {
            return Err(CoreError::CyclicGraph);
        }
        Ok(ShaderGraph { nodes, output, finalized: None, unfinalized: None })
    }

    /// Builds a graph without the cycle check, for exercising the scheduler.
    #[cfg(test)]
    pub(crate) fn from_parts_unchecked(
        nodes: StableGraph<ShaderNode, Link, Directed, u32>,
        output: NodeId,
    ) -> Self {
        ShaderGraph { nodes, output, finalized: None, unfinalized: None }
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    pub fn raw(&self) -> &StableGraph<ShaderNode, Link, Directed, u32> {
        &self.nodes
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&ShaderNode> {
        self.nodes.node_weight(id.into())
    }

    pub fn require(&self, id: NodeId) -> Result<&ShaderNode, CoreError> {
        self.node(id).ok_or(CoreError::NodeNotFound { id })
    }

    pub fn output_node(&self) -> &ShaderNode {
        &self.nodes[NodeIndex::from(self.output)]
    }

    /// All node IDs in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.node_indices().map(NodeId::from).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.node_count()
    }

    /// Upper bound on node indices, for arena-indexed side tables.
    pub fn node_bound(&self) -> usize {
        self.nodes.node_bound()
    }

    pub fn link_count(&self) -> usize {
        self.nodes.edge_count()
    }

    /// Source of the link feeding input `input` of `node`.
    pub fn input_link(&self, node: NodeId, input: usize) -> Option<(NodeId, usize)> {
        self.nodes
            .edges_directed(node.into(), Direction::Incoming)
            .find(|e| e.weight().to_input as usize == input)
            .map(|e| (NodeId::from(e.source()), e.weight().from_output as usize))
    }

    pub fn input_link_by_name(&self, node: NodeId, name: &str) -> Option<(NodeId, usize)> {
        let idx = self.node(node)?.input_index(name)?;
        self.input_link(node, idx)
    }

    pub fn is_input_linked(&self, node: NodeId, input: usize) -> bool {
        self.input_link(node, input).is_some()
    }

    /// Consumers of output `output` of `node`, sorted by (node, input).
    pub fn output_links(&self, node: NodeId, output: usize) -> Vec<(NodeId, usize)> {
        let mut links: Vec<_> = self
            .nodes
            .edges_directed(node.into(), Direction::Outgoing)
            .filter(|e| e.weight().from_output as usize == output)
            .map(|e| (NodeId::from(e.target()), e.weight().to_input as usize))
            .collect();
        links.sort();
        links
    }

    pub fn is_output_linked(&self, node: NodeId, output: usize) -> bool {
        self.nodes
            .edges_directed(node.into(), Direction::Outgoing)
            .any(|e| e.weight().from_output as usize == output)
    }

    pub fn input_socket(&self, node: NodeId, input: usize) -> Option<&ShaderInput> {
        self.node(node)?.inputs.get(input)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    pub fn add(&mut self, kind: NodeKind) -> NodeId {
        self.add_node(ShaderNode::new(kind))
    }

    pub fn add_node(&mut self, node: ShaderNode) -> NodeId {
        self.touch();
        NodeId::from(self.nodes.add_node(node))
    }

    /// Sets the value an input uses while unlinked.
    pub fn set_input(&mut self, node: NodeId, name: &str, value: SocketValue) -> Result<(), CoreError> {
        let target = self.nodes.node_weight_mut(node.into()).ok_or(CoreError::NodeNotFound { id: node })?;
        let input = target
            .inputs
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| CoreError::InputNotFound { node, name: name.to_string() })?;
        if !value.fits(input.ty) {
            return Err(CoreError::ValueTypeMismatch { name: name.to_string(), expected: input.ty });
        }
        input.value = value;
        self.touch();
        Ok(())
    }

    /// Links `from.from_output` to `to.to_input`, replacing any existing
    /// link on that input.
    pub fn connect(
        &mut self,
        from: NodeId,
        from_output: &str,
        to: NodeId,
        to_input: &str,
    ) -> Result<(), CoreError> {
        let source = self.require(from)?;
        let out_idx = source
            .output_index(from_output)
            .ok_or_else(|| CoreError::OutputNotFound { node: from, name: from_output.to_string() })?;
        let from_ty = source.outputs[out_idx].ty;

        let target = self.require(to)?;
        let in_idx = target
            .input_index(to_input)
            .ok_or_else(|| CoreError::InputNotFound { node: to, name: to_input.to_string() })?;
        let to_ty = target.inputs[in_idx].ty;

        if !from_ty.links_to(to_ty) {
            return Err(CoreError::IncompatibleLink { from: from_ty, to: to_ty });
        }
        if has_path_connecting(&self.nodes, to.into(), from.into(), None) {
            return Err(CoreError::WouldCreateCycle { from, to });
        }

        self.link(from, out_idx, to, in_idx);
        Ok(())
    }

    /// Removes the link feeding `to.to_input`, if any.
    pub fn disconnect(&mut self, to: NodeId, to_input: &str) -> Result<bool, CoreError> {
        let in_idx = self
            .require(to)?
            .input_index(to_input)
            .ok_or_else(|| CoreError::InputNotFound { node: to, name: to_input.to_string() })?;
        Ok(self.unlink(to, in_idx))
    }

    fn link(&mut self, from: NodeId, output: usize, to: NodeId, input: usize) {
        self.unlink(to, input);
        self.nodes.add_edge(
            from.into(),
            to.into(),
            Link { from_output: output as u16, to_input: input as u16 },
        );
        self.touch();
    }

    /// Edits after a finalize apply to the finalized graph, which becomes
    /// the new starting point.
    fn touch(&mut self) {
        self.finalized = None;
        self.unfinalized = None;
    }

    fn unlink(&mut self, to: NodeId, input: usize) -> bool {
        let edge = self
            .nodes
            .edges_directed(to.into(), Direction::Incoming)
            .find(|e| e.weight().to_input as usize == input)
            .map(|e| e.id());
        match edge {
            Some(edge) => {
                self.nodes.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    fn set_value(&mut self, node: NodeId, input: usize, value: SocketValue) {
        if let Some(target) = self.nodes.node_weight_mut(node.into()) {
            if let Some(socket) = target.inputs.get_mut(input) {
                socket.value = value;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Feature queries
    // -----------------------------------------------------------------------

    /// Whether a closure's normal is driven by something other than the
    /// geometry normal.
    pub fn node_has_bump(&self, id: NodeId) -> bool {
        let Some(node) = self.node(id) else {
            return false;
        };
        if !node.kind.is_closure() {
            return false;
        }
        match node.input_index("Normal").and_then(|idx| self.input_link(id, idx)) {
            Some((src, _)) => self
                .node(src)
                .map(|n| n.kind.special_type() != SpecialType::Geometry)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Adds the geometry attributes `id` reads to `attributes`.
    pub fn node_attributes(&self, id: NodeId, attributes: &mut AttributeRequestSet, background: bool) {
        let Some(node) = self.node(id) else {
            return;
        };
        match &node.kind {
            NodeKind::Attribute { attribute } => {
                if (0..node.outputs.len()).any(|o| self.is_output_linked(id, o)) {
                    attributes.add_name(attribute);
                }
            }
            NodeKind::TextureCoordinate { .. } => {
                if !background && self.is_output_linked(id, 0) {
                    attributes.add_standard(AttributeStandard::Generated);
                }
                if self.is_output_linked(id, 2) {
                    attributes.add_standard(AttributeStandard::Uv);
                }
            }
            NodeKind::ImageTexture { .. } => {
                if !self.is_input_linked(id, 0) {
                    attributes.add_standard(AttributeStandard::Uv);
                }
            }
            NodeKind::CheckerTexture => {
                if !background && !self.is_input_linked(id, 0) {
                    attributes.add_standard(AttributeStandard::Generated);
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Prepares the graph for compilation. Idempotent for the same options
    /// until the graph is edited again; different options restart from the
    /// graph as it was before the previous finalize.
    pub fn finalize(&mut self, options: FinalizeOptions) {
        match self.finalized {
            Some(previous) if previous == options => return,
            Some(previous) => {
                tracing::debug!(?previous, ?options, "finalize options changed, restarting from unfinalized graph");
                if let Some(unfinalized) = self.unfinalized.take() {
                    self.nodes = unfinalized;
                }
            }
            None => {}
        }
        let unfinalized = self.nodes.clone();

        let folded = self.fold_constants();
        let removed = self.remove_unreachable();
        if options.do_bump {
            self.bump_from_displacement(options.bump_in_object_space);
        }
        self.transform_multi_closure("Surface", false);
        self.transform_multi_closure("Volume", true);

        tracing::trace!(folded, removed, nodes = self.node_count(), "finalized shader graph");
        self.finalized = Some(options);
        self.unfinalized = Some(unfinalized);
    }

    /// Folds constant producers into their consumers. Returns the number of
    /// links removed.
    fn fold_constants(&mut self) -> usize {
        let mut folded = 0;
        loop {
            let mut changed = 0;
            for id in self.node_ids() {
                changed += self.fold_node(id);
            }
            if changed == 0 {
                break;
            }
            folded += changed;
        }
        folded
    }

    fn fold_node(&mut self, id: NodeId) -> usize {
        enum Fold {
            Keep,
            Constant(SocketValue),
            Discard,
            Bypass(usize),
        }

        let node = &self.nodes[NodeIndex::from(id)];
        let linked = |name: &str| self.input_link_by_name(id, name).is_some();
        let action = match &node.kind {
            NodeKind::Value { value } => Fold::Constant(SocketValue::Float(*value)),
            NodeKind::Rgb { color } => Fold::Constant(SocketValue::Float3(*color)),
            NodeKind::Math { op, use_clamp } if !linked("Value1") && !linked("Value2") => {
                let mut value = op.apply(node.float("Value1"), node.float("Value2"));
                if *use_clamp {
                    value = value.clamp(0.0, 1.0);
                }
                Fold::Constant(SocketValue::Float(value))
            }
            NodeKind::Emission | NodeKind::Background => {
                let dark = !linked("Color") && node.float3("Color").is_zero();
                let off = !linked("Strength") && node.float("Strength") == 0.0;
                if dark || off {
                    Fold::Discard
                } else {
                    Fold::Keep
                }
            }
            NodeKind::MixClosure if !linked("Fac") => match node.float("Fac") {
                f if f == 0.0 => Fold::Bypass(1),
                f if f == 1.0 => Fold::Bypass(2),
                _ => Fold::Keep,
            },
            _ => Fold::Keep,
        };

        match action {
            Fold::Keep => 0,
            Fold::Constant(value) => self.propagate_constant(id, value),
            Fold::Discard => self.discard_outputs(id),
            Fold::Bypass(input) => self.bypass(id, input),
        }
    }

    /// Copies a constant into every consumer of output 0 whose type accepts
    /// it and drops those links.
    fn propagate_constant(&mut self, id: NodeId, value: SocketValue) -> usize {
        let mut count = 0;
        for (consumer, input) in self.output_links(id, 0) {
            let Some(ty) = self.input_socket(consumer, input).map(|i| i.ty) else {
                continue;
            };
            let converted = match (&value, ty) {
                (SocketValue::Float(v), SocketType::Float) => Some(SocketValue::Float(*v)),
                (SocketValue::Float(v), t) if t.is_float3() => {
                    Some(SocketValue::Float3(crate::types::Float3::splat(*v)))
                }
                (SocketValue::Float3(v), t) if t.is_float3() => Some(SocketValue::Float3(*v)),
                _ => None,
            };
            if let Some(converted) = converted {
                self.set_value(consumer, input, converted);
                self.unlink(consumer, input);
                count += 1;
            }
        }
        count
    }

    fn discard_outputs(&mut self, id: NodeId) -> usize {
        let edges: Vec<_> = self
            .nodes
            .edges_directed(id.into(), Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for edge in &edges {
            self.nodes.remove_edge(*edge);
        }
        edges.len()
    }

    /// Reroutes consumers of `id` to whatever feeds input `input`.
    fn bypass(&mut self, id: NodeId, input: usize) -> usize {
        let source = self.input_link(id, input);
        let consumers = self.output_links(id, 0);
        self.discard_outputs(id);
        if let Some((src, out)) = source {
            for (consumer, consumer_input) in &consumers {
                self.link(src, out, *consumer, *consumer_input);
            }
        }
        consumers.len()
    }

    /// Removes nodes that cannot reach the output node.
    fn remove_unreachable(&mut self) -> usize {
        let mut keep = vec![false; self.nodes.node_bound()];
        let mut stack = vec![NodeIndex::from(self.output)];
        while let Some(idx) = stack.pop() {
            if std::mem::replace(&mut keep[idx.index()], true) {
                continue;
            }
            stack.extend(self.nodes.neighbors_directed(idx, Direction::Incoming));
        }
        let dead: Vec<_> = self.nodes.node_indices().filter(|idx| !keep[idx.index()]).collect();
        for idx in &dead {
            self.nodes.remove_node(*idx);
        }
        dead.len()
    }

    fn bump_from_displacement(&mut self, use_object_space: bool) {
        let out = self.output;
        let node = self.output_node();
        let (Some(disp_idx), Some(normal_idx)) =
            (node.input_index("Displacement"), node.input_index("Normal"))
        else {
            return;
        };
        let Some((src, src_out)) = self.input_link(out, disp_idx) else {
            return;
        };
        let bump = self.add(NodeKind::BumpFromDisplacement { use_object_space });
        self.link(src, src_out, bump, 0);
        self.link(bump, 0, out, normal_idx);
    }

    /// Pushes mix/add closure weights down to the leaf closures, so each
    /// closure reads its final weight from its mix weight input.
    fn transform_multi_closure(&mut self, terminal: &str, volume: bool) {
        let Some((root, _)) = self.input_link_by_name(self.output, terminal) else {
            return;
        };

        let mut work: Vec<(NodeId, Option<(NodeId, usize)>)> = vec![(root, None)];
        while let Some((id, weight_out)) = work.pop() {
            let node = &self.nodes[NodeIndex::from(id)];
            if node.kind.special_type() == SpecialType::CombineClosure {
                let fac = node.input_index("Fac");
                let fac_value = node.float("Fac");
                let cl1 = node.input_index("Closure1").and_then(|i| self.input_link(id, i));
                let cl2 = node.input_index("Closure2").and_then(|i| self.input_link(id, i));

                let (weight1, weight2) = match fac {
                    Some(fac_idx) => {
                        let fac_link = self.input_link(id, fac_idx);
                        let mix = self.add(NodeKind::MixClosureWeight);
                        match fac_link {
                            Some((src, out)) => self.link(src, out, mix, 1),
                            None => self.set_value(mix, 1, SocketValue::Float(fac_value)),
                        }
                        if let Some((src, out)) = weight_out {
                            self.link(src, out, mix, 0);
                        }
                        (Some((mix, 0)), Some((mix, 1)))
                    }
                    None => (weight_out, weight_out),
                };

                if let Some((c2, _)) = cl2 {
                    work.push((c2, weight2));
                }
                if let Some((c1, _)) = cl1 {
                    work.push((c1, weight1));
                }
                continue;
            }

            let Some(weight_idx) = node.weight_input(volume) else {
                continue;
            };
            let weight_value = node.inputs[weight_idx].value.as_float().unwrap_or(0.0);
            let existing = self.input_link(id, weight_idx);
            let mut weight_out = weight_out;

            if existing.is_some() || weight_value != 0.0 {
                let math = self.add(NodeKind::Math { op: MathOp::Add, use_clamp: false });
                match existing {
                    Some((src, out)) => self.link(src, out, math, 0),
                    None => self.set_value(math, 0, SocketValue::Float(weight_value)),
                }
                match weight_out {
                    Some((src, out)) => self.link(src, out, math, 1),
                    None => self.set_value(math, 1, SocketValue::Float(1.0)),
                }
                weight_out = Some((math, 0));
                if existing.is_some() {
                    self.unlink(id, weight_idx);
                }
            }

            match weight_out {
                Some((src, out)) => self.link(src, out, id, weight_idx),
                None => self.set_value(id, weight_idx, SocketValue::Float(weight_value + 1.0)),
            }
        }
    }
}
