//! Dependency collection and fixed-point scheduling over a [`ShaderGraph`].
//!
//! Both backends walk the graph the same way and differ only in which inputs
//! they ignore and what they do per node. Those differences live behind the
//! [`GraphWalk`] trait; the traversal itself is iterative, so deep graphs do
//! not grow the call stack.

use crate::error::CoreError;
use crate::graph::ShaderGraph;
use crate::id::NodeId;

/// Arena-indexed boolean per node, keyed by node index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFlags {
    bits: Vec<bool>,
}

impl NodeFlags {
    pub fn with_capacity(bound: usize) -> Self {
        NodeFlags { bits: vec![false; bound] }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.bits.get(id.index()).copied().unwrap_or(false)
    }

    /// Sets the flag; returns `true` if it was previously unset.
    pub fn insert(&mut self, id: NodeId) -> bool {
        if id.index() >= self.bits.len() {
            self.bits.resize(id.index() + 1, false);
        }
        !std::mem::replace(&mut self.bits[id.index()], true)
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = false);
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }
}

/// Insertion-ordered node set. Iteration order is the order nodes were
/// added, which for [`find_dependencies`] is dependency postorder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    order: Vec<NodeId>,
    members: NodeFlags,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: NodeId) -> bool {
        let added = self.members.insert(id);
        if added {
            self.order.push(id);
        }
        added
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Members of `self` that are also in `other`, in `self`'s order.
    pub fn intersection(&self, other: &DependencySet) -> DependencySet {
        let mut out = DependencySet::new();
        for id in self.iter().filter(|id| other.contains(*id)) {
            out.insert(id);
        }
        out
    }

    pub fn extend(&mut self, other: &DependencySet) {
        for id in other.iter() {
            self.insert(id);
        }
    }
}

/// Backend hooks for walking a graph.
pub trait GraphWalk {
    type Error: From<CoreError>;

    fn graph(&self) -> &ShaderGraph;

    /// Whether `input` of `node` is ignored for dependency purposes.
    fn skip_input(&self, node: NodeId, input: usize) -> bool;

    fn is_done(&self, node: NodeId) -> bool;

    /// Emits `node` and marks it done.
    fn emit_node(&mut self, node: NodeId) -> Result<(), Self::Error>;
}

/// Adds every not-yet-done node upstream of `node.input` to `deps`, in
/// postorder: a node is appended only after all of its own non-skipped
/// dependencies. `skip_node` and its upstream are not entered through it.
pub fn find_dependencies<W: GraphWalk + ?Sized>(
    walk: &W,
    deps: &mut DependencySet,
    node: NodeId,
    input: usize,
    skip_node: Option<NodeId>,
) {
    let graph = walk.graph();
    if walk.skip_input(node, input) {
        return;
    }
    let Some((first, _)) = graph.input_link(node, input) else {
        return;
    };

    let mut on_stack = NodeFlags::with_capacity(graph.node_bound());
    let enterable = |id: NodeId, deps: &DependencySet, on_stack: &NodeFlags| {
        !walk.is_done(id) && Some(id) != skip_node && !deps.contains(id) && !on_stack.contains(id)
    };
    if !enterable(first, deps, &on_stack) {
        return;
    }

    let mut stack: Vec<(NodeId, usize)> = vec![(first, 0)];
    on_stack.insert(first);
    while let Some(top) = stack.last_mut() {
        let (current, next_input) = *top;
        let input_count = graph.node(current).map(|n| n.inputs.len()).unwrap_or(0);
        if next_input < input_count {
            top.1 += 1;
            if walk.skip_input(current, next_input) {
                continue;
            }
            if let Some((upstream, _)) = graph.input_link(current, next_input) {
                if enterable(upstream, deps, &on_stack) {
                    on_stack.insert(upstream);
                    stack.push((upstream, 0));
                }
            }
        } else {
            stack.pop();
            deps.insert(current);
        }
    }
}

/// Emits every node of `nodes` once all of its non-skipped upstream nodes
/// are done, scanning repeatedly until the set is exhausted.
///
/// Returns the number of passes taken. A pass that makes no progress means
/// the remaining nodes can never become ready, which is reported as
/// [`CoreError::Unschedulable`].
pub fn schedule<W: GraphWalk + ?Sized>(walk: &mut W, nodes: &DependencySet) -> Result<usize, W::Error> {
    let mut passes = 0;
    loop {
        passes += 1;
        let mut progressed = false;
        let mut pending = Vec::new();

        for id in nodes.iter() {
            if walk.is_done(id) {
                continue;
            }
            if is_ready(walk, id) {
                walk.emit_node(id)?;
                progressed = true;
            } else {
                pending.push(id);
            }
        }

        if pending.is_empty() {
            return Ok(passes);
        }
        if !progressed {
            return Err(CoreError::Unschedulable { remaining: pending }.into());
        }
    }
}

fn is_ready<W: GraphWalk + ?Sized>(walk: &W, id: NodeId) -> bool {
    let graph = walk.graph();
    let input_count = graph.node(id).map(|n| n.inputs.len()).unwrap_or(0);
    (0..input_count).all(|input| {
        walk.skip_input(id, input)
            || match graph.input_link(id, input) {
                Some((upstream, _)) => walk.is_done(upstream),
                None => true,
            }
    })
}
