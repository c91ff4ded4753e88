//! Graph to bytecode compilation.
//!
//! A shader compiles one entry point at a time, each in a fresh
//! [`EntryContext`] with its own stack and bookkeeping. Inside an entry the
//! closure tree is walked from the terminal; mixes with a non-constant
//! factor become conditional jumps so the untaken branch is skipped at run
//! time. Nodes needed by both branches are hoisted above the jumps.
//!
//! The finished program is laid out as a header jump instruction followed
//! by the bump, surface, volume, and displacement sections. Bump has no
//! terminator and falls through into surface.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use shadegraph_core::node::SpecialType;
use shadegraph_core::walk::{find_dependencies, schedule, DependencySet, GraphWalk, NodeFlags};
use shadegraph_core::{
    AttributeIdMap, AttributeKey, AttributeRequestSet, BytecodeProgram, CoreError,
    DisplacementMethod, EntryPoint, Instruction, NodeId, Shader, ShaderFlags, ShaderGraph,
    SocketType, SocketValue,
};

use crate::error::SvmError;
use crate::opcode::{encode_uchar4, float_bits, Opcode, BUMP_EVAL_STATE_SIZE, STACK_INVALID};
use crate::stack::{SlotEvent, StackAllocator};
use crate::summary::Summary;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvmOptions {
    /// Compiling the world shader: generated coordinates come from the
    /// shading position instead of a mesh attribute.
    pub background: bool,
    /// Keep every stack access of every entry in [`SvmOutput::traces`].
    pub record_stack_trace: bool,
}

/// Where an entry point was when compilation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Collecting,
    Scheduling,
    Emitting,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct EntryFailure {
    pub entry: EntryPoint,
    /// Phase the entry point was in when it failed.
    pub phase: Phase,
    pub error: SvmError,
}

#[derive(Debug)]
pub struct SvmOutput {
    pub program: BytecodeProgram,
    pub summary: Summary,
    /// Entry points that failed. Their jump targets the shared terminator
    /// and they contribute no flags.
    pub failures: Vec<EntryFailure>,
    pub traces: BTreeMap<EntryPoint, Vec<SlotEvent>>,
}

impl SvmOutput {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Compiles shaders to bytecode. Shares the scene's attribute map so
/// attribute ids agree across shaders.
pub struct SvmCompiler<'a> {
    attributes: &'a AttributeIdMap,
    options: SvmOptions,
}

impl<'a> SvmCompiler<'a> {
    pub fn new(attributes: &'a AttributeIdMap, options: SvmOptions) -> Self {
        SvmCompiler { attributes, options }
    }

    pub fn options(&self) -> SvmOptions {
        self.options
    }

    /// Finalizes and compiles `shader`, updating its flags and attribute
    /// requests. The program is returned, not stored.
    pub fn compile(&self, shader: &mut Shader) -> SvmOutput {
        let start = Instant::now();
        let has_bump = shader.prepare_compile();
        let mut summary = Summary { time_finalize: start.elapsed(), ..Summary::default() };

        let settings = EntrySettings {
            background: self.options.background,
            displacement_method: shader.displacement_method,
            record_trace: self.options.record_stack_trace,
        };
        let order = has_bump
            .then_some(EntryPoint::Bump)
            .into_iter()
            .chain([EntryPoint::Surface, EntryPoint::Volume, EntryPoint::Displacement]);

        let mut flags = ShaderFlags { has_bump, ..ShaderFlags::default() };
        let mut requests = AttributeRequestSet::new();
        let mut sections: BTreeMap<EntryPoint, Vec<Instruction>> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut traces = BTreeMap::new();
        let mut peak = 0;

        for entry in order {
            if !shader.is_terminal_linked(entry) {
                continue;
            }
            let entry_start = Instant::now();
            let mut ctx = EntryContext::new(shader.graph(), self.attributes, entry, settings);
            let result = ctx.compile();
            peak = peak.max(ctx.stack.peak());
            if settings.record_trace {
                traces.insert(entry, ctx.stack.take_trace());
            }
            match result {
                Ok(()) => {
                    flags |= ctx.flags;
                    requests.merge(&ctx.requests);
                    sections.insert(entry, ctx.code);
                }
                Err((phase, error)) => {
                    tracing::error!(shader = %shader.name, %entry, ?phase, %error, "entry point failed to compile");
                    failures.push(EntryFailure { entry, phase, error });
                }
            }
            summary.record_time(entry, entry_start.elapsed());
        }

        // Bump code only makes sense ahead of a surface section.
        if !sections.contains_key(&EntryPoint::Surface) {
            sections.remove(&EntryPoint::Bump);
        }

        let program = layout(sections, peak);
        shader.flags = flags;
        shader.update_attributes(requests);

        summary.num_svm_nodes = program.instructions.len();
        summary.peak_stack_usage = peak;
        summary.failed = failures.iter().map(|f| f.entry).collect();
        summary.time_total = start.elapsed();
        tracing::debug!(
            shader = %shader.name,
            instructions = summary.num_svm_nodes,
            peak_stack = peak,
            "compiled shader to bytecode"
        );

        SvmOutput { program, summary, failures, traces }
    }
}

/// Concatenates entry sections behind the header jump. Jumps of entries
/// without a section point at a shared trailing terminator.
fn layout(mut sections: BTreeMap<EntryPoint, Vec<Instruction>>, peak: u32) -> BytecodeProgram {
    let mut instructions: Vec<Instruction> = vec![[Opcode::ShaderJump as i32, 0, 0, 0]];
    let mut entries: BTreeMap<EntryPoint, Range<usize>> = BTreeMap::new();
    for entry in [EntryPoint::Bump, EntryPoint::Surface, EntryPoint::Volume, EntryPoint::Displacement] {
        if let Some(code) = sections.remove(&entry) {
            let begin = instructions.len();
            instructions.extend(code);
            entries.insert(entry, begin..instructions.len());
        }
    }

    let start_of = |entry: EntryPoint| entries.get(&entry).map(|r| r.start);
    let targets = [
        start_of(EntryPoint::Bump).or_else(|| start_of(EntryPoint::Surface)),
        start_of(EntryPoint::Volume),
        start_of(EntryPoint::Displacement),
    ];
    let terminator = targets.iter().any(Option::is_none).then(|| {
        instructions.push([Opcode::End as i32, 0, 0, 0]);
        instructions.len() - 1
    });
    for (word, target) in targets.iter().enumerate() {
        instructions[0][word + 1] = target.or(terminator).unwrap_or(0) as i32;
    }

    BytecodeProgram { instructions, entries, peak_stack_usage: peak }
}

// ---------------------------------------------------------------------------
// Per-entry state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct EntrySettings {
    background: bool,
    displacement_method: DisplacementMethod,
    record_trace: bool,
}

/// Deferred work for the closure tree walk.
enum ClosureTask {
    Visit(NodeId),
    EmitShared(DependencySet),
    /// Emit a conditional jump over the branch fed by `input`, then the
    /// branch itself.
    Branch { node: NodeId, input: usize, fac: usize, opcode: Opcode },
    PatchJump(usize),
    ReleaseFactor { node: NodeId, input: usize },
    Finish(NodeId),
}

pub(crate) struct EntryContext<'c> {
    graph: &'c ShaderGraph,
    attributes: &'c AttributeIdMap,
    entry: EntryPoint,
    settings: EntrySettings,
    pub(crate) code: Vec<Instruction>,
    pub(crate) stack: StackAllocator,
    input_slots: HashMap<(NodeId, usize), u32>,
    output_slots: HashMap<(NodeId, usize), u32>,
    mix_weight_offset: u32,
    done: NodeFlags,
    closure_done: NodeFlags,
    pub(crate) flags: ShaderFlags,
    pub(crate) requests: AttributeRequestSet,
    pub(crate) phase: Phase,
}

impl<'c> EntryContext<'c> {
    fn new(
        graph: &'c ShaderGraph,
        attributes: &'c AttributeIdMap,
        entry: EntryPoint,
        settings: EntrySettings,
    ) -> Self {
        EntryContext {
            graph,
            attributes,
            entry,
            settings,
            code: Vec::new(),
            stack: StackAllocator::new(settings.record_trace),
            input_slots: HashMap::new(),
            output_slots: HashMap::new(),
            mix_weight_offset: STACK_INVALID,
            done: NodeFlags::with_capacity(graph.node_bound()),
            closure_done: NodeFlags::with_capacity(graph.node_bound()),
            flags: ShaderFlags::default(),
            requests: AttributeRequestSet::new(),
            phase: Phase::Idle,
        }
    }

    /// Compiles the entry point. On failure the context ends in
    /// [`Phase::Failed`] and the phase it failed in is returned.
    fn compile(&mut self) -> Result<(), (Phase, SvmError)> {
        self.compile_entry().map_err(|error| {
            let failed_in = self.phase;
            self.phase = Phase::Failed;
            (failed_in, error)
        })
    }

    fn compile_entry(&mut self) -> Result<(), SvmError> {
        let graph = self.graph;
        let output = graph.output();
        let terminal = self.input_index(output, self.entry.terminal())?;

        let bump_state = if self.entry == EntryPoint::Bump
            && self.settings.displacement_method == DisplacementMethod::Both
        {
            let offset = self.stack.find_offset(BUMP_EVAL_STATE_SIZE, self.code.len())?;
            self.add_node(Opcode::EnterBumpEval, offset as i32, 0, 0);
            Some(offset)
        } else {
            None
        };

        if let Some((root, _)) = graph.input_link(output, terminal) {
            match self.entry {
                EntryPoint::Surface => self.flags.has_surface = true,
                EntryPoint::Volume => self.flags.has_volume = true,
                EntryPoint::Displacement => self.flags.has_displacement = true,
                EntryPoint::Bump => {}
            }
            self.generate_multi_closure(root)?;
        }

        self.phase = Phase::Emitting;
        self.emit_output(output)?;

        if let Some(offset) = bump_state {
            self.add_node(Opcode::LeaveBumpEval, offset as i32, 0, 0);
            self.stack.release(offset, BUMP_EVAL_STATE_SIZE, self.code.len());
        }
        if self.entry != EntryPoint::Bump {
            self.add_node(Opcode::End, 0, 0, 0);
        }
        self.phase = Phase::Done;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Closure tree
    // -----------------------------------------------------------------------

    fn generate_multi_closure(&mut self, root: NodeId) -> Result<(), SvmError> {
        let graph = self.graph;
        let mut tasks = vec![ClosureTask::Visit(root)];
        while let Some(task) = tasks.pop() {
            match task {
                ClosureTask::Visit(id) => self.visit_closure(root, id, &mut tasks)?,
                ClosureTask::EmitShared(shared) => self.emit_set(&shared)?,
                ClosureTask::Branch { node, input, fac, opcode } => {
                    let fac_slot = self.assign_input_idx(node, fac)?;
                    let at = self.code.len();
                    self.add_node(opcode, 0, fac_slot as i32, 0);
                    tasks.push(ClosureTask::PatchJump(at));
                    if let Some((child, _)) = graph.input_link(node, input) {
                        tasks.push(ClosureTask::Visit(child));
                    }
                }
                ClosureTask::PatchJump(at) => {
                    self.code[at][1] = (self.code.len() - at - 1) as i32;
                }
                ClosureTask::ReleaseFactor { node, input } => {
                    self.input_slots.remove(&(node, input));
                }
                ClosureTask::Finish(id) => {
                    self.done.insert(id);
                    self.clear_users(id);
                }
            }
        }
        Ok(())
    }

    fn visit_closure(
        &mut self,
        root: NodeId,
        id: NodeId,
        tasks: &mut Vec<ClosureTask>,
    ) -> Result<(), SvmError> {
        let graph = self.graph;
        if self.closure_done.contains(id) {
            return Ok(());
        }
        let node = graph.require(id)?;
        if node.kind.special_type() != SpecialType::CombineClosure {
            self.closure_done.insert(id);
            self.generate_closure_node(id)?;
            self.done.insert(id);
            return Ok(());
        }

        let linked = |name: &str| node.input_index(name).filter(|i| graph.is_input_linked(id, *i));
        let (cl1, cl2) = (linked("Closure1"), linked("Closure2"));
        if cl1.is_none() && cl2.is_none() {
            return Ok(());
        }
        self.closure_done.insert(id);

        let Some(fac) = linked("Fac") else {
            // Constant factor: both branches always run, weighted.
            tasks.push(ClosureTask::Finish(id));
            for input in [cl2, cl1].into_iter().flatten() {
                if let Some((child, _)) = graph.input_link(id, input) {
                    tasks.push(ClosureTask::Visit(child));
                }
            }
            return Ok(());
        };

        let mut fac_deps = DependencySet::new();
        self.collect(&mut fac_deps, id, fac, None);
        self.emit_set(&fac_deps)?;

        let mut cl1_deps = DependencySet::new();
        let mut cl2_deps = DependencySet::new();
        if let Some(input) = cl1 {
            self.collect(&mut cl1_deps, id, input, None);
        }
        if let Some(input) = cl2 {
            self.collect(&mut cl2_deps, id, input, None);
        }
        let mut shared = cl1_deps.intersection(&cl2_deps);

        // Nodes also used outside this mix must not end up behind a jump.
        if root != id {
            for input in 0..graph.require(root)?.inputs.len() {
                let mut root_deps = DependencySet::new();
                self.collect(&mut root_deps, root, input, Some(id));
                shared.extend(&root_deps.intersection(&cl1_deps));
                shared.extend(&root_deps.intersection(&cl2_deps));
            }
        }

        tasks.push(ClosureTask::Finish(id));
        tasks.push(ClosureTask::ReleaseFactor { node: id, input: fac });
        // Closure1 carries weight 1 - fac, Closure2 carries fac.
        if let Some(input) = cl2 {
            tasks.push(ClosureTask::Branch { node: id, input, fac, opcode: Opcode::JumpIfZero });
        }
        if let Some(input) = cl1 {
            tasks.push(ClosureTask::Branch { node: id, input, fac, opcode: Opcode::JumpIfOne });
        }
        if !shared.is_empty() {
            let mut shared_closures = Vec::new();
            for input in [cl1, cl2].into_iter().flatten() {
                if let Some((child, _)) = graph.input_link(id, input) {
                    self.shared_closure_nodes(child, &shared, &mut shared_closures);
                }
            }
            tasks.push(ClosureTask::EmitShared(shared));
            tasks.extend(shared_closures.into_iter().rev().map(ClosureTask::Visit));
        }
        Ok(())
    }

    /// Closure nodes in `shared` reachable from `start` through closure
    /// inputs, without descending past a shared node.
    fn shared_closure_nodes(&self, start: NodeId, shared: &DependencySet, out: &mut Vec<NodeId>) {
        let graph = self.graph;
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if shared.contains(id) {
                if !out.contains(&id) {
                    out.push(id);
                }
                continue;
            }
            let Some(node) = graph.node(id) else {
                continue;
            };
            for (input, socket) in node.inputs.iter().enumerate().rev() {
                if socket.ty != SocketType::Closure {
                    continue;
                }
                if let Some((upstream, _)) = graph.input_link(id, input) {
                    stack.push(upstream);
                }
            }
        }
    }

    fn generate_closure_node(&mut self, id: NodeId) -> Result<(), SvmError> {
        let graph = self.graph;
        let node = graph.require(id)?;
        for input in 0..node.inputs.len() {
            if self.skips_input(id, input) || !graph.is_input_linked(id, input) {
                continue;
            }
            let mut deps = DependencySet::new();
            self.collect(&mut deps, id, input, None);
            self.emit_set(&deps)?;
        }

        if let Some(weight) = node.weight_input(self.entry == EntryPoint::Volume) {
            let value = node.inputs[weight].value.as_float().unwrap_or(1.0);
            if graph.is_input_linked(id, weight) || value != 1.0 {
                self.mix_weight_offset = self.assign_input_idx(id, weight)?;
            }
        }
        let emitted = self.generate_node(id);
        self.mix_weight_offset = STACK_INVALID;
        emitted?;

        if self.entry == EntryPoint::Surface {
            let kind = &node.kind;
            self.flags.has_surface_emission |= kind.has_surface_emission();
            self.flags.has_surface_transparent |= kind.has_surface_transparent();
            self.flags.has_surface_bssrdf |= kind.has_surface_bssrdf();
            if graph.node_has_bump(id) {
                self.flags.has_bump = true;
                if kind.has_surface_bssrdf() {
                    self.flags.has_bssrdf_bump = true;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node emission
    // -----------------------------------------------------------------------

    fn collect(&mut self, deps: &mut DependencySet, node: NodeId, input: usize, skip: Option<NodeId>) {
        self.phase = Phase::Collecting;
        find_dependencies(self, deps, node, input, skip);
    }

    fn emit_set(&mut self, nodes: &DependencySet) -> Result<(), SvmError> {
        self.phase = Phase::Scheduling;
        schedule(self, nodes)?;
        Ok(())
    }

    fn generate_node(&mut self, id: NodeId) -> Result<(), SvmError> {
        let graph = self.graph;
        self.phase = Phase::Emitting;
        self.emit_node_code(id)?;
        self.clear_users(id);
        self.clear_temporary(id);

        let kind = &graph.require(id)?.kind;
        match self.entry {
            EntryPoint::Surface => {
                self.flags.has_surface_spatial_varying |= kind.has_spatial_varying();
                self.flags.has_surface_raytrace |= kind.has_raytrace();
            }
            EntryPoint::Volume => {
                self.flags.has_volume_spatial_varying |= kind.has_spatial_varying();
                self.flags.has_volume_attribute_dependency |= kind.has_attribute_dependency();
            }
            EntryPoint::Bump | EntryPoint::Displacement => {}
        }
        self.flags.has_integrator_dependency |= kind.has_integrator_dependency();
        graph.node_attributes(id, &mut self.requests, self.settings.background);
        self.done.insert(id);
        Ok(())
    }

    /// Releases upstream outputs that no later node will read.
    fn clear_users(&mut self, id: NodeId) {
        let graph = self.graph;
        let Some(node) = graph.node(id) else {
            return;
        };
        for input in 0..node.inputs.len() {
            let Some((src, out)) = graph.input_link(id, input) else {
                continue;
            };
            let Some(&slot) = self.output_slots.get(&(src, out)) else {
                continue;
            };
            let consumers = graph.output_links(src, out);
            if !consumers.iter().all(|(c, _)| *c == id || self.done.contains(*c)) {
                continue;
            }
            let size = graph
                .node(src)
                .and_then(|n| n.outputs.get(out))
                .and_then(|o| o.ty.stack_size())
                .unwrap_or(0);
            self.stack.release(slot, size, self.code.len());
            self.output_slots.remove(&(src, out));
            for consumer in consumers {
                self.input_slots.remove(&consumer);
            }
        }
    }

    /// Releases constants loaded for unlinked inputs.
    fn clear_temporary(&mut self, id: NodeId) {
        let graph = self.graph;
        let Some(node) = graph.node(id) else {
            return;
        };
        for (input, socket) in node.inputs.iter().enumerate() {
            if self.effective_link(id, input).is_some() {
                continue;
            }
            if let Some(slot) = self.input_slots.remove(&(id, input)) {
                let size = socket.ty.stack_size().unwrap_or(0);
                self.stack.release(slot, size, self.code.len());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Slot assignment, used by the per-kind emitters
    // -----------------------------------------------------------------------

    pub(crate) fn graph(&self) -> &'c ShaderGraph {
        self.graph
    }

    pub(crate) fn entry(&self) -> EntryPoint {
        self.entry
    }

    pub(crate) fn background(&self) -> bool {
        self.settings.background
    }

    pub(crate) fn attribute_id(&self, key: &AttributeKey) -> u32 {
        self.attributes.id(key)
    }

    fn skips_input(&self, id: NodeId, input: usize) -> bool {
        self.entry == EntryPoint::Displacement
            && self
                .graph
                .input_link(id, input)
                .and_then(|(src, _)| self.graph.node(src))
                .is_some_and(|n| n.kind.special_type() == SpecialType::Bump)
    }

    /// Link feeding `input`, unless this entry point ignores it.
    fn effective_link(&self, id: NodeId, input: usize) -> Option<(NodeId, usize)> {
        if self.skips_input(id, input) {
            return None;
        }
        self.graph.input_link(id, input)
    }

    pub(crate) fn input_index(&self, id: NodeId, name: &str) -> Result<usize, SvmError> {
        self.graph
            .require(id)?
            .input_index(name)
            .ok_or_else(|| CoreError::InputNotFound { node: id, name: name.to_string() }.into())
    }

    pub(crate) fn output_index(&self, id: NodeId, name: &str) -> Result<usize, SvmError> {
        self.graph
            .require(id)?
            .output_index(name)
            .ok_or_else(|| CoreError::OutputNotFound { node: id, name: name.to_string() }.into())
    }

    pub(crate) fn is_linked(&self, id: NodeId, name: &str) -> bool {
        self.input_index(id, name).ok().and_then(|i| self.effective_link(id, i)).is_some()
    }

    pub(crate) fn is_output_linked(&self, id: NodeId, name: &str) -> bool {
        self.output_index(id, name).is_ok_and(|o| self.graph.is_output_linked(id, o))
    }

    fn slot_size(&self, id: NodeId, socket: &str, ty: SocketType) -> Result<u32, SvmError> {
        ty.stack_size().ok_or_else(|| SvmError::UnsupportedSocketType {
            node: id,
            socket: socket.to_string(),
            ty,
        })
    }

    /// Slot holding the value of an input: the upstream output's slot when
    /// linked, otherwise a freshly loaded constant.
    pub(crate) fn assign_input(&mut self, id: NodeId, name: &str) -> Result<u32, SvmError> {
        let input = self.input_index(id, name)?;
        self.assign_input_idx(id, input)
    }

    pub(crate) fn assign_input_if_linked(&mut self, id: NodeId, name: &str) -> Result<u32, SvmError> {
        if self.is_linked(id, name) {
            self.assign_input(id, name)
        } else {
            Ok(STACK_INVALID)
        }
    }

    fn assign_input_idx(&mut self, id: NodeId, input: usize) -> Result<u32, SvmError> {
        let graph = self.graph;
        let socket = graph
            .input_socket(id, input)
            .ok_or_else(|| CoreError::InputNotFound { node: id, name: input.to_string() })?;
        let size = self.slot_size(id, &socket.name, socket.ty)?;
        if size == 0 {
            return Ok(STACK_INVALID);
        }

        if let Some((src, out)) = self.effective_link(id, input) {
            let slot = *self
                .output_slots
                .get(&(src, out))
                .ok_or_else(|| SvmError::UnassignedLink { node: id, socket: socket.name.clone() })?;
            self.stack.read(slot, size, self.code.len())?;
            self.input_slots.insert((id, input), slot);
            return Ok(slot);
        }

        if let Some(&slot) = self.input_slots.get(&(id, input)) {
            return Ok(slot);
        }
        let slot = self.stack.find_offset(size, self.code.len())?;
        self.load_constant(slot, &socket.value, socket.ty);
        self.input_slots.insert((id, input), slot);
        Ok(slot)
    }

    fn load_constant(&mut self, slot: u32, value: &SocketValue, ty: SocketType) {
        match ty {
            SocketType::Int => {
                self.add_node(Opcode::ValueF, value.as_int().unwrap_or(0), slot as i32, 0);
            }
            t if t.is_float3() => {
                let v = value.as_float3().unwrap_or_default();
                self.add_node(Opcode::ValueV, slot as i32, 0, 0);
                self.push([float_bits(v.x), float_bits(v.y), float_bits(v.z), 0]);
            }
            _ => {
                let v = value.as_float().unwrap_or(0.0);
                self.add_node(Opcode::ValueF, float_bits(v), slot as i32, 0);
            }
        }
    }

    /// Slot for an output, claimed on first use.
    pub(crate) fn assign_output(&mut self, id: NodeId, name: &str) -> Result<u32, SvmError> {
        let output = self.output_index(id, name)?;
        if let Some(&slot) = self.output_slots.get(&(id, output)) {
            return Ok(slot);
        }
        let ty = self.graph.require(id)?.outputs[output].ty;
        let size = self.slot_size(id, name, ty)?;
        let slot = self.stack.find_offset(size, self.code.len())?;
        self.output_slots.insert((id, output), slot);
        Ok(slot)
    }

    pub(crate) fn assign_output_if_linked(&mut self, id: NodeId, name: &str) -> Result<u32, SvmError> {
        if self.is_output_linked(id, name) {
            self.assign_output(id, name)
        } else {
            Ok(STACK_INVALID)
        }
    }

    /// Makes `output` alias the value feeding `input`, without copying.
    pub(crate) fn link_output(&mut self, id: NodeId, input: &str, output: &str) -> Result<(), SvmError> {
        let out_idx = self.output_index(id, output)?;
        if self.output_slots.contains_key(&(id, out_idx)) {
            return Ok(());
        }
        let in_idx = self.input_index(id, input)?;
        let (src, src_out) = self
            .effective_link(id, in_idx)
            .ok_or_else(|| SvmError::UnassignedLink { node: id, socket: input.to_string() })?;
        let slot = *self
            .output_slots
            .get(&(src, src_out))
            .ok_or_else(|| SvmError::UnassignedLink { node: id, socket: input.to_string() })?;
        let ty = self.graph.require(id)?.outputs[out_idx].ty;
        let size = self.slot_size(id, output, ty)?;
        self.stack.read(slot, size, self.code.len())?;
        self.stack.add_user(slot, size);
        self.output_slots.insert((id, out_idx), slot);
        Ok(())
    }

    /// Scratch slots owned by a single emitter.
    pub(crate) fn temp_slot(&mut self, size: u32) -> Result<u32, SvmError> {
        self.stack.find_offset(size, self.code.len())
    }

    pub(crate) fn release_temp(&mut self, slot: u32, size: u32) {
        self.stack.release(slot, size, self.code.len());
    }

    /// Weight slot of the closure being emitted, or [`STACK_INVALID`] when
    /// its weight is exactly one.
    pub(crate) fn closure_mix_weight(&mut self) -> Result<u32, SvmError> {
        if self.mix_weight_offset != STACK_INVALID {
            self.stack.read(self.mix_weight_offset, 1, self.code.len())?;
        }
        Ok(self.mix_weight_offset)
    }

    pub(crate) fn encode(&self, x: u32, y: u32, z: u32, w: u32) -> Result<i32, SvmError> {
        encode_uchar4(x, y, z, w).ok_or(SvmError::OperandOverflow { value: x.max(y).max(z).max(w) })
    }

    pub(crate) fn add_node(&mut self, opcode: Opcode, a: i32, b: i32, c: i32) {
        self.code.push([opcode as i32, a, b, c]);
    }

    pub(crate) fn push(&mut self, instruction: Instruction) {
        self.code.push(instruction);
    }
}

impl GraphWalk for EntryContext<'_> {
    type Error = SvmError;

    fn graph(&self) -> &ShaderGraph {
        self.graph
    }

    fn skip_input(&self, node: NodeId, input: usize) -> bool {
        self.skips_input(node, input)
    }

    fn is_done(&self, node: NodeId) -> bool {
        self.done.contains(node)
    }

    fn emit_node(&mut self, node: NodeId) -> Result<(), SvmError> {
        self.generate_node(node)?;
        self.phase = Phase::Scheduling;
        Ok(())
    }
}
