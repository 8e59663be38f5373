//! Combines remote-buffer loads and stores that run on different shards into one wider
//! instruction per round, then biases the schedule so that old state is consumed before
//! new state is loaded.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use tracing::{debug, debug_span, trace};

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::backend_config::CallType;
use crate::backend::buffers::descriptors::remote_buffer_count;
use crate::backend::buffers::{
    remote_buffer_parameters, uses, BufferAnalysis, BufferLocality, BufferUseKind,
};
use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::matcher::fusion_computations;
use crate::backend::module::Module;
use crate::backend::pipeline::ModulePass;
use crate::backend::reachability::ReachabilityMap;
use crate::backend::spec::{CompId, CustomOp, InstId, NewInstruction, Opcode, Shape, Sharding};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Load,
    Store,
}

fn direction(op: &CustomOp) -> Option<Direction> {
    match op {
        CustomOp::RemoteParameterLoad { .. } | CustomOp::BufferLoadSlice { .. } => {
            Some(Direction::Load)
        }
        CustomOp::RemoteParameterStore { .. } | CustomOp::BufferStoreSlice { .. } => {
            Some(Direction::Store)
        }
        _ => None,
    }
}

/// Heap order: largest first, then lowest buffer parameter number, then lowest id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    byte_size: usize,
    parameter: Reverse<usize>,
    id: Reverse<InstId>,
}

impl QueueEntry {
    fn new(comp: &Computation, id: InstId) -> Self {
        let inst = &comp[id];
        let parameter = inst
            .operands()
            .first()
            .and_then(|&op| comp[op].opcode().parameter_number())
            .unwrap_or(usize::MAX);
        Self {
            byte_size: inst.shape().byte_size(),
            parameter: Reverse(parameter),
            id: Reverse(id),
        }
    }
}

/// Merges loads and stores living on different shards of every resource update.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteParameterParallelCombiner;

impl RemoteParameterParallelCombiner {
    const NAME: &'static str = "remote-parameter-parallel-combiner";

    pub fn new() -> Self {
        Self
    }

    /// Returns true when the computation changed.
    pub fn run_on_computation(&self, comp: &mut Computation) -> Result<bool, CompileError> {
        let _span = debug_span!("parallel_combiner", computation = comp.name()).entered();
        let loads = combine_from_different_shards(comp, Direction::Load)?;
        let stores = combine_from_different_shards(comp, Direction::Store)?;
        let changed = !loads.is_empty() || !stores.is_empty();
        add_scheduling_constraints(comp, &loads, &stores)?;
        Ok(changed)
    }
}

fn shard_queues(comp: &Computation, want: Direction) -> BTreeMap<u32, BinaryHeap<QueueEntry>> {
    let mut queues: BTreeMap<u32, BinaryHeap<QueueEntry>> = BTreeMap::new();
    for inst in comp.instructions() {
        if inst.custom_op().and_then(direction) != Some(want) {
            continue;
        }
        let Some(device) = inst.sharding_unique_device() else {
            continue;
        };
        queues
            .entry(device)
            .or_default()
            .push(QueueEntry::new(comp, inst.id()));
    }
    queues
}

/// Pops one candidate per shard per round and combines the round when legal.
/// The result lists combined instructions from the smallest round to the largest.
fn combine_from_different_shards(
    comp: &mut Computation,
    want: Direction,
) -> Result<Vec<InstId>, CompileError> {
    let mut queues = shard_queues(comp, want);
    let mut combined = Vec::new();
    loop {
        let round: Vec<InstId> = queues
            .values_mut()
            .filter_map(|q| q.pop().map(|entry| entry.id.0))
            .collect();
        if round.len() < 2 {
            break;
        }
        if !independently_schedulable(comp, &round) {
            trace!(count = round.len(), "round has dependent members, skipped");
            continue;
        }
        if !same_kind(comp, &round) {
            trace!(count = round.len(), "round mixes operation kinds, skipped");
            continue;
        }
        if want == Direction::Store && !stores_target_distinct_remote_buffers(comp, &round)? {
            trace!(count = round.len(), "round stores to shared buffers, skipped");
            continue;
        }
        let new = combine_and_replace(comp, &round)?;
        debug!(combined = %comp[new].name(), count = round.len(), "combined remote buffer operations");
        combined.push(new);
    }
    // Rounds were popped largest first; schedule order wants the reverse.
    combined.reverse();
    Ok(combined)
}

fn independently_schedulable(comp: &Computation, round: &[InstId]) -> bool {
    let reachability = ReachabilityMap::build(comp);
    round.iter().all(|&a| {
        round
            .iter()
            .all(|&b| a == b || !reachability.is_reachable(a, b))
    })
}

fn same_kind(comp: &Computation, round: &[InstId]) -> bool {
    let kind = |id: InstId| std::mem::discriminant(comp[id].opcode());
    let custom = |id: InstId| comp[id].custom_op().map(std::mem::discriminant);
    round
        .iter()
        .all(|&id| kind(id) == kind(round[0]) && custom(id) == custom(round[0]))
}

fn stores_target_distinct_remote_buffers(
    comp: &Computation,
    stores: &[InstId],
) -> Result<bool, CompileError> {
    let analysis = BufferAnalysis::run(comp, &remote_buffer_parameters(comp))?;
    let mut seen = BTreeSet::new();
    for &store in stores {
        // A store writes in place into every operand it aliases read-write.
        for used in uses(comp, store)? {
            if used.kind() != BufferUseKind::AliasReadWrite {
                continue;
            }
            let target = comp[store].operand(used.operand_number());
            let buffer = analysis.unique_buffer(target, &[])?;
            if buffer.locality() != BufferLocality::Remote || !seen.insert(buffer.id()) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Operands of the combined instruction, grouped per role: every buffer first, then
/// every value or offset in the order the single instructions list them.
fn combine_operands(comp: &Computation, round: &[InstId]) -> Result<Vec<InstId>, CompileError> {
    let mut groups_per_inst = None;
    for &id in round {
        let inst = &comp[id];
        let buffers = remote_buffer_count(inst);
        if buffers == 0 || inst.operand_count() % buffers != 0 {
            return Err(CompileError::structural(format!(
                "{} has {} operands for {} remote buffers",
                inst.name(),
                inst.operand_count(),
                buffers
            )));
        }
        let groups = inst.operand_count() / buffers;
        if *groups_per_inst.get_or_insert(groups) != groups {
            return Err(CompileError::structural(format!(
                "{} does not match the operand layout of the other combined operations",
                inst.name()
            )));
        }
    }
    let groups = groups_per_inst.unwrap_or(0);
    let mut operands = Vec::new();
    for group in 0..groups {
        for &id in round {
            let inst = &comp[id];
            let buffers = remote_buffer_count(inst);
            operands.extend_from_slice(&inst.operands()[group * buffers..(group + 1) * buffers]);
        }
    }
    Ok(operands)
}

fn combined_op(comp: &Computation, round: &[InstId]) -> Result<CustomOp, CompileError> {
    let mut factors = Vec::new();
    for &id in round {
        let op = comp[id].custom_op().ok_or_else(|| {
            CompileError::structural(format!("{} is not a remote buffer operation", comp[id].name()))
        })?;
        factors.extend_from_slice(op.replication_factors().unwrap_or_default());
    }
    let first = comp[round[0]]
        .custom_op()
        .ok_or_else(|| CompileError::structural("combined round lost its first operation"))?;
    Ok(match first {
        CustomOp::RemoteParameterLoad { .. } => CustomOp::RemoteParameterLoad {
            replication_factors: factors,
        },
        CustomOp::RemoteParameterStore { .. } => CustomOp::RemoteParameterStore {
            replication_factors: factors,
        },
        CustomOp::BufferLoadSlice { .. } => CustomOp::BufferLoadSlice {
            replication_factors: factors,
        },
        CustomOp::BufferStoreSlice { .. } => CustomOp::BufferStoreSlice {
            replication_factors: factors,
        },
        other => {
            return Err(CompileError::structural(format!(
                "{} cannot be combined",
                other.mnemonic()
            )))
        }
    })
}

fn combine_and_replace(comp: &mut Computation, round: &[InstId]) -> Result<InstId, CompileError> {
    let operands = combine_operands(comp, round)?;
    let op = combined_op(comp, round)?;
    let shapes: Vec<Shape> = round.iter().map(|&id| comp[id].shape().clone()).collect();
    let shardings: Vec<Sharding> = round
        .iter()
        .map(|&id| comp[id].sharding().cloned().unwrap_or(Sharding::Replicated))
        .collect();
    let name = format!("{}.combined", comp[round[0]].name());
    let metadata = comp[round[0]].metadata().cloned();
    let new = comp.add_instruction(
        NewInstruction::new(Opcode::Custom(op), Shape::tuple(shapes), operands)
            .named(name)
            .with_sharding(Some(Sharding::Tuple(shardings.clone())))
            .with_metadata(metadata),
    )?;

    for (index, (&old, sharding)) in round.iter().zip(shardings).enumerate() {
        let element = comp.add_get_tuple_element(new, index)?;
        comp.set_sharding(element, Some(sharding))?;
        comp.copy_control_dependencies(old, new)?;
        comp.drop_all_control_dependencies(old)?;
        comp.replace_all_uses_with(old, element)?;
        comp.remove_instruction(old)?;
    }
    Ok(new)
}

/// Orders each combined load after the most recent combined store it can follow, so
/// the state a previous load brought in is consumed before the next one arrives.
///
/// Does nothing unless there are as many loads as stores. Never fails on ordering that
/// cannot be added; it only skips it.
pub fn add_scheduling_constraints(
    comp: &mut Computation,
    loads: &[InstId],
    stores: &[InstId],
) -> Result<(), CompileError> {
    if loads.len() != stores.len() {
        trace!(
            loads = loads.len(),
            stores = stores.len(),
            "load and store counts differ, no scheduling constraints"
        );
        return Ok(());
    }
    let mut reachability = ReachabilityMap::build(comp);
    for i in 1..loads.len() {
        let load = loads[i];
        for delay in 1..=i {
            let prev_load = loads[i - delay];
            let prev_store = stores[i - delay];
            if reachability.is_reachable(load, prev_store) {
                continue;
            }
            trace!(
                store = %comp[prev_store].name(),
                load = %comp[load].name(),
                "ordering store before load"
            );
            comp.add_control_dependency(prev_store, load)?;
            reachability.add_control_edge(prev_store, load);

            let mut scheduled_users = BTreeSet::new();
            schedule_all_users_before(
                comp,
                &mut reachability,
                &mut scheduled_users,
                prev_load,
                load,
            )?;
            let mut scheduled_inputs = BTreeSet::new();
            for &user in &scheduled_users {
                schedule_all_inputs_after(
                    comp,
                    &mut reachability,
                    &mut scheduled_inputs,
                    user,
                    prev_load,
                )?;
            }
            break;
        }
    }
    Ok(())
}

/// Every transitive user of `inst` runs before `load`, where that keeps the graph acyclic.
/// `scheduled` collects the users that were visited.
fn schedule_all_users_before(
    comp: &mut Computation,
    reachability: &mut ReachabilityMap,
    scheduled: &mut BTreeSet<InstId>,
    inst: InstId,
    load: InstId,
) -> Result<(), CompileError> {
    let users = comp[inst].users().to_vec();
    for user in users {
        if user == load || reachability.is_reachable(load, user) {
            continue;
        }
        if !scheduled.insert(user) {
            continue;
        }
        if !reachability.is_reachable(user, load) {
            comp.add_control_dependency(user, load)?;
            reachability.add_control_edge(user, load);
        }
        schedule_all_users_before(comp, reachability, scheduled, user, load)?;
    }
    Ok(())
}

/// Every transitive non-parameter input of `inst` runs after `prev_load`, unless it
/// already has to run before it.
fn schedule_all_inputs_after(
    comp: &mut Computation,
    reachability: &mut ReachabilityMap,
    scheduled: &mut BTreeSet<InstId>,
    inst: InstId,
    prev_load: InstId,
) -> Result<(), CompileError> {
    let mut operands = comp[inst].operands().to_vec();
    for operand in operands {
        if comp[operand].opcode().is_parameter() || reachability.is_reachable(operand, prev_load)
        {
            continue;
        }
        if !scheduled.insert(operand) {
            continue;
        }
        if !reachability.is_reachable(prev_load, operand) {
            comp.add_control_dependency(prev_load, operand)?;
            reachability.add_control_edge(prev_load, operand);
        }
        schedule_all_inputs_after(comp, reachability, scheduled, operand, prev_load)?;
    }
    Ok(())
}

fn resource_update_bodies(module: &Module) -> Vec<CompId> {
    let fusion_bodies = fusion_computations(module);
    let mut out = BTreeSet::new();
    for comp_id in module.computations_post_order() {
        if fusion_bodies.contains(&comp_id) {
            continue;
        }
        for inst in module[comp_id].instructions() {
            if inst.backend_config().call_type() != Some(CallType::ResourceUpdate) {
                continue;
            }
            if let Some(callee) = inst.opcode().called_computation() {
                out.insert(callee);
            }
        }
    }
    out.into_iter().collect()
}

impl ModulePass for RemoteParameterParallelCombiner {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let mut changed = false;
        for comp in resource_update_bodies(module) {
            changed |= self.run_on_computation(&mut module[comp])?;
        }
        Ok(changed)
    }
}
