use std::collections::{HashMap, HashSet};

use tracing::{debug, debug_span};

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::backend_config::{BackendConfig, CallType, FunctionConfig, ThreeState};
use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::fusion::{
    get_clusters_in, get_elementwise_clusterable_computations, ElementwiseCluster,
    PartitionRequest,
};
use crate::backend::matcher::fusion_computations;
use crate::backend::module::Module;
use crate::backend::passes::replication::{
    flatten_and_pad, gather_shards, gathered_remote_load, replicated_store_of,
    shard_partitioned_value,
};
use crate::backend::pipeline::ModulePass;
use crate::backend::spec::{CompId, CustomOp, InstId, NewInstruction, Opcode, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusteringConfig {
    pub replication_factor: usize,
    /// Outline clusters that cannot be partitioned as plain replicated calls.
    pub handle_non_replicated_clusters: bool,
    /// Minimum aligned element count of a partitioned cluster.
    pub minimum_cluster_size: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            handle_non_replicated_clusters: false,
            minimum_cluster_size: 0,
        }
    }
}

/// Outlines elementwise clusters of every resource update into calls, splitting the
/// work across replicas where the cluster allows it.
#[derive(Debug, Clone, Default)]
pub struct ResourceUpdateElementwiseClustering {
    config: ClusteringConfig,
}

/// Outlined bodies by structural key, so identical clusters share one computation.
pub type OutlinedClusters = HashMap<String, CompId>;

impl ResourceUpdateElementwiseClustering {
    const NAME: &'static str = "resource-update-elementwise-clustering";

    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    fn scopes(module: &Module) -> Result<Vec<(CompId, ThreeState)>, CompileError> {
        let fusion_bodies = fusion_computations(module);
        let mut scopes = Vec::new();
        for comp_id in module.computations_post_order() {
            if fusion_bodies.contains(&comp_id) {
                continue;
            }
            let comp = &module[comp_id];
            for inst in comp.instructions() {
                if !matches!(
                    inst.backend_config().call_type(),
                    Some(CallType::RepeatLoop | CallType::Pipeline)
                ) {
                    continue;
                }
                let Some(body) = inst.opcode().called_computation() else {
                    continue;
                };
                for update in module[body].instructions() {
                    if update.backend_config().call_type() != Some(CallType::ResourceUpdate) {
                        continue;
                    }
                    let callee = update.opcode().called_computation().ok_or_else(|| {
                        CompileError::structural(format!(
                            "resource update {} calls no computation",
                            update.name()
                        ))
                    })?;
                    let partition = update
                        .backend_config()
                        .resource_update_config()
                        .partition_offloaded_variables;
                    scopes.push((callee, partition));
                }
            }
        }
        Ok(scopes)
    }
}

impl ModulePass for ResourceUpdateElementwiseClustering {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let _span = debug_span!("elementwise_clustering").entered();
        let elementwise_comps = get_elementwise_clusterable_computations(module);
        let mut outlined = OutlinedClusters::new();
        let mut changed = false;
        for (scope, partition) in Self::scopes(module)? {
            let request = PartitionRequest {
                partition_offloaded_variables: partition,
                replication_factor: self.config.replication_factor,
                minimum_cluster_size: self.config.minimum_cluster_size,
            };
            // Outlining one cluster invalidates the boundaries of the others.
            loop {
                let clusters = get_clusters_in(&module[scope], &elementwise_comps, request);
                let Some(cluster) = clusters.into_iter().find(|c| {
                    c.is_replica_partitioned() || self.config.handle_non_replicated_clusters
                }) else {
                    break;
                };
                let replication_factor = if cluster.is_replica_partitioned() {
                    self.config.replication_factor
                } else {
                    1
                };
                outline_cluster(module, scope, &cluster, replication_factor, &mut outlined)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

fn flat_shape(shape: &Shape, shard: usize) -> Shape {
    match shape.dtype() {
        Some(dtype) if shape.is_array() && !shape.is_scalar() => Shape::array(dtype, vec![shard]),
        _ => shape.clone(),
    }
}

/// `callee` with every non-scalar value reshaped to `[shard]`.
fn flatten_computation(callee: &Computation, shard: usize) -> Result<Computation, CompileError> {
    let mut flat = Computation::new(format!("{}.flat", callee.name()));
    let mut mapping: HashMap<InstId, InstId> = HashMap::new();
    for id in callee.post_order() {
        let inst = &callee[id];
        let operands = inst
            .operands()
            .iter()
            .map(|op| mapping.get(op).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| CompileError::structural(format!("{} lost an operand", inst.name())))?;
        let new = flat.add_instruction(
            NewInstruction::new(inst.opcode().clone(), flat_shape(inst.shape(), shard), operands)
                .named(inst.name()),
        )?;
        mapping.insert(id, new);
    }
    let root = mapping
        .get(&callee.root())
        .copied()
        .ok_or_else(|| CompileError::structural("flattened computation lost its root"))?;
    flat.set_root(root)?;
    Ok(flat)
}

fn cluster_body(
    module: &mut Module,
    scope: CompId,
    cluster: &ElementwiseCluster,
    partitioned: bool,
) -> Result<Computation, CompileError> {
    let shard = cluster.shard_size();
    let reshape = |shape: &Shape| {
        if partitioned {
            flat_shape(shape, shard)
        } else {
            shape.clone()
        }
    };

    let mut flattened_callees: HashMap<CompId, CompId> = HashMap::new();
    if partitioned {
        for &id in cluster.post_order() {
            if let Some(callee) = module[scope][id].opcode().called_computation() {
                if flattened_callees.contains_key(&callee) {
                    continue;
                }
                let flat = flatten_computation(&module[callee], shard)?;
                flattened_callees.insert(callee, module.add_computation(flat));
            }
        }
    }

    let comp = &module[scope];
    let mut body = Computation::new(format!("{}.cluster", comp[cluster.top()].name()));
    let mut mapping: HashMap<InstId, InstId> = HashMap::new();
    for (number, &input) in cluster.inputs().iter().enumerate() {
        let param = body.add_parameter(
            number,
            reshape(comp[input].shape()),
            &format!("arg_{number}"),
        )?;
        mapping.insert(input, param);
    }
    for &id in cluster.post_order() {
        let inst = &comp[id];
        let operands = inst
            .operands()
            .iter()
            .map(|op| mapping.get(op).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                CompileError::structural(format!("{} reads outside its cluster", inst.name()))
            })?;
        let flattened = |callee: &CompId| {
            flattened_callees.get(callee).copied().ok_or_else(|| {
                CompileError::structural(format!("{} calls an unflattened computation", inst.name()))
            })
        };
        let opcode = match inst.opcode() {
            Opcode::Call { computation } if partitioned => Opcode::Call {
                computation: flattened(computation)?,
            },
            Opcode::Fusion { computation } if partitioned => Opcode::Fusion {
                computation: flattened(computation)?,
            },
            other => other.clone(),
        };
        let new = body.add_instruction(
            NewInstruction::new(opcode, reshape(inst.shape()), operands)
                .named(inst.name())
                .with_backend_config(inst.backend_config().clone())
                .with_metadata(inst.metadata().cloned()),
        )?;
        mapping.insert(id, new);
    }
    let outputs = cluster
        .outputs()
        .iter()
        .map(|id| mapping.get(id).copied())
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CompileError::structural("cluster output was not outlined"))?;
    let root = body.add_tuple(outputs)?;
    body.set_root(root)?;
    Ok(body)
}

/// The value each replica feeds the partitioned call for `input`.
fn partitioned_operand(
    comp: &mut Computation,
    input: InstId,
    replication_factor: usize,
) -> Result<InstId, CompileError> {
    if comp[input].shape().is_scalar() {
        return Ok(input);
    }
    if let Some(load) = gathered_remote_load(comp, input) {
        return Ok(load);
    }
    if matches!(comp[input].opcode(), Opcode::AllReduce) {
        let reduced = comp[input].operand(0);
        let padded = flatten_and_pad(comp, reduced, replication_factor)?;
        let shape = comp[padded].shape();
        let dtype = shape
            .dtype()
            .ok_or_else(|| CompileError::structural("all-reduce of a tuple cannot be scattered"))?;
        let shard = shape.element_count() / replication_factor;
        return Ok(comp.add_custom(
            CustomOp::ReduceScatter {
                replica_group_size: replication_factor,
            },
            vec![padded],
            Shape::array(dtype, vec![shard]),
        )?);
    }
    shard_partitioned_value(comp, input, replication_factor)
}

/// Replaces `cluster` with a call to an outlined computation and returns the call.
///
/// A partitioned cluster runs on `[shard]` pieces: its outputs go straight into the
/// replicated stores that consumed them and are gathered back for every other user.
pub fn outline_cluster(
    module: &mut Module,
    scope: CompId,
    cluster: &ElementwiseCluster,
    replication_factor: usize,
    outlined: &mut OutlinedClusters,
) -> Result<InstId, CompileError> {
    let partitioned = cluster.is_replica_partitioned() && replication_factor > 1;
    let body = cluster_body(module, scope, cluster, partitioned)?;
    let call_shape = body[body.root()].shape().clone();
    let key = body.structural_key();
    let callee = match outlined.get(&key) {
        Some(&existing) => {
            debug!(computation = %module[existing].name(), "reusing outlined cluster");
            existing
        }
        None => {
            let id = module.add_computation(body);
            outlined.insert(key, id);
            id
        }
    };

    let comp = &mut module[scope];
    let mut operands = Vec::with_capacity(cluster.inputs().len());
    for &input in cluster.inputs() {
        operands.push(if partitioned {
            partitioned_operand(comp, input, replication_factor)?
        } else {
            input
        });
    }
    let name = format!("{}.cluster", comp[cluster.top()].name());
    let call = comp.add_instruction(
        NewInstruction::new(Opcode::Call { computation: callee }, call_shape, operands)
            .named(name)
            .with_backend_config(BackendConfig::function(FunctionConfig {
                partitioned_elementwise_cluster: partitioned,
                ..FunctionConfig::default()
            })),
    )?;

    for (index, &output) in cluster.outputs().iter().enumerate() {
        let element = comp.add_get_tuple_element(call, index)?;
        let full_shape = comp[output].shape().clone();
        let mut gathered = None;
        for user in cluster.users_for_output(output) {
            if !comp.contains(user.instruction) {
                continue;
            }
            if partitioned {
                if let Some(store) = replicated_store_of(comp, user.instruction) {
                    let old_value = comp[store].operand(1);
                    if comp[old_value].shape() == comp[element].shape() {
                        comp.replace_operand_with(store, 1, element)?;
                        comp.remove_instruction_and_unused_operands(old_value)?;
                        continue;
                    }
                }
            }
            let value = if partitioned {
                match gathered {
                    Some(value) => value,
                    None => {
                        let value = gather_shards(comp, element, &full_shape, replication_factor)?;
                        gathered = Some(value);
                        value
                    }
                }
            } else {
                element
            };
            for &position in &user.indices {
                comp.replace_operand_with(user.instruction, position, value)?;
            }
        }
        if comp.is_root(output) {
            let value = match gathered {
                Some(value) => value,
                None if partitioned => {
                    gather_shards(comp, element, &full_shape, replication_factor)?
                }
                None => element,
            };
            comp.set_root(value)?;
        }
    }

    let members: HashSet<InstId> = cluster.post_order().iter().copied().collect();
    for &member in cluster.post_order() {
        if comp.contains(member) && comp[member].has_control_dependencies() {
            comp.copy_control_dependencies(member, call)?;
            comp.drop_all_control_dependencies(member)?;
        }
    }
    for &member in cluster.post_order().iter().rev() {
        if !comp.contains(member) {
            continue;
        }
        let dangling: Vec<InstId> = comp[member]
            .users()
            .iter()
            .copied()
            .filter(|u| !members.contains(u))
            .collect();
        if !dangling.is_empty() {
            return Err(CompileError::structural(format!(
                "cluster member {} still has {} users outside the cluster",
                comp[member].name(),
                dangling.len()
            )));
        }
        comp.remove_instruction(member)?;
    }
    debug!(
        call = %comp[call].name(),
        partitioned,
        outputs = cluster.outputs().len(),
        "outlined elementwise cluster"
    );
    Ok(call)
}
