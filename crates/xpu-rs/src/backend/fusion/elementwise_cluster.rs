//! Connected regions of elementwise instructions and the shard layout they take when
//! their tensors are split across replicas.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::{debug, trace};

use crate::backend::backend_config::{CallType, ThreeState};
use crate::backend::computation::Computation;
use crate::backend::module::Module;
use crate::backend::passes::replication::{gathered_remote_load, shard_size};
use crate::backend::reachability::ReachabilityMap;
use crate::backend::spec::{CompId, DType, InstId, Instruction, Opcode, Shape};

/// Inputs that hold the same value on every replica, so any replica may slice them.
pub type CrossReplicaValidInputs = HashSet<InstId>;

/// An external user of a cluster output and the operand slots it reads it through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPositions {
    pub instruction: InstId,
    pub indices: Vec<usize>,
}

fn is_clusterable_leaf(comp: &Computation, inst: &Instruction) -> bool {
    match inst.opcode() {
        op if op.is_elementwise() => true,
        Opcode::Constant { .. } => inst.shape().is_scalar(),
        Opcode::Broadcast { .. } => comp[inst.operand(0)].shape().is_scalar(),
        _ => false,
    }
}

/// Whether `inst` may join an elementwise cluster.
pub fn is_elementwise_clusterable(
    comp: &Computation,
    inst: &Instruction,
    elementwise_comps: &HashSet<CompId>,
) -> bool {
    match inst.opcode() {
        Opcode::Call { computation } | Opcode::Fusion { computation } => {
            elementwise_comps.contains(computation)
                && inst
                    .backend_config()
                    .call_type()
                    .map_or(true, |kind| kind == CallType::Function)
        }
        _ => is_clusterable_leaf(comp, inst),
    }
}

/// Computations (other than the entry) made only of parameters and clusterable
/// instructions, producing one array whose dimensions every non-scalar value shares.
pub fn get_elementwise_clusterable_computations(module: &Module) -> HashSet<CompId> {
    let mut out = HashSet::new();
    for id in module.computation_ids() {
        if id == module.entry() {
            continue;
        }
        let comp = &module[id];
        let root_shape = comp[comp.root()].shape();
        if !root_shape.is_array() || root_shape.is_scalar() {
            continue;
        }
        let dims = root_shape.dims();
        let clusterable = comp.instructions().all(|inst| {
            let shape_ok = inst.shape().is_scalar()
                || (inst.shape().is_array() && inst.shape().dims() == dims);
            shape_ok && (inst.opcode().is_parameter() || is_clusterable_leaf(comp, inst))
        });
        if clusterable {
            out.insert(id);
        }
    }
    out
}

/// Scalars, constants, all-reduce results, gathered remote loads and broadcast scalars.
pub fn cross_replica_valid_inputs(comp: &Computation) -> CrossReplicaValidInputs {
    let mut out = CrossReplicaValidInputs::new();
    for inst in comp.instructions() {
        let valid = inst.shape().is_scalar()
            || match inst.opcode() {
                Opcode::Constant { .. } | Opcode::AllReduce => true,
                Opcode::Broadcast { .. } => comp[inst.operand(0)].shape().is_scalar(),
                Opcode::Reshape => gathered_remote_load(comp, inst.id()).is_some(),
                _ => false,
            };
        if valid {
            out.insert(inst.id());
        }
    }
    out
}

/// Read-only view of the computation a cluster is grown in.
pub struct ClusterScope<'a> {
    comp: &'a Computation,
    elementwise_comps: &'a HashSet<CompId>,
    reachability: ReachabilityMap,
}

impl<'a> ClusterScope<'a> {
    pub fn new(comp: &'a Computation, elementwise_comps: &'a HashSet<CompId>) -> Self {
        Self {
            comp,
            elementwise_comps,
            reachability: ReachabilityMap::build(comp),
        }
    }

    pub fn computation(&self) -> &'a Computation {
        self.comp
    }

    /// A region is outlinable when no member reaches one of its inputs, otherwise the
    /// call would depend on its own result.
    fn is_convex(&self, insts: &BTreeSet<InstId>, inputs: &BTreeSet<InstId>) -> bool {
        inputs.iter().all(|&input| {
            insts
                .iter()
                .all(|&member| !self.reachability.is_reachable(member, input))
        })
    }
}

#[derive(Debug, Clone)]
struct Finalized {
    is_replica_partitioned: bool,
    inputs: Vec<InstId>,
    post_order: Vec<InstId>,
    outputs: Vec<InstId>,
    users_for_output: BTreeMap<InstId, Vec<UserPositions>>,
    cluster_dimensions: Vec<usize>,
    shard_dimensions: Vec<usize>,
    cluster_size: usize,
    aligned_cluster_size: usize,
    shard_size: usize,
}

/// What [`ElementwiseCluster::finalize`] needs to decide on partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRequest {
    pub partition_offloaded_variables: ThreeState,
    pub replication_factor: usize,
    /// Clusters with fewer aligned elements than this stay replicated.
    pub minimum_cluster_size: usize,
}

#[derive(Debug, Clone)]
pub struct ElementwiseCluster {
    top: InstId,
    cluster_shape: Shape,
    insts: BTreeSet<InstId>,
    inputs: BTreeSet<InstId>,
    finalized: Option<Finalized>,
}

impl ElementwiseCluster {
    pub fn new(comp: &Computation, top: InstId) -> Self {
        Self {
            top,
            cluster_shape: comp[top].shape().clone(),
            insts: BTreeSet::from([top]),
            inputs: comp[top].operands().iter().copied().collect(),
            finalized: None,
        }
    }

    pub fn contains(&self, id: InstId) -> bool {
        self.insts.contains(&id)
    }

    pub fn any_user_in(&self, comp: &Computation, id: InstId) -> bool {
        comp[id].users().iter().any(|u| self.contains(*u))
    }

    pub fn all_users_in(&self, comp: &Computation, id: InstId) -> bool {
        comp[id].users().iter().all(|u| self.contains(*u))
    }

    pub fn add(&mut self, comp: &Computation, id: InstId) {
        self.inputs.remove(&id);
        self.insts.insert(id);
        for &operand in comp[id].operands() {
            if !self.contains(operand) {
                self.inputs.insert(operand);
            }
        }
    }

    fn has_cluster_dims(&self, shape: &Shape) -> bool {
        shape.is_scalar() || (shape.is_array() && shape.dims() == self.cluster_shape.dims())
    }

    /// Absorbs `id` if it is clusterable, every user of it is already a member and the
    /// grown region stays outlinable.
    pub fn maybe_add(&mut self, scope: &ClusterScope<'_>, id: InstId) -> bool {
        let comp = scope.comp;
        let inst = &comp[id];
        if !is_elementwise_clusterable(comp, inst, scope.elementwise_comps)
            || !self.has_cluster_dims(inst.shape())
            || !self.all_users_in(comp, id)
        {
            return false;
        }
        let mut grown = self.clone();
        grown.add(comp, id);
        if !scope.is_convex(&grown.insts, &grown.inputs) {
            return false;
        }
        *self = grown;
        true
    }

    /// Clusters merge when one consumes a member of the other and the union stays outlinable.
    pub fn can_merge(&self, scope: &ClusterScope<'_>, other: &ElementwiseCluster) -> bool {
        if self.cluster_shape.dims() != other.cluster_shape.dims() {
            return false;
        }
        let connected = self.inputs.iter().any(|i| other.contains(*i))
            || other.inputs.iter().any(|i| self.contains(*i));
        if !connected {
            return false;
        }
        let mut merged = self.clone();
        merged.merge(scope.comp, other);
        scope.is_convex(&merged.insts, &merged.inputs)
    }

    pub fn merge(&mut self, comp: &Computation, other: &ElementwiseCluster) {
        for &id in &other.insts {
            self.add(comp, id);
        }
        self.finalized = None;
    }

    pub fn top(&self) -> InstId {
        self.top
    }

    pub fn instructions(&self) -> impl Iterator<Item = InstId> + '_ {
        self.insts.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// Freezes the cluster and computes its boundary and shard layout. Returns whether
    /// the cluster is worth processing at all.
    pub fn finalize(
        &mut self,
        comp: &Computation,
        valid_inputs: &CrossReplicaValidInputs,
        request: PartitionRequest,
    ) -> bool {
        self.finalized = None;
        if self
            .insts
            .iter()
            .any(|&id| !self.has_cluster_dims(comp[id].shape()))
        {
            trace!(top = %comp[self.top].name(), "cluster mixes dimensions");
            return false;
        }
        let has_compute = self.insts.iter().any(|&id| {
            let op = comp[id].opcode();
            op.is_elementwise() || op.called_computation().is_some()
        });
        if !has_compute {
            return false;
        }
        if self
            .inputs
            .iter()
            .any(|&id| !self.has_cluster_dims(comp[id].shape()))
        {
            trace!(top = %comp[self.top].name(), "cluster input has foreign dimensions");
            return false;
        }

        let post_order: Vec<InstId> = comp
            .post_order()
            .into_iter()
            .filter(|id| self.contains(*id))
            .collect();
        let mut outputs = Vec::new();
        let mut users_for_output = BTreeMap::new();
        for &id in &post_order {
            let external: Vec<UserPositions> = comp[id]
                .users()
                .iter()
                .filter(|u| !self.contains(**u))
                .map(|&user| UserPositions {
                    instruction: user,
                    indices: comp[user].operand_indices(id).to_vec(),
                })
                .collect();
            if external.is_empty() && !comp.is_root(id) {
                continue;
            }
            if comp[id].shape().is_scalar() {
                return false;
            }
            outputs.push(id);
            users_for_output.insert(id, external);
        }

        let replication_factor = request.replication_factor.max(1);
        let cluster_dimensions = self.cluster_shape.dims().to_vec();
        let cluster_size = self.cluster_shape.element_count();
        let boundary_dtypes: BTreeSet<DType> = self
            .inputs
            .iter()
            .chain(outputs.iter())
            .filter(|id| !comp[**id].shape().is_scalar())
            .filter_map(|id| comp[*id].shape().dtype())
            .collect();
        let shard_sizes: BTreeSet<usize> = boundary_dtypes
            .iter()
            .map(|&dtype| shard_size(cluster_size, dtype, replication_factor))
            .collect();
        let shard = shard_sizes
            .iter()
            .copied()
            .max()
            .unwrap_or_else(|| cluster_size.div_ceil(replication_factor));
        let aligned_cluster_size = shard * replication_factor;

        let inputs: Vec<InstId> = self.inputs.iter().copied().collect();
        let all_inputs_valid = inputs.iter().all(|id| valid_inputs.contains(id));
        let is_replica_partitioned = if request.partition_offloaded_variables == ThreeState::Off
            || replication_factor <= 1
        {
            false
        } else if !all_inputs_valid {
            debug!(top = %comp[self.top].name(), "cluster has inputs that differ between replicas");
            false
        } else if shard_sizes.len() > 1 {
            debug!(top = %comp[self.top].name(), "cluster element types disagree on the shard size");
            false
        } else if aligned_cluster_size < request.minimum_cluster_size {
            debug!(
                top = %comp[self.top].name(),
                aligned_cluster_size,
                minimum = request.minimum_cluster_size,
                "cluster too small to partition"
            );
            false
        } else {
            true
        };

        self.finalized = Some(Finalized {
            is_replica_partitioned,
            inputs,
            post_order,
            outputs,
            users_for_output,
            shard_dimensions: if is_replica_partitioned {
                vec![shard]
            } else {
                cluster_dimensions.clone()
            },
            cluster_dimensions,
            cluster_size,
            aligned_cluster_size,
            shard_size: shard,
        });
        true
    }

    fn finalized(&self) -> Option<&Finalized> {
        self.finalized.as_ref()
    }

    pub fn inputs(&self) -> &[InstId] {
        self.finalized().map_or(&[], |f| &f.inputs)
    }

    pub fn post_order(&self) -> &[InstId] {
        self.finalized().map_or(&[], |f| &f.post_order)
    }

    pub fn outputs(&self) -> &[InstId] {
        self.finalized().map_or(&[], |f| &f.outputs)
    }

    pub fn users_for_output(&self, id: InstId) -> &[UserPositions] {
        self.finalized()
            .and_then(|f| f.users_for_output.get(&id))
            .map_or(&[], Vec::as_slice)
    }

    /// Dimensions of the cluster's values before partitioning.
    pub fn cluster_dimensions(&self) -> &[usize] {
        self.finalized().map_or(&[], |f| &f.cluster_dimensions)
    }

    /// Dimensions each replica works on.
    pub fn shard_dimensions(&self) -> &[usize] {
        self.finalized().map_or(&[], |f| &f.shard_dimensions)
    }

    pub fn cluster_size(&self) -> usize {
        self.finalized().map_or(0, |f| f.cluster_size)
    }

    /// Cluster size including the padding the all-gathers add.
    pub fn aligned_cluster_size(&self) -> usize {
        self.finalized().map_or(0, |f| f.aligned_cluster_size)
    }

    pub fn shard_size(&self) -> usize {
        self.finalized().map_or(0, |f| f.shard_size)
    }

    pub fn is_replica_partitioned(&self) -> bool {
        self.finalized().is_some_and(|f| f.is_replica_partitioned)
    }

    pub fn cluster_shape(&self, dtype: DType) -> Shape {
        self.cluster_shape.with_dtype(dtype)
    }

    pub fn dump(&self, comp: &Computation) -> String {
        let names: Vec<&str> = self.insts.iter().map(|id| comp[*id].name()).collect();
        format!("cluster {} [{}]", comp[self.top].name(), names.join(", "))
    }
}

/// Grows clusters from the bottom of `comp` upwards, merges the connected ones and
/// returns those that finalize.
pub fn get_clusters_in(
    comp: &Computation,
    elementwise_comps: &HashSet<CompId>,
    request: PartitionRequest,
) -> Vec<ElementwiseCluster> {
    let scope = ClusterScope::new(comp, elementwise_comps);
    let mut claimed: HashSet<InstId> = HashSet::new();
    let mut clusters: Vec<ElementwiseCluster> = Vec::new();

    for id in comp.post_order().into_iter().rev() {
        let inst = &comp[id];
        if claimed.contains(&id)
            || !inst.shape().is_array()
            || inst.shape().is_scalar()
            || !is_elementwise_clusterable(comp, inst, elementwise_comps)
        {
            continue;
        }
        let mut cluster = ElementwiseCluster::new(comp, id);
        let mut frontier: Vec<InstId> = inst.operands().to_vec();
        while let Some(candidate) = frontier.pop() {
            if claimed.contains(&candidate) || cluster.contains(candidate) {
                continue;
            }
            if cluster.maybe_add(&scope, candidate) {
                frontier.extend(comp[candidate].operands().iter().copied());
            }
        }

        while let Some(index) = clusters
            .iter()
            .position(|existing| existing.can_merge(&scope, &cluster))
        {
            let mut existing = clusters.remove(index);
            existing.merge(comp, &cluster);
            cluster = existing;
        }
        claimed.extend(cluster.instructions());
        clusters.push(cluster);
    }

    let valid_inputs = cross_replica_valid_inputs(comp);
    clusters
        .into_iter()
        .filter_map(|mut cluster| {
            if cluster.finalize(comp, &valid_inputs, request) {
                trace!(cluster = %cluster.dump(comp), "finalized cluster");
                Some(cluster)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{BinaryOp, UnaryOp};

    fn request(replication_factor: usize) -> PartitionRequest {
        PartitionRequest {
            partition_offloaded_variables: ThreeState::Undefined,
            replication_factor,
            minimum_cluster_size: 0,
        }
    }

    #[test]
    fn grows_through_single_user_operands() {
        let shape = Shape::array(DType::F32, vec![8]);
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, shape.clone(), "a").unwrap();
        let b = comp.add_parameter(1, shape.clone(), "b").unwrap();
        let neg = comp.add_unary(UnaryOp::Negate, a).unwrap();
        let sum = comp.add_binary(BinaryOp::Add, neg, b).unwrap();
        let root = comp.add_tuple(vec![sum]).unwrap();
        comp.set_root(root).unwrap();

        let clusters = get_clusters_in(&comp, &HashSet::new(), request(1));
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.top(), sum);
        assert_eq!(cluster.post_order(), &[neg, sum]);
        assert_eq!(cluster.inputs(), &[a, b]);
        assert_eq!(cluster.outputs(), &[sum]);
        assert!(!cluster.is_replica_partitioned());
    }

    #[test]
    fn shared_operand_merges_clusters() {
        let shape = Shape::array(DType::F32, vec![8]);
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, shape.clone(), "a").unwrap();
        let shared = comp.add_unary(UnaryOp::Exp, a).unwrap();
        let x = comp.add_unary(UnaryOp::Negate, shared).unwrap();
        let y = comp.add_unary(UnaryOp::Abs, shared).unwrap();
        let root = comp.add_tuple(vec![x, y]).unwrap();
        comp.set_root(root).unwrap();

        let clusters = get_clusters_in(&comp, &HashSet::new(), request(1));
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 3);
        assert_eq!(clusters[0].outputs(), &[x, y]);
    }

    #[test]
    fn non_convex_merge_is_refused() {
        let shape = Shape::array(DType::F32, vec![8]);
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, shape.clone(), "a").unwrap();
        let first = comp.add_unary(UnaryOp::Exp, a).unwrap();
        // the reshape leaves the cluster and comes back
        let outside = comp.add_reshape(first, shape.clone()).unwrap();
        let second = comp.add_binary(BinaryOp::Add, first, outside).unwrap();
        let root = comp.add_tuple(vec![second]).unwrap();
        comp.set_root(root).unwrap();

        let clusters = get_clusters_in(&comp, &HashSet::new(), request(1));
        assert!(clusters.iter().all(|c| !(c.contains(first) && c.contains(second))));
    }

    #[test]
    fn partitions_when_inputs_are_replica_invariant() {
        let shape = Shape::array(DType::F32, vec![10]);
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, shape.clone(), "a").unwrap();
        let reduced = comp
            .add_instruction(crate::backend::spec::NewInstruction::new(
                Opcode::AllReduce,
                shape.clone(),
                vec![a],
            ))
            .unwrap();
        let scaled = comp.add_binary(BinaryOp::Multiply, reduced, reduced).unwrap();
        let root = comp.add_tuple(vec![scaled]).unwrap();
        comp.set_root(root).unwrap();

        let clusters = get_clusters_in(&comp, &HashSet::new(), request(4));
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert!(cluster.is_replica_partitioned());
        assert_eq!(cluster.shard_size(), 3);
        assert_eq!(cluster.aligned_cluster_size(), 12);
        assert_eq!(cluster.shard_dimensions(), &[3]);
        assert_eq!(cluster.cluster_dimensions(), &[10]);
    }
}
