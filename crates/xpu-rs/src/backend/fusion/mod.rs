mod elementwise_cluster;
mod registry;

pub use elementwise_cluster::{
    cross_replica_valid_inputs, get_clusters_in, get_elementwise_clusterable_computations,
    is_elementwise_clusterable, ClusterScope, CrossReplicaValidInputs, ElementwiseCluster,
    PartitionRequest, UserPositions,
};
pub use registry::FusionRegistry;
