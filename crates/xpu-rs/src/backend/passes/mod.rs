//! Module passes of the compile pipeline.

mod dce;
mod elementwise_clustering;
mod gradient_accumulation_fuser;
mod host_compute_barrier;
mod multi_update_combiner;
mod outline_remote_buffers;
mod parallel_combiner;
pub mod replication;
mod single_op_fusion;
mod variables_offload;

pub use dce::DeadCodeElimination;
pub use elementwise_clustering::{
    outline_cluster, ClusteringConfig, OutlinedClusters, ResourceUpdateElementwiseClustering,
};
pub use gradient_accumulation_fuser::GradientAccumulationFuser;
pub use host_compute_barrier::HostComputeBarrierInserter;
pub use multi_update_combiner::MultiUpdateCombiner;
pub use outline_remote_buffers::{
    IsomorphicFunctions, OutlineRemoteBuffers, RemoteBufferInputsOutputsInfos,
};
pub use parallel_combiner::{add_scheduling_constraints, RemoteParameterParallelCombiner};
pub use single_op_fusion::SingleOpFusion;
pub use variables_offload::{fix_root_instruction, OffloadConfig, ResourceUpdateVariablesOffload};

pub use crate::backend::pipeline::ModulePass;
