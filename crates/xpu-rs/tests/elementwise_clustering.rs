use xpu_rs::backend::backend_config::ThreeState;
use xpu_rs::backend::computation::Computation;
use xpu_rs::backend::fusion::{get_clusters_in, PartitionRequest};
use xpu_rs::backend::passes::{ClusteringConfig, ModulePass, ResourceUpdateElementwiseClustering};
use xpu_rs::backend::spec::{CompId, CustomOp, InstId, Opcode};
use xpu_rs::{hlo_module, CompilerAnnotations, Module};

/// Wraps a resource update body in a repeat loop driven by the entry computation.
/// The update takes `(f32[64], f32[64], f32[])` and returns a tuple of `root_shape`.
fn in_training_loop(update_body: &str, root_shape: &str, update_config: &str) -> String {
    format!(
        r#"
HloModule clustering

%resource_update {{
{update_body}
}}

%loop {{
  %p0 = f32[64] parameter(0)
  %p1 = f32[64] parameter(1)
  %p2 = f32[] parameter(2)
  ROOT %ru = {root_shape} call(%p0, %p1, %p2), to_apply=%resource_update, backend_config={update_config}
}}

ENTRY %main {{
  %e0 = f32[64] parameter(0)
  %e1 = f32[64] parameter(1)
  %e2 = f32[] parameter(2)
  ROOT %call = {root_shape} call(%e0, %e1, %e2), to_apply=%loop, backend_config={{"callConfig":{{"type":"RepeatLoop"}}}}
}}
"#
    )
}

const RESOURCE_UPDATE: &str = r#"{"callConfig":{"type":"ResourceUpdate"}}"#;
const NOT_PARTITIONED: &str = r#"{"callConfig":{"type":"ResourceUpdate","resourceUpdateConfig":{"partitionOffloadedVariables":"THREESTATE_OFF"}}}"#;

/// SGD step on a replica-partitioned remote variable, as left by variable offloading.
const SGD_STEP: &str = r#"
  %grad_in = f32[64] parameter(0)
  %var = f32[64] parameter(1)
  %lr = f32[] parameter(2)
  %load = f32[32] remote-parameter-load(%var), replication_factors={2}
  %gathered = f32[2,32] all-gather(%load), replica_group_size=2
  %full = f32[64] reshape(%gathered)
  %grad = f32[64] all-reduce(%grad_in)
  %blr = f32[64] broadcast(%lr), dimensions={}
  %scaled = f32[64] multiply(%grad, %blr)
  %new = f32[64] subtract(%full, %scaled)
  %rows = f32[2,32] reshape(%new)
  %replica = s32[] replication-index()
  %zero = s32[] constant(0)
  %row = f32[1,32] dynamic-slice(%rows, %replica, %zero), dynamic_slice_sizes={1,32}
  %shard = f32[32] reshape(%row)
  %store = f32[64] remote-parameter-store(%var, %shard), replication_factors={2}
  ROOT %t = (f32[64], f32[64], f32[]) tuple(%grad_in, %store, %lr)
"#;

const SGD_ROOT: &str = "(f32[64], f32[64], f32[])";

fn clustering(replication_factor: usize, handle_non_replicated_clusters: bool) -> ClusteringConfig {
    ClusteringConfig {
        replication_factor,
        handle_non_replicated_clusters,
        minimum_cluster_size: 0,
    }
}

fn run(module: &mut Module, config: ClusteringConfig) -> bool {
    let mut annotations = CompilerAnnotations::default();
    let changed = ResourceUpdateElementwiseClustering::new(config)
        .run(module, &mut annotations)
        .expect("clustering failed");
    module.verify().expect("module invalid after clustering");
    changed
}

fn update(module: &Module) -> &Computation {
    &module[module.find_computation("resource_update").expect("update")]
}

fn cluster_calls(comp: &Computation) -> Vec<InstId> {
    comp.instructions()
        .filter(|i| i.name().ends_with(".cluster") && matches!(i.opcode(), Opcode::Call { .. }))
        .map(|i| i.id())
        .collect()
}

fn callee(comp: &Computation, call: InstId) -> CompId {
    comp[call]
        .opcode()
        .called_computation()
        .expect("call has a callee")
}

#[test]
fn sgd_update_is_partitioned_across_replicas() {
    let mut module = hlo_module!(&in_training_loop(SGD_STEP, SGD_ROOT, RESOURCE_UPDATE));
    assert!(run(&mut module, clustering(2, false)));

    let comp = update(&module);
    let [call] = cluster_calls(comp)[..] else {
        panic!("expected one outlined cluster");
    };
    let config = comp[call].backend_config().function_config();
    assert!(config.partitioned_elementwise_cluster);

    // Inputs in creation order: the rate, the variable shard, the reduce-scattered gradient.
    let operands = comp[call].operands();
    assert_eq!(operands.len(), 3);
    assert_eq!(operands[0], comp.find("lr").unwrap());
    assert_eq!(operands[1], comp.find("load").unwrap());
    let scattered = &comp[operands[2]];
    assert_eq!(
        scattered.custom_op(),
        Some(&CustomOp::ReduceScatter {
            replica_group_size: 2
        })
    );
    assert_eq!(scattered.operand(0), comp.find("grad_in").unwrap());
    assert_eq!(scattered.shape().dims(), [32]);

    // The new shard is stored without gathering the full value first.
    let store = &comp[comp.find("store").unwrap()];
    let element = &comp[store.operand(1)];
    assert!(matches!(element.opcode(), Opcode::GetTupleElement { index: 0 }));
    assert_eq!(element.operand(0), call);
    for gone in ["new", "scaled", "blr", "rows", "shard", "gathered", "full", "grad"] {
        assert!(comp.find(gone).is_none(), "{gone} should be gone");
    }
    assert!(!comp
        .instructions()
        .any(|i| matches!(i.custom_op(), Some(CustomOp::AllGather { .. }))));

    let body = &module[callee(comp, call)];
    let shapes: Vec<String> = body
        .parameters()
        .into_iter()
        .map(|p| body[p].shape().to_string())
        .collect();
    assert_eq!(shapes, ["f32[]", "f32[32]", "f32[32]"]);
    let root = &body[body.root()];
    assert!(matches!(root.opcode(), Opcode::Tuple));
    assert_eq!(root.shape().tuple_elements().len(), 1);
}

#[test]
fn cluster_read_outside_a_store_is_gathered_back() {
    let body = r#"
  %a = f32[64] parameter(0)
  %b = f32[64] parameter(1)
  %s = f32[] parameter(2)
  %ra = f32[64] all-reduce(%a)
  %rb = f32[64] all-reduce(%b)
  %bs = f32[64] broadcast(%s), dimensions={}
  %prod = f32[64] multiply(%ra, %bs)
  %sum = f32[64] add(%prod, %rb)
  ROOT %t = (f32[64], f32[64], f32[]) tuple(%sum, %rb, %s)
"#;
    let mut module = hlo_module!(&in_training_loop(body, SGD_ROOT, RESOURCE_UPDATE));
    assert!(run(&mut module, clustering(2, false)));

    let comp = update(&module);
    let calls = cluster_calls(comp);
    assert_eq!(calls.len(), 1);
    let root = &comp[comp.root()];
    let gathered = &comp[root.operand(0)];
    assert!(matches!(gathered.opcode(), Opcode::Reshape));
    assert_eq!(gathered.shape().dims(), [64]);
    let all_gather = &comp[gathered.operand(0)];
    assert_eq!(
        all_gather.custom_op(),
        Some(&CustomOp::AllGather {
            replica_group_size: 2
        })
    );
    assert!(matches!(
        comp[all_gather.operand(0)].opcode(),
        Opcode::GetTupleElement { index: 0 }
    ));
}

#[test]
fn replica_dependent_inputs_stay_replicated() {
    // `%a` is a plain parameter: every replica may hold a different value.
    let body = r#"
  %a = f32[64] parameter(0)
  %b = f32[64] parameter(1)
  %s = f32[] parameter(2)
  %sum = f32[64] add(%a, %b)
  ROOT %t = (f32[64], f32[64], f32[]) tuple(%sum, %b, %s)
"#;
    let mut module = hlo_module!(&in_training_loop(body, SGD_ROOT, RESOURCE_UPDATE));
    assert!(!run(&mut module, clustering(2, false)));

    assert!(run(&mut module, clustering(2, true)));
    let comp = update(&module);
    let [call] = cluster_calls(comp)[..] else {
        panic!("expected one outlined cluster");
    };
    assert!(!comp[call].backend_config().function_config().partitioned_elementwise_cluster);
    assert_eq!(
        comp[call].operands(),
        [comp.find("a").unwrap(), comp.find("b").unwrap()]
    );
    let root = &comp[comp.root()];
    let element = &comp[root.operand(0)];
    assert!(matches!(element.opcode(), Opcode::GetTupleElement { index: 0 }));
    assert_eq!(element.shape().dims(), [64]);
}

#[test]
fn partitioning_can_be_disabled_per_resource_update() {
    let mut module = hlo_module!(&in_training_loop(SGD_STEP, SGD_ROOT, NOT_PARTITIONED));
    assert!(!run(&mut module, clustering(2, false)));
    assert!(cluster_calls(update(&module)).is_empty());
}

#[test]
fn identical_clusters_share_one_computation() {
    let body = r#"
  %a = f32[64] parameter(0)
  %b = f32[64] parameter(1)
  %s = f32[] parameter(2)
  %ra = f32[64] all-reduce(%a)
  %rb = f32[64] all-reduce(%b)
  %ba = f32[64] broadcast(%s), dimensions={}
  %bb = f32[64] broadcast(%s), dimensions={}
  %na = f32[64] multiply(%ra, %ba)
  %nb = f32[64] multiply(%rb, %bb)
  ROOT %t = (f32[64], f32[64], f32[]) tuple(%na, %nb, %s)
"#;
    let mut module = hlo_module!(&in_training_loop(body, SGD_ROOT, RESOURCE_UPDATE));
    assert!(run(&mut module, clustering(2, false)));

    let comp = update(&module);
    let calls = cluster_calls(comp);
    assert_eq!(calls.len(), 2);
    assert_eq!(callee(comp, calls[0]), callee(comp, calls[1]));
}

#[test]
fn minimum_cluster_size_counts_aligned_elements() {
    let body = r#"
  %a = f32[64] parameter(0)
  %b = f32[64] parameter(1)
  %s = f32[] parameter(2)
  %ra = f32[64] all-reduce(%a)
  %bs = f32[64] broadcast(%s), dimensions={}
  %n = f32[64] multiply(%ra, %bs)
  ROOT %t = (f32[64], f32[64], f32[]) tuple(%n, %b, %s)
"#;
    let mut module = hlo_module!(&in_training_loop(body, SGD_ROOT, RESOURCE_UPDATE));
    let comp = update(&module);
    let clusters = get_clusters_in(
        comp,
        &Default::default(),
        PartitionRequest {
            partition_offloaded_variables: ThreeState::Undefined,
            replication_factor: 3,
            minimum_cluster_size: 66,
        },
    );
    // 64 elements over 3 replicas: shards of 22, 66 elements once padded.
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].cluster_size(), 64);
    assert_eq!(clusters[0].shard_size(), 22);
    assert_eq!(clusters[0].aligned_cluster_size(), 66);
    assert!(clusters[0].is_replica_partitioned());

    let too_large = ClusteringConfig {
        minimum_cluster_size: 67,
        ..clustering(3, false)
    };
    assert!(!run(&mut module, too_large));
    assert!(run(&mut module, clustering(3, false)));
}
