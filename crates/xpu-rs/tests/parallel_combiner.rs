use xpu_rs::backend::computation::Computation;
use xpu_rs::backend::passes::{ModulePass, RemoteParameterParallelCombiner};
use xpu_rs::backend::reachability::ReachabilityMap;
use xpu_rs::backend::spec::{CustomOp, DType, InstId, Opcode, Shape, Sharding};
use xpu_rs::{hlo_module, CompilerAnnotations, Module};

/// Two variables per shard; the `f32[16]` pair is larger than the `f32[8]` pair.
const TWO_SHARDS: &str = r#"
HloModule two_shards

%update {
  %a = f32[16] parameter(0)
  %b = f32[16] parameter(1)
  %c = f32[8] parameter(2)
  %d = f32[8] parameter(3)
  %la = f32[16] remote-parameter-load(%a), replication_factors={1}, sharding={maximal device=0}
  %lb = f32[16] remote-parameter-load(%b), replication_factors={1}, sharding={maximal device=1}
  %lc = f32[8] remote-parameter-load(%c), replication_factors={1}, sharding={maximal device=0}
  %ld = f32[8] remote-parameter-load(%d), replication_factors={1}, sharding={maximal device=1}
  %na = f32[16] add(%la, %la), sharding={maximal device=0}
  %nb = f32[16] add(%lb, %lb), sharding={maximal device=1}
  %nc = f32[8] add(%lc, %lc), sharding={maximal device=0}
  %nd = f32[8] add(%ld, %ld), sharding={maximal device=1}
  %sa = f32[16] remote-parameter-store(%a, %na), replication_factors={1}, sharding={maximal device=0}
  %sb = f32[16] remote-parameter-store(%b, %nb), replication_factors={1}, sharding={maximal device=1}
  %sc = f32[8] remote-parameter-store(%c, %nc), replication_factors={1}, sharding={maximal device=0}
  %sd = f32[8] remote-parameter-store(%d, %nd), replication_factors={1}, sharding={maximal device=1}
  ROOT %t = (f32[16], f32[16], f32[8], f32[8]) tuple(%sa, %sb, %sc, %sd)
}

ENTRY %main {
  %p0 = f32[16] parameter(0)
  %p1 = f32[16] parameter(1)
  %p2 = f32[8] parameter(2)
  %p3 = f32[8] parameter(3)
  ROOT %ru = (f32[16], f32[16], f32[8], f32[8]) call(%p0, %p1, %p2, %p3), to_apply=%update, backend_config={"callConfig":{"type":"ResourceUpdate"}}
}
"#;

fn run(module: &mut Module) -> bool {
    let mut annotations = CompilerAnnotations::default();
    let changed = RemoteParameterParallelCombiner::new()
        .run(module, &mut annotations)
        .expect("combiner failed");
    module.verify().expect("module invalid after combining");
    changed
}

fn update(module: &Module) -> &Computation {
    &module[module.find_computation("update").expect("update computation")]
}

fn named(comp: &Computation, name: &str) -> InstId {
    comp.find(name)
        .unwrap_or_else(|| panic!("no instruction named {name}"))
}

fn remote_ops(comp: &Computation, store: bool) -> Vec<InstId> {
    comp.instructions()
        .filter(|i| match i.custom_op() {
            Some(CustomOp::RemoteParameterLoad { .. }) => !store,
            Some(CustomOp::RemoteParameterStore { .. }) => store,
            _ => false,
        })
        .map(|i| i.id())
        .collect()
}

#[test]
fn loads_and_stores_combine_pairwise_across_shards() {
    let mut module = hlo_module!(TWO_SHARDS);
    assert!(run(&mut module));
    let comp = update(&module);

    assert_eq!(remote_ops(comp, false).len(), 2);
    assert_eq!(remote_ops(comp, true).len(), 2);

    let big = named(comp, "la.combined");
    let f32_16 = Shape::array(DType::F32, vec![16]);
    assert_eq!(
        comp[big].shape(),
        &Shape::tuple(vec![f32_16.clone(), f32_16.clone()])
    );
    assert_eq!(comp[big].operands(), [named(comp, "a"), named(comp, "b")]);
    assert_eq!(
        comp[big].custom_op().and_then(CustomOp::replication_factors),
        Some(&[1, 1][..])
    );
    assert_eq!(
        comp[big].sharding(),
        Some(&Sharding::Tuple(vec![
            Sharding::Maximal { device: 0 },
            Sharding::Maximal { device: 1 }
        ]))
    );

    // Each element goes back to the users of the load it replaced, in round order.
    let na = &comp[named(comp, "na")];
    let element = &comp[na.operand(0)];
    assert!(matches!(
        element.opcode(),
        Opcode::GetTupleElement { index: 0 }
    ));
    assert_eq!(element.operand(0), big);
    assert_eq!(element.shape(), &f32_16);
    assert_eq!(element.sharding_unique_device(), Some(0));
    let nb = &comp[named(comp, "nb")];
    assert!(matches!(
        comp[nb.operand(0)].opcode(),
        Opcode::GetTupleElement { index: 1 }
    ));

    let store = named(comp, "sa.combined");
    let values = [named(comp, "na"), named(comp, "nb")];
    assert_eq!(
        comp[store].operands(),
        [named(comp, "a"), named(comp, "b"), values[0], values[1]]
    );
}

#[test]
fn smaller_state_is_stored_before_the_larger_state_loads() {
    let mut module = hlo_module!(TWO_SHARDS);
    assert!(run(&mut module));
    let comp = update(&module);

    let big_load = named(comp, "la.combined");
    let small_load = named(comp, "lc.combined");
    let small_store = named(comp, "sc.combined");
    assert!(comp[big_load].control_predecessors().contains(&small_store));

    // Everything reading the small state now precedes the big load.
    let reachability = ReachabilityMap::build(comp);
    for name in ["nc", "nd"] {
        assert!(reachability.is_reachable(named(comp, name), big_load));
    }
    assert!(reachability.is_reachable(small_load, big_load));
    assert!(!reachability.is_reachable(big_load, small_load));
}

#[test]
fn inputs_of_the_small_state_update_run_after_its_load() {
    let mut module = hlo_module!(
        r#"
HloModule input_chain

%update {
  %a = f32[16] parameter(0)
  %b = f32[16] parameter(1)
  %c = f32[8] parameter(2)
  %d = f32[8] parameter(3)
  %g = f32[8] parameter(4)
  %la = f32[16] remote-parameter-load(%a), replication_factors={1}, sharding={maximal device=0}
  %lb = f32[16] remote-parameter-load(%b), replication_factors={1}, sharding={maximal device=1}
  %lc = f32[8] remote-parameter-load(%c), replication_factors={1}, sharding={maximal device=0}
  %ld = f32[8] remote-parameter-load(%d), replication_factors={1}, sharding={maximal device=1}
  %ng = f32[8] negate(%g), sharding={maximal device=0}
  %cg = f32[8] exponential(%ng), sharding={maximal device=0}
  %na = f32[16] add(%la, %la), sharding={maximal device=0}
  %nb = f32[16] add(%lb, %lb), sharding={maximal device=1}
  %nc = f32[8] add(%lc, %cg), sharding={maximal device=0}
  %nd = f32[8] add(%ld, %ld), sharding={maximal device=1}
  %sa = f32[16] remote-parameter-store(%a, %na), replication_factors={1}, sharding={maximal device=0}
  %sb = f32[16] remote-parameter-store(%b, %nb), replication_factors={1}, sharding={maximal device=1}
  %sc = f32[8] remote-parameter-store(%c, %nc), replication_factors={1}, sharding={maximal device=0}
  %sd = f32[8] remote-parameter-store(%d, %nd), replication_factors={1}, sharding={maximal device=1}
  ROOT %t = (f32[16], f32[16], f32[8], f32[8]) tuple(%sa, %sb, %sc, %sd)
}

ENTRY %main {
  %p0 = f32[16] parameter(0)
  %p1 = f32[16] parameter(1)
  %p2 = f32[8] parameter(2)
  %p3 = f32[8] parameter(3)
  %p4 = f32[8] parameter(4)
  ROOT %ru = (f32[16], f32[16], f32[8], f32[8]) call(%p0, %p1, %p2, %p3, %p4), to_apply=%update, backend_config={"callConfig":{"type":"ResourceUpdate"}}
}
"#
    );
    assert!(run(&mut module));
    let comp = update(&module);

    let small_load = named(comp, "lc.combined");
    let big_load = named(comp, "la.combined");
    let reachability = ReachabilityMap::build(comp);
    for name in ["ng", "cg"] {
        assert!(
            reachability.is_reachable(small_load, named(comp, name)),
            "{name} should wait for the small load"
        );
        assert!(reachability.is_reachable(named(comp, name), big_load));
    }
    assert!(!reachability.is_reachable(small_load, named(comp, "g")));
}

#[test]
fn load_depending_on_other_shard_store_is_not_combined() {
    let mut module = hlo_module!(
        r#"
HloModule dependent

%update {
  %a = f32[16] parameter(0)
  %b = f32[16] parameter(1)
  %lb = f32[16] remote-parameter-load(%b), replication_factors={1}, sharding={maximal device=1}
  %nb = f32[16] add(%lb, %lb), sharding={maximal device=1}
  %sb = f32[16] remote-parameter-store(%b, %nb), replication_factors={1}, sharding={maximal device=1}
  %la = f32[16] remote-parameter-load(%a), replication_factors={1}, sharding={maximal device=0}, control-predecessors={%sb}
  %na = f32[16] add(%la, %la), sharding={maximal device=0}
  %sa = f32[16] remote-parameter-store(%a, %na), replication_factors={1}, sharding={maximal device=0}
  ROOT %t = (f32[16], f32[16]) tuple(%sa, %sb)
}

ENTRY %main {
  %p0 = f32[16] parameter(0)
  %p1 = f32[16] parameter(1)
  ROOT %ru = (f32[16], f32[16]) call(%p0, %p1), to_apply=%update, backend_config={"callConfig":{"type":"ResourceUpdate"}}
}
"#
    );
    let before = module.to_string();
    assert!(!run(&mut module));
    assert_eq!(module.to_string(), before);
}

#[test]
fn unbalanced_loads_and_stores_get_no_scheduling_constraints() {
    // Only the loads can be combined: the single store lives on one shard.
    let mut module = hlo_module!(
        r#"
HloModule unbalanced

%update {
  %a = f32[16] parameter(0)
  %b = f32[16] parameter(1)
  %la = f32[16] remote-parameter-load(%a), replication_factors={1}, sharding={maximal device=0}
  %lb = f32[16] remote-parameter-load(%b), replication_factors={1}, sharding={maximal device=1}
  %sum = f32[16] add(%la, %lb), sharding={maximal device=0}
  %sa = f32[16] remote-parameter-store(%a, %sum), replication_factors={1}, sharding={maximal device=0}
  ROOT %t = (f32[16], f32[16]) tuple(%sa, %lb)
}

ENTRY %main {
  %p0 = f32[16] parameter(0)
  %p1 = f32[16] parameter(1)
  ROOT %ru = (f32[16], f32[16]) call(%p0, %p1), to_apply=%update, backend_config={"callConfig":{"type":"ResourceUpdate"}}
}
"#
    );
    assert!(run(&mut module));
    let comp = update(&module);
    assert_eq!(remote_ops(comp, false), [named(comp, "la.combined")]);
    assert_eq!(remote_ops(comp, true), [named(comp, "sa")]);
    assert!(comp
        .instructions()
        .all(|i| i.control_predecessors().is_empty()));
}

#[test]
fn computations_outside_resource_updates_are_ignored() {
    let mut module = hlo_module!(
        r#"
HloModule outside

ENTRY %main {
  %a = f32[16] parameter(0)
  %b = f32[16] parameter(1)
  %la = f32[16] remote-parameter-load(%a), replication_factors={1}, sharding={maximal device=0}
  %lb = f32[16] remote-parameter-load(%b), replication_factors={1}, sharding={maximal device=1}
  ROOT %t = (f32[16], f32[16]) tuple(%la, %lb)
}
"#
    );
    assert!(!run(&mut module));
}
