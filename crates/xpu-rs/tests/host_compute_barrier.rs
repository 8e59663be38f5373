use xpu_rs::backend::passes::{DeadCodeElimination, HostComputeBarrierInserter, ModulePass};
use xpu_rs::backend::spec::CustomOp;
use xpu_rs::{hlo_module, CompilerAnnotations};

const HOST_COMPUTE: &str = r#"
HloModule host_compute

ENTRY %main {
  %x = f32[4] parameter(0)
  %y = f32[4] parameter(1)
  %send0 = () send-to-host(%x), metadata={op_type="XlaHostCompute" op_name="hc0"}
  %send1 = () send-to-host(%y), metadata={op_type="XlaHostCompute" op_name="hc0"}
  %recv0 = f32[4] recv-from-host(), metadata={op_type="XlaHostCompute" op_name="hc0"}
  %send2 = () send-to-host(%x), metadata={op_type="XlaHostCompute" op_name="only_send"}
  %recv1 = f32[4] recv-from-host(), metadata={op_type="Other" op_name="hc0"}
  ROOT %sum = f32[4] add(%recv0, %recv1)
}
"#;

#[test]
fn receives_wait_for_every_send_of_their_host_computation() {
    let mut module = hlo_module!(HOST_COMPUTE);
    let mut annotations = CompilerAnnotations::default();
    assert!(HostComputeBarrierInserter::new()
        .run(&mut module, &mut annotations)
        .unwrap());
    module.verify().unwrap();

    let entry = module.entry_computation();
    let barriers: Vec<_> = entry
        .instructions()
        .filter(|i| i.custom_op() == Some(&CustomOp::SendRecvBarrier))
        .collect();
    assert_eq!(barriers.len(), 1);
    let barrier = barriers[0];
    assert_eq!(barrier.name(), "hc0.barrier");
    assert!(barrier.shape().is_tuple() && barrier.shape().tuple_elements().is_empty());

    let find = |name: &str| entry.find(name).unwrap();
    assert_eq!(barrier.control_predecessors(), [find("send0"), find("send1")]);
    assert_eq!(barrier.control_successors(), [find("recv0")]);
    assert!(entry[find("recv1")].control_predecessors().is_empty());
    assert!(entry[find("send2")].control_successors().is_empty());
}

#[test]
fn barrier_insertion_is_idempotent() {
    let mut module = hlo_module!(HOST_COMPUTE);
    let mut annotations = CompilerAnnotations::default();
    let pass = HostComputeBarrierInserter::new();
    assert!(pass.run(&mut module, &mut annotations).unwrap());
    let first = module.to_string();
    assert!(!pass.run(&mut module, &mut annotations).unwrap());
    assert_eq!(module.to_string(), first);
}

#[test]
fn dead_code_elimination_keeps_host_transfers_and_barriers() {
    let mut module = hlo_module!(
        r#"
HloModule dce

%unused {
  %p = f32[4] parameter(0)
  ROOT %n = f32[4] negate(%p)
}

ENTRY %main {
  %x = f32[4] parameter(0)
  %dead = f32[4] exponential(%x)
  %dead_call = f32[4] call(%dead), to_apply=%unused
  %send = () send-to-host(%x), metadata={op_type="XlaHostCompute" op_name="hc"}
  %recv = f32[4] recv-from-host(), metadata={op_type="XlaHostCompute" op_name="hc"}
  ROOT %out = f32[4] add(%x, %x)
}
"#
    );
    let mut annotations = CompilerAnnotations::default();
    assert!(HostComputeBarrierInserter::new()
        .run(&mut module, &mut annotations)
        .unwrap());
    assert!(DeadCodeElimination::new()
        .run(&mut module, &mut annotations)
        .unwrap());
    module.verify().unwrap();

    let entry = module.entry_computation();
    for name in ["send", "recv", "hc.barrier", "x", "out"] {
        assert!(entry.find(name).is_some(), "{name} was removed");
    }
    assert!(entry.find("dead").is_none());
    assert!(entry.find("dead_call").is_none());
    assert!(module.find_computation("unused").is_none());
    assert!(!DeadCodeElimination::new()
        .run(&mut module, &mut annotations)
        .unwrap());
}
