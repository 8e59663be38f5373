use proptest::prelude::*;
use xpu_rs::backend::fusion::FusionRegistry;
use xpu_rs::backend::matcher::{HloMatcher, OutlineHandler};
use xpu_rs::backend::passes::{
    GradientAccumulationFuser, ModulePass, MultiUpdateCombiner, SingleOpFusion,
};
use xpu_rs::backend::spec::{CustomOp, Opcode};
use xpu_rs::backend::text_ir::{parse_module, print_module};
use xpu_rs::{hlo_module, CompilerAnnotations, Module};

fn run(pass: &dyn ModulePass, module: &mut Module) -> bool {
    let mut annotations = CompilerAnnotations::default();
    let changed = pass.run(module, &mut annotations).expect("pass failed");
    module.verify().expect("module invalid after pass");
    changed
}

const RELU: &str = r#"
HloModule relu

ENTRY %main {
  %x = f32[4] parameter(0)
  %zero = f32[] constant(0)
  %bzero = f32[4] broadcast(%zero), dimensions={}
  %relu = f32[4] maximum(%x, %bzero)
  ROOT %out = f32[4] negate(%relu)
}
"#;

#[test]
fn relu_is_outlined_into_a_fusion() {
    let mut module = hlo_module!(RELU);
    assert!(run(&SingleOpFusion::default(), &mut module));

    let entry = module.entry_computation();
    let out = &entry[entry.root()];
    let fusion = &entry[out.operand(0)];
    let Opcode::Fusion { computation } = fusion.opcode() else {
        panic!("expected a fusion, got {}", fusion.opcode().mnemonic());
    };
    assert_eq!(module[*computation].name(), "_pop_op_relu");
    assert_eq!(fusion.operands(), [entry.find("x").unwrap()]);
    assert!(entry.find("bzero").is_none());
    assert!(entry.find("zero").is_none());

    let body = &module[*computation];
    assert_eq!(body.num_parameters(), 1);
    assert!(matches!(body[body.root()].opcode(), Opcode::Binary(_)));
}

#[test]
fn scaled_inplace_keeps_inputs_in_pattern_order() {
    let mut module = hlo_module!(
        r#"
HloModule scaled

ENTRY %main {
  %x = f32[4] parameter(0)
  %y = f32[4] parameter(1)
  %s = f32[] parameter(2)
  %bs = f32[4] broadcast(%s), dimensions={}
  %scaled = f32[4] multiply(%y, %bs)
  ROOT %out = f32[4] add(%x, %scaled)
}
"#
    );
    assert!(run(&SingleOpFusion::default(), &mut module));

    let entry = module.entry_computation();
    let fusion = &entry[entry.root()];
    assert!(matches!(fusion.opcode(), Opcode::Fusion { .. }));
    let expected: Vec<_> = ["x", "y", "s"]
        .iter()
        .map(|n| entry.find(n).unwrap())
        .collect();
    assert_eq!(fusion.operands(), expected.as_slice());
    assert_eq!(entry.instruction_count(), 4);
}

#[test]
fn shared_interior_instruction_rejects_the_match() {
    let src = r#"
HloModule joined

ENTRY %main {
  %x = f32[4] parameter(0)
  %zero = f32[] constant(0)
  %bzero = f32[4] broadcast(%zero), dimensions={}
  %relu = f32[4] maximum(%x, %bzero)
  ROOT %sum = f32[4] add(%relu, %bzero)
}
"#;
    let mut module = hlo_module!(src);
    let before = print_module(&module);
    let registry = FusionRegistry::with_builtin_fusions();
    let handler = OutlineHandler::new("single-op-fusion", registry.patterns().to_vec());
    let stats = HloMatcher::new(&handler).run(&mut module).unwrap();
    assert_eq!(stats.replacements, 0);
    assert_eq!(stats.rejected, 1);
    assert_eq!(print_module(&module), before);
}

#[test]
fn gradient_accumulation_becomes_in_place_add() {
    let mut module = hlo_module!(
        r#"
HloModule accumulate

ENTRY %main {
  %grad = f32[8] parameter(0)
  %acc = f32[8] gradient-accumulator-create(%grad)
  %sum = f32[8] add(%acc, %grad), sharding={maximal device=1}
  ROOT %out = f32[8] negate(%sum)
}
"#
    );
    assert!(run(&GradientAccumulationFuser::default(), &mut module));

    let entry = module.entry_computation();
    let fused = &entry[entry[entry.root()].operand(0)];
    assert_eq!(fused.custom_op(), Some(&CustomOp::GradientAccumulatorAdd));
    assert_eq!(fused.operand(0), entry.find("acc").unwrap());
    assert_eq!(fused.operand(1), entry.find("grad").unwrap());
    assert_eq!(fused.sharding_unique_device(), Some(1));
    assert!(entry.find("sum").is_none());
}

#[test]
fn shared_accumulator_is_not_fused() {
    let mut module = hlo_module!(
        r#"
HloModule accumulate_shared

ENTRY %main {
  %grad = f32[8] parameter(0)
  %acc = f32[8] gradient-accumulator-create(%grad)
  %sum = f32[8] add(%acc, %grad)
  ROOT %t = (f32[8], f32[8]) tuple(%sum, %acc)
}
"#
    );
    assert!(!run(&GradientAccumulationFuser::default(), &mut module));
}

#[test]
fn multi_update_chain_collapses_into_one_update() {
    let mut module = hlo_module!(
        r#"
HloModule multi_update

ENTRY %main {
  %buf = f32[16,4] parameter(0)
  %i0 = s32[2,1] parameter(1)
  %u0 = f32[2,4] parameter(2)
  %i1 = s32[3,1] parameter(3)
  %u1 = f32[3,4] parameter(4)
  %i2 = s32[2,1] parameter(5)
  %u2 = f32[2,4] parameter(6)
  %scale = f32[] parameter(7)
  %mu0 = f32[16,4] multi-update-add(%buf, %i0, %u0, %scale)
  %mu1 = f32[16,4] multi-update-add(%mu0, %i1, %u1, %scale)
  ROOT %mu2 = f32[16,4] multi-update-add(%mu1, %i2, %u2, %scale)
}
"#
    );
    assert!(run(&MultiUpdateCombiner::default(), &mut module));

    let entry = module.entry_computation();
    let updates: Vec<_> = entry
        .instructions()
        .filter(|i| i.custom_op() == Some(&CustomOp::MultiUpdateAdd))
        .collect();
    assert_eq!(updates.len(), 1);
    let combined = updates[0];
    assert_eq!(combined.id(), entry.root());
    assert_eq!(combined.operand(0), entry.find("buf").unwrap());
    assert_eq!(combined.operand(3), entry.find("scale").unwrap());
    assert_eq!(entry[combined.operand(1)].shape().dims(), [7, 1]);
    assert_eq!(entry[combined.operand(2)].shape().dims(), [7, 4]);
}

#[test]
fn multi_updates_with_different_scales_stay_apart() {
    let mut module = hlo_module!(
        r#"
HloModule multi_update_scales

ENTRY %main {
  %buf = f32[16,4] parameter(0)
  %i0 = s32[2,1] parameter(1)
  %u0 = f32[2,4] parameter(2)
  %s0 = f32[] parameter(3)
  %s1 = f32[] parameter(4)
  %mu0 = f32[16,4] multi-update-add(%buf, %i0, %u0, %s0)
  ROOT %mu1 = f32[16,4] multi-update-add(%mu0, %i0, %u0, %s1)
}
"#
    );
    assert!(!run(&MultiUpdateCombiner::default(), &mut module));
}

/// Chains relu, scaled-add, plain and shared-broadcast segments after `%x`.
fn chained_program(kinds: &[u8]) -> String {
    let mut body = String::from("  %x = f32[4] parameter(0)\n");
    let mut prev = String::from("%x");
    for (i, kind) in kinds.iter().enumerate() {
        let v = format!("%v{i}");
        match kind {
            0 => {
                body += &format!("  %z{i} = f32[] constant(0)\n");
                body += &format!("  %b{i} = f32[4] broadcast(%z{i}), dimensions={{}}\n");
                body += &format!("  {v} = f32[4] maximum({prev}, %b{i})\n");
            }
            1 => {
                body += &format!("  %s{i} = f32[] constant(2)\n");
                body += &format!("  %b{i} = f32[4] broadcast(%s{i}), dimensions={{}}\n");
                body += &format!("  %m{i} = f32[4] multiply({prev}, %b{i})\n");
                body += &format!("  {v} = f32[4] add(%x, %m{i})\n");
            }
            2 => body += &format!("  {v} = f32[4] negate({prev})\n"),
            _ => {
                body += &format!("  %z{i} = f32[] constant(0)\n");
                body += &format!("  %b{i} = f32[4] broadcast(%z{i}), dimensions={{}}\n");
                body += &format!("  %r{i} = f32[4] maximum({prev}, %b{i})\n");
                body += &format!("  {v} = f32[4] add(%r{i}, %b{i})\n");
            }
        }
        prev = v;
    }
    body += &format!("  ROOT %out = f32[4] negate({prev})\n");
    format!("HloModule chained\n\nENTRY %main {{\n{body}}}\n")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn matcher_runs_are_deterministic(kinds in prop::collection::vec(0u8..4, 1..8)) {
        let src = chained_program(&kinds);
        let registry = FusionRegistry::with_builtin_fusions();
        let handler = OutlineHandler::new("single-op-fusion", registry.patterns().to_vec());

        let mut first = parse_module(&src).expect("parse");
        let mut second = parse_module(&src).expect("parse");
        let stats_first = HloMatcher::new(&handler).run(&mut first).expect("first run");
        let stats_second = HloMatcher::new(&handler).run(&mut second).expect("second run");

        prop_assert_eq!(stats_first, stats_second);
        prop_assert_eq!(print_module(&first), print_module(&second));
        let expected = kinds.iter().filter(|k| **k < 2).count();
        prop_assert_eq!(stats_first.replacements, expected);
        prop_assert!(first.verify().is_ok());
    }
}
