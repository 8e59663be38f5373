use tracing::{debug, debug_span};

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::matcher::{
    filters, HloMatcher, HloMatcherPattern, MatchHandler, Operand, PatternMatch,
};
use crate::backend::module::Module;
use crate::backend::pipeline::ModulePass;
use crate::backend::spec::{CompId, CustomOp, InstId, Instruction, NewInstruction, Opcode};

/// Turns `add(accumulator, gradient)` into an in-place `gradient-accumulator-add`
/// when the accumulator comes straight from `gradient-accumulator-create` and the
/// add is its only user.
#[derive(Debug, Clone)]
pub struct GradientAccumulationFuser {
    patterns: Vec<HloMatcherPattern>,
}

impl GradientAccumulationFuser {
    const NAME: &'static str = "gradient-accumulation-fuser";
}

impl Default for GradientAccumulationFuser {
    fn default() -> Self {
        Self {
            patterns: vec![HloMatcherPattern::new("gradient_accumulation")
                .op(filters::add, [Operand::Input(1), Operand::Input(2)])
                .input_where(is_private_accumulator)
                .input()],
        }
    }
}

fn is_private_accumulator(_: &Computation, inst: &Instruction) -> bool {
    filters::gradient_accumulator_create(inst.opcode()) && inst.user_count() == 1
}

impl MatchHandler for GradientAccumulationFuser {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn patterns(&self) -> &[HloMatcherPattern] {
        &self.patterns
    }

    fn replace(
        &self,
        module: &mut Module,
        comp: CompId,
        matched: &PatternMatch,
    ) -> Result<Option<InstId>, CompileError> {
        let computation = &mut module[comp];
        let add = &computation[matched.root];
        let (accumulator, gradient) = (add.operand(0), add.operand(1));
        let new = NewInstruction::new(
            Opcode::Custom(CustomOp::GradientAccumulatorAdd),
            add.shape().clone(),
            vec![accumulator, gradient],
        )
        .with_sharding(add.sharding().cloned())
        .with_metadata(add.metadata().cloned());
        let fused = computation.add_instruction(new)?;
        debug!(accumulator = computation[accumulator].name(), "fused accumulation");
        Ok(Some(fused))
    }
}

impl ModulePass for GradientAccumulationFuser {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let _span = debug_span!("gradient_accumulation_fuser").entered();
        let stats = HloMatcher::new(self).run(module)?;
        Ok(stats.replacements > 0)
    }
}
