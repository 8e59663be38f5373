use tracing::{debug, debug_span};

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::error::CompileError;
use crate::backend::matcher::{
    filters, HloMatcher, HloMatcherPattern, MatchHandler, MatcherConfig, Operand, PatternMatch,
};
use crate::backend::module::Module;
use crate::backend::pipeline::ModulePass;
use crate::backend::spec::{CompId, CustomOp, InstId, NewInstruction, Opcode};

/// Combines two chained `multi-update-add`s on the same buffer and scale into one
/// whose indices and updates are the concatenation of both.
///
/// Restarts after every replacement so longer chains collapse completely.
#[derive(Debug, Clone)]
pub struct MultiUpdateCombiner {
    patterns: Vec<HloMatcherPattern>,
}

impl MultiUpdateCombiner {
    const NAME: &'static str = "multi-update-combiner";

    const OUTER: usize = 0;
    const INNER: usize = 1;
}

impl Default for MultiUpdateCombiner {
    fn default() -> Self {
        // outer(inner(buffer, i0, u0, scale), i1, u1, scale)
        let pattern = HloMatcherPattern::new("multi_update_add_chain")
            .op(
                filters::multi_update_add,
                [
                    Operand::Node(1),
                    Operand::Input(3),
                    Operand::Input(4),
                    Operand::Input(5),
                ],
            )
            .op(
                filters::multi_update_add,
                [
                    Operand::Input(2),
                    Operand::Input(6),
                    Operand::Input(7),
                    Operand::Input(5),
                ],
            )
            .input()
            .input()
            .input()
            .input()
            .input()
            .input();
        Self {
            patterns: vec![pattern],
        }
    }
}

impl MatchHandler for MultiUpdateCombiner {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn patterns(&self) -> &[HloMatcherPattern] {
        &self.patterns
    }

    fn config(&self) -> MatcherConfig {
        MatcherConfig {
            restart_after_replacement: true,
        }
    }

    fn replace(
        &self,
        module: &mut Module,
        comp: CompId,
        matched: &PatternMatch,
    ) -> Result<Option<InstId>, CompileError> {
        let (Some(outer), Some(inner)) = (matched.node(Self::OUTER), matched.node(Self::INNER))
        else {
            return Err(CompileError::structural("multi-update match without both updates"));
        };
        let computation = &mut module[comp];
        let outer_inst = &computation[outer];
        let inner_inst = &computation[inner];
        let buffer = inner_inst.operand(0);
        let scale = outer_inst.operand(3);
        let (i0, u0) = (inner_inst.operand(1), inner_inst.operand(2));
        let (i1, u1) = (outer_inst.operand(1), outer_inst.operand(2));
        let shape = outer_inst.shape().clone();
        let sharding = outer_inst.sharding().cloned();
        let metadata = outer_inst.metadata().cloned();

        let indices = match computation.add_concatenate(vec![i0, i1], 0) {
            Ok(id) => id,
            Err(err) => {
                debug!(%err, "indices cannot be concatenated, skipping");
                return Ok(None);
            }
        };
        let updates = match computation.add_concatenate(vec![u0, u1], 0) {
            Ok(id) => id,
            Err(err) => {
                computation.remove_instruction(indices)?;
                debug!(%err, "updates cannot be concatenated, skipping");
                return Ok(None);
            }
        };
        let combined = computation.add_instruction(
            NewInstruction::new(
                Opcode::Custom(CustomOp::MultiUpdateAdd),
                shape,
                vec![buffer, indices, updates, scale],
            )
            .named("multi-update-add.combined")
            .with_sharding(sharding)
            .with_metadata(metadata),
        )?;
        Ok(Some(combined))
    }
}

impl ModulePass for MultiUpdateCombiner {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let _span = debug_span!("multi_update_combiner").entered();
        let stats = HloMatcher::new(self).run(module)?;
        Ok(stats.replacements > 0)
    }
}
