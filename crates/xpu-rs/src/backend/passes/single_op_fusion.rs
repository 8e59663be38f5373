use tracing::debug_span;

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::error::CompileError;
use crate::backend::fusion::FusionRegistry;
use crate::backend::matcher::{HloMatcher, OutlineHandler};
use crate::backend::module::Module;
use crate::backend::pipeline::ModulePass;

/// Outlines every registered single-op fusion into a `_pop_op_<name>` fusion computation.
#[derive(Debug, Clone)]
pub struct SingleOpFusion {
    handler: OutlineHandler,
}

impl SingleOpFusion {
    const NAME: &'static str = "single-op-fusion";

    pub fn new(registry: &FusionRegistry) -> Self {
        Self {
            handler: OutlineHandler::new(Self::NAME, registry.patterns().to_vec()),
        }
    }
}

impl Default for SingleOpFusion {
    fn default() -> Self {
        Self::new(&FusionRegistry::with_builtin_fusions())
    }
}

impl ModulePass for SingleOpFusion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let _span = debug_span!("single_op_fusion").entered();
        let stats = HloMatcher::new(&self.handler).run(module)?;
        Ok(stats.replacements > 0)
    }
}
