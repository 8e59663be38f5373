use std::collections::HashSet;

use tracing::debug;

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::module::Module;
use crate::backend::pipeline::ModulePass;
use crate::backend::spec::{InstId, Instruction};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeadCodeElimination;

impl DeadCodeElimination {
    const NAME: &'static str = "dce";

    pub fn new() -> Self {
        Self
    }

    /// Removes every instruction nothing live depends on. Returns the number removed.
    pub fn run_on_computation(&self, comp: &mut Computation) -> Result<usize, CompileError> {
        let mut worklist: Vec<InstId> = vec![comp.root()];
        for inst in comp.instructions() {
            if is_pinned(inst) {
                worklist.push(inst.id());
            }
        }

        let mut live: HashSet<InstId> = HashSet::new();
        while let Some(id) = worklist.pop() {
            if !live.insert(id) {
                continue;
            }
            let inst = &comp[id];
            worklist.extend(inst.operands().iter().copied());
            worklist.extend(inst.control_predecessors().iter().copied());
        }

        // Users first, so each removal leaves its operands free of this user.
        let mut dead: Vec<InstId> = comp
            .post_order()
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect();
        dead.reverse();
        let mut removed = 0usize;
        for id in dead {
            if comp.contains(id) {
                comp.remove_instruction(id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn is_pinned(inst: &Instruction) -> bool {
    inst.opcode().is_parameter()
        || inst.opcode().has_side_effect()
        || inst.has_control_dependencies()
}

impl ModulePass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let mut removed = 0usize;
        for comp in module.computations_post_order() {
            removed += self.run_on_computation(&mut module[comp])?;
        }
        let computations = module.remove_unreachable_computations();
        if removed > 0 || computations > 0 {
            debug!(instructions = removed, computations, "removed dead code");
        }
        Ok(removed > 0 || computations > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{BinaryOp, CustomOp, DType, Shape, UnaryOp};

    #[test]
    fn removes_unused_chain_but_keeps_parameters_and_side_effects() {
        let shape = Shape::array(DType::F32, vec![4]);
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, shape.clone(), "a").unwrap();
        let unused = comp.add_parameter(1, shape.clone(), "unused").unwrap();
        let dead = comp.add_unary(UnaryOp::Negate, a).unwrap();
        let dead2 = comp.add_unary(UnaryOp::Exp, dead).unwrap();
        let send = comp
            .add_custom(CustomOp::SendToHost, vec![a], Shape::tuple(Vec::new()))
            .unwrap();
        let root = comp.add_binary(BinaryOp::Add, a, a).unwrap();
        comp.set_root(root).unwrap();

        let removed = DeadCodeElimination::new()
            .run_on_computation(&mut comp)
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!comp.contains(dead) && !comp.contains(dead2));
        assert!(comp.contains(unused) && comp.contains(send));
        comp.verify().unwrap();
    }
}
