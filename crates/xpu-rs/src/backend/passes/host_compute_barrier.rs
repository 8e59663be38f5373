use std::collections::BTreeMap;

use tracing::{debug, debug_span};

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::matcher::fusion_computations;
use crate::backend::module::Module;
use crate::backend::pipeline::ModulePass;
use crate::backend::spec::{CustomOp, InstId, NewInstruction, Opcode, Shape};

const HOST_COMPUTE_OP_TYPE: &str = "XlaHostCompute";

#[derive(Debug, Default)]
struct HostComputeOps {
    sends: Vec<InstId>,
    recvs: Vec<InstId>,
}

/// Keeps every receive of a host computation after all of its sends by routing them
/// through a `send-recv-barrier`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostComputeBarrierInserter;

impl HostComputeBarrierInserter {
    const NAME: &'static str = "host-compute-barrier-inserter";

    pub fn new() -> Self {
        Self
    }

    pub fn run_on_computation(&self, comp: &mut Computation) -> Result<bool, CompileError> {
        let mut groups: BTreeMap<String, HostComputeOps> = BTreeMap::new();
        for id in comp.post_order() {
            let inst = &comp[id];
            let Some(metadata) = inst.metadata() else {
                continue;
            };
            if metadata.op_type != HOST_COMPUTE_OP_TYPE {
                continue;
            }
            match inst.custom_op() {
                Some(CustomOp::SendToHost) => groups
                    .entry(metadata.op_name.clone())
                    .or_default()
                    .sends
                    .push(id),
                Some(CustomOp::RecvFromHost) => groups
                    .entry(metadata.op_name.clone())
                    .or_default()
                    .recvs
                    .push(id),
                _ => {}
            }
        }

        let mut changed = false;
        for (op_name, ops) in groups {
            if ops.sends.is_empty() || ops.recvs.is_empty() {
                continue;
            }
            if ops.recvs.iter().all(|&recv| behind_barrier(comp, recv)) {
                continue;
            }
            let barrier = comp.add_instruction(
                NewInstruction::new(
                    Opcode::Custom(CustomOp::SendRecvBarrier),
                    Shape::tuple(Vec::new()),
                    Vec::new(),
                )
                .named(format!("{op_name}.barrier")),
            )?;
            for &send in &ops.sends {
                comp.add_control_dependency(send, barrier)?;
            }
            for &recv in &ops.recvs {
                comp.add_control_dependency(barrier, recv)?;
            }
            debug!(
                op_name = %op_name,
                sends = ops.sends.len(),
                recvs = ops.recvs.len(),
                "inserted host compute barrier"
            );
            changed = true;
        }
        Ok(changed)
    }
}

fn behind_barrier(comp: &Computation, recv: InstId) -> bool {
    comp[recv]
        .control_predecessors()
        .iter()
        .any(|&pred| comp[pred].custom_op() == Some(&CustomOp::SendRecvBarrier))
}

impl ModulePass for HostComputeBarrierInserter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let _span = debug_span!("host_compute_barrier").entered();
        let fusion_bodies = fusion_computations(module);
        let mut changed = false;
        for comp in module.computations_post_order() {
            if fusion_bodies.contains(&comp) {
                continue;
            }
            changed |= self.run_on_computation(&mut module[comp])?;
        }
        Ok(changed)
    }
}
