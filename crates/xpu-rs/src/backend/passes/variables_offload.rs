use tracing::{debug, debug_span, info};

use crate::backend::annotations::{CompilerAnnotations, InputKind, OutputKind, RemoteParameterInfo};
use crate::backend::backend_config::{CallType, ThreeState};
use crate::backend::buffers::descriptors::remote_buffer_count;
use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::matcher::fusion_computations;
use crate::backend::module::Module;
use crate::backend::passes::replication::{insert_replicated_load, insert_replicated_store};
use crate::backend::pipeline::ModulePass;
use crate::backend::spec::{CompId, InstId, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadConfig {
    /// Whether the target device configuration has remote memory at all.
    pub remote_memory_supported: bool,
    /// Variables smaller than this many bytes stay resident.
    pub minimum_remote_tensor_size: usize,
    pub replication_factor: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            remote_memory_supported: true,
            minimum_remote_tensor_size: 128,
            replication_factor: 1,
        }
    }
}

/// Keeps persistent variables updated by a loop's resource update in remote memory,
/// loading them at the start of the update and storing the new value at its end.
#[derive(Debug, Clone, Default)]
pub struct ResourceUpdateVariablesOffload {
    config: OffloadConfig,
}

/// One offloadable variable, traced through the entry, the loop body and the update.
#[derive(Debug, Clone, Copy)]
struct OffloadCandidate {
    /// Parameter of the resource update computation.
    input_in_resource_update: InstId,
    /// Operand of the resource update root at `output_index`.
    output_in_resource_update: InstId,
    output_index: usize,
    /// Entry parameter feeding the loop.
    input_to_call: InstId,
    entry_param_number: usize,
}

impl ResourceUpdateVariablesOffload {
    const NAME: &'static str = "resource-update-variables-offload";

    pub fn new(config: OffloadConfig) -> Self {
        Self { config }
    }

    fn optimize(
        &self,
        module: &mut Module,
        annotations: &mut CompilerAnnotations,
        call_op: InstId,
        resource_update: InstId,
    ) -> Result<bool, CompileError> {
        let entry = module.entry();
        let body = callee(&module[entry], call_op)?;
        let update_comp = callee(&module[body], resource_update)?;

        let mut changed = fix_root_instruction(&mut module[update_comp])?;
        changed |= fix_root_instruction(&mut module[body])?;

        let update_config = module[body][resource_update]
            .backend_config()
            .resource_update_config();
        if update_config.offload_variables == ThreeState::Off {
            return Ok(changed);
        }
        let partition = update_config.partition_offloaded_variables != ThreeState::Off;
        let replication_factor = if partition {
            self.config.replication_factor.max(1)
        } else {
            1
        };

        if module[entry].is_root(call_op) {
            fix_root_instruction(&mut module[entry])?;
            changed = true;
        }
        let entry_comp = &module[entry];
        let entry_root = entry_comp.root();
        if !matches!(entry_comp[entry_root].opcode(), Opcode::Tuple)
            || entry_comp[entry_root].user_count() > 0
        {
            return Ok(changed);
        }

        let candidates = find_candidates(
            module,
            annotations,
            (entry, call_op),
            (body, resource_update),
            update_comp,
        );
        if candidates.is_empty() {
            return Ok(changed);
        }

        if !self.config.remote_memory_supported {
            let message = "the current device configuration does not support remote memory, \
                           so resource update variables cannot be offloaded; set \
                           `offloadVariables` to THREESTATE_OFF to silence this";
            if update_config.offload_variables == ThreeState::On {
                return Err(CompileError::failed_precondition(message));
            }
            info!("{message}");
            return Ok(changed);
        }

        for candidate in candidates {
            let byte_size = module[entry][candidate.input_to_call].shape().byte_size();
            if byte_size < self.config.minimum_remote_tensor_size {
                debug!(
                    parameter = candidate.entry_param_number,
                    byte_size,
                    minimum = self.config.minimum_remote_tensor_size,
                    "variable below the minimum remote tensor size, not offloaded"
                );
                continue;
            }
            debug!(parameter = candidate.entry_param_number, "offloading variable");
            offload(&mut module[update_comp], &candidate, replication_factor)?;
            annotations
                .remote_parameter_infos
                .insert(RemoteParameterInfo::new(
                    candidate.entry_param_number,
                    replication_factor > 1,
                ));
            changed = true;
        }
        Ok(changed)
    }
}

fn callee(comp: &Computation, call: InstId) -> Result<CompId, CompileError> {
    comp[call]
        .opcode()
        .called_computation()
        .ok_or_else(|| CompileError::structural(format!("{} is not a call", comp[call].name())))
}

/// Rewrites the root of `comp` into a tuple instruction if it only has a tuple shape.
pub fn fix_root_instruction(comp: &mut Computation) -> Result<bool, CompileError> {
    let root = comp.root();
    let inst = &comp[root];
    if matches!(inst.opcode(), Opcode::Tuple) || !inst.shape().is_tuple() {
        return Ok(false);
    }
    let count = inst.shape().tuple_elements().len();
    let mut elements = Vec::with_capacity(count);
    for index in 0..count {
        elements.push(comp.add_get_tuple_element(root, index)?);
    }
    let tuple = comp.add_tuple(elements)?;
    comp.set_root(tuple)?;
    Ok(true)
}

fn find_candidates(
    module: &Module,
    annotations: &CompilerAnnotations,
    (entry, call_op): (CompId, InstId),
    (body, resource_update): (CompId, InstId),
    update_comp: CompId,
) -> Vec<OffloadCandidate> {
    let entry_comp = &module[entry];
    let body_comp = &module[body];
    let update = &module[update_comp];
    let call = &entry_comp[call_op];
    let ru = &body_comp[resource_update];
    let body_root = &body_comp[body_comp.root()];
    let update_root = &update[update.root()];
    let entry_root = entry_comp.root();
    let aliasing = &annotations.input_output_aliasing_map;

    let mut out = Vec::new();
    for (operand_index, &operand) in ru.operands().iter().enumerate() {
        let operand_inst = &body_comp[operand];
        if operand_inst.shape().is_tuple() {
            continue;
        }
        let Some(call_param_number) = operand_inst.opcode().parameter_number() else {
            continue;
        };
        if ru.operand_indices(operand).len() != 1 || operand_inst.user_count() != 1 {
            continue;
        }

        let Some(&call_input) = call.operands().get(call_param_number) else {
            continue;
        };
        let call_input_inst = &entry_comp[call_input];
        let Some(entry_param_number) = call_input_inst.opcode().parameter_number() else {
            continue;
        };
        if call_input_inst.user_count() != 1 || call.operand_indices(call_input).len() != 1 {
            continue;
        }

        // The loop must hand the update's output for this slot straight back out.
        let Some(&loop_output) = body_root.operands().get(call_param_number) else {
            continue;
        };
        let loop_output_inst = &body_comp[loop_output];
        let Opcode::GetTupleElement { index: update_output_index } = *loop_output_inst.opcode()
        else {
            continue;
        };
        if loop_output_inst.operand(0) != resource_update {
            continue;
        }

        if aliasing.input(entry_param_number) != Some(InputKind::ResourceModified) {
            continue;
        }

        let mut call_outputs = Vec::new();
        let mut all_gtes = true;
        for &user in call.users() {
            match entry_comp[user].opcode() {
                Opcode::GetTupleElement { index } => {
                    if *index == call_param_number {
                        call_outputs.push(user);
                    }
                }
                _ => {
                    all_gtes = false;
                    break;
                }
            }
        }
        let ([output_from_call], true) = (call_outputs.as_slice(), all_gtes) else {
            continue;
        };
        if entry_comp[*output_from_call].users() != [entry_root] {
            continue;
        }
        let output_positions = entry_comp[entry_root].operand_indices(*output_from_call);
        let [entry_output_index] = output_positions.as_slice() else {
            continue;
        };
        match aliasing.output(*entry_output_index) {
            Some(OutputKind::ResourceModified { input_index }) if input_index == entry_param_number => {}
            _ => continue,
        }

        let Some(input_in_resource_update) = update.parameter(operand_index) else {
            continue;
        };
        let Some(&output_in_resource_update) = update_root.operands().get(update_output_index)
        else {
            continue;
        };
        let already_remote = update[input_in_resource_update]
            .users()
            .iter()
            .any(|&u| remote_buffer_count(&update[u]) > 0);
        if already_remote {
            continue;
        }

        out.push(OffloadCandidate {
            input_in_resource_update,
            output_in_resource_update,
            output_index: update_output_index,
            input_to_call: call_input,
            entry_param_number,
        });
    }
    out
}

fn offload(
    comp: &mut Computation,
    candidate: &OffloadCandidate,
    replication_factor: usize,
) -> Result<(), CompileError> {
    let parameter = candidate.input_in_resource_update;
    let loaded = insert_replicated_load(comp, parameter, replication_factor)?;
    comp.replace_uses_with_except(parameter, loaded.value, &[loaded.load])?;

    // A pass-through slot now returns the loaded value and needs no store.
    if candidate.input_in_resource_update == candidate.output_in_resource_update {
        return Ok(());
    }
    let store = insert_replicated_store(
        comp,
        parameter,
        candidate.output_in_resource_update,
        replication_factor,
    )?;
    let root = comp.root();
    comp.replace_operand_with(root, candidate.output_index, store)?;
    Ok(())
}

impl ModulePass for ResourceUpdateVariablesOffload {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let _span = debug_span!("variables_offload").entered();
        let fusion_bodies = fusion_computations(module);
        let mut to_optimize = Vec::new();
        for comp_id in module.computations_post_order() {
            if fusion_bodies.contains(&comp_id) {
                continue;
            }
            let comp = &module[comp_id];
            for id in comp.post_order() {
                let inst = &comp[id];
                if !matches!(
                    inst.backend_config().call_type(),
                    Some(CallType::RepeatLoop | CallType::Pipeline)
                ) {
                    continue;
                }
                let body = callee(comp, id)?;
                let body_comp = &module[body];
                let updates: Vec<InstId> = body_comp
                    .post_order()
                    .into_iter()
                    .filter(|&i| {
                        body_comp[i].backend_config().call_type() == Some(CallType::ResourceUpdate)
                    })
                    .collect();
                match updates.as_slice() {
                    [] => {}
                    [update] => {
                        if comp_id == module.entry() {
                            to_optimize.push((id, *update));
                        }
                    }
                    _ => {
                        return Err(CompileError::failed_precondition(
                            "detected multiple resource update instructions",
                        ))
                    }
                }
            }
        }

        let mut changed = false;
        for (call_op, resource_update) in to_optimize {
            changed |= self.optimize(module, annotations, call_op, resource_update)?;
        }
        Ok(changed)
    }
}
