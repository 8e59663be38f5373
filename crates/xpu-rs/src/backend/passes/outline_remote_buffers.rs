//! Moves the remote loads feeding a function call and the remote stores consuming its
//! results into the called function, so isomorphic calls share the load/store code.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, debug_span, trace};

use crate::backend::annotations::CompilerAnnotations;
use crate::backend::backend_config::{BackendConfig, CallType, FunctionConfig};
use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::matcher::fusion_computations;
use crate::backend::module::Module;
use crate::backend::passes::variables_offload::fix_root_instruction;
use crate::backend::pipeline::ModulePass;
use crate::backend::spec::{CompId, CustomOp, InstId, NewInstruction, Opcode, Shape};

fn single_remote_load(comp: &Computation, id: InstId) -> Option<usize> {
    match comp[id].custom_op() {
        Some(CustomOp::RemoteParameterLoad {
            replication_factors,
        }) if replication_factors.len() == 1 => Some(replication_factors[0]),
        _ => None,
    }
}

fn single_remote_store(comp: &Computation, id: InstId) -> bool {
    matches!(
        comp[id].custom_op(),
        Some(CustomOp::RemoteParameterStore { replication_factors }) if replication_factors.len() == 1
    )
}

/// How a function call's operands and results map onto remote buffers, and the
/// canonical order that puts them first.
///
/// Inputs are ordered modified loads, unmodified loads, other inputs. Outputs are
/// ordered modified stores (paired with the modified loads), other outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteBufferInputsOutputsInfos {
    inputs_old_to_new: Vec<usize>,
    inputs_new_to_old: Vec<usize>,
    outputs_old_to_new: Vec<usize>,
    outputs_new_to_old: Vec<usize>,
    replication_factors: BTreeMap<usize, usize>,
    num_modified_load_stores: usize,
    num_unmodified_loads: usize,
}

fn invert(permutation: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; permutation.len()];
    for (old, &new) in permutation.iter().enumerate() {
        inverse[new] = old;
    }
    inverse
}

impl RemoteBufferInputsOutputsInfos {
    pub fn from_call(comp: &Computation, call: InstId) -> Result<Self, CompileError> {
        let inst = &comp[call];
        let num_outputs = inst.shape().tuple_elements().len();

        // Operands that are remote loads used by nothing but this slot of the call.
        let mut load_inputs: BTreeMap<usize, usize> = BTreeMap::new();
        for (index, &operand) in inst.operands().iter().enumerate() {
            let Some(factor) = single_remote_load(comp, operand) else {
                continue;
            };
            if comp[operand].users() == [call] && inst.operand_indices(operand).len() == 1 {
                load_inputs.insert(index, factor);
            }
        }

        // Outputs whose only consumer stores them back into the buffer an input loaded.
        let mut modified: BTreeMap<usize, usize> = BTreeMap::new();
        let all_gtes = inst
            .users()
            .iter()
            .all(|&u| matches!(comp[u].opcode(), Opcode::GetTupleElement { .. }));
        if all_gtes {
            let mut readers: BTreeMap<usize, usize> = BTreeMap::new();
            for &user in inst.users() {
                if let Opcode::GetTupleElement { index } = *comp[user].opcode() {
                    *readers.entry(index).or_default() += 1;
                }
            }
            for &user in inst.users() {
                let Opcode::GetTupleElement { index: output } = *comp[user].opcode() else {
                    continue;
                };
                // The stored value must not be read anywhere else.
                if readers.get(&output) != Some(&1) {
                    continue;
                }
                let [store] = comp[user].users() else {
                    continue;
                };
                if !single_remote_store(comp, *store)
                    || comp[*store].operand_count() != 2
                    || comp[*store].operand(1) != user
                {
                    continue;
                }
                let buffer = comp[*store].operand(0);
                let paired = load_inputs
                    .keys()
                    .copied()
                    .find(|&input| comp[inst.operand(input)].operand(0) == buffer);
                if let Some(input) = paired {
                    if !modified.values().any(|&o| o == output) && !modified.contains_key(&input) {
                        modified.insert(input, output);
                    }
                }
            }
        }

        let mut inputs_new_to_old: Vec<usize> = modified.keys().copied().collect();
        inputs_new_to_old.extend(
            load_inputs
                .keys()
                .copied()
                .filter(|i| !modified.contains_key(i)),
        );
        inputs_new_to_old.extend((0..inst.operand_count()).filter(|i| !load_inputs.contains_key(i)));
        let mut outputs_new_to_old: Vec<usize> = modified.values().copied().collect();
        outputs_new_to_old.extend((0..num_outputs).filter(|o| !modified.values().any(|m| m == o)));

        if inputs_new_to_old.len() != inst.operand_count() || outputs_new_to_old.len() != num_outputs {
            return Err(CompileError::structural(format!(
                "permutation of {} does not cover its operands and outputs",
                inst.name()
            )));
        }
        Ok(Self {
            inputs_old_to_new: invert(&inputs_new_to_old),
            outputs_old_to_new: invert(&outputs_new_to_old),
            inputs_new_to_old,
            outputs_new_to_old,
            num_modified_load_stores: modified.len(),
            num_unmodified_loads: load_inputs.len() - modified.len(),
            replication_factors: load_inputs,
        })
    }

    /// Replication factor of the load feeding operand `index`, in call operand order.
    pub fn load_replication_factor(&self, index: usize) -> Option<usize> {
        self.replication_factors.get(&index).copied()
    }

    pub fn num_modified_load_stores(&self) -> usize {
        self.num_modified_load_stores
    }

    pub fn num_unmodified_loads(&self) -> usize {
        self.num_unmodified_loads
    }

    pub fn num_load_inputs(&self) -> usize {
        self.num_modified_load_stores + self.num_unmodified_loads
    }

    pub fn replication_factors(&self) -> &BTreeMap<usize, usize> {
        &self.replication_factors
    }

    pub fn inputs_old_to_new(&self) -> &[usize] {
        &self.inputs_old_to_new
    }

    pub fn inputs_new_to_old(&self) -> &[usize] {
        &self.inputs_new_to_old
    }

    pub fn outputs_old_to_new(&self) -> &[usize] {
        &self.outputs_old_to_new
    }

    pub fn outputs_new_to_old(&self) -> &[usize] {
        &self.outputs_new_to_old
    }
}

/// Function calls that call isomorphic computations with the same remote buffer layout.
pub type IsomorphicFunctions = Vec<Vec<(CompId, InstId)>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct OutlineRemoteBuffers;

impl OutlineRemoteBuffers {
    const NAME: &'static str = "outline-remote-buffers";

    pub fn new() -> Self {
        Self
    }

    /// Groups calls by callee structure and remote buffer layout, in first-seen order.
    pub fn get_functions_for_outlining(
        module: &Module,
    ) -> Result<IsomorphicFunctions, CompileError> {
        let fusion_bodies = fusion_computations(module);
        let mut keys: HashMap<(String, RemoteBufferInputsOutputsInfos), usize> = HashMap::new();
        let mut groups: IsomorphicFunctions = Vec::new();
        for comp_id in module.computations_post_order() {
            if fusion_bodies.contains(&comp_id) {
                continue;
            }
            let comp = &module[comp_id];
            for id in comp.post_order() {
                let inst = &comp[id];
                if inst.backend_config().call_type() != Some(CallType::Function)
                    || !inst.shape().is_tuple()
                {
                    continue;
                }
                let Some(callee) = inst.opcode().called_computation() else {
                    continue;
                };
                let infos = RemoteBufferInputsOutputsInfos::from_call(comp, id)?;
                if infos.num_load_inputs() == 0 {
                    continue;
                }
                let key = (module[callee].structural_key(), infos);
                let group = *keys.entry(key).or_insert_with(|| {
                    groups.push(Vec::new());
                    groups.len() - 1
                });
                groups[group].push((comp_id, id));
            }
        }
        Ok(groups)
    }
}

/// The callee rebuilt to take buffers for its loaded inputs and to store its modified
/// outputs itself.
fn outlined_function(
    module: &Module,
    comp: CompId,
    call: InstId,
    infos: &RemoteBufferInputsOutputsInfos,
) -> Result<Computation, CompileError> {
    let caller = &module[comp];
    let call_inst = &caller[call];
    let callee_id = call_inst
        .opcode()
        .called_computation()
        .ok_or_else(|| CompileError::structural(format!("{} is not a call", call_inst.name())))?;
    let callee = &module[callee_id];
    let callee_root = &callee[callee.root()];
    if !matches!(callee_root.opcode(), Opcode::Tuple) {
        return Err(CompileError::structural(format!(
            "{} does not return a tuple",
            callee.name()
        )));
    }

    let mut function = Computation::new(format!("{}.remote", callee.name()));
    let mut mapping: HashMap<InstId, InstId> = HashMap::new();
    let mut buffers: HashMap<usize, InstId> = HashMap::new();
    for (new, &old) in infos.inputs_new_to_old().iter().enumerate() {
        let old_param = callee.parameter(old).ok_or_else(|| {
            CompileError::structural(format!("{} has no parameter {old}", callee.name()))
        })?;
        let param_shape = callee[old_param].shape().clone();
        match infos.load_replication_factor(old) {
            Some(factor) => {
                let load = call_inst.operand(old);
                let buffer_shape = caller[caller[load].operand(0)].shape().clone();
                let buffer = function.add_parameter(new, buffer_shape, &format!("buffer_{new}"))?;
                let loaded = function.add_custom(
                    CustomOp::RemoteParameterLoad {
                        replication_factors: vec![factor],
                    },
                    vec![buffer],
                    param_shape,
                )?;
                buffers.insert(old, buffer);
                mapping.insert(old_param, loaded);
            }
            None => {
                let param = function.add_parameter(new, param_shape, &format!("arg_{new}"))?;
                mapping.insert(old_param, param);
            }
        }
    }

    for id in callee.post_order() {
        let inst = &callee[id];
        if inst.opcode().is_parameter() {
            continue;
        }
        let operands = inst
            .operands()
            .iter()
            .map(|op| mapping.get(op).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| CompileError::structural(format!("{} lost an operand", inst.name())))?;
        let new = function.add_instruction(
            NewInstruction::new(inst.opcode().clone(), inst.shape().clone(), operands)
                .named(inst.name())
                .with_sharding(inst.sharding().cloned())
                .with_backend_config(inst.backend_config().clone())
                .with_metadata(inst.metadata().cloned()),
        )?;
        mapping.insert(id, new);
    }

    // Pair each modified output with the input whose buffer it is stored into.
    let modified_inputs = &infos.inputs_new_to_old()[..infos.num_modified_load_stores()];
    let mut elements = Vec::with_capacity(infos.outputs_new_to_old().len());
    for (new, &old) in infos.outputs_new_to_old().iter().enumerate() {
        let value = mapping
            .get(&callee_root.operand(old))
            .copied()
            .ok_or_else(|| CompileError::structural("callee output was not cloned"))?;
        let Some(&input) = modified_inputs.get(new) else {
            elements.push(value);
            continue;
        };
        let buffer = buffers
            .get(&input)
            .copied()
            .ok_or_else(|| CompileError::structural("modified output has no buffer"))?;
        let factor = infos.load_replication_factor(input).unwrap_or(1);
        let buffer_shape = function[buffer].shape().clone();
        elements.push(function.add_custom(
            CustomOp::RemoteParameterStore {
                replication_factors: vec![factor],
            },
            vec![buffer, value],
            buffer_shape,
        )?);
    }
    let root = function.add_tuple(elements)?;
    function.set_root(root)?;
    Ok(function)
}

fn rewrite_call(
    comp: &mut Computation,
    call: InstId,
    function: CompId,
    function_shape: &Shape,
    infos: &RemoteBufferInputsOutputsInfos,
) -> Result<InstId, CompileError> {
    let loads: Vec<InstId> = infos
        .replication_factors()
        .keys()
        .map(|&i| comp[call].operand(i))
        .collect();
    let mut operands = Vec::with_capacity(comp[call].operand_count());
    for &old in infos.inputs_new_to_old() {
        let operand = comp[call].operand(old);
        operands.push(match infos.load_replication_factor(old) {
            Some(_) => comp[operand].operand(0),
            None => operand,
        });
    }
    let config = FunctionConfig {
        num_modified_remote_buffer_inputs: infos.num_modified_load_stores(),
        num_unmodified_remote_buffer_inputs: infos.num_unmodified_loads(),
        ..comp[call].backend_config().function_config()
    };
    let name = comp[call].name().to_string();
    let sharding = comp[call].sharding().cloned();
    let metadata = comp[call].metadata().cloned();
    let new_call = comp.add_instruction(
        NewInstruction::new(
            Opcode::Call {
                computation: function,
            },
            function_shape.clone(),
            operands,
        )
        .named(name)
        .with_sharding(sharding)
        .with_backend_config(BackendConfig::function(config))
        .with_metadata(metadata),
    )?;

    let mut stale = Vec::new();
    for user in comp[call].users().to_vec() {
        let Opcode::GetTupleElement { index: old } = *comp[user].opcode() else {
            return Err(CompileError::structural(format!(
                "{} is used by a non tuple element instruction",
                comp[call].name()
            )));
        };
        let new_index = infos.outputs_old_to_new()[old];
        let element = comp.add_get_tuple_element(new_call, new_index)?;
        if new_index < infos.num_modified_load_stores() {
            // The store moved inside; its users now read the call's result.
            let store = match comp[user].users() {
                [store] if single_remote_store(comp, *store) => *store,
                _ => {
                    return Err(CompileError::structural(format!(
                        "{} is a modified output but does not only feed its remote store",
                        comp[user].name()
                    )))
                }
            };
            comp.copy_control_dependencies(store, new_call)?;
            comp.drop_all_control_dependencies(store)?;
            comp.replace_all_uses_with(store, element)?;
            stale.push(store);
        } else {
            comp.replace_all_uses_with(user, element)?;
        }
        stale.push(user);
    }
    comp.copy_control_dependencies(call, new_call)?;
    comp.drop_all_control_dependencies(call)?;
    stale.push(call);
    for load in loads {
        comp.copy_control_dependencies(load, new_call)?;
        comp.drop_all_control_dependencies(load)?;
        stale.push(load);
    }
    for id in stale {
        comp.remove_instruction(id)?;
    }
    Ok(new_call)
}

impl ModulePass for OutlineRemoteBuffers {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(
        &self,
        module: &mut Module,
        _annotations: &mut CompilerAnnotations,
    ) -> Result<bool, CompileError> {
        let _span = debug_span!("outline_remote_buffers").entered();
        let groups = Self::get_functions_for_outlining(module)?;
        let mut changed = false;
        for group in groups {
            let Some(&(first_comp, first_call)) = group.first() else {
                continue;
            };
            if let Some(callee) = module[first_comp][first_call].opcode().called_computation() {
                fix_root_instruction(&mut module[callee])?;
            }
            let infos = RemoteBufferInputsOutputsInfos::from_call(&module[first_comp], first_call)?;
            let function = outlined_function(module, first_comp, first_call, &infos)?;
            let function_shape = function[function.root()].shape().clone();
            let function = module.add_computation(function);
            trace!(
                function = %module[function].name(),
                calls = group.len(),
                modified = infos.num_modified_load_stores(),
                unmodified = infos.num_unmodified_loads(),
                "outlined remote buffer function"
            );
            for (comp, call) in group {
                let infos = RemoteBufferInputsOutputsInfos::from_call(&module[comp], call)?;
                rewrite_call(&mut module[comp], call, function, &function_shape, &infos)?;
            }
            changed = true;
        }
        if changed {
            debug!("outlined remote buffer loads and stores into functions");
        }
        Ok(changed)
    }
}
