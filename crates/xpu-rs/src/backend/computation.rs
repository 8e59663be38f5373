use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Index;

use smallvec::SmallVec;
use thiserror::Error;

use crate::backend::backend_config::BackendConfig;
use crate::backend::spec::{
    BinaryOp, CompId, ComparisonDirection, CustomOp, DType, InstId, Instruction, NewInstruction,
    Opcode, Shape, UnaryOp,
};

/// Failures of the graph construction and mutation API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("instruction {id} does not exist in computation `{computation}`")]
    MissingInstruction { id: InstId, computation: String },
    #[error("computation {0:?} does not exist")]
    MissingComputation(CompId),
    #[error("instruction `{name}` still has {users} user(s)")]
    HasUsers { name: String, users: usize },
    #[error("instruction `{0}` still has control dependencies")]
    HasControlDependencies(String),
    #[error("cannot remove root instruction `{0}`")]
    RemovingRoot(String),
    #[error("cannot replace `{old}` ({old_shape}) with `{new}` ({new_shape}): shapes differ")]
    ShapeMismatch {
        old: String,
        new: String,
        old_shape: String,
        new_shape: String,
    },
    #[error("operand {index} out of range for `{name}`")]
    OperandOutOfRange { name: String, index: usize },
    #[error("invalid shape for `{op}`: {reason}")]
    InvalidShape { op: &'static str, reason: String },
    #[error("computation `{0}` contains a cycle")]
    Cycle(String),
    #[error("computation `{0}` has no root instruction")]
    NoRoot(String),
    #[error("derived edges of `{0}` are out of sync with its operands")]
    Desynchronized(String),
}

/// An ordered arena of instructions with one designated root.
///
/// Removal leaves a tombstone in the slot, so ids held by a pass stay
/// meaningful (`contains` turns false) while it keeps walking the graph.
#[derive(Debug, Clone)]
pub struct Computation {
    name: String,
    slots: Vec<Option<Instruction>>,
    root: Option<InstId>,
    used_names: HashSet<String>,
}

impl Computation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            root: None,
            used_names: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Root instruction. An empty computation reports id 0, which `verify` rejects.
    pub fn root(&self) -> InstId {
        self.root.unwrap_or(InstId(0))
    }

    pub fn set_root(&mut self, root: InstId) -> Result<(), GraphError> {
        self.check(root)?;
        self.root = Some(root);
        Ok(())
    }

    pub fn is_root(&self, id: InstId) -> bool {
        self.root == Some(id)
    }

    pub fn contains(&self, id: InstId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }

    pub fn get(&self, id: InstId) -> Option<&Instruction> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: InstId) -> Result<&mut Instruction, GraphError> {
        let computation = &self.name;
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| GraphError::MissingInstruction {
                id,
                computation: computation.clone(),
            })
    }

    fn check(&self, id: InstId) -> Result<&Instruction, GraphError> {
        self.get(id).ok_or_else(|| GraphError::MissingInstruction {
            id,
            computation: self.name.clone(),
        })
    }

    /// Live instructions in creation order.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn instruction_ids(&self) -> Vec<InstId> {
        self.instructions().map(Instruction::id).collect()
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions().count()
    }

    pub fn find(&self, name: &str) -> Option<InstId> {
        self.instructions().find(|i| i.name == name).map(|i| i.id)
    }

    pub fn parameter(&self, number: usize) -> Option<InstId> {
        self.instructions()
            .find(|i| i.opcode.parameter_number() == Some(number))
            .map(|i| i.id)
    }

    /// Parameters ordered by parameter number.
    pub fn parameters(&self) -> Vec<InstId> {
        let mut params: Vec<(usize, InstId)> = self
            .instructions()
            .filter_map(|i| i.opcode.parameter_number().map(|n| (n, i.id)))
            .collect();
        params.sort();
        params.into_iter().map(|(_, id)| id).collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().len()
    }

    fn unique_name(&mut self, base: &str) -> String {
        if self.used_names.insert(base.to_string()) {
            return base.to_string();
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{base}.{suffix}");
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Adds an instruction; the first instruction of an empty computation becomes its root.
    pub fn add_instruction(&mut self, new: NewInstruction) -> Result<InstId, GraphError> {
        for &operand in &new.operands {
            self.check(operand)?;
        }
        let id = InstId(self.slots.len() as u32);
        let base = new
            .name
            .unwrap_or_else(|| new.opcode.mnemonic().to_string());
        let name = self.unique_name(&base);
        let operands = new.operands;
        self.slots.push(Some(Instruction {
            id,
            name,
            opcode: new.opcode,
            shape: new.shape,
            operands: operands.clone(),
            users: SmallVec::new(),
            control_predecessors: Vec::new(),
            control_successors: Vec::new(),
            sharding: new.sharding,
            backend_config: new.backend_config,
            metadata: new.metadata,
        }));
        for operand in operands {
            self.add_user(operand, id)?;
        }
        if self.root.is_none() {
            self.root = Some(id);
        }
        Ok(id)
    }

    fn add_user(&mut self, operand: InstId, user: InstId) -> Result<(), GraphError> {
        let inst = self.get_mut(operand)?;
        if !inst.users.contains(&user) {
            inst.users.push(user);
        }
        Ok(())
    }

    fn remove_user_if_unused(&mut self, operand: InstId, user: InstId) -> Result<(), GraphError> {
        let still_used = self.check(user)?.operands.contains(&operand);
        if !still_used {
            self.get_mut(operand)?.users.retain(|u| *u != user);
        }
        Ok(())
    }

    pub fn set_sharding(
        &mut self,
        id: InstId,
        sharding: Option<crate::backend::spec::Sharding>,
    ) -> Result<(), GraphError> {
        self.get_mut(id)?.sharding = sharding;
        Ok(())
    }

    pub fn set_backend_config(
        &mut self,
        id: InstId,
        config: BackendConfig,
    ) -> Result<(), GraphError> {
        self.get_mut(id)?.backend_config = config;
        Ok(())
    }

    pub fn set_metadata(
        &mut self,
        id: InstId,
        metadata: Option<crate::backend::spec::OpMetadata>,
    ) -> Result<(), GraphError> {
        self.get_mut(id)?.metadata = metadata;
        Ok(())
    }

    /// Renames an instruction, suffixing the name if it is already taken.
    pub fn rename(&mut self, id: InstId, name: &str) -> Result<(), GraphError> {
        self.check(id)?;
        let name = self.unique_name(name);
        self.get_mut(id)?.name = name;
        Ok(())
    }

    fn check_same_shape(&self, old: InstId, new: InstId) -> Result<(), GraphError> {
        let old_inst = self.check(old)?;
        let new_inst = self.check(new)?;
        if old_inst.shape != new_inst.shape {
            return Err(GraphError::ShapeMismatch {
                old: old_inst.name.clone(),
                new: new_inst.name.clone(),
                old_shape: old_inst.shape.to_string(),
                new_shape: new_inst.shape.to_string(),
            });
        }
        Ok(())
    }

    pub fn replace_operand_with(
        &mut self,
        user: InstId,
        operand_number: usize,
        new_operand: InstId,
    ) -> Result<(), GraphError> {
        let user_inst = self.check(user)?;
        let Some(&old_operand) = user_inst.operands.get(operand_number) else {
            return Err(GraphError::OperandOutOfRange {
                name: user_inst.name.clone(),
                index: operand_number,
            });
        };
        if old_operand == new_operand {
            return Ok(());
        }
        self.check_same_shape(old_operand, new_operand)?;
        self.get_mut(user)?.operands[operand_number] = new_operand;
        self.remove_user_if_unused(old_operand, user)?;
        self.add_user(new_operand, user)
    }

    /// Rewires every use of `old` by users outside `except` to `new`. Returns the number of users rewired.
    pub fn replace_uses_with_except(
        &mut self,
        old: InstId,
        new: InstId,
        except: &[InstId],
    ) -> Result<usize, GraphError> {
        if old == new {
            return Ok(0);
        }
        self.check_same_shape(old, new)?;
        let users: Vec<InstId> = self
            .check(old)?
            .users
            .iter()
            .copied()
            .filter(|u| !except.contains(u))
            .collect();
        for &user in &users {
            let positions = self.check(user)?.operand_indices(old);
            for position in positions {
                self.replace_operand_with(user, position, new)?;
            }
        }
        Ok(users.len())
    }

    /// Rewires all users of `old` to `new`, moving the root if `old` was the root.
    pub fn replace_all_uses_with(&mut self, old: InstId, new: InstId) -> Result<(), GraphError> {
        self.replace_uses_with_except(old, new, &[])?;
        if self.root == Some(old) {
            self.root = Some(new);
        }
        Ok(())
    }

    /// Replaces `old` with `new` everywhere, moves its control edges to `new` and removes `old`.
    pub fn replace_instruction(&mut self, old: InstId, new: InstId) -> Result<(), GraphError> {
        self.replace_all_uses_with(old, new)?;
        self.copy_control_dependencies(old, new)?;
        self.drop_all_control_dependencies(old)?;
        self.remove_instruction(old)?;
        Ok(())
    }

    /// Adds an ordering edge: `from` executes before `to`.
    pub fn add_control_dependency(&mut self, from: InstId, to: InstId) -> Result<(), GraphError> {
        self.check(from)?;
        let to_inst = self.get_mut(to)?;
        if !to_inst.control_predecessors.contains(&from) {
            to_inst.control_predecessors.push(from);
        }
        let from_inst = self.get_mut(from)?;
        if !from_inst.control_successors.contains(&to) {
            from_inst.control_successors.push(to);
        }
        Ok(())
    }

    pub fn remove_control_dependency(&mut self, from: InstId, to: InstId) -> Result<(), GraphError> {
        self.get_mut(to)?.control_predecessors.retain(|p| *p != from);
        self.get_mut(from)?.control_successors.retain(|s| *s != to);
        Ok(())
    }

    pub fn drop_all_control_dependencies(&mut self, id: InstId) -> Result<(), GraphError> {
        let inst = self.check(id)?;
        let preds = inst.control_predecessors.clone();
        let succs = inst.control_successors.clone();
        for pred in preds {
            self.remove_control_dependency(pred, id)?;
        }
        for succ in succs {
            self.remove_control_dependency(id, succ)?;
        }
        Ok(())
    }

    /// Gives `to` the same control predecessors and successors as `from`.
    pub fn copy_control_dependencies(&mut self, from: InstId, to: InstId) -> Result<(), GraphError> {
        let inst = self.check(from)?;
        let preds = inst.control_predecessors.clone();
        let succs = inst.control_successors.clone();
        for pred in preds {
            if pred != to {
                self.add_control_dependency(pred, to)?;
            }
        }
        for succ in succs {
            if succ != to {
                self.add_control_dependency(to, succ)?;
            }
        }
        Ok(())
    }

    /// Tombstones an instruction with no users, no control edges and that is not the root.
    pub fn remove_instruction(&mut self, id: InstId) -> Result<Instruction, GraphError> {
        let inst = self.check(id)?;
        if !inst.users.is_empty() {
            return Err(GraphError::HasUsers {
                name: inst.name.clone(),
                users: inst.users.len(),
            });
        }
        if inst.has_control_dependencies() {
            return Err(GraphError::HasControlDependencies(inst.name.clone()));
        }
        if self.root == Some(id) {
            return Err(GraphError::RemovingRoot(inst.name.clone()));
        }
        let removed = self.slots[id.index()]
            .take()
            .ok_or_else(|| GraphError::MissingInstruction {
                id,
                computation: self.name.clone(),
            })?;
        let mut seen = HashSet::new();
        for &operand in &removed.operands {
            if seen.insert(operand) {
                self.get_mut(operand)?.users.retain(|u| *u != id);
            }
        }
        Ok(removed)
    }

    /// Removes `id` and then any operand left without users, parameters excluded.
    pub fn remove_instruction_and_unused_operands(&mut self, id: InstId) -> Result<usize, GraphError> {
        let mut removed = 0usize;
        let mut worklist = vec![id];
        while let Some(current) = worklist.pop() {
            let Some(inst) = self.get(current) else {
                continue;
            };
            if !inst.users.is_empty()
                || inst.has_control_dependencies()
                || self.root == Some(current)
                || (current != id
                    && (inst.opcode.has_side_effect() || inst.opcode.is_parameter()))
            {
                continue;
            }
            let instruction = self.remove_instruction(current)?;
            removed += 1;
            for operand in instruction.operands.into_iter().rev() {
                worklist.push(operand);
            }
        }
        Ok(removed)
    }

    fn dependencies(inst: &Instruction) -> impl DoubleEndedIterator<Item = InstId> + '_ {
        inst.operands
            .iter()
            .chain(inst.control_predecessors.iter())
            .copied()
    }

    /// Topological order over operand and control edges; creation order breaks ties.
    pub fn post_order(&self) -> Vec<InstId> {
        const UNVISITED: u8 = 0;
        const VISITING: u8 = 1;
        const DONE: u8 = 2;

        let mut state = vec![UNVISITED; self.slots.len()];
        let mut order = Vec::with_capacity(self.slots.len());
        let mut stack: Vec<(InstId, bool)> = Vec::new();
        for start in self.instruction_ids() {
            if state[start.index()] != UNVISITED {
                continue;
            }
            stack.push((start, false));
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    if state[id.index()] != DONE {
                        state[id.index()] = DONE;
                        order.push(id);
                    }
                    continue;
                }
                if state[id.index()] != UNVISITED {
                    continue;
                }
                state[id.index()] = VISITING;
                stack.push((id, true));
                if let Some(inst) = self.get(id) {
                    for dep in Self::dependencies(inst).rev() {
                        if state[dep.index()] == UNVISITED {
                            stack.push((dep, false));
                        }
                    }
                }
            }
        }
        order
    }

    /// Structural fingerprint used to deduplicate outlined computations.
    ///
    /// Names are ignored; instructions are identified by their post-order position.
    pub fn structural_key(&self) -> String {
        let order = self.post_order();
        let position: HashMap<InstId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut key = String::new();
        for id in &order {
            let inst = &self[*id];
            let operands: Vec<String> = inst
                .operands
                .iter()
                .map(|op| position[op].to_string())
                .collect();
            let sharding = inst
                .sharding
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default();
            key.push_str(&format!(
                "{:?}|{}|{}|{}|{};",
                inst.opcode,
                inst.shape,
                operands.join(","),
                sharding,
                if self.is_root(*id) { "root" } else { "" }
            ));
        }
        key
    }

    /// Recomputes the derived edge caches and checks them, the root and acyclicity.
    pub fn verify(&self) -> Result<(), GraphError> {
        let root = self.root.ok_or_else(|| GraphError::NoRoot(self.name.clone()))?;
        self.check(root)?;

        let mut users: HashMap<InstId, HashSet<InstId>> = HashMap::new();
        let mut successors: HashMap<InstId, HashSet<InstId>> = HashMap::new();
        for inst in self.instructions() {
            for &operand in &inst.operands {
                self.check(operand)?;
                users.entry(operand).or_default().insert(inst.id);
            }
            for &pred in &inst.control_predecessors {
                self.check(pred)?;
                successors.entry(pred).or_default().insert(inst.id);
            }
        }
        for inst in self.instructions() {
            let cached_users: HashSet<InstId> = inst.users.iter().copied().collect();
            let cached_succs: HashSet<InstId> = inst.control_successors.iter().copied().collect();
            if cached_users != users.remove(&inst.id).unwrap_or_default()
                || cached_users.len() != inst.users.len()
                || cached_succs != successors.remove(&inst.id).unwrap_or_default()
            {
                return Err(GraphError::Desynchronized(inst.name.clone()));
            }
        }

        // Kahn's algorithm over operand and control edges.
        let mut in_degree: HashMap<InstId, usize> = HashMap::new();
        for inst in self.instructions() {
            let mut deps: HashSet<InstId> = inst.operands.iter().copied().collect();
            deps.extend(inst.control_predecessors.iter().copied());
            in_degree.insert(inst.id, deps.len());
        }
        let mut ready: VecDeque<InstId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = ready.pop_front() {
            visited += 1;
            let inst = &self[id];
            let mut dependents: HashSet<InstId> = inst.users.iter().copied().collect();
            dependents.extend(inst.control_successors.iter().copied());
            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }
        if visited != in_degree.len() {
            return Err(GraphError::Cycle(self.name.clone()));
        }
        Ok(())
    }
}

/// Typed factories used by passes when they emit replacement fragments.
impl Computation {
    pub fn add_parameter(
        &mut self,
        number: usize,
        shape: Shape,
        name: &str,
    ) -> Result<InstId, GraphError> {
        self.add_instruction(
            NewInstruction::new(Opcode::Parameter { number }, shape, Vec::new()).named(name),
        )
    }

    pub fn add_constant(&mut self, value: f64, shape: Shape) -> Result<InstId, GraphError> {
        self.add_instruction(NewInstruction::new(
            Opcode::Constant { value },
            shape,
            Vec::new(),
        ))
    }

    pub fn add_tuple(&mut self, operands: Vec<InstId>) -> Result<InstId, GraphError> {
        let mut shapes = Vec::with_capacity(operands.len());
        for &operand in &operands {
            shapes.push(self.check(operand)?.shape.clone());
        }
        self.add_instruction(NewInstruction::new(
            Opcode::Tuple,
            Shape::tuple(shapes),
            operands,
        ))
    }

    pub fn add_get_tuple_element(
        &mut self,
        operand: InstId,
        index: usize,
    ) -> Result<InstId, GraphError> {
        let tuple = self.check(operand)?;
        let shape = tuple
            .shape
            .tuple_element(index)
            .cloned()
            .ok_or_else(|| GraphError::InvalidShape {
                op: "get-tuple-element",
                reason: format!("`{}` has no tuple element {index}", tuple.name),
            })?;
        self.add_instruction(NewInstruction::new(
            Opcode::GetTupleElement { index },
            shape,
            vec![operand],
        ))
    }

    pub fn add_unary(&mut self, op: UnaryOp, operand: InstId) -> Result<InstId, GraphError> {
        let shape = self.check(operand)?.shape.clone();
        self.add_instruction(NewInstruction::new(Opcode::Unary(op), shape, vec![operand]))
    }

    pub fn add_binary(
        &mut self,
        op: BinaryOp,
        lhs: InstId,
        rhs: InstId,
    ) -> Result<InstId, GraphError> {
        let shape = self.check(lhs)?.shape.clone();
        let rhs_shape = &self.check(rhs)?.shape;
        if shape.dims() != rhs_shape.dims() {
            return Err(GraphError::InvalidShape {
                op: "binary",
                reason: format!("operand shapes {shape} and {rhs_shape} differ"),
            });
        }
        self.add_instruction(NewInstruction::new(
            Opcode::Binary(op),
            shape,
            vec![lhs, rhs],
        ))
    }

    pub fn add_compare(
        &mut self,
        direction: ComparisonDirection,
        lhs: InstId,
        rhs: InstId,
    ) -> Result<InstId, GraphError> {
        let shape = self.check(lhs)?.shape.with_dtype(DType::Pred);
        self.add_instruction(NewInstruction::new(
            Opcode::Compare(direction),
            shape,
            vec![lhs, rhs],
        ))
    }

    pub fn add_convert(&mut self, operand: InstId, dtype: DType) -> Result<InstId, GraphError> {
        let shape = self.check(operand)?.shape.with_dtype(dtype);
        self.add_instruction(NewInstruction::new(Opcode::Convert, shape, vec![operand]))
    }

    pub fn add_broadcast(
        &mut self,
        operand: InstId,
        shape: Shape,
        dims: Vec<usize>,
    ) -> Result<InstId, GraphError> {
        self.add_instruction(NewInstruction::new(
            Opcode::Broadcast { dims },
            shape,
            vec![operand],
        ))
    }

    pub fn add_reshape(&mut self, operand: InstId, shape: Shape) -> Result<InstId, GraphError> {
        let source = self.check(operand)?;
        if source.shape.element_count() != shape.element_count() || source.shape.is_tuple() {
            return Err(GraphError::InvalidShape {
                op: "reshape",
                reason: format!("cannot reshape {} to {shape}", source.shape),
            });
        }
        self.add_instruction(NewInstruction::new(Opcode::Reshape, shape, vec![operand]))
    }

    pub fn add_slice(
        &mut self,
        operand: InstId,
        starts: Vec<usize>,
        limits: Vec<usize>,
    ) -> Result<InstId, GraphError> {
        let source = self.check(operand)?;
        let dims = source.shape.dims();
        if starts.len() != dims.len()
            || limits.len() != dims.len()
            || starts
                .iter()
                .zip(limits.iter())
                .zip(dims.iter())
                .any(|((s, l), d)| s > l || l > d)
        {
            return Err(GraphError::InvalidShape {
                op: "slice",
                reason: format!("bounds {starts:?}..{limits:?} do not fit {}", source.shape),
            });
        }
        let out_dims: Vec<usize> = starts.iter().zip(limits.iter()).map(|(s, l)| l - s).collect();
        let shape = source.shape.with_dims(out_dims);
        self.add_instruction(NewInstruction::new(
            Opcode::Slice { starts, limits },
            shape,
            vec![operand],
        ))
    }

    pub fn add_pad(
        &mut self,
        operand: InstId,
        padding_value: InstId,
        low: Vec<usize>,
        high: Vec<usize>,
    ) -> Result<InstId, GraphError> {
        let source = self.check(operand)?;
        let dims = source.shape.dims();
        if low.len() != dims.len() || high.len() != dims.len() {
            return Err(GraphError::InvalidShape {
                op: "pad",
                reason: format!("padding rank does not match {}", source.shape),
            });
        }
        let out_dims: Vec<usize> = dims
            .iter()
            .zip(low.iter().zip(high.iter()))
            .map(|(d, (l, h))| d + l + h)
            .collect();
        let shape = source.shape.with_dims(out_dims);
        self.add_instruction(NewInstruction::new(
            Opcode::Pad { low, high },
            shape,
            vec![operand, padding_value],
        ))
    }

    pub fn add_dynamic_slice(
        &mut self,
        operand: InstId,
        start_indices: &[InstId],
        sizes: Vec<usize>,
    ) -> Result<InstId, GraphError> {
        let source = self.check(operand)?;
        if start_indices.len() != source.shape.rank() || sizes.len() != source.shape.rank() {
            return Err(GraphError::InvalidShape {
                op: "dynamic-slice",
                reason: format!("index rank does not match {}", source.shape),
            });
        }
        let shape = source.shape.with_dims(sizes.clone());
        let mut operands = vec![operand];
        operands.extend_from_slice(start_indices);
        self.add_instruction(NewInstruction::new(
            Opcode::DynamicSlice { sizes },
            shape,
            operands,
        ))
    }

    pub fn add_concatenate(
        &mut self,
        operands: Vec<InstId>,
        dim: usize,
    ) -> Result<InstId, GraphError> {
        let Some(&first) = operands.first() else {
            return Err(GraphError::InvalidShape {
                op: "concatenate",
                reason: "no operands".to_string(),
            });
        };
        let base = self.check(first)?.shape.clone();
        let mut dims = base.dims().to_vec();
        if dim >= dims.len() {
            return Err(GraphError::InvalidShape {
                op: "concatenate",
                reason: format!("dimension {dim} out of range for {base}"),
            });
        }
        dims[dim] = 0;
        for &operand in &operands {
            dims[dim] += self.check(operand)?.shape.dims().get(dim).copied().unwrap_or(0);
        }
        self.add_instruction(NewInstruction::new(
            Opcode::Concatenate { dim },
            base.with_dims(dims),
            operands,
        ))
    }

    pub fn add_call(
        &mut self,
        computation: CompId,
        operands: Vec<InstId>,
        shape: Shape,
        config: BackendConfig,
    ) -> Result<InstId, GraphError> {
        self.add_instruction(
            NewInstruction::new(Opcode::Call { computation }, shape, operands)
                .with_backend_config(config),
        )
    }

    pub fn add_custom(
        &mut self,
        op: CustomOp,
        operands: Vec<InstId>,
        shape: Shape,
    ) -> Result<InstId, GraphError> {
        self.add_instruction(NewInstruction::new(Opcode::Custom(op), shape, operands))
    }
}

impl Index<InstId> for Computation {
    type Output = Instruction;

    fn index(&self, id: InstId) -> &Instruction {
        match self.get(id) {
            Some(inst) => inst,
            None => panic!("instruction {id} is not live in computation `{}`", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32v(n: usize) -> Shape {
        Shape::array(DType::F32, vec![n])
    }

    #[test]
    fn users_follow_operand_rewrites() {
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, f32v(4), "a").unwrap();
        let b = comp.add_parameter(1, f32v(4), "b").unwrap();
        let add = comp.add_binary(BinaryOp::Add, a, a).unwrap();
        comp.set_root(add).unwrap();
        assert_eq!(comp[a].users(), &[add]);

        comp.replace_operand_with(add, 0, b).unwrap();
        assert_eq!(comp[a].users(), &[add], "operand 1 still reads `a`");
        comp.replace_operand_with(add, 1, b).unwrap();
        assert!(comp[a].users().is_empty());
        assert_eq!(comp[b].users(), &[add]);
        comp.verify().unwrap();
    }

    #[test]
    fn removal_leaves_tombstone() {
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, f32v(4), "a").unwrap();
        let neg = comp.add_unary(UnaryOp::Negate, a).unwrap();
        let root = comp.add_unary(UnaryOp::Abs, a).unwrap();
        comp.set_root(root).unwrap();

        assert!(matches!(
            comp.remove_instruction(a),
            Err(GraphError::HasUsers { .. })
        ));
        comp.remove_instruction(neg).unwrap();
        assert!(!comp.contains(neg));
        assert_eq!(comp[a].users(), &[root]);
        let next = comp.add_unary(UnaryOp::Exp, a).unwrap();
        assert!(next > neg, "ids are never reused");
    }

    #[test]
    fn post_order_respects_control_edges() {
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, f32v(4), "a").unwrap();
        let late = comp.add_unary(UnaryOp::Exp, a).unwrap();
        let early = comp.add_unary(UnaryOp::Log, a).unwrap();
        let root = comp.add_tuple(vec![late, early]).unwrap();
        comp.set_root(root).unwrap();
        comp.add_control_dependency(early, late).unwrap();

        let order = comp.post_order();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(early) < pos(late));
        assert_eq!(*order.last().unwrap(), root);
        comp.verify().unwrap();
    }

    #[test]
    fn control_cycle_is_reported() {
        let mut comp = Computation::new("c");
        let a = comp.add_parameter(0, f32v(4), "a").unwrap();
        let x = comp.add_unary(UnaryOp::Exp, a).unwrap();
        comp.set_root(x).unwrap();
        comp.add_control_dependency(x, a).unwrap();
        assert_eq!(comp.verify(), Err(GraphError::Cycle("c".to_string())));
    }
}
