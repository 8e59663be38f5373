use std::collections::HashSet;
use std::fmt;
use std::ops::{Index, IndexMut};

use crate::backend::computation::{Computation, GraphError};
use crate::backend::spec::{CompId, InstId};

/// A program: computations addressed by [`CompId`] plus the designated entry computation.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    computations: Vec<Option<Computation>>,
    entry: CompId,
}

impl Module {
    /// Creates a module whose entry computation is `entry`.
    pub fn new(name: impl Into<String>, entry: Computation) -> Self {
        Self {
            name: name.into(),
            computations: vec![Some(entry)],
            entry: CompId(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> CompId {
        self.entry
    }

    pub fn set_entry(&mut self, entry: CompId) -> Result<(), GraphError> {
        self.computation(entry)?;
        self.entry = entry;
        Ok(())
    }

    pub fn entry_computation(&self) -> &Computation {
        &self[self.entry]
    }

    pub fn entry_computation_mut(&mut self) -> &mut Computation {
        let entry = self.entry;
        &mut self[entry]
    }

    pub fn computation(&self, id: CompId) -> Result<&Computation, GraphError> {
        self.computations
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(GraphError::MissingComputation(id))
    }

    pub fn computation_mut(&mut self, id: CompId) -> Result<&mut Computation, GraphError> {
        self.computations
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(GraphError::MissingComputation(id))
    }

    pub fn contains(&self, id: CompId) -> bool {
        self.computation(id).is_ok()
    }

    /// Live computations in creation order.
    pub fn computation_ids(&self) -> Vec<CompId> {
        self.computations
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| CompId(i as u32))
            .collect()
    }

    pub fn find_computation(&self, name: &str) -> Option<CompId> {
        self.computation_ids()
            .into_iter()
            .find(|id| self[*id].name() == name)
    }

    /// Adds a computation, suffixing its name if another computation already uses it.
    pub fn add_computation(&mut self, mut computation: Computation) -> CompId {
        let taken: HashSet<String> = self
            .computations
            .iter()
            .flatten()
            .map(|c| c.name().to_string())
            .collect();
        if taken.contains(computation.name()) {
            let base = computation.name().to_string();
            let mut suffix = 1usize;
            while taken.contains(&format!("{base}.{suffix}")) {
                suffix += 1;
            }
            computation.set_name(format!("{base}.{suffix}"));
        }
        self.computations.push(Some(computation));
        CompId((self.computations.len() - 1) as u32)
    }

    pub fn remove_computation(&mut self, id: CompId) -> Result<Computation, GraphError> {
        if id == self.entry {
            return Err(GraphError::RemovingRoot(self[id].name().to_string()));
        }
        self.computations
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(GraphError::MissingComputation(id))
    }

    /// Every `(computation, instruction)` that calls `callee`.
    pub fn callers(&self, callee: CompId) -> Vec<(CompId, InstId)> {
        let mut out = Vec::new();
        for comp_id in self.computation_ids() {
            for inst in self[comp_id].instructions() {
                if inst.opcode().called_computation() == Some(callee) {
                    out.push((comp_id, inst.id()));
                }
            }
        }
        out
    }

    /// Computations reachable from the entry, callees before callers.
    pub fn computations_post_order(&self) -> Vec<CompId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(self.entry, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            let Ok(comp) = self.computation(id) else {
                continue;
            };
            let mut callees: Vec<CompId> = comp
                .post_order()
                .into_iter()
                .filter_map(|inst| comp[inst].opcode().called_computation())
                .collect();
            callees.reverse();
            for callee in callees {
                if !visited.contains(&callee) {
                    stack.push((callee, false));
                }
            }
        }
        order
    }

    /// Drops computations no longer reachable from the entry. Returns how many were removed.
    pub fn remove_unreachable_computations(&mut self) -> usize {
        let reachable: HashSet<CompId> = self.computations_post_order().into_iter().collect();
        let mut removed = 0;
        for id in self.computation_ids() {
            if !reachable.contains(&id) {
                self.computations[id.index()] = None;
                removed += 1;
            }
        }
        removed
    }

    pub fn verify(&self) -> Result<(), GraphError> {
        for id in self.computation_ids() {
            let comp = &self[id];
            comp.verify()?;
            for inst in comp.instructions() {
                if let Some(callee) = inst.opcode().called_computation() {
                    self.computation(callee)?;
                }
            }
        }
        Ok(())
    }
}

impl Index<CompId> for Module {
    type Output = Computation;

    fn index(&self, id: CompId) -> &Computation {
        match self.computation(id) {
            Ok(comp) => comp,
            Err(err) => panic!("{err}"),
        }
    }
}

impl IndexMut<CompId> for Module {
    fn index_mut(&mut self, id: CompId) -> &mut Computation {
        match self.computation_mut(id) {
            Ok(comp) => comp,
            Err(err) => panic!("{err}"),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::backend::text_ir::print_module(self))
    }
}
