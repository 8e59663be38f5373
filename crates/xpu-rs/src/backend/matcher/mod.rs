//! Declarative subgraph patterns and the engine that finds and replaces them.
//!
//! A pattern is a list of nodes with the root at index 0. Operation nodes
//! constrain the opcode (and optionally the whole instruction) and name their
//! operand slots; input nodes are wildcards for values produced outside the
//! matched region. [`HloMatcher`] anchors every pattern at every instruction of
//! every non-fusion computation in post order, checks the legality of the
//! region and hands it to a [`MatchHandler`] that builds the replacement.

mod outline;

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, debug_span, trace};

use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::module::Module;
use crate::backend::spec::{CompId, InstId, Instruction, Opcode};

pub use outline::{outline_expression_from_match, OutlineHandler, FUSION_PREFIX};

pub type OpcodeFilter = fn(&Opcode) -> bool;
pub type NodePredicate = fn(&Computation, &Instruction) -> bool;

/// Where an operand of an operation node comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Another operation node of the same pattern.
    Node(usize),
    /// An input node of the same pattern. Repeating `Input(k)` requires the same instruction.
    Input(usize),
    /// Anonymous wildcard; every occurrence becomes its own region input.
    Any,
}

#[derive(Clone)]
pub enum PatternNode {
    Op {
        opcode: OpcodeFilter,
        predicate: Option<NodePredicate>,
        operands: Vec<Operand>,
    },
    Input {
        predicate: Option<NodePredicate>,
    },
}

impl std::fmt::Debug for PatternNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternNode::Op {
                predicate,
                operands,
                ..
            } => f
                .debug_struct("Op")
                .field("predicated", &predicate.is_some())
                .field("operands", operands)
                .finish(),
            PatternNode::Input { predicate } => f
                .debug_struct("Input")
                .field("predicated", &predicate.is_some())
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HloMatcherPattern {
    name: String,
    nodes: Vec<PatternNode>,
}

impl HloMatcherPattern {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn op<const N: usize>(self, opcode: OpcodeFilter, operands: [Operand; N]) -> Self {
        self.push(PatternNode::Op {
            opcode,
            predicate: None,
            operands: operands.to_vec(),
        })
    }

    pub fn op_where<const N: usize>(
        self,
        opcode: OpcodeFilter,
        predicate: NodePredicate,
        operands: [Operand; N],
    ) -> Self {
        self.push(PatternNode::Op {
            opcode,
            predicate: Some(predicate),
            operands: operands.to_vec(),
        })
    }

    pub fn input(self) -> Self {
        self.push(PatternNode::Input { predicate: None })
    }

    pub fn input_where(self, predicate: NodePredicate) -> Self {
        self.push(PatternNode::Input {
            predicate: Some(predicate),
        })
    }

    fn push(mut self, node: PatternNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[PatternNode] {
        &self.nodes
    }

    /// Rejects patterns whose root is not an operation or whose slots point at the wrong node kind.
    pub fn validate(&self) -> Result<(), CompileError> {
        let bad = |reason: String| {
            CompileError::structural(format!("pattern '{}': {reason}", self.name))
        };
        match self.nodes.first() {
            Some(PatternNode::Op { .. }) => {}
            _ => return Err(bad("root must be an operation node".into())),
        }
        for (index, node) in self.nodes.iter().enumerate() {
            let PatternNode::Op { operands, .. } = node else {
                continue;
            };
            for operand in operands {
                match *operand {
                    Operand::Node(i) => match self.nodes.get(i) {
                        Some(PatternNode::Op { .. }) if i > index => {}
                        _ => {
                            return Err(bad(format!(
                                "node {index} refers to Node({i}), which is not a later operation node"
                            )))
                        }
                    },
                    Operand::Input(k) => match self.nodes.get(k) {
                        Some(PatternNode::Input { .. }) => {}
                        _ => {
                            return Err(bad(format!(
                                "node {index} refers to Input({k}), which is not an input node"
                            )))
                        }
                    },
                    Operand::Any => {}
                }
            }
        }
        Ok(())
    }
}

/// One structural match of a pattern anchored at `nodes[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern: usize,
    pub root: InstId,
    /// Instruction bound to each operation node, indexed like the pattern nodes.
    /// Input nodes hold `None`.
    pub nodes: Vec<Option<InstId>>,
    /// Region inputs: input nodes in node order, then anonymous wildcards in visit order.
    pub inputs: Vec<InstId>,
}

impl PatternMatch {
    /// Instructions of the matched region.
    pub fn instructions(&self) -> impl Iterator<Item = InstId> + '_ {
        self.nodes.iter().flatten().copied()
    }

    pub fn node(&self, index: usize) -> Option<InstId> {
        self.nodes.get(index).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatcherConfig {
    /// Re-scan a computation from scratch after each replacement instead of
    /// skipping instructions already claimed by an earlier match.
    pub restart_after_replacement: bool,
}

/// Produces the replacement for a legal match.
pub trait MatchHandler {
    fn name(&self) -> &str;

    /// Patterns in priority order; the first legal match at an anchor wins.
    fn patterns(&self) -> &[HloMatcherPattern];

    fn config(&self) -> MatcherConfig {
        MatcherConfig::default()
    }

    /// Builds the replacement for `matched` inside `comp` and returns the instruction
    /// that takes over the root's uses, or `None` to decline the match.
    fn replace(
        &self,
        module: &mut Module,
        comp: CompId,
        matched: &PatternMatch,
    ) -> Result<Option<InstId>, CompileError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchStats {
    /// Legal matches handed to the handler.
    pub matches: usize,
    pub replacements: usize,
    /// Structural matches dropped by a legality check.
    pub rejected: usize,
}

pub struct HloMatcher<'h> {
    handler: &'h dyn MatchHandler,
}

impl<'h> HloMatcher<'h> {
    pub fn new(handler: &'h dyn MatchHandler) -> Self {
        Self { handler }
    }

    pub fn run(&self, module: &mut Module) -> Result<MatchStats, CompileError> {
        let _span = debug_span!("matcher", pass = self.handler.name()).entered();
        for pattern in self.handler.patterns() {
            pattern.validate()?;
        }
        let fusion_bodies = fusion_computations(module);
        let mut stats = MatchStats::default();
        for comp in module.computations_post_order() {
            if fusion_bodies.contains(&comp) {
                continue;
            }
            self.run_on_computation(module, comp, &mut stats)?;
        }
        if stats.replacements > 0 {
            debug!(
                matches = stats.matches,
                replacements = stats.replacements,
                rejected = stats.rejected,
                "matcher finished"
            );
        }
        Ok(stats)
    }

    fn run_on_computation(
        &self,
        module: &mut Module,
        comp: CompId,
        stats: &mut MatchStats,
    ) -> Result<(), CompileError> {
        let patterns = self.handler.patterns();
        let restart = self.handler.config().restart_after_replacement;
        let mut consumed: HashSet<InstId> = HashSet::new();
        'scan: loop {
            let order = module[comp].post_order();
            for anchor in order {
                if !module[comp].contains(anchor) || consumed.contains(&anchor) {
                    continue;
                }
                for (index, pattern) in patterns.iter().enumerate() {
                    let computation = &module[comp];
                    let Some(matched) = match_at(computation, index, pattern, anchor) else {
                        continue;
                    };
                    if let Err(reason) = check_legal(computation, &matched, &consumed) {
                        trace!(pattern = pattern.name(), anchor = %computation[anchor].name(), reason, "match rejected");
                        stats.rejected += 1;
                        continue;
                    }
                    stats.matches += 1;
                    let Some(replacement) = self.handler.replace(module, comp, &matched)? else {
                        continue;
                    };
                    replace_region(&mut module[comp], &matched, replacement)?;
                    stats.replacements += 1;
                    trace!(pattern = pattern.name(), "replaced match");
                    if restart {
                        consumed.clear();
                        continue 'scan;
                    }
                    consumed.extend(matched.instructions());
                    consumed.insert(replacement);
                    break;
                }
            }
            return Ok(());
        }
    }
}

/// Computations used as the body of a fusion instruction anywhere in the module.
pub fn fusion_computations(module: &Module) -> HashSet<CompId> {
    let mut out = HashSet::new();
    for comp in module.computation_ids() {
        for inst in module[comp].instructions() {
            if let Opcode::Fusion { computation } = inst.opcode() {
                out.insert(*computation);
            }
        }
    }
    out
}

struct Binding<'p> {
    pattern: &'p HloMatcherPattern,
    nodes: Vec<Option<InstId>>,
    inputs: BTreeMap<usize, InstId>,
    anonymous: Vec<InstId>,
}

/// Structural match of `pattern` rooted at `anchor`, without legality checks.
pub fn match_at(
    comp: &Computation,
    pattern_index: usize,
    pattern: &HloMatcherPattern,
    anchor: InstId,
) -> Option<PatternMatch> {
    let mut binding = Binding {
        pattern,
        nodes: vec![None; pattern.nodes.len()],
        inputs: BTreeMap::new(),
        anonymous: Vec::new(),
    };
    if !binding.bind_op(comp, 0, anchor) {
        return None;
    }
    let bound: HashSet<InstId> = binding.nodes.iter().flatten().copied().collect();
    let mut inputs: Vec<InstId> = Vec::new();
    for id in binding.inputs.values().chain(binding.anonymous.iter()) {
        if bound.contains(id) {
            return None;
        }
        if !inputs.contains(id) {
            inputs.push(*id);
        }
    }
    Some(PatternMatch {
        pattern: pattern_index,
        root: anchor,
        nodes: binding.nodes,
        inputs,
    })
}

impl Binding<'_> {
    fn bind_op(&mut self, comp: &Computation, index: usize, id: InstId) -> bool {
        if let Some(bound) = self.nodes[index] {
            return bound == id;
        }
        let Some(PatternNode::Op {
            opcode,
            predicate,
            operands,
        }) = self.pattern.nodes.get(index)
        else {
            return false;
        };
        let inst = &comp[id];
        if !opcode(inst.opcode()) || inst.operand_count() != operands.len() {
            return false;
        }
        if predicate.is_some_and(|p| !p(comp, inst)) {
            return false;
        }
        if self.nodes.contains(&Some(id)) {
            return false;
        }
        self.nodes[index] = Some(id);
        for (slot, &operand) in operands.iter().zip(inst.operands()) {
            let ok = match *slot {
                Operand::Node(i) => self.bind_op(comp, i, operand),
                Operand::Input(k) => self.bind_input(comp, k, operand),
                Operand::Any => {
                    self.anonymous.push(operand);
                    true
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn bind_input(&mut self, comp: &Computation, index: usize, id: InstId) -> bool {
        if let Some(&bound) = self.inputs.get(&index) {
            return bound == id;
        }
        let Some(PatternNode::Input { predicate }) = self.pattern.nodes.get(index) else {
            return false;
        };
        if predicate.is_some_and(|p| !p(comp, &comp[id])) {
            return false;
        }
        self.inputs.insert(index, id);
        true
    }
}

fn check_legal(
    comp: &Computation,
    matched: &PatternMatch,
    consumed: &HashSet<InstId>,
) -> Result<(), &'static str> {
    let region: HashSet<InstId> = matched.instructions().collect();
    if region.iter().any(|id| consumed.contains(id)) {
        return Err("overlaps an earlier match");
    }
    let root = matched.root;
    for &id in &region {
        if id == root {
            continue;
        }
        let inst = &comp[id];
        if inst.users().iter().any(|u| !region.contains(u)) || comp.is_root(id) {
            return Err("interior instruction has users outside the region");
        }
        if inst.has_control_dependencies() {
            return Err("interior instruction has control dependencies");
        }
    }
    Ok(())
}

/// Moves the root's uses and control edges to `replacement` and deletes the region.
fn replace_region(
    comp: &mut Computation,
    matched: &PatternMatch,
    replacement: InstId,
) -> Result<(), CompileError> {
    let root = matched.root;
    if root == replacement {
        return Ok(());
    }
    comp.replace_instruction(root, replacement)?;
    let mut pending: Vec<InstId> = matched.instructions().filter(|id| *id != root).collect();
    loop {
        let before = pending.len();
        let mut kept = Vec::with_capacity(pending.len());
        for id in pending {
            if comp.get(id).is_some_and(|inst| inst.users().is_empty()) {
                comp.remove_instruction(id)?;
            } else if comp.contains(id) {
                kept.push(id);
            }
        }
        pending = kept;
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }
    if !pending.is_empty() {
        return Err(CompileError::structural(format!(
            "{} matched instructions still have users after replacement",
            pending.len()
        )));
    }
    Ok(())
}

/// Opcode filters for building patterns.
pub mod filters {
    use crate::backend::spec::{BinaryOp, CustomOp, Opcode};

    pub fn add(op: &Opcode) -> bool {
        matches!(op, Opcode::Binary(BinaryOp::Add))
    }

    pub fn subtract(op: &Opcode) -> bool {
        matches!(op, Opcode::Binary(BinaryOp::Subtract))
    }

    pub fn multiply(op: &Opcode) -> bool {
        matches!(op, Opcode::Binary(BinaryOp::Multiply))
    }

    pub fn maximum(op: &Opcode) -> bool {
        matches!(op, Opcode::Binary(BinaryOp::Maximum))
    }

    pub fn broadcast(op: &Opcode) -> bool {
        matches!(op, Opcode::Broadcast { .. })
    }

    pub fn constant(op: &Opcode) -> bool {
        matches!(op, Opcode::Constant { .. })
    }

    pub fn multi_update_add(op: &Opcode) -> bool {
        matches!(op, Opcode::Custom(CustomOp::MultiUpdateAdd))
    }

    pub fn gradient_accumulator_create(op: &Opcode) -> bool {
        matches!(op, Opcode::Custom(CustomOp::GradientAccumulatorCreate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_backward_node_reference() {
        let pattern = HloMatcherPattern::new("bad")
            .op(filters::add, [Operand::Any, Operand::Node(1)])
            .op(filters::multiply, [Operand::Node(0), Operand::Any]);
        assert!(pattern.validate().is_err());
    }

    #[test]
    fn validate_rejects_input_slot_on_op_node() {
        let pattern = HloMatcherPattern::new("bad")
            .op(filters::add, [Operand::Input(1), Operand::Any])
            .op(filters::broadcast, [Operand::Any]);
        assert!(pattern.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_pattern() {
        let pattern = HloMatcherPattern::new("ok")
            .op(filters::add, [Operand::Input(1), Operand::Node(2)])
            .input()
            .op(filters::broadcast, [Operand::Any]);
        assert!(pattern.validate().is_ok());
    }
}
