use std::collections::HashSet;

use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::matcher::{filters, HloMatcherPattern, Operand};
use crate::backend::spec::{Instruction, Opcode};

/// Single-op fusions known to the backend, in match priority order.
///
/// Built once and handed to the passes that need it; nothing registers itself.
#[derive(Debug, Clone, Default)]
pub struct FusionRegistry {
    patterns: Vec<HloMatcherPattern>,
}

impl FusionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every fusion the backend ships with.
    pub fn with_builtin_fusions() -> Self {
        let mut registry = Self::new();
        registry.patterns.push(scaled_inplace());
        registry.patterns.push(relu());
        registry
    }

    pub fn register(&mut self, pattern: HloMatcherPattern) -> Result<&mut Self, CompileError> {
        pattern.validate()?;
        let taken: HashSet<&str> = self.patterns.iter().map(|p| p.name()).collect();
        if taken.contains(pattern.name()) {
            return Err(CompileError::structural(format!(
                "fusion '{}' is already registered",
                pattern.name()
            )));
        }
        self.patterns.push(pattern);
        Ok(self)
    }

    pub fn patterns(&self) -> &[HloMatcherPattern] {
        &self.patterns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(HloMatcherPattern::name)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn broadcasts_scalar(comp: &Computation, inst: &Instruction) -> bool {
    comp[inst.operand(0)].shape().is_scalar()
}

fn is_zero(_: &Computation, inst: &Instruction) -> bool {
    matches!(inst.opcode(), Opcode::Constant { value } if *value == 0.0) && inst.shape().is_scalar()
}

/// `x + y * broadcast(scalar)`
fn scaled_inplace() -> HloMatcherPattern {
    HloMatcherPattern::new("scaled_inplace")
        .op(filters::add, [Operand::Input(1), Operand::Node(2)])
        .input()
        .op(filters::multiply, [Operand::Input(3), Operand::Node(4)])
        .input()
        .op_where(filters::broadcast, broadcasts_scalar, [Operand::Input(5)])
        .input()
}

/// `max(x, broadcast(0))`
fn relu() -> HloMatcherPattern {
    HloMatcherPattern::new("relu")
        .op(filters::maximum, [Operand::Input(1), Operand::Node(2)])
        .input()
        .op(filters::broadcast, [Operand::Node(3)])
        .op_where(filters::constant, is_zero, [])
}
