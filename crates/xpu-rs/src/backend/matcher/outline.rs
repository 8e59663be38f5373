use std::collections::{HashMap, HashSet};

use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::matcher::{HloMatcherPattern, MatchHandler, MatcherConfig, PatternMatch};
use crate::backend::module::Module;
use crate::backend::spec::{CompId, InstId, NewInstruction, Opcode};

/// Prefix of computations created by outlining a matched region.
pub const FUSION_PREFIX: &str = "_pop_op_";

/// Copies the matched region into a new `_pop_op_<name>` computation and adds a
/// `fusion` call to it in `comp`. The caller rewires the root's users.
pub fn outline_expression_from_match(
    module: &mut Module,
    comp: CompId,
    matched: &PatternMatch,
    name: &str,
) -> Result<InstId, CompileError> {
    let source = &module[comp];
    let region: HashSet<InstId> = matched.instructions().collect();
    let mut body = Computation::new(format!("{FUSION_PREFIX}{name}"));
    let mut mapping: HashMap<InstId, InstId> = HashMap::new();

    for (number, &input) in matched.inputs.iter().enumerate() {
        let param = body.add_parameter(
            number,
            source[input].shape().clone(),
            &format!("arg_{number}"),
        )?;
        mapping.insert(input, param);
    }

    for id in source.post_order() {
        if !region.contains(&id) {
            continue;
        }
        let inst = &source[id];
        let operands = inst
            .operands()
            .iter()
            .map(|op| {
                mapping.get(op).copied().ok_or_else(|| {
                    CompileError::structural(format!(
                        "operand {} of {} is neither in the region nor an input",
                        source[*op].name(),
                        inst.name()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let cloned = body.add_instruction(
            NewInstruction::new(inst.opcode().clone(), inst.shape().clone(), operands)
                .named(inst.name())
                .with_metadata(inst.metadata().cloned()),
        )?;
        mapping.insert(id, cloned);
    }
    let body_root = mapping
        .get(&matched.root)
        .copied()
        .ok_or_else(|| CompileError::structural("matched root was not outlined"))?;
    body.set_root(body_root)?;

    let root = &source[matched.root];
    let shape = root.shape().clone();
    let sharding = root.sharding().cloned();
    let metadata = root.metadata().cloned();

    let callee = module.add_computation(body);
    let fusion = NewInstruction::new(
        Opcode::Fusion {
            computation: callee,
        },
        shape,
        matched.inputs.clone(),
    )
    .named(name)
    .with_sharding(sharding)
    .with_metadata(metadata);
    Ok(module[comp].add_instruction(fusion)?)
}

/// Match handler that outlines every legal match of its patterns into a fusion.
#[derive(Debug, Clone)]
pub struct OutlineHandler {
    name: String,
    patterns: Vec<HloMatcherPattern>,
    config: MatcherConfig,
}

impl OutlineHandler {
    pub fn new(name: impl Into<String>, patterns: Vec<HloMatcherPattern>) -> Self {
        Self {
            name: name.into(),
            patterns,
            config: MatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MatcherConfig) -> Self {
        self.config = config;
        self
    }
}

impl MatchHandler for OutlineHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn patterns(&self) -> &[HloMatcherPattern] {
        &self.patterns
    }

    fn config(&self) -> MatcherConfig {
        self.config
    }

    fn replace(
        &self,
        module: &mut Module,
        comp: CompId,
        matched: &PatternMatch,
    ) -> Result<Option<InstId>, CompileError> {
        let pattern = self
            .patterns
            .get(matched.pattern)
            .ok_or_else(|| CompileError::structural("match refers to an unknown pattern"))?;
        outline_expression_from_match(module, comp, matched, pattern.name()).map(Some)
    }
}
