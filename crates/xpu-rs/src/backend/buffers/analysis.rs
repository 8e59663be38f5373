use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::backend::buffers::descriptors::{descriptor_for, remote_buffer_count};
use crate::backend::buffers::{
    Buffer, BufferError, BufferLocality, BufferPosition, BufferSet, InstructionBufferSet,
};
use crate::backend::computation::Computation;
use crate::backend::spec::{InstId, ShapeIndex};

/// Parameter numbers of `comp` that are consumed as remote buffers by a load or store.
pub fn remote_buffer_parameters(comp: &Computation) -> BTreeSet<usize> {
    let mut out = BTreeSet::new();
    for inst in comp.instructions() {
        let buffers = remote_buffer_count(inst);
        for &operand in inst.operands().iter().take(buffers) {
            if let Some(number) = comp[operand].opcode().parameter_number() {
                out.insert(number);
            }
        }
    }
    out
}

/// Per-output buffer sets of one computation, derived from the instruction descriptors.
#[derive(Debug, Clone, Default)]
pub struct BufferAnalysis {
    buffers: Vec<Buffer>,
    sets: HashMap<InstId, InstructionBufferSet>,
}

impl BufferAnalysis {
    /// Parameters listed in `remote_parameters` define remote buffers; everything else
    /// takes its locality from the buffer descriptions of the defining instruction.
    pub fn run(
        comp: &Computation,
        remote_parameters: &BTreeSet<usize>,
    ) -> Result<Self, BufferError> {
        let mut analysis = BufferAnalysis::default();
        for id in comp.post_order() {
            let inst = &comp[id];
            let descriptor = descriptor_for(inst.opcode());
            let mut set = InstructionBufferSet::default();

            for description in descriptor.use_descriptions(comp, inst) {
                if !description.kind.is_alias() {
                    continue;
                }
                let operand = inst.operand(description.operand_number);
                let source = analysis
                    .sets
                    .get(&operand)
                    .and_then(|s| s.output_buffer_set(&description.operand_index))
                    .cloned()
                    .ok_or_else(|| BufferError::MissingLeaf {
                        instruction: operand,
                        index: format!("{:?}", description.operand_index.as_slice()),
                    })?;
                set.set_output_buffer_set(description.output_index, source);
            }

            let localities: HashMap<ShapeIndex, BufferLocality> = descriptor
                .buffer_descriptions(comp, inst)
                .into_iter()
                .map(|d| (d.output_index, d.locality))
                .collect();
            let is_remote_parameter = inst
                .opcode()
                .parameter_number()
                .is_some_and(|n| remote_parameters.contains(&n));
            for leaf in inst.shape().leaf_indices() {
                if set.output_buffer_set(&leaf).is_some() {
                    continue;
                }
                let locality = if is_remote_parameter {
                    BufferLocality::Remote
                } else {
                    localities
                        .get(&leaf)
                        .copied()
                        .unwrap_or(BufferLocality::Local)
                };
                let buffer = Buffer::new(
                    analysis.buffers.len(),
                    BufferPosition {
                        instruction: id,
                        index: leaf.clone(),
                    },
                    locality,
                );
                trace!(buffer = %buffer, "defined buffer");
                analysis.buffers.push(buffer.clone());
                set.set_output_buffer_set(leaf, BufferSet::new([buffer]));
            }
            analysis.sets.insert(id, set);
        }
        Ok(analysis)
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn instruction_buffer_set(&self, id: InstId) -> Option<&InstructionBufferSet> {
        self.sets.get(&id)
    }

    pub fn buffer_set(&self, id: InstId, index: &[usize]) -> Option<&BufferSet> {
        self.sets.get(&id).and_then(|s| s.output_buffer_set(index))
    }

    pub fn unique_buffer(&self, id: InstId, index: &[usize]) -> Result<&Buffer, BufferError> {
        self.buffer_set(id, index)
            .ok_or_else(|| BufferError::MissingLeaf {
                instruction: id,
                index: format!("{index:?}"),
            })?
            .unique()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlo_module;

    const UPDATE_AND_STORE: &str = r#"
HloModule update_and_store

ENTRY %main {
  %buf = f32[8] parameter(0)
  %x = f32[8] parameter(1)
  %load = f32[8] remote-parameter-load(%buf), replication_factors={1}
  %sum = f32[8] add(%load, %x)
  %t = (f32[8], f32[8]) tuple(%sum, %x)
  %g = f32[8] get-tuple-element(%t), index=0
  %store = f32[8] remote-parameter-store(%buf, %g), replication_factors={1}
  ROOT %r = (f32[8], f32[8]) tuple(%store, %g)
}
"#;

    #[test]
    fn stored_buffers_are_remote_parameters() {
        let module = hlo_module!(UPDATE_AND_STORE);
        let comp = module.entry_computation();
        assert_eq!(remote_buffer_parameters(comp), BTreeSet::from([0]));
    }

    #[test]
    fn aliases_share_the_defining_buffer() {
        let module = hlo_module!(UPDATE_AND_STORE);
        let comp = module.entry_computation();
        let analysis = BufferAnalysis::run(comp, &remote_buffer_parameters(comp)).unwrap();
        let find = |name: &str| comp.find(name).unwrap();
        let buffer = |name: &str, index: &[usize]| {
            analysis.unique_buffer(find(name), index).unwrap().clone()
        };

        // buf, x, load and sum define buffers; the rest alias them.
        assert_eq!(analysis.buffers().len(), 4);

        let remote = buffer("buf", &[]);
        assert_eq!(remote.locality(), BufferLocality::Remote);
        assert_eq!(buffer("store", &[]), remote);
        assert_eq!(buffer("r", &[0]), remote);
        assert_eq!(buffer("load", &[]).locality(), BufferLocality::Local);

        let sum = buffer("sum", &[]);
        assert_eq!(buffer("t", &[0]), sum);
        assert_eq!(buffer("g", &[]), sum);
        assert_eq!(buffer("r", &[1]), sum);
        assert_eq!(buffer("t", &[1]), buffer("x", &[]));
        assert_eq!(sum.defining_position().instruction, find("sum"));
    }

    #[test]
    fn missing_outputs_are_reported() {
        let module = hlo_module!(UPDATE_AND_STORE);
        let comp = module.entry_computation();
        let analysis = BufferAnalysis::run(comp, &BTreeSet::new()).unwrap();
        let t = comp.find("t").unwrap();
        assert!(matches!(
            analysis.unique_buffer(t, &[2]),
            Err(BufferError::MissingLeaf { .. })
        ));
        // Without remote parameters the buffer stays on device.
        let buf = comp.find("buf").unwrap();
        assert_eq!(
            analysis.unique_buffer(buf, &[]).unwrap().locality(),
            BufferLocality::Local
        );
    }
}
