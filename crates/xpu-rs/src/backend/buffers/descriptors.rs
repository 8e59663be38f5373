use std::collections::{BTreeMap, BTreeSet};

use crate::backend::buffers::{
    BufferDescription, BufferError, BufferLocality, BufferUseKind, Use, UseDescription,
};
use crate::backend::computation::Computation;
use crate::backend::spec::{CustomOp, InstId, Instruction, Opcode, ShapeIndex};

/// The five queries every instruction kind answers about its buffers.
pub trait InstructionDescriptor: Sync {
    /// Operands that need a fresh allocation planned by this instruction.
    fn allocating_indices(&self, _comp: &Computation, _inst: &Instruction) -> BTreeSet<usize> {
        BTreeSet::new()
    }

    /// Whether the output needs a fresh allocation rather than aliasing an input.
    fn allocating_output(&self, _comp: &Computation, _inst: &Instruction) -> bool {
        true
    }

    /// Operand index whose layout should follow another operand's layout.
    fn layout_dependencies(&self, _comp: &Computation, _inst: &Instruction) -> BTreeMap<usize, usize> {
        BTreeMap::new()
    }

    fn use_descriptions(&self, comp: &Computation, inst: &Instruction) -> Vec<UseDescription> {
        no_alias_uses(comp, inst, 0..inst.operand_count())
    }

    fn buffer_descriptions(&self, _comp: &Computation, inst: &Instruction) -> Vec<BufferDescription> {
        local_outputs(inst)
    }
}

fn no_alias_uses(
    comp: &Computation,
    inst: &Instruction,
    operands: std::ops::Range<usize>,
) -> Vec<UseDescription> {
    let mut out = Vec::new();
    for operand_number in operands {
        let operand = &comp[inst.operand(operand_number)];
        for leaf in operand.shape().leaf_indices() {
            out.push(UseDescription::no_alias(operand_number, leaf));
        }
    }
    out
}

fn local_outputs(inst: &Instruction) -> Vec<BufferDescription> {
    inst.shape()
        .leaf_indices()
        .into_iter()
        .map(|output_index| BufferDescription {
            output_index,
            locality: BufferLocality::Local,
        })
        .collect()
}

/// Parameters, constants and other operand-free sources.
struct Source;
impl InstructionDescriptor for Source {}

/// Default for computing ops: reads every operand, writes a fresh output.
struct Compute;
impl InstructionDescriptor for Compute {}

struct TupleKind;
impl InstructionDescriptor for TupleKind {
    fn allocating_output(&self, _comp: &Computation, _inst: &Instruction) -> bool {
        false
    }

    fn use_descriptions(&self, comp: &Computation, inst: &Instruction) -> Vec<UseDescription> {
        let mut out = Vec::new();
        for (operand_number, &operand) in inst.operands().iter().enumerate() {
            for leaf in comp[operand].shape().leaf_indices() {
                let mut output_index = ShapeIndex::from_slice(&[operand_number]);
                output_index.extend_from_slice(&leaf);
                out.push(UseDescription::new(
                    operand_number,
                    leaf,
                    output_index,
                    BufferUseKind::AliasReadOnly,
                ));
            }
        }
        out
    }

    fn buffer_descriptions(&self, _comp: &Computation, _inst: &Instruction) -> Vec<BufferDescription> {
        Vec::new()
    }
}

struct GetTupleElementKind;
impl InstructionDescriptor for GetTupleElementKind {
    fn allocating_output(&self, _comp: &Computation, _inst: &Instruction) -> bool {
        false
    }

    fn use_descriptions(&self, _comp: &Computation, inst: &Instruction) -> Vec<UseDescription> {
        let Opcode::GetTupleElement { index } = inst.opcode() else {
            return Vec::new();
        };
        inst.shape()
            .leaf_indices()
            .into_iter()
            .map(|leaf| {
                let mut operand_index = ShapeIndex::from_slice(&[*index]);
                operand_index.extend_from_slice(&leaf);
                UseDescription::new(0, operand_index, leaf, BufferUseKind::AliasReadOnly)
            })
            .collect()
    }

    fn buffer_descriptions(&self, _comp: &Computation, _inst: &Instruction) -> Vec<BufferDescription> {
        Vec::new()
    }
}

/// Reshapes are views of their operand.
struct View;
impl InstructionDescriptor for View {
    fn allocating_output(&self, _comp: &Computation, _inst: &Instruction) -> bool {
        false
    }

    fn use_descriptions(&self, _comp: &Computation, _inst: &Instruction) -> Vec<UseDescription> {
        vec![UseDescription::new(
            0,
            ShapeIndex::new(),
            ShapeIndex::new(),
            BufferUseKind::AliasReadOnly,
        )]
    }

    fn buffer_descriptions(&self, _comp: &Computation, _inst: &Instruction) -> Vec<BufferDescription> {
        Vec::new()
    }
}

/// Updates operand 0 in place; `layout_source` operands follow operand 0's layout.
struct InPlace {
    allocates_operand: bool,
    layout_source: Option<usize>,
}

impl InstructionDescriptor for InPlace {
    fn allocating_indices(&self, _comp: &Computation, _inst: &Instruction) -> BTreeSet<usize> {
        if self.allocates_operand {
            BTreeSet::from([0])
        } else {
            BTreeSet::new()
        }
    }

    fn allocating_output(&self, _comp: &Computation, _inst: &Instruction) -> bool {
        false
    }

    fn layout_dependencies(&self, _comp: &Computation, _inst: &Instruction) -> BTreeMap<usize, usize> {
        self.layout_source.map(|src| (src, 0)).into_iter().collect()
    }

    fn use_descriptions(&self, comp: &Computation, inst: &Instruction) -> Vec<UseDescription> {
        let mut out = vec![UseDescription::new(
            0,
            ShapeIndex::new(),
            ShapeIndex::new(),
            BufferUseKind::AliasReadWrite,
        )];
        out.extend(no_alias_uses(comp, inst, 1..inst.operand_count()));
        out
    }

    fn buffer_descriptions(&self, _comp: &Computation, _inst: &Instruction) -> Vec<BufferDescription> {
        Vec::new()
    }
}

struct DynamicSliceKind;
impl InstructionDescriptor for DynamicSliceKind {
    fn allocating_indices(&self, _comp: &Computation, _inst: &Instruction) -> BTreeSet<usize> {
        BTreeSet::from([0])
    }
}

/// Remote loads read buffers that live off-chip into fresh on-device tensors.
struct RemoteLoad;
impl InstructionDescriptor for RemoteLoad {}

/// Remote stores write each value into its buffer in place; the outputs are the buffers.
struct RemoteStore;
impl InstructionDescriptor for RemoteStore {
    fn allocating_output(&self, _comp: &Computation, _inst: &Instruction) -> bool {
        false
    }

    fn use_descriptions(&self, comp: &Computation, inst: &Instruction) -> Vec<UseDescription> {
        let num_buffers = remote_buffer_count(inst);
        let mut out: Vec<UseDescription> = (0..num_buffers)
            .map(|i| {
                let output_index = if num_buffers == 1 {
                    ShapeIndex::new()
                } else {
                    ShapeIndex::from_slice(&[i])
                };
                UseDescription::new(
                    i,
                    ShapeIndex::new(),
                    output_index,
                    BufferUseKind::AliasReadWrite,
                )
            })
            .collect();
        out.extend(no_alias_uses(comp, inst, num_buffers..inst.operand_count()));
        out
    }

    fn buffer_descriptions(&self, _comp: &Computation, inst: &Instruction) -> Vec<BufferDescription> {
        inst.shape()
            .leaf_indices()
            .into_iter()
            .map(|output_index| BufferDescription {
                output_index,
                locality: BufferLocality::Remote,
            })
            .collect()
    }
}

/// Number of remote-buffer operands of a remote load or store.
pub fn remote_buffer_count(inst: &Instruction) -> usize {
    inst.custom_op()
        .and_then(CustomOp::replication_factors)
        .map(<[usize]>::len)
        .unwrap_or(0)
}

static SOURCE: Source = Source;
static COMPUTE: Compute = Compute;
static TUPLE: TupleKind = TupleKind;
static GTE: GetTupleElementKind = GetTupleElementKind;
static VIEW: View = View;
static DYNAMIC_SLICE: DynamicSliceKind = DynamicSliceKind;
static DYNAMIC_UPDATE_SLICE: InPlace = InPlace {
    allocates_operand: true,
    layout_source: Some(1),
};
static MULTI_UPDATE: InPlace = InPlace {
    allocates_operand: true,
    layout_source: None,
};
static ACCUMULATOR_ADD: InPlace = InPlace {
    allocates_operand: false,
    layout_source: Some(1),
};
static REMOTE_LOAD: RemoteLoad = RemoteLoad;
static REMOTE_STORE: RemoteStore = RemoteStore;

/// Dispatch table from instruction kind to its descriptor.
pub fn descriptor_for(opcode: &Opcode) -> &'static dyn InstructionDescriptor {
    match opcode {
        Opcode::Parameter { .. } | Opcode::Constant { .. } => &SOURCE,
        Opcode::Tuple => &TUPLE,
        Opcode::GetTupleElement { .. } => &GTE,
        Opcode::Reshape => &VIEW,
        Opcode::DynamicSlice { .. } => &DYNAMIC_SLICE,
        Opcode::DynamicUpdateSlice => &DYNAMIC_UPDATE_SLICE,
        Opcode::Custom(op) => match op {
            CustomOp::RemoteParameterLoad { .. } | CustomOp::BufferLoadSlice { .. } => {
                &REMOTE_LOAD
            }
            CustomOp::RemoteParameterStore { .. } | CustomOp::BufferStoreSlice { .. } => {
                &REMOTE_STORE
            }
            CustomOp::MultiUpdate | CustomOp::MultiUpdateAdd => &MULTI_UPDATE,
            CustomOp::GradientAccumulatorAdd => &ACCUMULATOR_ADD,
            CustomOp::ReplicationIndex | CustomOp::RecvFromHost | CustomOp::SendRecvBarrier => {
                &SOURCE
            }
            CustomOp::AllGather { .. }
            | CustomOp::ReduceScatter { .. }
            | CustomOp::GradientAccumulatorCreate
            | CustomOp::SendToHost => &COMPUTE,
        },
        Opcode::Unary(_)
        | Opcode::Binary(_)
        | Opcode::Compare(_)
        | Opcode::Select
        | Opcode::Convert
        | Opcode::Broadcast { .. }
        | Opcode::Slice { .. }
        | Opcode::Pad { .. }
        | Opcode::Concatenate { .. }
        | Opcode::Call { .. }
        | Opcode::Fusion { .. }
        | Opcode::AllReduce => &COMPUTE,
    }
}

pub fn allocating_indices(comp: &Computation, id: InstId) -> BTreeSet<usize> {
    let inst = &comp[id];
    descriptor_for(inst.opcode()).allocating_indices(comp, inst)
}

pub fn allocating_output(comp: &Computation, id: InstId) -> bool {
    let inst = &comp[id];
    descriptor_for(inst.opcode()).allocating_output(comp, inst)
}

pub fn layout_dependencies(comp: &Computation, id: InstId) -> BTreeMap<usize, usize> {
    let inst = &comp[id];
    descriptor_for(inst.opcode()).layout_dependencies(comp, inst)
}

pub fn use_descriptions(comp: &Computation, id: InstId) -> Vec<UseDescription> {
    let inst = &comp[id];
    descriptor_for(inst.opcode()).use_descriptions(comp, inst)
}

pub fn buffer_descriptions(comp: &Computation, id: InstId) -> Vec<BufferDescription> {
    let inst = &comp[id];
    descriptor_for(inst.opcode()).buffer_descriptions(comp, inst)
}

/// Groups the use descriptions of `id` into uses, one per (operand, operand index, kind).
pub fn uses(comp: &Computation, id: InstId) -> Result<Vec<Use>, BufferError> {
    let inst = &comp[id];
    let mut grouped: BTreeMap<(usize, ShapeIndex, BufferUseKind), Vec<ShapeIndex>> =
        BTreeMap::new();
    for description in use_descriptions(comp, id) {
        let outputs = grouped
            .entry((
                description.operand_number,
                description.operand_index.clone(),
                description.kind,
            ))
            .or_default();
        if description.kind.is_alias() {
            outputs.push(description.output_index);
        }
    }
    grouped
        .into_iter()
        .map(|((operand_number, operand_index, kind), output_indices)| match kind {
            BufferUseKind::NoAlias => Ok(Use::NoAlias {
                instruction: id,
                operand_number,
                operand_index,
            }),
            BufferUseKind::AliasReadOnly | BufferUseKind::AliasReadWrite => Use::alias(
                id,
                inst.name(),
                operand_number,
                operand_index,
                output_indices,
                kind == BufferUseKind::AliasReadWrite,
            ),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::shape_index;
    use crate::hlo_module;

    const UPDATE_AND_STORE: &str = r#"
HloModule update_and_store

ENTRY %main {
  %buf = f32[8] parameter(0)
  %x = f32[8] parameter(1)
  %upd = f32[2] parameter(2)
  %i = s32[] constant(0)
  %load = f32[8] remote-parameter-load(%buf), replication_factors={1}
  %sum = f32[8] add(%load, %x)
  %t = (f32[8], f32[8]) tuple(%sum, %x)
  %g = f32[8] get-tuple-element(%t), index=0
  %dus = f32[8] dynamic-update-slice(%g, %upd, %i)
  %store = f32[8] remote-parameter-store(%buf, %dus), replication_factors={1}
  ROOT %r = (f32[8]) tuple(%store)
}
"#;

    #[test]
    fn tuples_and_elements_forward_read_only() {
        let module = hlo_module!(UPDATE_AND_STORE);
        let comp = module.entry_computation();
        let t = comp.find("t").unwrap();
        let g = comp.find("g").unwrap();

        assert!(!allocating_output(comp, t));
        assert_eq!(
            use_descriptions(comp, t),
            vec![
                UseDescription::new(0, shape_index(&[]), shape_index(&[0]), BufferUseKind::AliasReadOnly),
                UseDescription::new(1, shape_index(&[]), shape_index(&[1]), BufferUseKind::AliasReadOnly),
            ]
        );
        assert!(buffer_descriptions(comp, t).is_empty());
        assert_eq!(
            uses(comp, g).unwrap(),
            vec![Use::Alias {
                instruction: g,
                operand_number: 0,
                operand_index: shape_index(&[0]),
                output_indices: vec![shape_index(&[])],
                read_write: false,
            }]
        );
    }

    #[test]
    fn store_writes_its_buffer_in_place() {
        let module = hlo_module!(UPDATE_AND_STORE);
        let comp = module.entry_computation();
        let store = comp.find("store").unwrap();

        assert_eq!(remote_buffer_count(&comp[store]), 1);
        assert!(!allocating_output(comp, store));
        assert_eq!(
            uses(comp, store).unwrap(),
            vec![
                Use::Alias {
                    instruction: store,
                    operand_number: 0,
                    operand_index: shape_index(&[]),
                    output_indices: vec![shape_index(&[])],
                    read_write: true,
                },
                Use::NoAlias {
                    instruction: store,
                    operand_number: 1,
                    operand_index: shape_index(&[]),
                },
            ]
        );
        assert_eq!(
            buffer_descriptions(comp, store),
            vec![BufferDescription {
                output_index: shape_index(&[]),
                locality: BufferLocality::Remote,
            }]
        );
    }

    #[test]
    fn update_slice_follows_the_layout_of_its_target() {
        let module = hlo_module!(UPDATE_AND_STORE);
        let comp = module.entry_computation();
        let dus = comp.find("dus").unwrap();

        assert_eq!(allocating_indices(comp, dus), BTreeSet::from([0]));
        assert_eq!(layout_dependencies(comp, dus), BTreeMap::from([(1, 0)]));
        let kinds: Vec<_> = uses(comp, dus).unwrap().iter().map(Use::kind).collect();
        assert_eq!(
            kinds,
            [
                BufferUseKind::AliasReadWrite,
                BufferUseKind::NoAlias,
                BufferUseKind::NoAlias
            ]
        );
    }

    #[test]
    fn compute_reads_operands_into_a_fresh_output() {
        let module = hlo_module!(UPDATE_AND_STORE);
        let comp = module.entry_computation();
        let sum = comp.find("sum").unwrap();
        let load = comp.find("load").unwrap();

        assert!(allocating_output(comp, sum));
        assert!(allocating_indices(comp, sum).is_empty());
        assert!(uses(comp, sum)
            .unwrap()
            .iter()
            .all(|u| u.kind() == BufferUseKind::NoAlias));
        assert_eq!(
            buffer_descriptions(comp, load),
            vec![BufferDescription {
                output_index: shape_index(&[]),
                locality: BufferLocality::Local,
            }]
        );
    }
}
