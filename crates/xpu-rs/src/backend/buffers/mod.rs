//! Buffer and use descriptors.
//!
//! Every instruction kind answers the same five queries (allocating indices,
//! allocating output, layout dependencies, use descriptions and buffer
//! descriptions) through [`descriptors::descriptor_for`]. [`BufferAnalysis`]
//! folds those answers into per-output buffer sets for a whole computation.

mod analysis;
pub mod descriptors;

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::backend::spec::{format_shape_index, InstId, ShapeIndex};

pub use analysis::{remote_buffer_parameters, BufferAnalysis};
pub use descriptors::{
    allocating_indices, allocating_output, buffer_descriptions, descriptor_for,
    layout_dependencies, use_descriptions, uses, InstructionDescriptor,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("alias use of operand {operand_number} by `{instruction}` lists no output index")]
    EmptyAliasOutputs {
        instruction: String,
        operand_number: usize,
    },
    #[error("expected a unique buffer, found {0}")]
    NotUnique(usize),
    #[error("no buffer set for output {index} of {instruction}")]
    MissingLeaf { instruction: InstId, index: String },
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferLocality {
    /// Fast on-device working memory.
    Local,
    /// Off-chip storage, only reachable through explicit loads and stores.
    Remote,
}

impl fmt::Display for BufferLocality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferLocality::Local => f.write_str("DeviceMemory"),
            BufferLocality::Remote => f.write_str("RemoteMemory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferUseKind {
    NoAlias,
    AliasReadOnly,
    AliasReadWrite,
}

impl BufferUseKind {
    pub fn is_alias(self) -> bool {
        self != BufferUseKind::NoAlias
    }
}

/// Opcode-level statement that operand `operand_number` at `operand_index`
/// is used by the output at `output_index` with the given kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UseDescription {
    pub operand_number: usize,
    pub operand_index: ShapeIndex,
    pub output_index: ShapeIndex,
    pub kind: BufferUseKind,
}

impl UseDescription {
    pub fn new(
        operand_number: usize,
        operand_index: ShapeIndex,
        output_index: ShapeIndex,
        kind: BufferUseKind,
    ) -> Self {
        Self {
            operand_number,
            operand_index,
            output_index,
            kind,
        }
    }

    pub fn no_alias(operand_number: usize, operand_index: ShapeIndex) -> Self {
        Self::new(
            operand_number,
            operand_index,
            ShapeIndex::new(),
            BufferUseKind::NoAlias,
        )
    }
}

impl fmt::Display for UseDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "alias {:?} from operand {} index {} to output index {}",
            self.kind,
            self.operand_number,
            format_shape_index(&self.operand_index),
            format_shape_index(&self.output_index)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescription {
    pub output_index: ShapeIndex,
    pub locality: BufferLocality,
}

/// A use bound to a concrete instruction. Alias uses always name at least one output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Use {
    NoAlias {
        instruction: InstId,
        operand_number: usize,
        operand_index: ShapeIndex,
    },
    Alias {
        instruction: InstId,
        operand_number: usize,
        operand_index: ShapeIndex,
        output_indices: Vec<ShapeIndex>,
        read_write: bool,
    },
}

impl Use {
    pub fn alias(
        instruction: InstId,
        instruction_name: &str,
        operand_number: usize,
        operand_index: ShapeIndex,
        output_indices: Vec<ShapeIndex>,
        read_write: bool,
    ) -> Result<Self, BufferError> {
        if output_indices.is_empty() {
            return Err(BufferError::EmptyAliasOutputs {
                instruction: instruction_name.to_string(),
                operand_number,
            });
        }
        Ok(Use::Alias {
            instruction,
            operand_number,
            operand_index,
            output_indices,
            read_write,
        })
    }

    pub fn operand_number(&self) -> usize {
        match self {
            Use::NoAlias { operand_number, .. } | Use::Alias { operand_number, .. } => {
                *operand_number
            }
        }
    }

    pub fn kind(&self) -> BufferUseKind {
        match self {
            Use::NoAlias { .. } => BufferUseKind::NoAlias,
            Use::Alias {
                read_write: false, ..
            } => BufferUseKind::AliasReadOnly,
            Use::Alias {
                read_write: true, ..
            } => BufferUseKind::AliasReadWrite,
        }
    }
}

/// (instruction, output sub-index) pair; ordered by instruction id, then index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferPosition {
    pub instruction: InstId,
    pub index: ShapeIndex,
}

pub type BufferId = usize;

/// Logical storage unit created by its defining position.
#[derive(Debug, Clone)]
pub struct Buffer {
    id: BufferId,
    defining_position: BufferPosition,
    locality: BufferLocality,
}

impl Buffer {
    pub fn new(id: BufferId, defining_position: BufferPosition, locality: BufferLocality) -> Self {
        Self {
            id,
            defining_position,
            locality,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn defining_position(&self) -> &BufferPosition {
        &self.defining_position
    }

    pub fn locality(&self) -> BufferLocality {
        self.locality
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.defining_position == other.defining_position
    }
}

impl Eq for Buffer {}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Id {} {}{}, locality {}",
            self.id,
            self.defining_position.instruction,
            format_shape_index(&self.defining_position.index),
            self.locality
        )
    }
}

/// Candidate buffers of one output position, sorted by id without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferSet {
    buffers: Vec<Buffer>,
}

impl BufferSet {
    pub fn new(buffers: impl IntoIterator<Item = Buffer>) -> Self {
        let mut buffers: Vec<Buffer> = buffers.into_iter().collect();
        buffers.sort_by_key(Buffer::id);
        buffers.dedup_by_key(|b| b.id());
        Self { buffers }
    }

    /// Inserts `buffer` at its sorted position; false if a buffer with that id is present.
    pub fn add(&mut self, buffer: Buffer) -> bool {
        match self.buffers.binary_search_by_key(&buffer.id(), Buffer::id) {
            Ok(_) => false,
            Err(pos) => {
                self.buffers.insert(pos, buffer);
                true
            }
        }
    }

    pub fn unique(&self) -> Result<&Buffer, BufferError> {
        match self.buffers.as_slice() {
            [only] => Ok(only),
            other => Err(BufferError::NotUnique(other.len())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn is_remote(&self) -> bool {
        !self.buffers.is_empty()
            && self
                .buffers
                .iter()
                .all(|b| b.locality() == BufferLocality::Remote)
    }
}

/// Buffer sets for every leaf of one instruction's output shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionBufferSet {
    leaves: BTreeMap<ShapeIndex, BufferSet>,
}

impl InstructionBufferSet {
    pub fn set_output_buffer_set(&mut self, index: ShapeIndex, set: BufferSet) {
        self.leaves.insert(index, set);
    }

    pub fn output_buffer_set(&self, index: &[usize]) -> Option<&BufferSet> {
        self.leaves.get(&ShapeIndex::from_slice(index))
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&ShapeIndex, &BufferSet)> {
        self.leaves.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::shape_index;

    fn buffer(id: usize) -> Buffer {
        Buffer::new(
            id,
            BufferPosition {
                instruction: InstId(id as u32),
                index: ShapeIndex::new(),
            },
            BufferLocality::Local,
        )
    }

    #[test]
    fn buffer_set_is_sorted_and_unique() {
        let mut set = BufferSet::new(vec![buffer(3), buffer(1), buffer(3)]);
        assert_eq!(set.iter().map(Buffer::id).collect::<Vec<_>>(), vec![1, 3]);
        assert!(set.add(buffer(2)));
        assert!(!set.add(buffer(1)));
        assert_eq!(set.iter().map(Buffer::id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(set.unique(), Err(BufferError::NotUnique(3)));
    }

    #[test]
    fn alias_use_requires_output_index() {
        let err = Use::alias(InstId(4), "store", 0, ShapeIndex::new(), Vec::new(), true);
        assert!(matches!(err, Err(BufferError::EmptyAliasOutputs { .. })));
        let ok = Use::alias(InstId(4), "store", 0, ShapeIndex::new(), vec![shape_index(&[])], true)
            .unwrap();
        assert_eq!(ok.kind(), BufferUseKind::AliasReadWrite);
    }
}
