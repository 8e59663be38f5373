//! Load and store sequences that move a replica-partitioned tensor between remote
//! memory and the full, replicated value every replica computes with.
//!
//! A tensor of `n` elements partitioned over `r` replicas is stored as `r` shards
//! of `shard_size(n, dtype, r)` elements, with the tail of the last shard padded.

use crate::backend::computation::Computation;
use crate::backend::error::CompileError;
use crate::backend::spec::{CustomOp, DType, InstId, Opcode, Shape};

/// Elements per 4-byte grain; shards are a whole number of grains.
pub fn grain_size(dtype: DType) -> usize {
    (4 / dtype.size_in_bytes()).max(1)
}

/// Elements one replica holds of an `element_count`-element tensor.
pub fn shard_size(element_count: usize, dtype: DType, replication_factor: usize) -> usize {
    let grain = grain_size(dtype);
    let rf = replication_factor.max(1);
    grain * element_count.div_ceil(grain).div_ceil(rf)
}

/// Shape of the shard a replica loads for `full`, or `full` itself when not partitioned.
pub fn remote_load_shape(full: &Shape, replication_factor: usize) -> Result<Shape, CompileError> {
    if replication_factor <= 1 {
        return Ok(full.clone());
    }
    let dtype = array_dtype(full)?;
    Ok(Shape::array(
        dtype,
        vec![shard_size(full.element_count(), dtype, replication_factor)],
    ))
}

fn array_dtype(shape: &Shape) -> Result<DType, CompileError> {
    shape
        .dtype()
        .filter(|_| shape.is_array())
        .ok_or_else(|| CompileError::structural(format!("expected an array shape, got {shape}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatedLoad {
    pub load: InstId,
    /// Final instruction of the sequence, holding the full value.
    pub value: InstId,
}

/// Appends `load -> all-gather -> [flatten -> slice] -> reshape` for `remote_buffer`.
///
/// Users of the buffer are left untouched; the caller decides which of them read the
/// loaded value instead.
pub fn insert_replicated_load(
    comp: &mut Computation,
    remote_buffer: InstId,
    replication_factor: usize,
) -> Result<ReplicatedLoad, CompileError> {
    let full = comp[remote_buffer].shape().clone();
    let load_shape = remote_load_shape(&full, replication_factor)?;
    let load = comp.add_custom(
        CustomOp::RemoteParameterLoad {
            replication_factors: vec![replication_factor.max(1)],
        },
        vec![remote_buffer],
        load_shape.clone(),
    )?;
    if replication_factor <= 1 {
        return Ok(ReplicatedLoad { load, value: load });
    }

    let value = gather_shards(comp, load, &full, replication_factor)?;
    Ok(ReplicatedLoad { load, value })
}

/// Appends `all-gather -> [flatten -> slice] -> reshape`, rebuilding the `full` value
/// from this replica's `[shard]` piece.
pub fn gather_shards(
    comp: &mut Computation,
    shard_value: InstId,
    full: &Shape,
    replication_factor: usize,
) -> Result<InstId, CompileError> {
    let dtype = array_dtype(full)?;
    let shard = comp[shard_value].shape().element_count();
    let gathered = comp.add_custom(
        CustomOp::AllGather {
            replica_group_size: replication_factor,
        },
        vec![shard_value],
        Shape::array(dtype, vec![replication_factor, shard]),
    )?;
    if replication_factor * shard == full.element_count() {
        return Ok(comp.add_reshape(gathered, full.clone())?);
    }
    let flat = comp.add_reshape(gathered, Shape::array(dtype, vec![replication_factor * shard]))?;
    let sliced = comp.add_slice(flat, vec![0], vec![full.element_count()])?;
    Ok(comp.add_reshape(sliced, full.clone())?)
}

/// `value` flattened and zero padded to `replication_factor` whole shards.
pub fn flatten_and_pad(
    comp: &mut Computation,
    value: InstId,
    replication_factor: usize,
) -> Result<InstId, CompileError> {
    let shape = comp[value].shape().clone();
    let dtype = array_dtype(&shape)?;
    let count = shape.element_count();
    let padded_count = shard_size(count, dtype, replication_factor) * replication_factor.max(1);
    let flat = if shape.dims() == [count] {
        value
    } else {
        comp.add_reshape(value, Shape::array(dtype, vec![count]))?
    };
    if padded_count == count {
        return Ok(flat);
    }
    let zero = comp.add_constant(0.0, Shape::scalar(dtype))?;
    Ok(comp.add_pad(flat, zero, vec![0], vec![padded_count - count])?)
}

/// Appends `[flatten -> pad] -> reshape -> dynamic-slice(replica) -> reshape -> store`
/// writing this replica's shard of `value` into `remote_buffer`. Returns the store.
pub fn insert_replicated_store(
    comp: &mut Computation,
    remote_buffer: InstId,
    value: InstId,
    replication_factor: usize,
) -> Result<InstId, CompileError> {
    let buffer_shape = comp[remote_buffer].shape().clone();
    let mut to_store = value;
    if replication_factor > 1 {
        let shard = shard_partitioned_value(comp, value, replication_factor)?;
        to_store = shard;
    }
    let store = comp.add_custom(
        CustomOp::RemoteParameterStore {
            replication_factors: vec![replication_factor.max(1)],
        },
        vec![remote_buffer, to_store],
        buffer_shape,
    )?;
    Ok(store)
}

/// This replica's `[shard]` slice of `value`, padding the flattened value with zeros first
/// when the shards do not cover it exactly.
pub fn shard_partitioned_value(
    comp: &mut Computation,
    value: InstId,
    replication_factor: usize,
) -> Result<InstId, CompileError> {
    let shape = comp[value].shape().clone();
    let dtype = array_dtype(&shape)?;
    let count = shape.element_count();
    let shard = shard_size(count, dtype, replication_factor);
    let padded_count = shard * replication_factor;

    let mut padded = value;
    if padded_count != count {
        let zero = comp.add_constant(0.0, Shape::scalar(dtype))?;
        let flat = comp.add_reshape(value, Shape::array(dtype, vec![count]))?;
        padded = comp.add_pad(flat, zero, vec![0], vec![padded_count - count])?;
    }
    let rows = comp.add_reshape(padded, Shape::array(dtype, vec![replication_factor, shard]))?;
    let replica = comp.add_custom(CustomOp::ReplicationIndex, Vec::new(), Shape::scalar(DType::S32))?;
    let zero_index = comp.add_constant(0.0, Shape::scalar(DType::S32))?;
    let row = comp.add_dynamic_slice(rows, &[replica, zero_index], vec![1, shard])?;
    Ok(comp.add_reshape(row, Shape::array(dtype, vec![shard]))?)
}

fn is_remote_load(comp: &Computation, id: InstId) -> bool {
    matches!(
        comp[id].custom_op(),
        Some(CustomOp::RemoteParameterLoad { .. })
    )
}

/// If `id` ends a replicated load sequence, the remote load that feeds it.
pub fn gathered_remote_load(comp: &Computation, id: InstId) -> Option<InstId> {
    let inst = &comp[id];
    if !matches!(inst.opcode(), Opcode::Reshape) {
        return None;
    }
    let mut current = inst.operand(0);
    loop {
        let producer = &comp[current];
        match producer.opcode() {
            Opcode::Slice { .. } | Opcode::Reshape => current = producer.operand(0),
            Opcode::Custom(CustomOp::AllGather { .. }) => {
                let load = producer.operand(0);
                return is_remote_load(comp, load).then_some(load);
            }
            _ => return None,
        }
    }
}

/// If `user` starts the replicated store sequence of some remote store, that store.
///
/// Follows single-user chains of the shapes [`insert_replicated_store`] emits.
pub fn replicated_store_of(comp: &Computation, user: InstId) -> Option<InstId> {
    let mut current = user;
    for _ in 0..8 {
        let inst = &comp[current];
        match inst.opcode() {
            Opcode::Custom(CustomOp::RemoteParameterStore { .. }) => return Some(current),
            Opcode::Reshape | Opcode::Pad { .. } | Opcode::DynamicSlice { .. } => {
                let [next] = inst.users() else {
                    return None;
                };
                current = *next;
            }
            _ => return None,
        }
    }
    None
}
