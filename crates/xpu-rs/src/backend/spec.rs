use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::backend::backend_config::BackendConfig;

/// Identifier of an instruction inside its owning [`Computation`](crate::backend::computation::Computation).
///
/// Ids are handed out in creation order and never reused, so they double as
/// the stable tie-break for every deterministic traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstId(pub u32);

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a computation owned by a [`Module`](crate::backend::module::Module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompId(pub u32);

impl CompId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Element types understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    Pred,
    S32,
    U32,
    F16,
    F32,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Pred => 1,
            DType::F16 => 2,
            DType::S32 | DType::U32 | DType::F32 => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::F32)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Pred => "pred",
            DType::S32 => "s32",
            DType::U32 => "u32",
            DType::F16 => "f16",
            DType::F32 => "f32",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "pred" => Some(DType::Pred),
            "s32" => Some(DType::S32),
            "u32" => Some(DType::U32),
            "f16" => Some(DType::F16),
            "f32" => Some(DType::F32),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Path to a sub-shape of a (possibly nested) tuple shape. Empty for the whole value.
pub type ShapeIndex = SmallVec<[usize; 2]>;

pub fn shape_index(path: &[usize]) -> ShapeIndex {
    ShapeIndex::from_slice(path)
}

pub fn format_shape_index(index: &[usize]) -> String {
    let parts: Vec<String> = index.iter().map(|i| i.to_string()).collect();
    format!("{{{}}}", parts.join(","))
}

/// Output shape of an instruction: a dense array or a tuple of shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    Array { dtype: DType, dims: Vec<usize> },
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(dtype: DType, dims: impl Into<Vec<usize>>) -> Self {
        Shape::Array {
            dtype,
            dims: dims.into(),
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Shape::Array {
            dtype,
            dims: Vec::new(),
        }
    }

    pub fn tuple(elements: Vec<Shape>) -> Self {
        Shape::Tuple(elements)
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Shape::Array { .. })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Shape::Array { dims, .. } if dims.is_empty())
    }

    pub fn dtype(&self) -> Option<DType> {
        match self {
            Shape::Array { dtype, .. } => Some(*dtype),
            Shape::Tuple(_) => None,
        }
    }

    /// Dimensions of an array shape; empty for scalars and tuples.
    pub fn dims(&self) -> &[usize] {
        match self {
            Shape::Array { dims, .. } => dims,
            Shape::Tuple(_) => &[],
        }
    }

    pub fn rank(&self) -> usize {
        self.dims().len()
    }

    /// Number of elements, summed over all leaves for tuples.
    pub fn element_count(&self) -> usize {
        match self {
            Shape::Array { dims, .. } => dims.iter().product(),
            Shape::Tuple(elements) => elements.iter().map(Shape::element_count).sum(),
        }
    }

    pub fn byte_size(&self) -> usize {
        match self {
            Shape::Array { dtype, .. } => self.element_count() * dtype.size_in_bytes(),
            Shape::Tuple(elements) => elements.iter().map(Shape::byte_size).sum(),
        }
    }

    pub fn tuple_elements(&self) -> &[Shape] {
        match self {
            Shape::Tuple(elements) => elements,
            Shape::Array { .. } => &[],
        }
    }

    pub fn tuple_element(&self, index: usize) -> Option<&Shape> {
        self.tuple_elements().get(index)
    }

    pub fn subshape(&self, index: &[usize]) -> Option<&Shape> {
        let mut current = self;
        for &i in index {
            current = current.tuple_element(i)?;
        }
        Some(current)
    }

    /// All non-tuple leaf positions in depth-first order.
    pub fn leaf_indices(&self) -> Vec<ShapeIndex> {
        fn walk(shape: &Shape, prefix: &mut ShapeIndex, out: &mut Vec<ShapeIndex>) {
            match shape {
                Shape::Array { .. } => out.push(prefix.clone()),
                Shape::Tuple(elements) => {
                    for (i, element) in elements.iter().enumerate() {
                        prefix.push(i);
                        walk(element, prefix, out);
                        prefix.pop();
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut ShapeIndex::new(), &mut out);
        out
    }

    /// Same element type with new dimensions. Tuples are returned unchanged.
    pub fn with_dims(&self, dims: impl Into<Vec<usize>>) -> Shape {
        match self {
            Shape::Array { dtype, .. } => Shape::array(*dtype, dims),
            Shape::Tuple(_) => self.clone(),
        }
    }

    pub fn with_dtype(&self, dtype: DType) -> Shape {
        match self {
            Shape::Array { dims, .. } => Shape::array(dtype, dims.clone()),
            Shape::Tuple(_) => self.clone(),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array { dtype, dims } => {
                let dims: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "{}[{}]", dtype, dims.join(","))
            }
            Shape::Tuple(elements) => {
                let parts: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    Abs,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonDirection {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonDirection {
    pub fn name(self) -> &'static str {
        match self {
            ComparisonDirection::Eq => "EQ",
            ComparisonDirection::Ne => "NE",
            ComparisonDirection::Lt => "LT",
            ComparisonDirection::Le => "LE",
            ComparisonDirection::Gt => "GT",
            ComparisonDirection::Ge => "GE",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "EQ" => Some(ComparisonDirection::Eq),
            "NE" => Some(ComparisonDirection::Ne),
            "LT" => Some(ComparisonDirection::Lt),
            "LE" => Some(ComparisonDirection::Le),
            "GT" => Some(ComparisonDirection::Gt),
            "GE" => Some(ComparisonDirection::Ge),
            _ => None,
        }
    }
}

/// Backend-specific operations that have no generic opcode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CustomOp {
    /// Operands: remote buffers. One replication factor per buffer.
    RemoteParameterLoad { replication_factors: Vec<usize> },
    /// Operands: remote buffers, then the values to store into them.
    RemoteParameterStore { replication_factors: Vec<usize> },
    /// Operands: remote buffers, then offsets.
    BufferLoadSlice { replication_factors: Vec<usize> },
    /// Operands: remote buffers, then values, then offsets.
    BufferStoreSlice { replication_factors: Vec<usize> },
    AllGather { replica_group_size: usize },
    ReduceScatter { replica_group_size: usize },
    ReplicationIndex,
    MultiUpdate,
    MultiUpdateAdd,
    GradientAccumulatorCreate,
    GradientAccumulatorAdd,
    SendToHost,
    RecvFromHost,
    SendRecvBarrier,
}

impl CustomOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CustomOp::RemoteParameterLoad { .. } => "remote-parameter-load",
            CustomOp::RemoteParameterStore { .. } => "remote-parameter-store",
            CustomOp::BufferLoadSlice { .. } => "buffer-load-slice",
            CustomOp::BufferStoreSlice { .. } => "buffer-store-slice",
            CustomOp::AllGather { .. } => "all-gather",
            CustomOp::ReduceScatter { .. } => "reduce-scatter",
            CustomOp::ReplicationIndex => "replication-index",
            CustomOp::MultiUpdate => "multi-update",
            CustomOp::MultiUpdateAdd => "multi-update-add",
            CustomOp::GradientAccumulatorCreate => "gradient-accumulator-create",
            CustomOp::GradientAccumulatorAdd => "gradient-accumulator-add",
            CustomOp::SendToHost => "send-to-host",
            CustomOp::RecvFromHost => "recv-from-host",
            CustomOp::SendRecvBarrier => "send-recv-barrier",
        }
    }

    /// Replication factors of the remote-buffer operands, if this op addresses remote memory.
    pub fn replication_factors(&self) -> Option<&[usize]> {
        match self {
            CustomOp::RemoteParameterLoad {
                replication_factors,
            }
            | CustomOp::RemoteParameterStore {
                replication_factors,
            }
            | CustomOp::BufferLoadSlice {
                replication_factors,
            }
            | CustomOp::BufferStoreSlice {
                replication_factors,
            } => Some(replication_factors),
            _ => None,
        }
    }
}

/// Closed set of operations an [`Instruction`] can perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Parameter { number: usize },
    /// Splat constant: every element of the output holds `value`.
    Constant { value: f64 },
    Tuple,
    GetTupleElement { index: usize },
    Unary(UnaryOp),
    Binary(BinaryOp),
    Compare(ComparisonDirection),
    Select,
    Convert,
    Broadcast { dims: Vec<usize> },
    Reshape,
    Slice { starts: Vec<usize>, limits: Vec<usize> },
    Pad { low: Vec<usize>, high: Vec<usize> },
    DynamicSlice { sizes: Vec<usize> },
    DynamicUpdateSlice,
    Concatenate { dim: usize },
    Call { computation: CompId },
    Fusion { computation: CompId },
    AllReduce,
    Custom(CustomOp),
}

impl Opcode {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Parameter { .. } => "parameter",
            Opcode::Constant { .. } => "constant",
            Opcode::Tuple => "tuple",
            Opcode::GetTupleElement { .. } => "get-tuple-element",
            Opcode::Unary(op) => match op {
                UnaryOp::Negate => "negate",
                UnaryOp::Abs => "abs",
                UnaryOp::Exp => "exponential",
                UnaryOp::Log => "log",
                UnaryOp::Sqrt => "sqrt",
                UnaryOp::Rsqrt => "rsqrt",
                UnaryOp::Tanh => "tanh",
            },
            Opcode::Binary(op) => match op {
                BinaryOp::Add => "add",
                BinaryOp::Subtract => "subtract",
                BinaryOp::Multiply => "multiply",
                BinaryOp::Divide => "divide",
                BinaryOp::Maximum => "maximum",
                BinaryOp::Minimum => "minimum",
                BinaryOp::Power => "power",
            },
            Opcode::Compare(_) => "compare",
            Opcode::Select => "select",
            Opcode::Convert => "convert",
            Opcode::Broadcast { .. } => "broadcast",
            Opcode::Reshape => "reshape",
            Opcode::Slice { .. } => "slice",
            Opcode::Pad { .. } => "pad",
            Opcode::DynamicSlice { .. } => "dynamic-slice",
            Opcode::DynamicUpdateSlice => "dynamic-update-slice",
            Opcode::Concatenate { .. } => "concatenate",
            Opcode::Call { .. } => "call",
            Opcode::Fusion { .. } => "fusion",
            Opcode::AllReduce => "all-reduce",
            Opcode::Custom(op) => op.mnemonic(),
        }
    }

    /// Pure per-element operations: the output at an index only reads the same index of each input.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Opcode::Unary(_)
                | Opcode::Binary(_)
                | Opcode::Compare(_)
                | Opcode::Select
                | Opcode::Convert
        )
    }

    pub fn called_computation(&self) -> Option<CompId> {
        match self {
            Opcode::Call { computation } | Opcode::Fusion { computation } => Some(*computation),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&CustomOp> {
        match self {
            Opcode::Custom(op) => Some(op),
            _ => None,
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self, Opcode::Parameter { .. })
    }

    pub fn parameter_number(&self) -> Option<usize> {
        match self {
            Opcode::Parameter { number } => Some(*number),
            _ => None,
        }
    }

    /// Operations that must survive dead-code elimination even without users.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            Opcode::Custom(
                CustomOp::RemoteParameterStore { .. }
                    | CustomOp::BufferStoreSlice { .. }
                    | CustomOp::SendToHost
                    | CustomOp::RecvFromHost
                    | CustomOp::SendRecvBarrier
            )
        )
    }
}

/// Device placement of an instruction's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sharding {
    Replicated,
    Maximal { device: u32 },
    Tuple(Vec<Sharding>),
}

impl Sharding {
    /// The single device this sharding pins to, looking through uniform tuples.
    pub fn unique_device(&self) -> Option<u32> {
        match self {
            Sharding::Replicated => None,
            Sharding::Maximal { device } => Some(*device),
            Sharding::Tuple(elements) => {
                let mut devices = elements.iter().map(Sharding::unique_device);
                let first = devices.next()??;
                devices.all(|d| d == Some(first)).then_some(first)
            }
        }
    }
}

impl fmt::Display for Sharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sharding::Replicated => f.write_str("{replicated}"),
            Sharding::Maximal { device } => write!(f, "{{maximal device={device}}}"),
            Sharding::Tuple(elements) => {
                let parts: Vec<String> = elements.iter().map(|s| s.to_string()).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

/// Framework-level origin of an instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct OpMetadata {
    pub op_type: String,
    pub op_name: String,
}

/// A node of the program graph.
///
/// `users` and `control_successors` are caches maintained by the owning
/// computation; the authoritative edges are `operands` and
/// `control_predecessors`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub(crate) id: InstId,
    pub(crate) name: String,
    pub(crate) opcode: Opcode,
    pub(crate) shape: Shape,
    pub(crate) operands: Vec<InstId>,
    pub(crate) users: SmallVec<[InstId; 4]>,
    pub(crate) control_predecessors: Vec<InstId>,
    pub(crate) control_successors: Vec<InstId>,
    pub(crate) sharding: Option<Sharding>,
    pub(crate) backend_config: BackendConfig,
    pub(crate) metadata: Option<OpMetadata>,
}

impl Instruction {
    pub fn id(&self) -> InstId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn opcode(&self) -> &Opcode {
        &self.opcode
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn operands(&self) -> &[InstId] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> InstId {
        self.operands[index]
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Positions at which `operand` appears in this instruction's operand list.
    pub fn operand_indices(&self, operand: InstId) -> SmallVec<[usize; 2]> {
        self.operands
            .iter()
            .enumerate()
            .filter(|(_, &op)| op == operand)
            .map(|(i, _)| i)
            .collect()
    }

    /// Distinct users, in the order they started using this instruction.
    pub fn users(&self) -> &[InstId] {
        &self.users
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn control_predecessors(&self) -> &[InstId] {
        &self.control_predecessors
    }

    pub fn control_successors(&self) -> &[InstId] {
        &self.control_successors
    }

    pub fn has_control_dependencies(&self) -> bool {
        !self.control_predecessors.is_empty() || !self.control_successors.is_empty()
    }

    pub fn sharding(&self) -> Option<&Sharding> {
        self.sharding.as_ref()
    }

    pub fn sharding_unique_device(&self) -> Option<u32> {
        self.sharding.as_ref().and_then(Sharding::unique_device)
    }

    pub fn backend_config(&self) -> &BackendConfig {
        &self.backend_config
    }

    pub fn metadata(&self) -> Option<&OpMetadata> {
        self.metadata.as_ref()
    }

    pub fn custom_op(&self) -> Option<&CustomOp> {
        self.opcode.as_custom()
    }
}

/// Description of an instruction to be added to a computation.
#[derive(Debug, Clone)]
pub struct NewInstruction {
    pub name: Option<String>,
    pub opcode: Opcode,
    pub shape: Shape,
    pub operands: Vec<InstId>,
    pub sharding: Option<Sharding>,
    pub backend_config: BackendConfig,
    pub metadata: Option<OpMetadata>,
}

impl NewInstruction {
    pub fn new(opcode: Opcode, shape: Shape, operands: Vec<InstId>) -> Self {
        Self {
            name: None,
            opcode,
            shape,
            operands,
            sharding: None,
            backend_config: BackendConfig::default(),
            metadata: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_sharding(mut self, sharding: Option<Sharding>) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn with_backend_config(mut self, config: BackendConfig) -> Self {
        self.backend_config = config;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<OpMetadata>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_leaves_are_depth_first() {
        let shape = Shape::tuple(vec![
            Shape::array(DType::F32, vec![2]),
            Shape::tuple(vec![Shape::scalar(DType::S32), Shape::scalar(DType::F16)]),
        ]);
        let leaves = shape.leaf_indices();
        assert_eq!(
            leaves,
            vec![shape_index(&[0]), shape_index(&[1, 0]), shape_index(&[1, 1])]
        );
        assert_eq!(shape.byte_size(), 8 + 4 + 2);
        assert_eq!(shape.to_string(), "(f32[2], (s32[], f16[]))");
    }

    #[test]
    fn uniform_tuple_sharding_has_unique_device() {
        let sharding = Sharding::Tuple(vec![
            Sharding::Maximal { device: 1 },
            Sharding::Maximal { device: 1 },
        ]);
        assert_eq!(sharding.unique_device(), Some(1));
        let mixed = Sharding::Tuple(vec![
            Sharding::Maximal { device: 0 },
            Sharding::Maximal { device: 1 },
        ]);
        assert_eq!(mixed.unique_device(), None);
    }
}
