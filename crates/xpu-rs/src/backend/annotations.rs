use std::cmp::Ordering;
use std::collections::BTreeSet;

/// How an entry-computation parameter participates in the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Plain input fed every step.
    Parameter,
    /// Persistent resource that is read but never written back.
    ResourceNotModified,
    /// Persistent resource that is updated and written back.
    ResourceModified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Output,
    /// Writes back the resource input at `input_index`.
    ResourceModified { input_index: usize },
    /// Resource created by the program rather than aliased from an input.
    ResourceOutput,
}

/// Classification of the entry computation's parameters and outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputOutputAliasingMap {
    inputs: Vec<InputKind>,
    outputs: Vec<OutputKind>,
}

impl InputOutputAliasingMap {
    pub fn new(inputs: Vec<InputKind>, outputs: Vec<OutputKind>) -> Self {
        Self { inputs, outputs }
    }

    /// Map where the first `num_resources` inputs are modified resources written back
    /// to the output slot of the same index, followed by `num_other_inputs` plain inputs.
    pub fn with_modified_resources(num_resources: usize, num_other_inputs: usize) -> Self {
        let mut inputs = vec![InputKind::ResourceModified; num_resources];
        inputs.extend(std::iter::repeat(InputKind::Parameter).take(num_other_inputs));
        let outputs = (0..num_resources)
            .map(|input_index| OutputKind::ResourceModified { input_index })
            .collect();
        Self { inputs, outputs }
    }

    pub fn input(&self, index: usize) -> Option<InputKind> {
        self.inputs.get(index).copied()
    }

    pub fn output(&self, index: usize) -> Option<OutputKind> {
        self.outputs.get(index).copied()
    }

    pub fn inputs(&self) -> &[InputKind] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputKind] {
        &self.outputs
    }
}

/// An entry parameter that now lives in remote memory.
#[derive(Debug, Clone, Copy)]
pub struct RemoteParameterInfo {
    pub parameter_number: usize,
    pub is_replica_partitioned: bool,
}

impl RemoteParameterInfo {
    pub fn new(parameter_number: usize, is_replica_partitioned: bool) -> Self {
        Self {
            parameter_number,
            is_replica_partitioned,
        }
    }
}

// Identity is the parameter number alone.
impl PartialEq for RemoteParameterInfo {
    fn eq(&self, other: &Self) -> bool {
        self.parameter_number == other.parameter_number
    }
}

impl Eq for RemoteParameterInfo {}

impl PartialOrd for RemoteParameterInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemoteParameterInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parameter_number.cmp(&other.parameter_number)
    }
}

pub type RemoteParameterInfos = BTreeSet<RemoteParameterInfo>;

/// Module-wide facts shared between passes and handed to the device backend afterwards.
#[derive(Debug, Clone, Default)]
pub struct CompilerAnnotations {
    pub input_output_aliasing_map: InputOutputAliasingMap,
    pub remote_parameter_infos: RemoteParameterInfos,
}

impl CompilerAnnotations {
    pub fn new(input_output_aliasing_map: InputOutputAliasingMap) -> Self {
        Self {
            input_output_aliasing_map,
            remote_parameter_infos: RemoteParameterInfos::new(),
        }
    }
}
