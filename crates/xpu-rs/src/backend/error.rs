use thiserror::Error;

use crate::backend::buffers::BufferError;
use crate::backend::computation::GraphError;

/// Failure of a compiler pass. Any of these aborts the whole pipeline.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The user asked for something the target or the program cannot provide.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// An invariant an earlier pass should have established does not hold.
    #[error("internal error: {0}")]
    Structural(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl CompileError {
    pub fn structural(msg: impl Into<String>) -> Self {
        CompileError::Structural(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        CompileError::FailedPrecondition(msg.into())
    }
}
