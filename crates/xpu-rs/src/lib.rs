//! Graph-level compiler passes for a replicated, remote-memory accelerator target.
//!
//! Programs are [`backend::module::Module`]s of dataflow computations. The passes in
//! [`backend::passes`] rewrite them in place, and [`backend::pipeline`] strings the
//! passes together in the order a compile would run them.

pub mod backend;
mod env;

pub use backend::annotations::CompilerAnnotations;
pub use backend::error::CompileError;
pub use backend::module::Module;
pub use backend::spec::{DType, Shape};
