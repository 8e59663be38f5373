pub mod annotations;
pub mod backend_config;
pub mod buffers;
pub mod computation;
pub mod error;
pub mod fusion;
pub mod matcher;
pub mod module;
pub mod passes;
pub mod pipeline;
pub mod reachability;
pub mod spec;
pub mod text_ir;
