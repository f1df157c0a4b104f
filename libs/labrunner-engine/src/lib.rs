//! Execution core: build contexts, the container sandbox, the direct process
//! fallback, test report normalization and the orchestrator tying them together.

pub mod build_context;
pub mod catalog;
pub mod error;
pub mod normalizer;
pub mod orchestrator;
pub mod process;
pub mod sandbox;
pub mod strategy;


pub use catalog::ModuleCatalog;
pub use error::ExecutionError;
pub use orchestrator::Executor;
pub use strategy::ExecutionStrategy;

/// Filename the submission is written to, both in containers and on disk.
pub const ENTRY_POINT: &str = "tmp-server.js";
