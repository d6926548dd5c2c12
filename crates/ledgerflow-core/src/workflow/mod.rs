//! Workflow execution core: spec parsing, ordering, durable checkpointing,
//! execution and replay.
//!
//! - `definition` -- YAML/JSON parsing, validation, schema export
//! - `dag` -- cycle detection and sequential execution order
//! - `checkpoint` -- versioned checkpoint manager for crash recovery
//! - `retry` -- retry decisions, backoff and failure dispositions
//! - `recorder` -- per-invocation audit hook
//! - `engine` -- sequential step executor
//! - `runner` -- engine plus audit trail
//! - `replay` -- dry-run / verify / rehydrate replays of recorded runs
//! - `verifier` -- op-by-op comparison of replays against the audit trail

pub mod checkpoint;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod recorder;
pub mod replay;
pub mod retry;
pub mod runner;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{EngineError, RunParams, WorkflowEngine};
pub use replay::ReplayError;
pub use runner::WorkflowRunner;
pub use verifier::ReplayVerifier;
