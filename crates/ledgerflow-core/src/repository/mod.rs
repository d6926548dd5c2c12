//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (ledgerflow-infra) implements. The core crate never depends on any
//! specific storage technology; in-memory bindings live in
//! [`crate::storage`].

pub mod audit;
pub mod checkpoint;
pub mod golden;

pub use audit::{AuditError, AuditStore};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use golden::GoldenLog;
