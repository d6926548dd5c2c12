//! In-memory bindings of the repository ports.
//!
//! Process-local and lock-sharded via `DashMap`. They honor the same
//! concurrency contracts as the SQLite bindings in ledgerflow-infra and are
//! what tests and embedded callers use.

pub mod audit;
pub mod checkpoint;
pub mod golden;

pub use audit::InMemoryAuditStore;
pub use checkpoint::InMemoryCheckpointStore;
pub use golden::InMemoryGoldenLog;
