//! Shared domain types for Ledgerflow.
//!
//! This crate contains the data model of the workflow execution core:
//! workflow specs, checkpoints, golden events, the closed error taxonomy,
//! audit op records and replay results.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod golden;
pub mod replay;
pub mod workflow;
