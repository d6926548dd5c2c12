//! Infrastructure layer for Ledgerflow.
//!
//! Contains the SQLite implementations of the store traits defined in
//! `ledgerflow-core` (checkpoints, golden log, audit trail) and the
//! `ledgerflow.toml` configuration loader.

pub mod config;
pub mod sqlite;
