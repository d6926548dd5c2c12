//! Execution core and storage port definitions for Ledgerflow.
//!
//! This crate defines the "ports" (store traits) that the infrastructure
//! layer implements, in-memory bindings of those ports, and the engine that
//! drives workflow runs, audit recording and replay verification. It depends
//! only on `ledgerflow-types` -- never on `ledgerflow-infra` or any database
//! crate.

pub mod canonical;
pub mod golden;
pub mod guard;
pub mod policy;
pub mod repository;
pub mod skill;
pub mod storage;
pub mod taxonomy;
pub mod workflow;
