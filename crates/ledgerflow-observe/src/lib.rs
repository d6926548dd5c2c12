//! Observability setup for Ledgerflow.
//!
//! The core library only emits `tracing` events; binaries and tests that
//! want them printed install a subscriber through [`tracing_setup`].

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, init_tracing, shutdown_tracing};
