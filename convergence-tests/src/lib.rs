//! Black-box convergence verification for replicated CRDT stores.
//!
//! Replicas are started as independent processes and driven only through
//! their HTTP API: mutations, peer synchronization and state fingerprints.
//! The [`driver::Driver`] runs a scenario and the [`verifier`] judges
//! convergence, idempotence and commutativity from the fingerprints it
//! collected.

pub mod client;
pub mod config;
pub mod driver;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod launcher;
pub mod operation;
pub mod output;
pub mod probe;
pub mod report;
pub mod settle;
pub mod sync;
pub mod template;
pub mod verifier;
