//! apimigrate CLI - command-line interface for versioned HTTP API migrations.
//!
//! Runs a single migration directory (`up`, `down`, `status`) or a graph of
//! stages described by `stages.yaml` (`stages up|down|status|validate`).

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod output;
