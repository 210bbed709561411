//! qsm-ci: QSM algorithm benchmarking against BIDS datasets.
//!
//! This library groups the multi-echo acquisitions of a BIDS dataset into
//! work units and runs reconstruction algorithms against them inside
//! isolated sandboxes (Docker, Apptainer or TinyRange VMs).

// Core modules
pub mod algorithm;
pub mod bids;
pub mod cli;
pub mod error;
pub mod orchestrator;
pub mod sandbox;

// Re-export commonly used types
pub use algorithm::AlgorithmDescriptor;
pub use bids::{group, Grouper, WorkUnit};
pub use error::{ConfigError, GroupError, OrchestratorError, SandboxError};
pub use orchestrator::{BatchReport, ExecutionFailure, ExecutionResult, Orchestrator};
pub use sandbox::{BackendKind, SandboxBackend};
