//! Execution orchestrator: prepares a private working directory per unit,
//! runs the algorithm through a [`crate::sandbox::SandboxBackend`], streams
//! its output and harvests the images it writes.

pub mod config;
pub mod executor;
pub mod harvest;
pub mod result;
pub mod state;
pub mod workspace;

pub use config::{OrchestratorConfig, DEFAULT_LOG_TAIL};
pub use executor::Orchestrator;
pub use harvest::{artifact_kind, destination_dir, destination_name, harvest, Harvest};
pub use result::{
    BatchReport, ExecutionEvent, ExecutionFailure, ExecutionResult, ExecutionStatus, LogTail,
};
pub use state::ExecutionState;
pub use workspace::{unit_environment, UnitWorkspace};
