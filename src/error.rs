//! Error types for qsm-ci operations.
//!
//! Defines error types for the major subsystems:
//! - Algorithm descriptor loading (fatal before any execution)
//! - Dataset grouping
//! - Sandbox backends (container runtime, namespace runtime, VM)
//! - Orchestration of a single work unit
//!
//! Per-unit execution failures are not errors: they are reported as values
//! inside [`crate::orchestrator::ExecutionResult`]. Discovery and harvest
//! warnings are logged and collected without interrupting the caller.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors in the algorithm directory that abort a run before anything starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Entry script '{}' does not exist", .0.display())]
    MissingEntryScript(PathBuf),

    #[error("No image specified for the {backend} backend in the algorithm script")]
    MissingImage { backend: String },

    #[error("Algorithm directory '{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("Invalid directive '{key}': {reason}")]
    InvalidDirective { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort dataset grouping as a whole.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("Dataset root '{}' does not exist", .0.display())]
    RootNotFound(PathBuf),

    #[error("Failed to walk dataset: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a sidecar or parameter file could not be used.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by sandbox backends.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Runtime not available: {0}")]
    RuntimeUnavailable(String),

    #[error("Image '{image}' unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Unit '{0}' not found")]
    UnitNotFound(String),

    #[error("Error reading logs: {0}")]
    Logs(String),

    #[error("Wait failed: {0}")]
    Wait(String),

    #[error("Teardown failed: {0}")]
    Teardown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the orchestrator itself, as opposed to a failing algorithm.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to prepare working directory '{}': {reason}", .path.display())]
    Workspace { path: PathBuf, reason: String },

    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("Execution of '{unit}' cancelled: {reason}")]
    Cancelled { unit: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Problems found while grouping that leave the walk running with partial data.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum DiscoveryWarning {
    #[error("Sidecar '{}' skipped: {reason}", .path.display())]
    Sidecar { path: PathBuf, reason: String },

    #[error("Field direction file '{}' ignored: {reason}", .path.display())]
    FieldDirections { path: PathBuf, reason: String },

    #[error("Derivative '{}' ({software}/{kind}) matches no work unit", .path.display())]
    Orphan {
        path: PathBuf,
        software: String,
        kind: String,
    },

    #[error("No primary acquisition files found under '{}'", .0.display())]
    Empty(PathBuf),
}

/// A single artifact that could not be relocated. Sibling artifacts are unaffected.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum HarvestWarning {
    #[error("Failed to decompress '{}': {reason}", .path.display())]
    Decompress { path: PathBuf, reason: String },

    #[error("Failed to move '{}' to '{}': {reason}", .from.display(), .to.display())]
    Move {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    #[error("Destination '{}' already claimed by another artifact; '{}' left in place", .to.display(), .from.display())]
    Collision { from: PathBuf, to: PathBuf },
}
