//! Results, failure kinds and progress events of unit executions.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::ExecutionState;
use crate::bids::UnitKey;
use crate::error::HarvestWarning;
use crate::sandbox::BackendKind;

/// Why a unit failed. Failures are values, never errors of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The prepared working directory cannot be run (e.g. no entry script).
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Image, runtime or privilege problem before the algorithm started.
    #[error("Launch failed: {reason}")]
    Launch { reason: String },

    #[error("Algorithm exited with code {code}")]
    NonZeroExit { code: i64 },

    /// The algorithm exited cleanly but left no image in `output/`.
    #[error("Algorithm produced no output images")]
    NoOutput,

    /// Stopped by a deadline or a cancel request inside a batch.
    #[error("Execution cancelled: {reason}")]
    Cancelled { reason: String },
}

/// Outcome of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed { failure: ExecutionFailure },
}

/// Bounded ring of the most recent log lines.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Complete result of executing an algorithm against one work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique identifier for this execution.
    pub execution_id: String,
    pub unit: UnitKey,
    /// Deterministic sandbox name of the unit.
    pub unit_name: String,
    pub algorithm: String,
    pub backend: BackendKind,
    /// Final lifecycle state.
    pub state: ExecutionState,
    pub status: ExecutionStatus,
    /// Exit code, when the algorithm process ran to completion.
    pub exit_code: Option<i64>,
    /// Last log lines, kept only for failed units.
    pub log_tail: Vec<String>,
    /// Relocated artifacts in the derivatives layout.
    pub outputs: Vec<PathBuf>,
    pub harvest_warnings: Vec<HarvestWarning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ExecutionResult {
    /// Creates a result for a unit that has not finished yet.
    pub fn started(
        unit: UnitKey,
        unit_name: impl Into<String>,
        algorithm: impl Into<String>,
        backend: BackendKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            unit,
            unit_name: unit_name.into(),
            algorithm: algorithm.into(),
            backend,
            state: ExecutionState::Prepared,
            status: ExecutionStatus::Succeeded,
            exit_code: None,
            log_tail: Vec::new(),
            outputs: Vec::new(),
            harvest_warnings: Vec::new(),
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
        }
    }

    /// Marks the result as succeeded with the given artifacts.
    pub fn succeed(mut self, outputs: Vec<PathBuf>, warnings: Vec<HarvestWarning>) -> Self {
        self.status = ExecutionStatus::Succeeded;
        self.outputs = outputs;
        self.harvest_warnings = warnings;
        self.finish()
    }

    /// Marks the result as failed, keeping the log tail.
    pub fn fail(mut self, failure: ExecutionFailure, log_tail: Vec<String>) -> Self {
        self.status = ExecutionStatus::Failed { failure };
        self.log_tail = log_tail;
        self.finish()
    }

    pub fn with_state(mut self, state: ExecutionState) -> Self {
        self.state = state;
        self
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = Some(code);
        self
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self.duration = (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    pub fn failure(&self) -> Option<&ExecutionFailure> {
        match &self.status {
            ExecutionStatus::Failed { failure } => Some(failure),
            ExecutionStatus::Succeeded => None,
        }
    }
}

/// Progress notifications sent while units execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    Started { unit_name: String },
    StateChanged { unit_name: String, state: ExecutionState },
    Log { unit_name: String, line: String },
    Finished { unit_name: String, status: ExecutionStatus },
}

/// Results of a batch, in input order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<ExecutionResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// True when the batch had units and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.succeeded() == 0
    }
}
