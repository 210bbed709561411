//! Configuration for executing algorithms against work units.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::CONTAINER_WORKDIR;

/// Number of log lines kept for failure reports.
pub const DEFAULT_LOG_TAIL: usize = 20;

/// Where units run and where their results go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Parent of the per-unit private directories (`<work_root>/runs/<unit>`).
    pub work_root: PathBuf,
    /// Dataset root the unit paths are relative to.
    pub dataset_root: PathBuf,
    /// Root of the derived-data layout receiving harvested artifacts.
    pub derivatives_root: PathBuf,
    /// Log lines kept for failure reports.
    pub log_tail: usize,
    /// Units executed at the same time by `run_batch`.
    pub concurrency: usize,
    /// Per-unit deadline; none by default.
    pub timeout: Option<Duration>,
    /// Working directory inside the sandbox.
    pub container_workdir: String,
    /// Command started inside the working directory.
    pub command: String,
}

impl OrchestratorConfig {
    /// Creates a configuration with derivatives under `<dataset_root>/derivatives`.
    pub fn new(work_root: impl Into<PathBuf>, dataset_root: impl Into<PathBuf>) -> Self {
        let dataset_root = dataset_root.into();
        Self {
            work_root: work_root.into(),
            derivatives_root: dataset_root.join("derivatives"),
            dataset_root,
            log_tail: DEFAULT_LOG_TAIL,
            concurrency: 1,
            timeout: None,
            container_workdir: CONTAINER_WORKDIR.to_string(),
            command: "./main.sh".to_string(),
        }
    }

    /// Sets the derivatives root.
    pub fn with_derivatives_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.derivatives_root = dir.into();
        self
    }

    /// Sets the log tail length.
    pub fn with_log_tail(mut self, lines: usize) -> Self {
        self.log_tail = lines;
        self
    }

    /// Sets the batch concurrency (at least one).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the per-unit timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the command run inside the sandbox.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Directory holding every unit's private directory.
    pub fn runs_dir(&self) -> PathBuf {
        self.work_root.join("runs")
    }

    /// Path of the input document as seen from inside the sandbox.
    pub fn input_document_path(&self) -> String {
        format!("{}/inputs.json", self.container_workdir.trim_end_matches('/'))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new("./work", "./bids")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::new("/work", "/data/bids");
        assert_eq!(config.derivatives_root, PathBuf::from("/data/bids/derivatives"));
        assert_eq!(config.log_tail, 20);
        assert_eq!(config.concurrency, 1);
        assert!(config.timeout.is_none());
        assert_eq!(config.runs_dir(), PathBuf::from("/work/runs"));
        assert_eq!(config.input_document_path(), "/workdir/inputs.json");
    }

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::new("/work", "/bids")
            .with_derivatives_root("/out")
            .with_concurrency(0)
            .with_timeout(Duration::from_secs(60))
            .with_log_tail(5);

        assert_eq!(config.derivatives_root, PathBuf::from("/out"));
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.log_tail, 5);
    }
}
