//! Execution of an algorithm against work units through a sandbox backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::config::OrchestratorConfig;
use super::harvest::harvest;
use super::result::{BatchReport, ExecutionEvent, ExecutionFailure, ExecutionResult, LogTail};
use super::state::ExecutionState;
use super::workspace::{unit_environment, UnitWorkspace};
use crate::algorithm::AlgorithmDescriptor;
use crate::bids::WorkUnit;
use crate::error::OrchestratorError;
use crate::sandbox::{unit_name, LaunchSpec, SandboxBackend};

/// Runs algorithms against work units, one private sandbox per unit.
pub struct Orchestrator {
    backend: Arc<dyn SandboxBackend>,
    config: OrchestratorConfig,
    event_tx: Option<mpsc::Sender<ExecutionEvent>>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: OrchestratorConfig) -> Self {
        Self {
            backend,
            config,
            event_tx: None,
        }
    }

    /// Sends progress events to `tx` while units execute.
    pub fn with_events(mut self, tx: mpsc::Sender<ExecutionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Deterministic sandbox name of `unit` under `algorithm`.
    pub fn unit_name(&self, unit: &WorkUnit, algorithm: &AlgorithmDescriptor) -> String {
        unit_name(
            &algorithm.name,
            &unit.subject,
            unit.session.as_deref(),
            unit.acquisition.as_deref(),
            unit.run.as_deref(),
        )
    }

    /// Executes `algorithm` against one unit.
    ///
    /// Fails only when the algorithm cannot be configured for this backend;
    /// every per-unit problem is reported inside the returned result.
    pub async fn execute(
        &self,
        unit: &WorkUnit,
        algorithm: &AlgorithmDescriptor,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let kind = self.backend.kind();
        let image = algorithm.image_for(kind)?.to_string();
        let name = self.unit_name(unit, algorithm);

        let result = ExecutionResult::started(unit.key(), &name, &algorithm.name, kind);
        let mut state = ExecutionState::Prepared;
        info!(unit = %name, backend = %kind, image = %image, "Executing unit");
        self.emit(ExecutionEvent::Started {
            unit_name: name.clone(),
        })
        .await;

        let workspace = match UnitWorkspace::prepare(&self.config, unit, algorithm, &name) {
            Ok(ws) => ws,
            Err(e) => {
                let failure = ExecutionFailure::Configuration {
                    reason: e.to_string(),
                };
                return self.launch_error(result, &mut state, failure).await;
            }
        };
        if !workspace.has_entry_script(&self.config.command) {
            let failure = ExecutionFailure::Configuration {
                reason: format!(
                    "entry script '{}' missing from '{}'",
                    self.config.command,
                    workspace.root.display()
                ),
            };
            return self.launch_error(result, &mut state, failure).await;
        }

        let host_workdir = workspace
            .root
            .canonicalize()
            .unwrap_or_else(|_| workspace.root.clone());
        let spec = LaunchSpec::new(&name, &image, host_workdir)
            .with_command(&self.config.command)
            .with_container_workdir(&self.config.container_workdir)
            .with_env(unit_environment(
                unit,
                &algorithm.name,
                &self.config.input_document_path(),
            ))
            .with_resources(algorithm.resources());

        if let Err(e) = self.backend.prepare(&spec).await {
            let failure = ExecutionFailure::Launch {
                reason: e.to_string(),
            };
            return self.launch_error(result, &mut state, failure).await;
        }

        let mut handle = match self.backend.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.teardown(&name).await;
                let failure = ExecutionFailure::Launch {
                    reason: e.to_string(),
                };
                return self.launch_error(result, &mut state, failure).await;
            }
        };
        self.advance(&name, &mut state, ExecutionState::Launched).await?;
        self.advance(&name, &mut state, ExecutionState::Running).await?;

        let mut tail = LogTail::new(self.config.log_tail);
        let mut logs = self.backend.stream_logs(&mut handle);
        while let Some(line) = logs.next().await {
            match line {
                Ok(line) => {
                    info!(unit = %name, "{}", line);
                    self.emit(ExecutionEvent::Log {
                        unit_name: name.clone(),
                        line: line.clone(),
                    })
                    .await;
                    tail.push(line);
                }
                // The backend stream ends on its own; an error only loses one pipe.
                Err(e) => warn!(unit = %name, error = %e, "Log stream interrupted"),
            }
        }
        drop(logs);

        let exit = self.backend.wait(&mut handle).await;
        self.teardown(&name).await;

        let result = match exit {
            Ok(0) => {
                match harvest(
                    &workspace.output_dir(),
                    &self.config.derivatives_root,
                    &algorithm.name,
                    unit,
                ) {
                    Ok(h) => {
                        self.advance(&name, &mut state, ExecutionState::Succeeded)
                            .await?;
                        info!(unit = %name, outputs = h.outputs.len(), "Unit succeeded");
                        result.with_exit_code(0).succeed(h.outputs, h.warnings)
                    }
                    Err(failure) => {
                        self.advance(&name, &mut state, ExecutionState::Failed).await?;
                        error!(unit = %name, "{}", failure);
                        result.with_exit_code(0).fail(failure, tail.into_lines())
                    }
                }
            }
            Ok(code) => {
                self.advance(&name, &mut state, ExecutionState::Failed).await?;
                let failure = ExecutionFailure::NonZeroExit { code };
                error!(unit = %name, code, "Algorithm failed");
                result.with_exit_code(code).fail(failure, tail.into_lines())
            }
            Err(e) => {
                self.advance(&name, &mut state, ExecutionState::Failed).await?;
                error!(unit = %name, error = %e, "Lost track of unit");
                let failure = ExecutionFailure::Launch {
                    reason: e.to_string(),
                };
                result.fail(failure, tail.into_lines())
            }
        };

        let result = result.with_state(state);
        self.emit(ExecutionEvent::Finished {
            unit_name: name,
            status: result.status.clone(),
        })
        .await;
        Ok(result)
    }

    /// Executes one unit unless `cancel` completes first, in which case the
    /// unit is torn down and [`OrchestratorError::Cancelled`] is returned.
    pub async fn execute_cancellable<F>(
        &self,
        unit: &WorkUnit,
        algorithm: &AlgorithmDescriptor,
        cancel: F,
    ) -> Result<ExecutionResult, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        self.execute_until(unit, algorithm, async {
            cancel.await;
            "cancelled".to_string()
        })
        .await
    }

    /// Executes one unit with a deadline.
    pub async fn execute_with_timeout(
        &self,
        unit: &WorkUnit,
        algorithm: &AlgorithmDescriptor,
        timeout: Duration,
    ) -> Result<ExecutionResult, OrchestratorError> {
        self.execute_until(unit, algorithm, deadline(timeout)).await
    }

    async fn execute_until<F>(
        &self,
        unit: &WorkUnit,
        algorithm: &AlgorithmDescriptor,
        stop: F,
    ) -> Result<ExecutionResult, OrchestratorError>
    where
        F: Future<Output = String>,
    {
        let outcome = tokio::select! {
            result = self.execute(unit, algorithm) => Ok(result),
            reason = stop => Err(reason),
        };

        match outcome {
            Ok(result) => result,
            Err(reason) => {
                let name = self.unit_name(unit, algorithm);
                warn!(unit = %name, %reason, "Stopping unit");
                self.teardown(&name).await;
                Err(OrchestratorError::Cancelled { unit: name, reason })
            }
        }
    }

    /// Executes every unit, at most `config.concurrency` at a time.
    ///
    /// Results come back in input order. Only a configuration problem of the
    /// algorithm aborts the batch, and it does so before any unit starts.
    pub async fn run_batch(
        &self,
        units: &[WorkUnit],
        algorithm: &AlgorithmDescriptor,
    ) -> Result<BatchReport, OrchestratorError> {
        self.run_batch_cancellable(units, algorithm, futures::future::pending())
            .await
    }

    /// Like [`Orchestrator::run_batch`], but once `cancel` completes running
    /// units are torn down and pending ones are reported as cancelled.
    pub async fn run_batch_cancellable<F>(
        &self,
        units: &[WorkUnit],
        algorithm: &AlgorithmDescriptor,
        cancel: F,
    ) -> Result<BatchReport, OrchestratorError>
    where
        F: Future<Output = ()>,
    {
        algorithm.image_for(self.backend.kind())?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let batch = self.run_units(units, algorithm, cancel_rx);
        tokio::pin!(batch);

        tokio::select! {
            report = &mut batch => return Ok(report),
            _ = cancel => {
                warn!("Cancellation requested, stopping running units");
                let _ = cancel_tx.send(true);
            }
        }
        Ok(batch.await)
    }

    async fn run_units(
        &self,
        units: &[WorkUnit],
        algorithm: &AlgorithmDescriptor,
        cancel: watch::Receiver<bool>,
    ) -> BatchReport {
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        info!(
            units = units.len(),
            concurrency = self.config.concurrency,
            "Starting batch"
        );

        let futures = units.iter().map(|unit| {
            let sem = sem.clone();
            let mut cancel = cancel.clone();
            async move {
                let _permit = sem.acquire().await.ok();
                if *cancel.borrow() {
                    // Never launched, so the unit stops short of any running state.
                    return self.error_result(
                        unit,
                        algorithm,
                        ExecutionState::LaunchError,
                        OrchestratorError::Cancelled {
                            unit: self.unit_name(unit, algorithm),
                            reason: "cancelled before start".to_string(),
                        },
                    );
                }

                let timeout = self.config.timeout;
                let stop = async move {
                    let signal = async {
                        if cancel.wait_for(|c| *c).await.is_err() {
                            futures::future::pending::<()>().await;
                        }
                        "cancelled".to_string()
                    };
                    match timeout {
                        Some(t) => tokio::select! {
                            reason = deadline(t) => reason,
                            reason = signal => reason,
                        },
                        None => signal.await,
                    }
                };

                match self.execute_until(unit, algorithm, stop).await {
                    Ok(result) => result,
                    Err(e) => self.error_result(unit, algorithm, ExecutionState::Failed, e),
                }
            }
        });

        let results = futures::future::join_all(futures).await;
        let report = BatchReport { results };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Batch finished"
        );
        report
    }

    /// Failed result for a unit whose execution returned an error.
    fn error_result(
        &self,
        unit: &WorkUnit,
        algorithm: &AlgorithmDescriptor,
        state: ExecutionState,
        err: OrchestratorError,
    ) -> ExecutionResult {
        let failure = match err {
            OrchestratorError::Cancelled { reason, .. } => ExecutionFailure::Cancelled { reason },
            other => ExecutionFailure::Launch {
                reason: other.to_string(),
            },
        };
        ExecutionResult::started(
            unit.key(),
            self.unit_name(unit, algorithm),
            &algorithm.name,
            self.backend.kind(),
        )
        .with_state(state)
        .fail(failure, Vec::new())
    }

    async fn launch_error(
        &self,
        result: ExecutionResult,
        state: &mut ExecutionState,
        failure: ExecutionFailure,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let name = result.unit_name.clone();
        self.advance(&name, state, ExecutionState::LaunchError).await?;
        error!(unit = %name, "{}", failure);

        let result = result.with_state(*state).fail(failure, Vec::new());
        self.emit(ExecutionEvent::Finished {
            unit_name: name,
            status: result.status.clone(),
        })
        .await;
        Ok(result)
    }

    async fn advance(
        &self,
        unit_name: &str,
        state: &mut ExecutionState,
        next: ExecutionState,
    ) -> Result<(), OrchestratorError> {
        state.transition(next)?;
        debug!(unit = unit_name, state = %next, "State changed");
        self.emit(ExecutionEvent::StateChanged {
            unit_name: unit_name.to_string(),
            state: next,
        })
        .await;
        Ok(())
    }

    async fn teardown(&self, unit_name: &str) {
        if let Err(e) = self.backend.teardown(unit_name).await {
            warn!(unit = unit_name, error = %e, "Teardown failed");
        }
    }

    async fn emit(&self, event: ExecutionEvent) {
        if let Some(sender) = &self.event_tx {
            let _ = sender.send(event).await;
        }
    }
}

async fn deadline(timeout: Duration) -> String {
    tokio::time::sleep(timeout).await;
    format!("timed out after {}s", timeout.as_secs())
}
