//! Supervised execution of units.
//!
//! [`ExecutionSupervisor::execute`] validates the request against the
//! schema, spawns exactly one subprocess under the unit's environment, and
//! turns its output into an [`ExecutionResult`]. The supervisor owns
//! cleanup: by the time a result is returned the process group has been
//! reaped and the per-run scratch directory removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::environment::ExecutionEnvironment;
use super::result::{ExecutionRequest, ExecutionResult, FailureKind};
use super::schema::ParameterSchema;
use super::subprocess::{self, ProcessError, ProcessLimits, ProcessOutcome};
use super::unit::UnitDescriptor;
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::types::{Timestamp, UnitId};

/// Maximum stderr carried into a failure message.
const STDERR_TAIL_BYTES: usize = 4096;

/// Fatal execution errors. Per-unit failures are [`ExecutionResult`]s.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The host cannot spawn processes right now.
    #[error("Host cannot run scripts: {0}")]
    HostUnavailable(String),

    #[error("Execution supervisor is shutting down")]
    ShuttingDown,
}

impl From<SupervisorError> for CoreError {
    fn from(err: SupervisorError) -> Self {
        CoreError::Unavailable(err.to_string())
    }
}

/// An in-flight execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunningExecution {
    pub execution_id: Uuid,
    pub unit_id: UnitId,
    pub started_at: Timestamp,
    pub deadline_secs: u64,
}

struct RunningSlot {
    info: RunningExecution,
    cancel: CancellationToken,
}

/// Removes a registry entry when the execution ends, however it ends.
struct Registration<'a> {
    running: &'a Mutex<HashMap<Uuid, RunningSlot>>,
    id: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.id);
        }
    }
}

/// Runs units as bounded subprocesses.
pub struct ExecutionSupervisor {
    config: Arc<EngineConfig>,
    slots: Semaphore,
    running: Mutex<HashMap<Uuid, RunningSlot>>,
    shutdown: CancellationToken,
}

impl ExecutionSupervisor {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            slots: Semaphore::new(config.max_concurrent_executions),
            config,
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run one execution request.
    ///
    /// Returns `Err` only when no subprocess can be spawned on this host
    /// (or during shutdown); every per-unit outcome is an `Ok` result.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        unit: &UnitDescriptor,
        schema: &ParameterSchema,
        env: &ExecutionEnvironment,
    ) -> Result<ExecutionResult, SupervisorError> {
        let args = match schema.bind(&request.parameters) {
            Ok(args) => args,
            Err(e) => {
                tracing::debug!(unit_id = %unit.id, error = %e, "Rejected execution request");
                return Ok(ExecutionResult::failure(FailureKind::ValidationError, e.to_string()));
            }
        };

        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| SupervisorError::ShuttingDown)?;

        let execution_id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        self.lock_running().insert(
            execution_id,
            RunningSlot {
                info: RunningExecution {
                    execution_id,
                    unit_id: unit.id.clone(),
                    started_at: Utc::now(),
                    deadline_secs: request.deadline.as_secs(),
                },
                cancel: cancel.clone(),
            },
        );
        let _registration = Registration {
            running: &self.running,
            id: execution_id,
        };

        let scratch = scratch_dir(&self.config, execution_id);
        if let Err(e) = tokio::fs::create_dir_all(&scratch).await {
            tracing::error!(path = %scratch.display(), error = %e, "Cannot create scratch directory");
            return Err(SupervisorError::HostUnavailable(format!(
                "cannot create scratch directory: {e}"
            )));
        }

        let mut cmd = env.command(&args);
        cmd.env("SCRIPT_TMP_DIR", &scratch)
            .env("SCRIPT_EXECUTION_ID", execution_id.to_string());

        let limits = ProcessLimits {
            timeout: request.deadline,
            kill_grace: self.config.kill_grace,
            max_output_bytes: self.config.max_output_bytes,
        };

        tracing::info!(
            unit_id = %unit.id,
            %execution_id,
            args = args.len(),
            deadline_ms = request.deadline.as_millis() as u64,
            "Executing unit",
        );

        let outcome = subprocess::run_command(&mut cmd, &limits, Some(&cancel)).await;
        remove_scratch(&scratch).await;

        let result = match outcome {
            Ok(outcome) => self.classify(outcome),
            Err(ProcessError::ResourceExhausted(e)) => {
                tracing::error!(unit_id = %unit.id, error = %e, "Host cannot spawn processes");
                return Err(SupervisorError::HostUnavailable(e.to_string()));
            }
            Err(e) => ExecutionResult::failure(FailureKind::SpawnFailed, e.to_string()),
        };

        tracing::info!(
            unit_id = %unit.id,
            %execution_id,
            outcome = result.outcome(),
            elapsed_ms = result.elapsed_ms(),
            "Execution finished",
        );
        Ok(result)
    }

    fn classify(&self, outcome: ProcessOutcome) -> ExecutionResult {
        match outcome {
            ProcessOutcome::Exited {
                exit_code: 0,
                output,
                elapsed,
            } => match parse_payload(&output.stdout) {
                Ok(payload) => ExecutionResult::Success {
                    payload,
                    elapsed_ms: elapsed.as_millis() as u64,
                },
                Err(reason) => ExecutionResult::Failure {
                    kind: FailureKind::OutputContractError,
                    message: reason,
                    partial_output: output.stdout,
                    elapsed_ms: elapsed.as_millis() as u64,
                },
            },
            ProcessOutcome::Exited {
                exit_code,
                output,
                elapsed,
            } => {
                let stderr = tail(output.stderr.trim_end(), STDERR_TAIL_BYTES);
                let message = if stderr.is_empty() {
                    format!("Unit exited with code {exit_code}")
                } else {
                    format!("Unit exited with code {exit_code}: {stderr}")
                };
                ExecutionResult::Failure {
                    kind: FailureKind::NonZeroExit,
                    message,
                    partial_output: output.stdout,
                    elapsed_ms: elapsed.as_millis() as u64,
                }
            }
            ProcessOutcome::TimedOut { output, elapsed } => ExecutionResult::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
                partial_output: output.stdout,
            },
            ProcessOutcome::Cancelled { output, elapsed } => {
                let message = if self.shutdown.is_cancelled() {
                    "Terminated by shutdown"
                } else {
                    "Terminated by operator"
                };
                ExecutionResult::Failure {
                    kind: FailureKind::Terminated,
                    message: message.to_string(),
                    partial_output: output.stdout,
                    elapsed_ms: elapsed.as_millis() as u64,
                }
            }
        }
    }

    /// Snapshot of in-flight executions, oldest first.
    pub fn running(&self) -> Vec<RunningExecution> {
        let mut list: Vec<RunningExecution> = self
            .lock_running()
            .values()
            .map(|slot| slot.info.clone())
            .collect();
        list.sort_by_key(|r| r.started_at);
        list
    }

    /// Terminate an in-flight execution. Its caller receives
    /// `Failure { kind: Terminated }`.
    pub fn terminate(&self, execution_id: Uuid) -> Result<(), CoreError> {
        let running = self.lock_running();
        let slot = running.get(&execution_id).ok_or_else(|| CoreError::NotFound {
            entity: "Execution",
            id: execution_id.to_string(),
        })?;
        tracing::info!(%execution_id, unit_id = %slot.info.unit_id, "Terminating execution");
        slot.cancel.cancel();
        Ok(())
    }

    /// Terminate everything in flight and refuse new executions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunningSlot>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Parse stdout as exactly one JSON document.
fn parse_payload(stdout: &str) -> Result<serde_json::Value, String> {
    let text = stdout.trim();
    if text.is_empty() {
        return Err("Unit produced no output; expected one JSON payload".to_string());
    }
    serde_json::from_str(text).map_err(|e| format!("Output is not a single JSON payload: {e}"))
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}

/// Scratch directory of an execution.
pub fn scratch_dir(config: &EngineConfig, execution_id: Uuid) -> PathBuf {
    config.runs_dir().join(execution_id.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
