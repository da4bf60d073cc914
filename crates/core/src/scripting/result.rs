//! Execution request and result types.
//!
//! [`ExecutionResult`] is the single value returned for every call; it is
//! never mutated after creation. [`RunRecord`] is the flattened form handed
//! to persistence and notification collaborators.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Timestamp, UnitId};

/// A request to run one unit once.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub unit_id: UnitId,
    /// Caller-supplied parameter values, keyed by parameter name.
    pub parameters: Map<String, Value>,
    /// Wall-clock deadline measured from spawn.
    pub deadline: Duration,
}

impl ExecutionRequest {
    pub fn new(unit_id: impl Into<UnitId>, parameters: Map<String, Value>, deadline: Duration) -> Self {
        Self {
            unit_id: unit_id.into(),
            parameters,
            deadline,
        }
    }
}

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Caller input violates the schema. No process was started.
    ValidationError,
    /// The unit exited with a non-zero code.
    NonZeroExit,
    /// The unit exited zero but its output was not one structured payload.
    OutputContractError,
    /// The unit's process could not be started.
    SpawnFailed,
    /// Cancelled by an operator or by shutdown.
    Terminated,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::NonZeroExit => "non_zero_exit",
            Self::OutputContractError => "output_contract_error",
            Self::SpawnFailed => "spawn_failed",
            Self::Terminated => "terminated",
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        payload: Value,
        elapsed_ms: u64,
    },
    Failure {
        kind: FailureKind,
        message: String,
        /// Whatever the unit wrote to stdout before failing.
        partial_output: String,
        elapsed_ms: u64,
    },
    Timeout {
        elapsed_ms: u64,
        partial_output: String,
    },
}

impl ExecutionResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            partial_output: String::new(),
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            Self::Success { elapsed_ms, .. }
            | Self::Failure { elapsed_ms, .. }
            | Self::Timeout { elapsed_ms, .. } => *elapsed_ms,
        }
    }

    /// Short outcome name: `success`, `failure` or `timeout`.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Immutable per-call record for storage and notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub unit_id: UnitId,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub elapsed_ms: u64,
    /// Payload on success, error message otherwise.
    pub detail: Value,
    pub finished_at: Timestamp,
}

impl RunRecord {
    pub fn from_result(unit_id: &str, result: &ExecutionResult) -> Self {
        let detail = match result {
            ExecutionResult::Success { payload, .. } => payload.clone(),
            ExecutionResult::Failure { message, .. } => Value::String(message.clone()),
            ExecutionResult::Timeout { elapsed_ms, .. } => {
                Value::String(format!("Deadline exceeded after {elapsed_ms}ms"))
            }
        };
        Self {
            unit_id: unit_id.to_string(),
            outcome: result.outcome().to_string(),
            failure_kind: result.failure_kind(),
            elapsed_ms: result.elapsed_ms(),
            detail,
            finished_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
