//! Schema extraction through the introspection protocol.
//!
//! The unit is run with [`INTROSPECTION_FLAG`] as its only argument, under
//! the schema deadline. Exit zero with exactly one JSON line on stdout is
//! the only accepted answer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::environment::ExecutionEnvironment;
use super::runtime::INTROSPECTION_FLAG;
use super::schema::ParameterSchema;
use super::subprocess::{self, ProcessLimits, ProcessOutcome};
use super::unit::UnitDescriptor;
use crate::config::EngineConfig;

/// Suffix of the schema sidecar written next to an entry file.
pub const SIDECAR_SUFFIX: &str = "._map.json";

/// Introspection failed. Carries the raw output for diagnosis.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct ExtractionError {
    pub reason: String,
    pub stdout: String,
    pub stderr: String,
}

impl ExtractionError {
    fn new(reason: impl Into<String>, stdout: &str, stderr: &str) -> Self {
        Self {
            reason: reason.into(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Reason followed by the raw streams.
    pub fn diagnostic(&self) -> String {
        let mut text = self.reason.clone();
        if !self.stdout.trim().is_empty() {
            text.push_str("\n--- stdout ---\n");
            text.push_str(self.stdout.trim_end());
        }
        if !self.stderr.trim().is_empty() {
            text.push_str("\n--- stderr ---\n");
            text.push_str(self.stderr.trim_end());
        }
        text
    }
}

/// Runs units in introspection mode.
#[derive(Clone)]
pub struct SchemaExtractor {
    config: Arc<EngineConfig>,
}

impl SchemaExtractor {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub async fn extract(
        &self,
        unit: &UnitDescriptor,
        env: &ExecutionEnvironment,
    ) -> Result<ParameterSchema, ExtractionError> {
        let mut cmd = env.command([INTROSPECTION_FLAG]);
        let limits = ProcessLimits {
            timeout: self.config.schema_timeout,
            kill_grace: self.config.kill_grace,
            max_output_bytes: self.config.max_output_bytes,
        };

        let outcome = subprocess::run_command(&mut cmd, &limits, None)
            .await
            .map_err(|e| ExtractionError::new(format!("cannot start unit: {e}"), "", ""))?;

        match outcome {
            ProcessOutcome::Exited {
                exit_code: 0,
                output,
                ..
            } => {
                let schema = ParameterSchema::parse(&output.stdout)
                    .map_err(|e| ExtractionError::new(e.to_string(), &output.stdout, &output.stderr))?;
                tracing::debug!(unit_id = %unit.id, parameters = schema.len(), "Schema extracted");
                Ok(schema)
            }
            ProcessOutcome::Exited {
                exit_code, output, ..
            } => Err(ExtractionError::new(
                format!("introspection exited with code {exit_code}"),
                &output.stdout,
                &output.stderr,
            )),
            ProcessOutcome::TimedOut { output, elapsed } | ProcessOutcome::Cancelled { output, elapsed } => {
                Err(ExtractionError::new(
                    format!("introspection timed out after {}ms", elapsed.as_millis()),
                    &output.stdout,
                    &output.stderr,
                ))
            }
        }
    }
}

/// Sidecar path for an entry: `<dir>/<stem>._map.json`.
pub fn sidecar_path(entry: &Path) -> PathBuf {
    let stem = entry
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    entry.with_file_name(format!("{stem}{SIDECAR_SUFFIX}"))
}

/// Write the canonical schema next to the unit's entry file.
pub async fn write_sidecar(unit: &UnitDescriptor, schema: &ParameterSchema) -> std::io::Result<()> {
    tokio::fs::write(sidecar_path(&unit.entry), schema.to_canonical_json()).await
}

/// Remove a unit's sidecar, ignoring a missing file.
pub async fn remove_sidecar(unit: &UnitDescriptor) {
    let path = sidecar_path(&unit.entry);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove schema sidecar"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
