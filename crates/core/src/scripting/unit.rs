//! Unit descriptors and lifecycle state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::runtime::RuntimeKind;
use crate::types::{Timestamp, UnitId};

/// Lifecycle of a unit as seen by the scanner.
///
/// `discovered -> schema_pending -> ready`, with `error` reachable from any
/// pipeline stage and `removed` once the entry file disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Discovered,
    SchemaPending,
    Ready,
    Error,
    Removed,
}

impl UnitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::SchemaPending => "schema_pending",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Removed => "removed",
        }
    }
}

/// A discovered, independently callable script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    /// Path of the entry file (or group directory) relative to the unit
    /// root, `/`-separated.
    pub id: UnitId,
    /// Absolute entry-point location.
    pub entry: PathBuf,
    /// Directory the unit runs in.
    pub working_dir: PathBuf,
    pub runtime: RuntimeKind,
    /// Whether the unit is a directory with its own dependency declaration.
    pub group: bool,
    /// Digest of the entry content and the dependency declaration.
    pub fingerprint: String,
    /// Cache key of the unit's dependency set.
    pub dependency_digest: Option<String>,
    pub state: UnitState,
    pub updated_at: Timestamp,
}

impl UnitDescriptor {
    pub fn is_ready(&self) -> bool {
        self.state == UnitState::Ready
    }
}

/// Scanner-stage failures. Recovered by marking the unit `error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "stage", content = "message", rename_all = "snake_case")]
pub enum UnitError {
    /// Unit unreadable or malformed layout.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Introspection output missing, malformed or timed out.
    #[error("Schema extraction failed: {0}")]
    Extraction(String),

    /// Package-manager failure (terminal for the digest until forced).
    #[error("Dependency install failed: {0}")]
    DependencyInstall(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_error_serializes_with_stage() {
        let json = serde_json::to_value(UnitError::Extraction("exit 2".into())).expect("json");
        assert_eq!(json, serde_json::json!({"stage": "extraction", "message": "exit 2"}));
    }

    #[test]
    fn state_names_match_wire_form() {
        let json = serde_json::to_value(UnitState::SchemaPending).expect("json");
        assert_eq!(json, UnitState::SchemaPending.as_str());
    }
}
