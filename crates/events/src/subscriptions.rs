//! Per-unit notification opt-in.
//!
//! Units are silent by default. [`NotifySubscriptions`] holds the ids of
//! units an operator opted in and persists them as a JSON array, so the
//! choice survives restarts and units that disappear and come back.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Failure to load or persist the opt-in set.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("notification settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notification settings file is not a JSON array of unit ids: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Unit ids whose runs are forwarded to the webhook.
pub struct NotifySubscriptions {
    path: PathBuf,
    units: Mutex<BTreeSet<String>>,
    /// Serialises file writes so the file always matches the latest toggle.
    persist: tokio::sync::Mutex<()>,
}

impl NotifySubscriptions {
    /// Empty set persisted to `path` on the first change.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_units(path.into(), BTreeSet::new())
    }

    /// Load the set stored at `path`. A missing file means no unit opted in.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SubscriptionError> {
        let path = path.into();
        let units = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::with_units(path, units))
    }

    fn with_units(path: PathBuf, units: BTreeSet<String>) -> Self {
        Self {
            path,
            units: Mutex::new(units),
            persist: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.units.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self, unit_id: &str) -> bool {
        self.lock().contains(unit_id)
    }

    /// Opted-in unit ids, sorted.
    pub fn enabled(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Turn notifications for `unit_id` on or off and persist the set.
    ///
    /// Returns whether anything changed.
    pub async fn set(&self, unit_id: &str, enabled: bool) -> Result<bool, SubscriptionError> {
        let _persist = self.persist.lock().await;
        let (changed, snapshot) = {
            let mut units = self.lock();
            let changed = if enabled {
                units.insert(unit_id.to_string())
            } else {
                units.remove(unit_id)
            };
            (changed, units.clone())
        };
        if changed {
            self.write(&snapshot).await?;
            tracing::info!(unit_id, enabled, "Notification setting changed");
        }
        Ok(changed)
    }

    async fn write(&self, units: &BTreeSet<String>) -> Result<(), SubscriptionError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(units)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn units_are_silent_until_enabled() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let subs = NotifySubscriptions::new(tmp.path().join("notify_units.json"));
        assert!(!subs.is_enabled("hello.sh"));

        assert!(subs.set("hello.sh", true).await.expect("enable"));
        assert!(!subs.set("hello.sh", true).await.expect("enable again"));
        assert!(subs.is_enabled("hello.sh"));
        assert_eq!(subs.enabled(), vec!["hello.sh".to_string()]);

        assert!(subs.set("hello.sh", false).await.expect("disable"));
        assert!(!subs.is_enabled("hello.sh"));
    }

    #[tokio::test]
    async fn choices_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("state").join("notify_units.json");
        let subs = NotifySubscriptions::new(&path);
        subs.set("tools/report.py", true).await.expect("enable");
        subs.set("a.sh", true).await.expect("enable");
        subs.set("a.sh", false).await.expect("disable");

        let reopened = NotifySubscriptions::open(&path).await.expect("open");
        assert_eq!(reopened.enabled(), vec!["tools/report.py".to_string()]);
    }

    #[tokio::test]
    async fn missing_file_means_nothing_enabled() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let subs = NotifySubscriptions::open(tmp.path().join("absent.json"))
            .await
            .expect("open");
        assert!(subs.enabled().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("notify_units.json");
        std::fs::write(&path, "{\"not\": \"a list\"}").expect("write");
        let result = NotifySubscriptions::open(&path).await;
        assert!(matches!(result, Err(SubscriptionError::Corrupt(_))));
    }
}
