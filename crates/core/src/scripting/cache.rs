//! Content-addressed store of installed dependency sets.
//!
//! Entries are keyed by [`DependencyDeclaration::digest`] and live at
//! `<deps_cache_dir>/<runtime>/<digest>/`. Units with byte-identical
//! declarations share one entry.
//!
//! Locking: the entry map sits behind a short-lived `std` mutex that is
//! never held across an `.await`. Each entry carries its own async install
//! lock, so installs are serialized per digest while unrelated digests
//! install in parallel up to `max_concurrent_installs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::deps::DependencyDeclaration;
use super::installer::PackageInstaller;
use super::runtime::RuntimeKind;
use crate::config::EngineConfig;
use crate::types::Timestamp;

/// Marker written into an entry directory after a successful install.
pub const META_FILE: &str = ".deps_meta.json";

/// Installation state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Pending,
    Installed,
    Failed,
}

/// Cache failures.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Terminal for the digest until retried with `force_reinstall`.
    #[error("Dependency install failed for {digest}: {diagnostic}")]
    InstallFailed { digest: String, diagnostic: String },

    #[error("Dependency cache is shutting down")]
    ShuttingDown,

    #[error("Dependency cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Answers whether a digest is still referenced by a live unit.
///
/// Consulted at cleanup time against current state, never a snapshot.
pub trait LiveReferences: Send + Sync {
    fn is_referenced(&self, digest: &str) -> bool;
}

#[derive(Debug)]
struct SlotState {
    state: InstallState,
    last_used: Timestamp,
    installed_at: Option<Timestamp>,
    diagnostic: Option<String>,
}

#[derive(Debug)]
struct CacheSlot {
    declaration: DependencyDeclaration,
    digest: String,
    location: PathBuf,
    created_at: Timestamp,
    state: Mutex<SlotState>,
    install_lock: tokio::sync::Mutex<()>,
}

impl CacheSlot {
    fn new(declaration: DependencyDeclaration, digest: String, location: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            declaration,
            digest,
            location,
            created_at: now,
            state: Mutex::new(SlotState {
                state: InstallState::Pending,
                last_used: now,
                installed_at: None,
                diagnostic: None,
            }),
            install_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SlotState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Handle to one cache entry. Cloning shares the entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    slot: Arc<CacheSlot>,
}

impl CacheEntry {
    pub fn digest(&self) -> &str {
        &self.slot.digest
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.slot.declaration.runtime
    }

    pub fn declaration(&self) -> &DependencyDeclaration {
        &self.slot.declaration
    }

    /// Directory holding the installed packages.
    pub fn location(&self) -> &Path {
        &self.slot.location
    }

    pub fn state(&self) -> InstallState {
        self.slot.with_state(|s| s.state)
    }

    pub fn is_installed(&self) -> bool {
        self.state() == InstallState::Installed
    }

    /// Whether the entry has packages on disk (empty declarations have none).
    pub fn has_packages(&self) -> bool {
        self.is_installed() && !self.slot.declaration.is_empty()
    }

    /// Diagnostic output of the last failed install.
    pub fn diagnostic(&self) -> Option<String> {
        self.slot.with_state(|s| s.diagnostic.clone())
    }

    /// Whether both handles refer to the same entry.
    pub fn same_entry(&self, other: &CacheEntry) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    pub fn status(&self) -> CacheEntryStatus {
        let (state, last_used, installed_at, diagnostic) = self
            .slot
            .with_state(|s| (s.state, s.last_used, s.installed_at, s.diagnostic.clone()));
        CacheEntryStatus {
            digest: self.slot.digest.clone(),
            runtime: self.runtime(),
            state,
            location: self.slot.location.clone(),
            specifiers: self.slot.declaration.specifiers.clone(),
            created_at: self.slot.created_at,
            installed_at,
            last_used,
            diagnostic,
            size_bytes: 0,
        }
    }
}

/// Read-only view of an entry for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStatus {
    pub digest: String,
    pub runtime: RuntimeKind,
    pub state: InstallState,
    pub location: PathBuf,
    pub specifiers: Vec<String>,
    pub created_at: Timestamp,
    pub installed_at: Option<Timestamp>,
    pub last_used: Timestamp,
    pub diagnostic: Option<String>,
    pub size_bytes: u64,
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub reclaimed_bytes: u64,
}

/// Persisted form of [`META_FILE`].
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    digest: String,
    runtime: RuntimeKind,
    specifiers: Vec<String>,
    installed_at: Timestamp,
    install_log: String,
}

/// The dependency cache.
pub struct DependencyCache {
    root: PathBuf,
    installer: Arc<dyn PackageInstaller>,
    entries: Mutex<HashMap<String, Arc<CacheSlot>>>,
    install_slots: Semaphore,
}

impl DependencyCache {
    /// Create an empty cache rooted at the configured cache directory.
    pub fn new(config: &EngineConfig, installer: Arc<dyn PackageInstaller>) -> Self {
        Self {
            root: config.deps_cache_dir(),
            installer,
            entries: Mutex::new(HashMap::new()),
            install_slots: Semaphore::new(config.max_concurrent_installs),
        }
    }

    /// Create the cache and adopt entries installed by a previous process.
    ///
    /// Directories without a valid marker (interrupted installs, leftover
    /// evictions) are removed.
    pub async fn open(
        config: &EngineConfig,
        installer: Arc<dyn PackageInstaller>,
    ) -> Result<Self, CacheError> {
        let cache = Self::new(config, installer);
        tokio::fs::create_dir_all(&cache.root).await?;

        let mut adopted = 0usize;
        for runtime in [RuntimeKind::Python, RuntimeKind::Node] {
            let runtime_dir = cache.root.join(runtime.as_str());
            let mut dir = match tokio::fs::read_dir(&runtime_dir).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(item) = dir.next_entry().await? {
                let path = item.path();
                match read_meta(&path).await {
                    Some(meta) if is_valid_meta(&meta, &path, runtime) => {
                        let declaration = DependencyDeclaration {
                            runtime,
                            specifiers: meta.specifiers,
                            source: None,
                        };
                        let slot = CacheSlot::new(declaration, meta.digest.clone(), path);
                        slot.with_state(|s| {
                            s.state = InstallState::Installed;
                            s.installed_at = Some(meta.installed_at);
                        });
                        cache.lock_entries().insert(meta.digest, Arc::new(slot));
                        adopted += 1;
                    }
                    _ => {
                        tracing::warn!(path = %path.display(), "Removing unrecognised cache directory");
                        if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                            tracing::warn!(path = %path.display(), error = %e, "Failed to remove cache directory");
                        }
                    }
                }
            }
        }

        tracing::info!(root = %cache.root.display(), adopted, "Dependency cache opened");
        Ok(cache)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CacheSlot>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn location_for(&self, declaration: &DependencyDeclaration, digest: &str) -> PathBuf {
        self.root.join(declaration.runtime.as_str()).join(digest)
    }

    /// Look up (or create as `pending`) the entry for `declaration`.
    ///
    /// Identical declarations always resolve to the same entry.
    pub fn resolve(&self, declaration: &DependencyDeclaration) -> CacheEntry {
        let digest = declaration.digest();
        let slot = {
            let mut entries = self.lock_entries();
            match entries.get(&digest) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let mut canonical = declaration.clone();
                    canonical.source = None;
                    let location = self.location_for(declaration, &digest);
                    let slot = Arc::new(CacheSlot::new(canonical, digest.clone(), location));
                    entries.insert(digest, Arc::clone(&slot));
                    slot
                }
            }
        };
        slot.with_state(|s| s.last_used = Utc::now());
        CacheEntry { slot }
    }

    /// Install `entry` unless it is already installed.
    ///
    /// At most one install per digest runs at a time; concurrent callers
    /// wait and share the outcome. A failed entry stays failed until
    /// `force_reinstall` is set.
    pub async fn install(&self, entry: &CacheEntry, force_reinstall: bool) -> Result<(), CacheError> {
        let slot = &entry.slot;
        let _install = slot.install_lock.lock().await;

        let (state, diagnostic) = slot.with_state(|s| (s.state, s.diagnostic.clone()));
        match state {
            InstallState::Installed if !force_reinstall => return Ok(()),
            InstallState::Failed if !force_reinstall => {
                return Err(CacheError::InstallFailed {
                    digest: slot.digest.clone(),
                    diagnostic: diagnostic.unwrap_or_default(),
                })
            }
            _ => {}
        }

        if slot.declaration.is_empty() {
            mark_installed(slot);
            return Ok(());
        }

        let _permit = self
            .install_slots
            .acquire()
            .await
            .map_err(|_| CacheError::ShuttingDown)?;

        slot.with_state(|s| {
            s.state = InstallState::Pending;
            s.diagnostic = None;
        });

        if tokio::fs::metadata(&slot.location).await.is_ok() {
            tokio::fs::remove_dir_all(&slot.location).await?;
        }
        tokio::fs::create_dir_all(&slot.location).await?;

        tracing::info!(digest = %slot.digest, runtime = %slot.declaration.runtime, "Installing dependency set");

        match self.installer.install(&slot.declaration, &slot.location).await {
            Ok(install_log) => {
                let meta = EntryMeta {
                    digest: slot.digest.clone(),
                    runtime: slot.declaration.runtime,
                    specifiers: slot.declaration.specifiers.clone(),
                    installed_at: Utc::now(),
                    install_log,
                };
                let json = serde_json::to_vec_pretty(&meta)
                    .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
                tokio::fs::write(slot.location.join(META_FILE), json).await?;
                mark_installed(slot);
                tracing::info!(digest = %slot.digest, "Dependency set installed");
                Ok(())
            }
            Err(e) => {
                let diagnostic = e.to_string();
                if let Err(rm) = tokio::fs::remove_dir_all(&slot.location).await {
                    tracing::warn!(digest = %slot.digest, error = %rm, "Failed to remove partial install");
                }
                slot.with_state(|s| {
                    s.state = InstallState::Failed;
                    s.diagnostic = Some(diagnostic.clone());
                });
                tracing::warn!(digest = %slot.digest, error = %diagnostic, "Dependency install failed");
                Err(CacheError::InstallFailed {
                    digest: slot.digest.clone(),
                    diagnostic,
                })
            }
        }
    }

    /// Resolve and install in one step.
    pub async fn ensure(&self, declaration: &DependencyDeclaration) -> Result<CacheEntry, CacheError> {
        let entry = self.resolve(declaration);
        self.install(&entry, false).await?;
        Ok(entry)
    }

    /// Look up an existing entry without creating one.
    pub fn get(&self, digest: &str) -> Option<CacheEntry> {
        self.lock_entries()
            .get(digest)
            .map(|slot| CacheEntry { slot: Arc::clone(slot) })
    }

    /// Status of every entry, with on-disk sizes.
    pub async fn entries(&self) -> Vec<CacheEntryStatus> {
        let handles: Vec<CacheEntry> = self
            .lock_entries()
            .values()
            .map(|slot| CacheEntry { slot: Arc::clone(slot) })
            .collect();

        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            let mut status = handle.status();
            status.size_bytes = dir_size(handle.location()).await;
            statuses.push(status);
        }
        statuses.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        statuses
    }

    /// Remove entries unused for longer than `max_age`.
    ///
    /// An entry survives if `live` still references its digest, if an
    /// install holds its lock, or if any caller holds a handle to it. All
    /// three checks run under the entry-map lock, so a concurrent
    /// `resolve` either keeps the entry alive or creates a fresh one.
    pub async fn cleanup(&self, max_age: Duration, live: &dyn LiveReferences) -> CleanupReport {
        let now = Utc::now();
        let mut doomed: Vec<(String, Option<PathBuf>)> = Vec::new();

        {
            let mut entries = self.lock_entries();
            entries.retain(|digest, slot| {
                let (state, last_used) = slot.with_state(|s| (s.state, s.last_used));
                let age = (now - last_used).to_std().unwrap_or_default();
                if state == InstallState::Pending || age <= max_age {
                    return true;
                }
                if Arc::strong_count(slot) > 1 || live.is_referenced(digest) {
                    return true;
                }
                let Ok(_install) = slot.install_lock.try_lock() else {
                    return true;
                };
                // Move the directory aside so a re-resolve of the same digest
                // installs into a clean location.
                match tombstone(&slot.location) {
                    Ok(moved) => {
                        doomed.push((digest.clone(), moved));
                        false
                    }
                    Err(e) => {
                        tracing::warn!(digest = %digest, error = %e, "Cannot evict cache entry");
                        true
                    }
                }
            });
        }

        let mut report = CleanupReport::default();
        for (digest, moved) in doomed {
            if let Some(path) = moved {
                report.reclaimed_bytes += dir_size(&path).await;
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    tracing::warn!(digest = %digest, error = %e, "Failed to delete evicted cache entry");
                }
            }
            tracing::info!(digest = %digest, "Evicted dependency cache entry");
            report.removed.push(digest);
        }
        report
    }
}

fn mark_installed(slot: &CacheSlot) {
    slot.with_state(|s| {
        s.state = InstallState::Installed;
        s.installed_at = Some(Utc::now());
        s.diagnostic = None;
        s.last_used = Utc::now();
    });
}

/// Rename `location` to a unique sibling for deferred deletion.
fn tombstone(location: &Path) -> std::io::Result<Option<PathBuf>> {
    if !location.exists() {
        return Ok(None);
    }
    let mut name = location.as_os_str().to_owned();
    name.push(format!(".evicted-{}", uuid::Uuid::new_v4()));
    let target = PathBuf::from(name);
    std::fs::rename(location, &target)?;
    Ok(Some(target))
}

async fn read_meta(dir: &Path) -> Option<EntryMeta> {
    let bytes = tokio::fs::read(dir.join(META_FILE)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn is_valid_meta(meta: &EntryMeta, dir: &Path, runtime: RuntimeKind) -> bool {
    let expected = DependencyDeclaration {
        runtime,
        specifiers: meta.specifiers.clone(),
        source: None,
    }
    .digest();
    meta.runtime == runtime
        && meta.digest == expected
        && dir.file_name().and_then(|n| n.to_str()) == Some(meta.digest.as_str())
}

/// Total size of regular files under `path` (0 if missing).
async fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut items) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(item)) = items.next_entry().await {
            let Ok(file_type) = item.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(item.path());
            } else if file_type.is_file() {
                if let Ok(meta) = item.metadata().await {
                    total += meta.len();
                }
            }
        }
    }
    total
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
