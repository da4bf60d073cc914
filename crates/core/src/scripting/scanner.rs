//! Unit discovery and lifecycle management.
//!
//! [`UnitScanner::scan`] walks the unit tree, compares fingerprints against
//! known units and runs the pipeline (dependency resolve/install, schema
//! extraction) for every new or changed unit. After each cycle the
//! callable set is published as an immutable [`UnitCatalog`] snapshot so
//! request handlers never observe a half-updated unit.
//!
//! The scanner is the only writer of unit state. Execution outcomes reach
//! it through [`UnitScanner::report_failure`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;

use super::cache::{DependencyCache, LiveReferences};
use super::deps::DependencyDeclaration;
use super::environment::{EnvironmentBuilder, ExecutionEnvironment};
use super::extractor::{self, SchemaExtractor};
use super::ignore::IgnoreSet;
use super::runtime::RuntimeKind;
use super::schema::ParameterSchema;
use super::unit::{UnitDescriptor, UnitError, UnitState};
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::hashing::sha256_hex_parts;
use crate::types::{Timestamp, UnitId};

/// Fingerprint recorded for units whose entry cannot be read.
const UNREADABLE: &str = "unreadable";

/// Runtimes that can form group units (they have a declaration file).
const GROUP_RUNTIMES: [RuntimeKind; 2] = [RuntimeKind::Python, RuntimeKind::Node];

/// One unit as published in the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub descriptor: UnitDescriptor,
    pub schema: Option<ParameterSchema>,
    #[serde(skip)]
    pub environment: Option<ExecutionEnvironment>,
    pub declaration: DependencyDeclaration,
    pub error: Option<UnitError>,
}

impl CatalogEntry {
    /// Ready, with schema and environment in place.
    pub fn is_callable(&self) -> bool {
        self.descriptor.is_ready() && self.schema.is_some() && self.environment.is_some()
    }
}

/// Immutable snapshot of all known units.
#[derive(Debug, Default)]
pub struct UnitCatalog {
    pub generation: u64,
    pub published_at: Option<Timestamp>,
    units: BTreeMap<UnitId, Arc<CatalogEntry>>,
}

impl UnitCatalog {
    pub fn get(&self, id: &str) -> Option<&Arc<CatalogEntry>> {
        self.units.get(id)
    }

    /// Every unit, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CatalogEntry>> {
        self.units.values()
    }

    /// Units that can be executed right now.
    pub fn callable(&self) -> impl Iterator<Item = &Arc<CatalogEntry>> {
        self.units.values().filter(|u| u.is_callable())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Units that changed during one scan cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub added: Vec<UnitDescriptor>,
    pub changed: Vec<UnitDescriptor>,
    pub removed: Vec<UnitDescriptor>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// What discovery learned about an entry file.
struct Inspection {
    declaration: DependencyDeclaration,
    fingerprint: String,
}

struct Candidate {
    id: UnitId,
    entry: PathBuf,
    working_dir: PathBuf,
    runtime: RuntimeKind,
    group: bool,
    inspection: Result<Inspection, String>,
}

impl Candidate {
    fn fingerprint(&self) -> &str {
        match &self.inspection {
            Ok(inspection) => &inspection.fingerprint,
            Err(_) => UNREADABLE,
        }
    }

    fn discovered(&self) -> CatalogEntry {
        let declaration = match &self.inspection {
            Ok(inspection) => inspection.declaration.clone(),
            Err(_) => DependencyDeclaration::empty(self.runtime),
        };
        CatalogEntry {
            descriptor: UnitDescriptor {
                id: self.id.clone(),
                entry: self.entry.clone(),
                working_dir: self.working_dir.clone(),
                runtime: self.runtime,
                group: self.group,
                fingerprint: self.fingerprint().to_string(),
                dependency_digest: None,
                state: UnitState::Discovered,
                updated_at: Utc::now(),
            },
            schema: None,
            environment: None,
            declaration,
            error: None,
        }
    }
}

enum Change {
    Added,
    Changed,
}

/// Discovers units and drives them to `ready`.
pub struct UnitScanner {
    config: Arc<EngineConfig>,
    ignore: IgnoreSet,
    cache: Arc<DependencyCache>,
    builder: EnvironmentBuilder,
    extractor: SchemaExtractor,
    records: Mutex<HashMap<UnitId, CatalogEntry>>,
    catalog: watch::Sender<Arc<UnitCatalog>>,
    generation: AtomicU64,
    cycle: tokio::sync::Mutex<()>,
}

impl UnitScanner {
    pub fn new(config: Arc<EngineConfig>, cache: Arc<DependencyCache>) -> Self {
        let (catalog, _) = watch::channel(Arc::new(UnitCatalog::default()));
        Self {
            ignore: IgnoreSet::new(&config.scan_ignore_patterns),
            builder: EnvironmentBuilder::new(Arc::clone(&config)),
            extractor: SchemaExtractor::new(Arc::clone(&config)),
            config,
            cache,
            records: Mutex::new(HashMap::new()),
            catalog,
            generation: AtomicU64::new(0),
            cycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Current catalog snapshot.
    pub fn catalog(&self) -> Arc<UnitCatalog> {
        Arc::clone(&*self.catalog.borrow())
    }

    /// Receiver notified whenever a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<UnitCatalog>> {
        self.catalog.subscribe()
    }

    /// The dependency cache units resolve through.
    pub fn cache(&self) -> &Arc<DependencyCache> {
        &self.cache
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<UnitId, CatalogEntry>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one scan cycle. Cycles never overlap.
    pub async fn scan(&self) -> ScanReport {
        let _cycle = self.cycle.lock().await;
        let candidates = self.discover().await;

        let mut report = ScanReport::default();
        let mut pending: Vec<(Candidate, Change)> = Vec::new();
        {
            let mut records = self.lock_records();
            let seen: HashSet<UnitId> = candidates.iter().map(|c| c.id.clone()).collect();

            for candidate in candidates {
                let change = match records.get(&candidate.id) {
                    Some(known) if known.descriptor.fingerprint == candidate.fingerprint() => continue,
                    Some(_) => Change::Changed,
                    None => Change::Added,
                };
                records.insert(candidate.id.clone(), candidate.discovered());
                pending.push((candidate, change));
            }

            let gone: Vec<UnitId> = records.keys().filter(|id| !seen.contains(*id)).cloned().collect();
            for id in gone {
                if let Some(mut entry) = records.remove(&id) {
                    entry.descriptor.state = UnitState::Removed;
                    entry.descriptor.updated_at = Utc::now();
                    report.removed.push(entry.descriptor);
                }
            }
        }

        for descriptor in &report.removed {
            tracing::info!(unit_id = %descriptor.id, "Unit removed");
            extractor::remove_sidecar(descriptor).await;
        }

        let limit = self.config.max_concurrent_executions.max(1);
        let jobs: Vec<_> = pending.iter().map(|(candidate, _)| self.process(candidate, false)).collect();
        let processed: Vec<UnitDescriptor> = futures::stream::iter(jobs)
            .buffered(limit)
            .collect()
            .await;

        for ((_, change), descriptor) in pending.iter().zip(processed) {
            match change {
                Change::Added => report.added.push(descriptor),
                Change::Changed => report.changed.push(descriptor),
            }
        }

        self.publish();
        if !report.is_empty() {
            tracing::info!(
                added = report.added.len(),
                changed = report.changed.len(),
                removed = report.removed.len(),
                "Scan cycle complete",
            );
        }
        report
    }

    /// Re-run a unit's pipeline now.
    ///
    /// With `force_reinstall` a failed (or installed) dependency set is
    /// installed again; otherwise a failed install stays failed.
    pub async fn retry(&self, unit_id: &str, force_reinstall: bool) -> Result<UnitDescriptor, CoreError> {
        let _cycle = self.cycle.lock().await;
        let known = self
            .lock_records()
            .get(unit_id)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| CoreError::NotFound {
                entity: "Unit",
                id: unit_id.to_string(),
            })?;

        let content = tokio::fs::read_to_string(&known.entry).await;
        let candidate = self
            .candidate(
                known.id.clone(),
                known.entry.clone(),
                known.working_dir.clone(),
                known.runtime,
                known.group,
                content,
            )
            .await;
        self.lock_records().insert(candidate.id.clone(), candidate.discovered());

        tracing::info!(unit_id, force_reinstall, "Retrying unit pipeline");
        let descriptor = self.process(&candidate, force_reinstall).await;
        self.publish();
        Ok(descriptor)
    }

    /// Flip a unit to `error` immediately.
    ///
    /// Clears the fingerprint so the next scan cycle re-runs the pipeline.
    pub fn report_failure(&self, unit_id: &str, message: &str) {
        {
            let mut records = self.lock_records();
            let Some(entry) = records.get_mut(unit_id) else {
                return;
            };
            entry.descriptor.state = UnitState::Error;
            entry.descriptor.fingerprint.clear();
            entry.descriptor.updated_at = Utc::now();
            entry.error = Some(UnitError::Discovery(message.to_string()));
        }
        tracing::warn!(unit_id, error = message, "Unit marked as error after execution failure");
        self.publish();
    }

    fn publish(&self) {
        let snapshot = {
            let records = self.lock_records();
            UnitCatalog {
                generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
                published_at: Some(Utc::now()),
                units: records
                    .iter()
                    .map(|(id, entry)| (id.clone(), Arc::new(entry.clone())))
                    .collect(),
            }
        };
        self.catalog.send_replace(Arc::new(snapshot));
    }

    // -- pipeline -----------------------------------------------------------

    /// Run resolve -> install -> build -> extract for one candidate.
    async fn process(&self, candidate: &Candidate, force_reinstall: bool) -> UnitDescriptor {
        let inspection = match &candidate.inspection {
            Ok(inspection) => inspection,
            Err(message) => return self.fail(candidate, UnitError::Discovery(message.clone())),
        };

        let cache_entry = self.cache.resolve(&inspection.declaration);
        let digest = cache_entry.digest().to_string();
        self.update(candidate, |entry| {
            entry.descriptor.dependency_digest = Some(digest.clone());
        });

        if let Err(e) = self.cache.install(&cache_entry, force_reinstall).await {
            return self.fail(candidate, UnitError::DependencyInstall(e.to_string()));
        }

        let Some(descriptor) = self.update(candidate, |entry| {
            entry.descriptor.state = UnitState::SchemaPending;
        }) else {
            return candidate.discovered().descriptor;
        };

        let env = self.builder.build(&descriptor, &cache_entry);
        let schema = match self.extractor.extract(&descriptor, &env).await {
            Ok(schema) => schema,
            Err(e) => return self.fail(candidate, UnitError::Extraction(e.diagnostic())),
        };

        if let Err(e) = extractor::write_sidecar(&descriptor, &schema).await {
            tracing::warn!(unit_id = %candidate.id, error = %e, "Failed to write schema sidecar");
        }

        let parameters = schema.len();
        let ready = self.update(candidate, move |entry| {
            entry.descriptor.state = UnitState::Ready;
            entry.schema = Some(schema);
            entry.environment = Some(env);
            entry.error = None;
        });
        tracing::info!(unit_id = %candidate.id, runtime = %candidate.runtime, parameters, "Unit ready");
        ready.unwrap_or(descriptor)
    }

    fn fail(&self, candidate: &Candidate, error: UnitError) -> UnitDescriptor {
        tracing::warn!(unit_id = %candidate.id, error = %error, "Unit pipeline failed");
        self.update(candidate, |entry| {
            entry.descriptor.state = UnitState::Error;
            entry.schema = None;
            entry.environment = None;
            entry.error = Some(error);
        })
        .unwrap_or_else(|| candidate.discovered().descriptor)
    }

    /// Apply `f` to the candidate's record if it still has the candidate's
    /// fingerprint. Returns the updated descriptor.
    fn update(&self, candidate: &Candidate, f: impl FnOnce(&mut CatalogEntry)) -> Option<UnitDescriptor> {
        let mut records = self.lock_records();
        let entry = records.get_mut(&candidate.id)?;
        if entry.descriptor.fingerprint != candidate.fingerprint() {
            return None;
        }
        f(entry);
        entry.descriptor.updated_at = Utc::now();
        Some(entry.descriptor.clone())
    }

    // -- discovery ----------------------------------------------------------

    async fn discover(&self) -> Vec<Candidate> {
        let root = self.config.units_dir.clone();
        let mut found = Vec::new();

        if !tokio::fs::metadata(&root).await.map(|m| m.is_dir()).unwrap_or(false) {
            tracing::warn!(root = %root.display(), "Unit directory does not exist");
            return found;
        }

        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            if dir != root {
                if let Some(group) = self.group_candidate(&dir).await {
                    found.push(group);
                    continue;
                }
            }

            let mut items = match tokio::fs::read_dir(&dir).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Cannot read unit directory");
                    continue;
                }
            };

            loop {
                let item = match items.next_entry().await {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), error = %e, "Directory walk interrupted");
                        break;
                    }
                };
                let name = item.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if self.ignore.is_ignored(name) {
                    continue;
                }

                let path = item.path();
                let Ok(file_type) = item.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                // Follow file symlinks but never directory symlinks.
                let is_file = file_type.is_file()
                    || (file_type.is_symlink()
                        && tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false));
                if !is_file {
                    continue;
                }
                let Some(runtime) = RuntimeKind::from_path(&path) else {
                    continue;
                };

                let content = tokio::fs::read_to_string(&path).await;
                if matches!(&content, Ok(text) if !runtime.has_entry_point(text)) {
                    continue;
                }
                let id = relative_id(&root, &path);
                found.push(
                    self.candidate(id, path, dir.clone(), runtime, false, content)
                        .await,
                );
            }
        }

        found
    }

    /// A directory with both a group entry file and a declaration file.
    async fn group_candidate(&self, dir: &Path) -> Option<Candidate> {
        for runtime in GROUP_RUNTIMES {
            let declaration = dir.join(runtime.declaration_file()?);
            if !is_file(&declaration).await {
                continue;
            }
            for name in runtime.group_entry_names() {
                let entry = dir.join(name);
                if !is_file(&entry).await {
                    continue;
                }
                let content = tokio::fs::read_to_string(&entry).await;
                if matches!(&content, Ok(text) if !runtime.has_entry_point(text)) {
                    continue;
                }
                let id = relative_id(&self.config.units_dir, dir);
                return Some(
                    self.candidate(id, entry, dir.to_path_buf(), runtime, true, content)
                        .await,
                );
            }
        }
        None
    }

    async fn candidate(
        &self,
        id: UnitId,
        entry: PathBuf,
        working_dir: PathBuf,
        runtime: RuntimeKind,
        group: bool,
        content: std::io::Result<String>,
    ) -> Candidate {
        let inspection = match content {
            Err(e) => Err(format!("cannot read {}: {e}", entry.display())),
            Ok(text) => match DependencyDeclaration::load_for(&entry, &self.config.units_dir, runtime).await {
                Err(e) => Err(format!("cannot read dependency declaration: {e}")),
                Ok(declaration) => {
                    let fingerprint =
                        sha256_hex_parts([text.as_bytes(), declaration.digest().as_bytes()]);
                    Ok(Inspection {
                        declaration,
                        fingerprint,
                    })
                }
            },
        };
        Candidate {
            id,
            entry,
            working_dir,
            runtime,
            group,
            inspection,
        }
    }
}

impl LiveReferences for UnitScanner {
    /// Any known (non-removed) unit resolving to `digest` keeps it alive.
    fn is_referenced(&self, digest: &str) -> bool {
        self.lock_records()
            .values()
            .any(|entry| entry.descriptor.dependency_digest.as_deref() == Some(digest))
    }
}

fn relative_id(root: &Path, path: &Path) -> UnitId {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
