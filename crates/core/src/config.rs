//! Engine configuration.
//!
//! [`EngineConfig`] is resolved once at startup and handed to each engine
//! component by `Arc`. Every key is looked up in this order:
//!
//! 1. persisted override (`snake_case` key in the settings JSON file),
//! 2. environment variable (the upper-cased key),
//! 3. built-in default.
//!
//! | Key                          | Default                                        |
//! |------------------------------|------------------------------------------------|
//! | `units_dir`                  | `scripts_repo`                                 |
//! | `work_dir`                   | `.scriptgate`                                  |
//! | `scan_interval_sec`          | `5`                                            |
//! | `execution_timeout_sec`      | `600`                                          |
//! | `max_execution_timeout_sec`  | `3600`                                         |
//! | `schema_timeout_sec`         | `30`                                           |
//! | `install_timeout_sec`        | `300`                                          |
//! | `kill_grace_sec`             | `5`                                            |
//! | `max_concurrent_installs`    | `4`                                            |
//! | `max_concurrent_executions`  | `16`                                           |
//! | `max_output_bytes`           | `10485760`                                     |
//! | `cache_retention_days`       | `30`                                           |
//! | `cache_cleanup_interval_sec` | `86400`                                        |
//! | `scan_ignore_patterns`       | `node_modules,__pycache__,.git,.venv,*.pyc,.*` |
//! | `python_bin`                 | `python3`                                      |
//! | `node_bin`                   | `node`                                         |
//! | `shell_bin`                  | `bash`                                         |
//! | `npm_bin`                    | `npm`                                          |
//! | `notify_url`                 | unset                                          |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Environment variable naming the persisted settings file.
pub const SETTINGS_FILE_ENV: &str = "SETTINGS_FILE";

/// Settings file used when `SETTINGS_FILE` is not set.
pub const DEFAULT_SETTINGS_FILE: &str = "settings.json";

const DEFAULT_IGNORE_PATTERNS: &str = "node_modules,__pycache__,.git,.venv,*.pyc,.*";

const SECS_PER_DAY: u64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Persisted overrides
// ---------------------------------------------------------------------------

/// Operator overrides persisted by the management surface.
///
/// Stored as a flat JSON object. Non-string values are kept in their JSON
/// text form so `"scan_interval_sec": 10` and `"scan_interval_sec": "10"`
/// behave the same.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    values: HashMap<String, String>,
}

impl SettingsOverrides {
    /// Build overrides from an in-memory map.
    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Load overrides from a JSON file. A missing file yields no overrides.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(CoreError::Internal(format!(
                    "Cannot read settings file {}: {e}",
                    path.display()
                )))
            }
        };

        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
            .map_err(|e| {
                CoreError::Validation(format!(
                    "Settings file {} is not a JSON object: {e}",
                    path.display()
                ))
            })?;

        let values = object
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();

        Ok(Self { values })
    }

    /// Look up a single override.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Interpreter and package-manager executables.
#[derive(Debug, Clone)]
pub struct Interpreters {
    pub python: String,
    pub node: String,
    pub shell: String,
    pub npm: String,
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the unit tree.
    pub units_dir: PathBuf,
    /// Root for the dependency cache and per-run scratch directories.
    pub work_dir: PathBuf,
    pub scan_interval: Duration,
    /// Deadline applied when a caller does not supply one.
    pub execution_timeout: Duration,
    /// Ceiling on caller-supplied deadlines.
    pub max_execution_timeout: Duration,
    pub schema_timeout: Duration,
    pub install_timeout: Duration,
    /// Window between the graceful and the forceful termination signal.
    pub kill_grace: Duration,
    pub max_concurrent_installs: usize,
    pub max_concurrent_executions: usize,
    /// Per-stream capture cap for subprocess output.
    pub max_output_bytes: usize,
    pub cache_retention: Duration,
    pub cache_cleanup_interval: Duration,
    pub scan_ignore_patterns: Vec<String>,
    pub interpreters: Interpreters,
    pub notify_url: Option<String>,
}

impl EngineConfig {
    /// Resolve from the process environment and the persisted settings file.
    pub fn from_env() -> Result<Self, CoreError> {
        let settings_path = std::env::var(SETTINGS_FILE_ENV)
            .unwrap_or_else(|_| DEFAULT_SETTINGS_FILE.to_string());
        let overrides = SettingsOverrides::load(Path::new(&settings_path))?;
        Self::resolve(&overrides, |key| std::env::var(key).ok())
    }

    /// Resolve every key from `overrides`, then `env`, then the default.
    ///
    /// `env` receives upper-cased keys.
    pub fn resolve<F>(overrides: &SettingsOverrides, env: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let r = Resolver { overrides, env };

        let max_concurrent_installs: usize = r.parse("max_concurrent_installs", 4)?;
        let max_concurrent_executions: usize = r.parse("max_concurrent_executions", 16)?;
        if max_concurrent_installs == 0 || max_concurrent_executions == 0 {
            return Err(CoreError::Validation(
                "Concurrency limits must be at least 1".to_string(),
            ));
        }

        let scan_ignore_patterns = r
            .string("scan_ignore_patterns", DEFAULT_IGNORE_PATTERNS)
            .replace('\n', ",")
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && !p.starts_with('#'))
            .collect();

        let notify_url = r.lookup("notify_url").filter(|u| !u.trim().is_empty());

        Ok(Self {
            units_dir: r.dir("units_dir", "scripts_repo")?,
            work_dir: r.dir("work_dir", ".scriptgate")?,
            scan_interval: r.nonzero_secs("scan_interval_sec", 5)?,
            execution_timeout: r.nonzero_secs("execution_timeout_sec", 600)?,
            max_execution_timeout: r.nonzero_secs("max_execution_timeout_sec", 3600)?,
            schema_timeout: r.nonzero_secs("schema_timeout_sec", 30)?,
            install_timeout: r.nonzero_secs("install_timeout_sec", 300)?,
            kill_grace: r.secs("kill_grace_sec", 5)?,
            max_concurrent_installs,
            max_concurrent_executions,
            max_output_bytes: r.parse("max_output_bytes", 10 * 1024 * 1024)?,
            cache_retention: Duration::from_secs(
                r.parse::<u64>("cache_retention_days", 30)?
                    .saturating_mul(SECS_PER_DAY),
            ),
            cache_cleanup_interval: r.nonzero_secs("cache_cleanup_interval_sec", SECS_PER_DAY)?,
            scan_ignore_patterns,
            interpreters: Interpreters {
                python: r.string("python_bin", "python3"),
                node: r.string("node_bin", "node"),
                shell: r.string("shell_bin", "bash"),
                npm: r.string("npm_bin", "npm"),
            },
            notify_url,
        })
    }

    /// Directory holding installed dependency sets.
    pub fn deps_cache_dir(&self) -> PathBuf {
        self.work_dir.join("deps_cache")
    }

    /// Directory holding per-execution scratch directories.
    pub fn runs_dir(&self) -> PathBuf {
        self.work_dir.join("runs")
    }

    /// Clamp a caller-supplied deadline to the configured ceiling.
    pub fn effective_deadline(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|d| !d.is_zero())
            .unwrap_or(self.execution_timeout)
            .min(self.max_execution_timeout)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Defaults only fail when the working directory is gone.
        Self::resolve(&SettingsOverrides::default(), |_| None)
            .unwrap_or_else(|e| panic!("cannot resolve default engine configuration: {e}"))
    }
}

struct Resolver<'a, F> {
    overrides: &'a SettingsOverrides,
    env: F,
}

impl<F> Resolver<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn lookup(&self, key: &str) -> Option<String> {
        self.overrides
            .get(key)
            .map(str::to_string)
            .or_else(|| (self.env)(&key.to_uppercase()))
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.lookup(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, CoreError> {
        match self.lookup(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                CoreError::Validation(format!("{key} has an invalid value: {raw:?}"))
            }),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, CoreError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn nonzero_secs(&self, key: &str, default: u64) -> Result<Duration, CoreError> {
        let value = self.secs(key, default)?;
        if value.is_zero() {
            return Err(CoreError::Validation(format!("{key} must be at least 1")));
        }
        Ok(value)
    }

    /// Anchored to the working directory at startup; every child process
    /// runs with its own `current_dir`.
    fn dir(&self, key: &str, default: &str) -> Result<PathBuf, CoreError> {
        let raw = self.string(key, default);
        std::path::absolute(raw.trim())
            .map_err(|e| CoreError::Validation(format!("{key} is not a usable path ({raw:?}): {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
