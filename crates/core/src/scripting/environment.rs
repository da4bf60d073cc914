//! Per-unit execution environments.
//!
//! An [`ExecutionEnvironment`] is a plain value: interpreter, entry
//! argument, working directory and the exact variables to set or clear.
//! Nothing here mutates the host process; isolation comes from pointing the
//! interpreter search path at the unit's own cache entry and clearing any
//! inherited search path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Command;

use super::cache::CacheEntry;
use super::runtime::RuntimeKind;
use super::unit::UnitDescriptor;
use crate::config::EngineConfig;

/// Inherited variables that could leak host packages into a unit.
const CLEARED_VARS: &[&str] = &["PYTHONPATH", "PYTHONHOME", "PYTHONSTARTUP", "NODE_PATH", "NODE_OPTIONS"];

/// Everything needed to spawn a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionEnvironment {
    pub runtime: RuntimeKind,
    /// Interpreter executable.
    pub program: String,
    /// Entry file, passed as the interpreter's first argument.
    pub entry: PathBuf,
    pub working_dir: PathBuf,
    /// Interpreter search path, highest priority first.
    pub search_paths: Vec<PathBuf>,
    /// Variables set for the child (search path included).
    pub env_vars: BTreeMap<String, String>,
    /// Inherited variables removed from the child.
    pub cleared_vars: Vec<String>,
    /// Digest of the dependency set the environment points at.
    pub dependency_digest: String,
}

impl ExecutionEnvironment {
    /// Build a command running the entry with `args`.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.entry).args(args).current_dir(&self.working_dir);
        for var in &self.cleared_vars {
            cmd.env_remove(var);
        }
        cmd.envs(&self.env_vars);
        cmd
    }
}

/// Builds [`ExecutionEnvironment`]s from engine configuration.
#[derive(Clone)]
pub struct EnvironmentBuilder {
    config: Arc<EngineConfig>,
}

impl EnvironmentBuilder {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    pub fn build(&self, unit: &UnitDescriptor, cache_entry: &CacheEntry) -> ExecutionEnvironment {
        let interpreters = &self.config.interpreters;
        let program = match unit.runtime {
            RuntimeKind::Python => interpreters.python.clone(),
            RuntimeKind::Node => interpreters.node.clone(),
            RuntimeKind::Shell => interpreters.shell.clone(),
        };

        let mut search_paths = Vec::new();
        let mut env_vars = BTreeMap::new();

        match unit.runtime {
            RuntimeKind::Python => {
                if cache_entry.has_packages() {
                    search_paths.push(cache_entry.location().to_path_buf());
                }
                search_paths.push(unit.working_dir.clone());
                env_vars.insert("PYTHONPATH".to_string(), join_paths(&search_paths));
                env_vars.insert("PYTHONNOUSERSITE".to_string(), "1".to_string());
                env_vars.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
                env_vars.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
                env_vars.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
            }
            RuntimeKind::Node => {
                if cache_entry.has_packages() {
                    search_paths.push(cache_entry.location().join("node_modules"));
                }
                if !search_paths.is_empty() {
                    env_vars.insert("NODE_PATH".to_string(), join_paths(&search_paths));
                }
            }
            RuntimeKind::Shell => {}
        }

        let units_root = absolute(&self.config.units_dir);
        env_vars.insert("SCRIPT_ID".to_string(), unit.id.clone());
        env_vars.insert("SCRIPT_PATH".to_string(), unit.entry.to_string_lossy().into_owned());
        env_vars.insert("SCRIPT_DIR".to_string(), unit.working_dir.to_string_lossy().into_owned());
        env_vars.insert("UNITS_ROOT".to_string(), units_root.to_string_lossy().into_owned());

        ExecutionEnvironment {
            runtime: unit.runtime,
            program,
            entry: unit.entry.clone(),
            working_dir: unit.working_dir.clone(),
            search_paths,
            env_vars,
            cleared_vars: CLEARED_VARS.iter().map(|v| v.to_string()).collect(),
            dependency_digest: cache_entry.digest().to_string(),
        }
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join(":")
}

fn absolute(path: &std::path::Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::Utc;

    use super::*;
    use crate::scripting::cache::DependencyCache;
    use crate::scripting::deps::DependencyDeclaration;
    use crate::scripting::subprocess::{run_command, ProcessLimits, ProcessOutcome};
    use crate::scripting::test_helpers::{test_config, write_script, CountingInstaller};
    use crate::scripting::unit::UnitState;

    fn descriptor(entry: &Path, runtime: RuntimeKind) -> UnitDescriptor {
        UnitDescriptor {
            id: entry.file_name().expect("name").to_string_lossy().into_owned(),
            entry: entry.to_path_buf(),
            working_dir: entry.parent().expect("parent").to_path_buf(),
            runtime,
            group: false,
            fingerprint: "f".into(),
            dependency_digest: None,
            state: UnitState::Ready,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn python_search_path_points_at_the_cache_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(tmp.path(), tmp.path()));
        let cache = DependencyCache::new(&config, Arc::new(CountingInstaller::default()));
        let entry = cache
            .ensure(&DependencyDeclaration::parse(RuntimeKind::Python, "requests"))
            .await
            .expect("ensure");

        let unit = descriptor(&tmp.path().join("tool.py"), RuntimeKind::Python);
        let env = EnvironmentBuilder::new(Arc::clone(&config)).build(&unit, &entry);

        assert_eq!(env.program, "bash");
        assert_eq!(env.search_paths[0], entry.location());
        assert_eq!(env.search_paths[1], tmp.path());
        assert_eq!(env.env_vars["SCRIPT_ID"], "tool.py");
        assert!(env.env_vars["PYTHONPATH"].starts_with(&*entry.location().to_string_lossy()));
        assert!(env.cleared_vars.contains(&"PYTHONPATH".to_string()));
        assert_eq!(env.dependency_digest, entry.digest());
    }

    #[tokio::test]
    async fn different_dependency_sets_never_share_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(tmp.path(), tmp.path()));
        let cache = DependencyCache::new(&config, Arc::new(CountingInstaller::default()));
        let builder = EnvironmentBuilder::new(Arc::clone(&config));

        let a = cache
            .ensure(&DependencyDeclaration::parse(RuntimeKind::Node, "left-pad@1"))
            .await
            .expect("ensure");
        let b = cache
            .ensure(&DependencyDeclaration::parse(RuntimeKind::Node, "left-pad@2"))
            .await
            .expect("ensure");

        let env_a = builder.build(&descriptor(&tmp.path().join("a.js"), RuntimeKind::Node), &a);
        let env_b = builder.build(&descriptor(&tmp.path().join("b.js"), RuntimeKind::Node), &b);
        assert_ne!(env_a.env_vars["NODE_PATH"], env_b.env_vars["NODE_PATH"]);
        assert!(env_a.search_paths.iter().all(|p| !env_b.search_paths.contains(p)));
    }

    #[tokio::test]
    async fn command_runs_entry_in_unit_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(test_config(tmp.path(), tmp.path()));
        let cache = DependencyCache::new(&config, Arc::new(CountingInstaller::default()));
        let entry = cache
            .ensure(&DependencyDeclaration::empty(RuntimeKind::Shell))
            .await
            .expect("ensure");

        let script = write_script(
            tmp.path(),
            "env.sh",
            "echo \"${NODE_PATH:-unset}|$SCRIPT_ID|$PWD|$1\"\n",
        );
        let env = EnvironmentBuilder::new(Arc::clone(&config))
            .build(&descriptor(&script, RuntimeKind::Shell), &entry);
        let mut cmd = env.command(["arg"]);

        let limits = ProcessLimits::new(
            std::time::Duration::from_secs(5),
            std::time::Duration::from_millis(100),
        );
        let outcome = run_command(&mut cmd, &limits, None).await.expect("run");
        let ProcessOutcome::Exited { output, .. } = outcome else {
            panic!("expected exit");
        };
        let cwd = std::fs::canonicalize(tmp.path()).expect("canonicalize");
        assert_eq!(
            output.stdout.trim(),
            format!("unset|env.sh|{}|arg", cwd.display())
        );
    }
}
