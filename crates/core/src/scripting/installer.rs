//! Package-manager invocation for dependency sets.
//!
//! [`PackageInstaller`] is the seam the [`DependencyCache`](super::cache::DependencyCache)
//! installs through. [`SystemInstaller`] shells out to `pip` and `npm`,
//! installing into an isolated target directory so nothing touches the
//! host interpreter's site-packages or global `node_modules`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::deps::DependencyDeclaration;
use super::runtime::RuntimeKind;
use super::subprocess::{self, ProcessError, ProcessLimits, ProcessOutcome};
use crate::config::EngineConfig;

/// Package-manager failure.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("package manager exited with code {exit_code}: {output}")]
    Failed { exit_code: i32, output: String },

    #[error("package manager timed out after {}s: {output}", .after.as_secs())]
    TimedOut { after: Duration, output: String },

    #[error("cannot run package manager: {0}")]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installs a declaration's packages into a target directory.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Install every specifier of `declaration` into `target` (which exists
    /// and is empty). Returns the package manager's log.
    async fn install(
        &self,
        declaration: &DependencyDeclaration,
        target: &Path,
    ) -> Result<String, InstallError>;
}

/// `pip install --target` / `npm install --prefix` installer.
pub struct SystemInstaller {
    config: Arc<EngineConfig>,
}

impl SystemInstaller {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    fn command(&self, declaration: &DependencyDeclaration, target: &Path) -> Option<Command> {
        match declaration.runtime {
            RuntimeKind::Python => {
                let mut cmd = Command::new(&self.config.interpreters.python);
                cmd.args(["-m", "pip", "install", "--no-input", "--disable-pip-version-check"])
                    .arg("--target")
                    .arg(target)
                    .args(&declaration.specifiers)
                    .env("PYTHONNOUSERSITE", "1");
                Some(cmd)
            }
            RuntimeKind::Node => {
                let mut cmd = Command::new(&self.config.interpreters.npm);
                cmd.args(["install", "--no-audit", "--no-fund", "--prefix"])
                    .arg(target)
                    .args(&declaration.specifiers);
                Some(cmd)
            }
            RuntimeKind::Shell => None,
        }
    }
}

#[async_trait]
impl PackageInstaller for SystemInstaller {
    async fn install(
        &self,
        declaration: &DependencyDeclaration,
        target: &Path,
    ) -> Result<String, InstallError> {
        if declaration.runtime == RuntimeKind::Node {
            // npm resolves --prefix to the nearest package.json otherwise.
            tokio::fs::write(
                target.join("package.json"),
                r#"{"name":"scriptgate-deps","private":true}"#,
            )
            .await?;
        }

        let Some(mut cmd) = self.command(declaration, target) else {
            return Ok(String::new());
        };
        cmd.current_dir(target);

        let limits = ProcessLimits {
            timeout: self.config.install_timeout,
            kill_grace: self.config.kill_grace,
            max_output_bytes: self.config.max_output_bytes,
        };

        tracing::info!(
            runtime = %declaration.runtime,
            packages = declaration.specifiers.len(),
            target = %target.display(),
            "Installing dependencies",
        );

        match subprocess::run_command(&mut cmd, &limits, None).await? {
            ProcessOutcome::Exited {
                exit_code: 0,
                output,
                ..
            } => Ok(join_log(&output.stdout, &output.stderr)),
            ProcessOutcome::Exited {
                exit_code, output, ..
            } => Err(InstallError::Failed {
                exit_code,
                output: join_log(&output.stdout, &output.stderr),
            }),
            ProcessOutcome::TimedOut { output, .. } | ProcessOutcome::Cancelled { output, .. } => {
                Err(InstallError::TimedOut {
                    after: limits.timeout,
                    output: join_log(&output.stdout, &output.stderr),
                })
            }
        }
    }
}

fn join_log(stdout: &str, stderr: &str) -> String {
    match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
