//! Shared subprocess management utilities.
//!
//! Provides [`run_command`], the spawn + capture + deadline logic shared by
//! schema extraction, execution and package installation. Callers build a
//! [`tokio::process::Command`] for their runtime and delegate the rest here.
//!
//! Every child is started as the leader of its own process group so that a
//! deadline or cancellation can signal the whole tree: `SIGTERM` first, then
//! `SIGKILL` once the grace window expires.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default cap on captured stdout or stderr (10 MiB).
///
/// Output beyond the cap is read and discarded so the child never blocks
/// on a full pipe.
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// How long to wait for output pipes to close after the child is gone.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Deadline and capture limits for one subprocess run.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    /// Wall-clock deadline, measured from spawn.
    pub timeout: Duration,
    /// Window between `SIGTERM` and `SIGKILL` when terminating.
    pub kill_grace: Duration,
    /// Per-stream capture cap.
    pub max_output_bytes: usize,
}

impl ProcessLimits {
    pub fn new(timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            timeout,
            kill_grace,
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }
}

/// Captured output streams.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

/// How a subprocess run ended.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The process exited on its own. `exit_code` is `-1` when killed by a signal.
    Exited {
        exit_code: i32,
        output: Captured,
        elapsed: Duration,
    },
    /// The deadline expired; the process group was terminated.
    TimedOut { output: Captured, elapsed: Duration },
    /// The cancellation token fired; the process group was terminated.
    Cancelled { output: Captured, elapsed: Duration },
}

impl ProcessOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Exited { elapsed, .. }
            | Self::TimedOut { elapsed, .. }
            | Self::Cancelled { elapsed, .. } => *elapsed,
        }
    }

    pub fn output(&self) -> &Captured {
        match self {
            Self::Exited { output, .. }
            | Self::TimedOut { output, .. }
            | Self::Cancelled { output, .. } => output,
        }
    }
}

/// Errors raised before a subprocess is running.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program (interpreter or entry point) does not exist.
    #[error("Executable not found: {0}")]
    NotFound(String),

    /// The program exists but cannot be executed.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The host refused to create a process (EAGAIN, EMFILE, ENFILE, ENOMEM).
    #[error("Host cannot spawn processes: {0}")]
    ResourceExhausted(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Whether this failure is about the host rather than the unit.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// Spawn `cmd`, capture stdout/stderr and enforce `limits`.
///
/// Stdin is closed. The caller sets program, arguments, environment and
/// working directory. When `cancel` fires the process group is terminated
/// exactly as on a deadline and [`ProcessOutcome::Cancelled`] is returned.
pub async fn run_command(
    cmd: &mut Command,
    limits: &ProcessLimits,
    cancel: Option<&CancellationToken>,
) -> Result<ProcessOutcome, ProcessError> {
    // `kill_on_drop(true)` is the last line of defence if this future is dropped.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    let mut child = cmd.spawn().map_err(|e| classify_spawn_error(&program, e))?;
    let pgid = child.id();

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let mut readers = vec![
        tokio::spawn(read_stream(
            child.stdout.take(),
            Arc::clone(&stdout_buf),
            limits.max_output_bytes,
        )),
        tokio::spawn(read_stream(
            child.stderr.take(),
            Arc::clone(&stderr_buf),
            limits.max_output_bytes,
        )),
    ];

    enum Waited {
        Exited(io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        () = tokio::time::sleep(limits.timeout) => Waited::TimedOut,
        () = cancelled(cancel) => Waited::Cancelled,
    };

    match waited {
        Waited::Exited(Ok(status)) => {
            let elapsed = start.elapsed();
            // Background children may still hold the pipes open.
            if !drain(&mut readers, DRAIN_WINDOW).await {
                if let Some(pgid) = pgid {
                    signal_group(pgid, libc::SIGKILL);
                }
                drain(&mut readers, DRAIN_WINDOW).await;
            }
            Ok(ProcessOutcome::Exited {
                exit_code: status.code().unwrap_or(-1),
                output: collect(&stdout_buf, &stderr_buf),
                elapsed,
            })
        }
        Waited::Exited(Err(e)) => {
            terminate(&mut child, pgid, limits.kill_grace).await;
            drain(&mut readers, DRAIN_WINDOW).await;
            Err(ProcessError::Io(e))
        }
        Waited::TimedOut => {
            let elapsed = start.elapsed();
            tracing::debug!(program, elapsed_ms = elapsed.as_millis() as u64, "Deadline expired, terminating process group");
            terminate(&mut child, pgid, limits.kill_grace).await;
            drain(&mut readers, DRAIN_WINDOW).await;
            Ok(ProcessOutcome::TimedOut {
                output: collect(&stdout_buf, &stderr_buf),
                elapsed,
            })
        }
        Waited::Cancelled => {
            let elapsed = start.elapsed();
            tracing::debug!(program, "Cancelled, terminating process group");
            terminate(&mut child, pgid, limits.kill_grace).await;
            drain(&mut readers, DRAIN_WINDOW).await;
            Ok(ProcessOutcome::Cancelled {
                output: collect(&stdout_buf, &stderr_buf),
                elapsed,
            })
        }
    }
}

/// `SIGTERM` the group, wait up to `grace` for the leader, then `SIGKILL`
/// the group and reap the leader.
async fn terminate(child: &mut tokio::process::Child, pgid: Option<u32>, grace: Duration) {
    let Some(pgid) = pgid else {
        // Already reaped.
        return;
    };

    signal_group(pgid, libc::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::debug!(pgid, "Process ignored SIGTERM, escalating to SIGKILL");
    }
    // Stragglers that trapped SIGTERM, or the leader itself.
    signal_group(pgid, libc::SIGKILL);
    if let Err(e) = child.kill().await {
        if e.kind() != io::ErrorKind::InvalidInput {
            tracing::warn!(pgid, error = %e, "Failed to reap terminated process");
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    // Safety: killpg has no memory-safety preconditions. ESRCH only means the
    // group has no members left.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, signal, error = %err, "killpg failed");
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Wait for all reader tasks, up to `window`. Returns `false` (and aborts
/// the readers) if they did not finish in time.
async fn drain(readers: &mut [JoinHandle<()>], window: Duration) -> bool {
    let all = async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(window, all).await.is_ok() {
        return true;
    }
    for reader in readers.iter() {
        reader.abort();
    }
    false
}

fn collect(stdout: &Mutex<Vec<u8>>, stderr: &Mutex<Vec<u8>>) -> Captured {
    let text = |buf: &Mutex<Vec<u8>>| {
        buf.lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    };
    Captured {
        stdout: text(stdout),
        stderr: text(stderr),
    }
}

/// Read a stream into `sink` until EOF, keeping at most `cap` bytes.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>, sink: Arc<Mutex<Vec<u8>>>, cap: usize) {
    let Some(mut handle) = handle else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = sink.lock() {
                    let room = cap.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
        }
    }
}

fn classify_spawn_error(program: &str, err: io::Error) -> ProcessError {
    match err.kind() {
        io::ErrorKind::NotFound => ProcessError::NotFound(program.to_string()),
        io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied(program.to_string()),
        _ => match err.raw_os_error() {
            Some(code)
                if code == libc::EAGAIN
                    || code == libc::EMFILE
                    || code == libc::ENFILE
                    || code == libc::ENOMEM =>
            {
                ProcessError::ResourceExhausted(err)
            }
            _ => ProcessError::Io(err),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::scripting::test_helpers::{process_gone, write_script};

    fn limits(timeout_ms: u64) -> ProcessLimits {
        ProcessLimits::new(Duration::from_millis(timeout_ms), Duration::from_millis(300))
    }

    fn bash(script: &std::path::Path) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "a.sh", "echo out\necho err >&2\nexit 3\n");
        let outcome = run_command(&mut bash(&script), &limits(5_000), None)
            .await
            .expect("run");
        assert_matches!(outcome, ProcessOutcome::Exited { exit_code: 3, .. });
        assert_eq!(outcome.output().stdout, "out\n");
        assert_eq!(outcome.output().stderr, "err\n");
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let mut cmd = Command::new("/nonexistent/interpreter");
        let result = run_command(&mut cmd, &limits(1_000), None).await;
        assert_matches!(result, Err(ProcessError::NotFound(_)));
    }

    #[tokio::test]
    async fn deadline_kills_whole_group_and_keeps_partial_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("bg.pid");
        let script = write_script(
            dir.path(),
            "slow.sh",
            &format!(
                "sleep 30 &\necho $! > {}\necho partial\nwait\n",
                pid_file.display()
            ),
        );

        let outcome = run_command(&mut bash(&script), &limits(500), None)
            .await
            .expect("run");
        assert_matches!(outcome, ProcessOutcome::TimedOut { .. });
        assert_eq!(outcome.output().stdout, "partial\n");
        assert!(outcome.elapsed() >= Duration::from_millis(500));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert!(process_gone(pid).await, "background child {pid} survived");
    }

    #[tokio::test]
    async fn sigterm_trap_escalates_to_sigkill() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            "stubborn.sh",
            "trap '' TERM\necho $$\nwhile true; do sleep 0.1; done\n",
        );
        let outcome = run_command(&mut bash(&script), &limits(300), None)
            .await
            .expect("run");
        assert_matches!(outcome, ProcessOutcome::TimedOut { .. });
        let pid: u32 = outcome.output().stdout.trim().parse().expect("pid");
        assert!(process_gone(pid).await, "stubborn leader {pid} survived");
    }

    #[tokio::test]
    async fn cancellation_terminates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "wait.sh", "sleep 30\n");
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let outcome = run_command(&mut bash(&script), &limits(10_000), Some(&token))
            .await
            .expect("run");
        assert_matches!(outcome, ProcessOutcome::Cancelled { .. });
        assert!(outcome.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn output_is_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "loud.sh", "head -c 100000 /dev/zero | tr '\\0' 'a'\n");
        let mut lim = limits(5_000);
        lim.max_output_bytes = 1024;
        let outcome = run_command(&mut bash(&script), &lim, None).await.expect("run");
        assert_matches!(outcome, ProcessOutcome::Exited { exit_code: 0, .. });
        assert_eq!(outcome.output().stdout.len(), 1024);
    }

    #[test]
    fn classifies_resource_exhaustion() {
        let err = io::Error::from_raw_os_error(libc::EAGAIN);
        assert!(classify_spawn_error("bash", err).is_resource_exhaustion());
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(classify_spawn_error("bash", err).is_resource_exhaustion());
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert_matches!(classify_spawn_error("bash", err), ProcessError::NotFound(_));
    }
}
