//! BackendProcess - a supervised child process (a backend or the worker).
//!
//! Spawns a backend executable with piped stdio, drains its stderr into the
//! diagnostic log, and reports the exit status through a watch channel so any
//! number of waiters can observe it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::io::AsyncRead;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::api::types::{ApiError, BackendKind};
use crate::protocols::jsonrpc::LineReader;

/// How to launch one backend process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Variables set on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Inherited variables removed before spawning
    pub env_remove: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            env_remove: Vec::new(),
        }
    }
}

/// Exit status of a backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Handle to a running backend process.
///
/// Dropping the handle kills the process.
pub struct BackendProcess {
    label: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl BackendProcess {
    /// Spawn the process described by `spec`.
    ///
    /// # Errors
    ///
    /// - `BackendNotFound` if the program does not exist
    /// - `IoError` for any other spawn failure
    pub fn spawn(backend: BackendKind, spec: ProcessSpec) -> Result<Self, ApiError> {
        Self::spawn_labeled(backend.as_str(), spec, |message| ApiError::BackendNotFound {
            backend,
            message,
        })
    }

    /// Spawn a non-backend child (the bridge worker). A missing program is an `IoError`.
    pub fn spawn_worker(spec: ProcessSpec) -> Result<Self, ApiError> {
        Self::spawn_labeled("worker", spec, |message| ApiError::IoError { message })
    }

    fn spawn_labeled<F>(label: &str, spec: ProcessSpec, not_found: F) -> Result<Self, ApiError>
    where
        F: FnOnce(String) -> ApiError,
    {
        let label = label.to_string();

        log::info!(
            "Spawning process: label={label}, program={}, args={}",
            spec.program.display(),
            spec.args.len()
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found(format!("'{}' could not be executed: {e}", spec.program.display())),
            _ => ApiError::io("Failed to spawn process", e),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, label.clone()));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let wait_label = label.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                // Fires on terminate() and when the handle is dropped
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        log::debug!("[{wait_label}] kill failed (already exited?): {e}");
                    }
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    log::warn!("[{wait_label}] process wait failed: {e}");
                    ExitInfo::default()
                }
            };
            log::info!("Process exited: label={wait_label}, status={info}");
            let _ = exit_tx.send(Some(info));
        });

        log::debug!("Process started: label={label}, pid={pid:?}");

        Ok(Self {
            label,
            pid,
            stdin,
            stdout,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin, ApiError> {
        self.stdin
            .take()
            .ok_or_else(|| ApiError::io("Backend stdin", "not available"))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout, ApiError> {
        self.stdout
            .take()
            .ok_or_else(|| ApiError::io("Backend stdout", "not available"))
    }

    /// Best-effort forced termination. Idempotent.
    pub fn terminate(&self) {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            log::debug!("Terminating process: label={}, pid={:?}", self.label, self.pid);
            let _ = tx.send(());
        }
    }

    /// Exit status if the process has already exited.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait for the process to exit. Cancel-safe and callable repeatedly.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or_default(),
            // The wait task always publishes before dropping the sender
            Err(_) => self.try_exit().unwrap_or_default(),
        };
        exit
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(reader: R, label: String) {
    let mut lines = LineReader::new(reader);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    log::debug!("[{label} stderr] {line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[{label}] stderr read failed: {e}");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::{timeout, Duration};

    fn sh(script: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::new("sh");
        spec.args = vec!["-c".to_string(), script.to_string()];
        spec
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout_and_exit() {
        let mut process = BackendProcess::spawn(BackendKind::Claude, sh("printf 'hello'; exit 3")).unwrap();
        let mut stdout = process.take_stdout().unwrap();

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        let exit = timeout(Duration::from_secs(5), process.wait()).await.unwrap();

        assert_eq!(out, "hello");
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        // A second wait sees the same status
        assert_eq!(process.wait().await, exit);
    }

    #[tokio::test]
    async fn test_missing_program_is_backend_not_found() {
        let result = BackendProcess::spawn(
            BackendKind::Codex,
            ProcessSpec::new("/nonexistent/agent-bridge-test-binary"),
        );
        assert!(matches!(
            result,
            Err(ApiError::BackendNotFound {
                backend: BackendKind::Codex,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_worker_is_io_error() {
        let result = BackendProcess::spawn_worker(ProcessSpec::new("/nonexistent/agent-bridge-worker"));
        assert!(matches!(result, Err(ApiError::IoError { .. })));
    }

    #[tokio::test]
    async fn test_terminate_reports_signal() {
        let process = BackendProcess::spawn(BackendKind::Claude, sh("sleep 30")).unwrap();
        process.terminate();
        process.terminate();

        let exit = timeout(Duration::from_secs(5), process.wait()).await.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(9));
    }

    #[tokio::test]
    async fn test_env_overrides_and_removals() {
        let mut spec = sh("printf '%s|%s' \"$BRIDGE_SET\" \"${HOME:-none}\"");
        spec.env.push(("BRIDGE_SET".to_string(), "yes".to_string()));
        spec.env_remove.push("HOME".to_string());

        let mut process = BackendProcess::spawn(BackendKind::Claude, spec).unwrap();
        let mut out = String::new();
        process.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "yes|none");
    }
}
