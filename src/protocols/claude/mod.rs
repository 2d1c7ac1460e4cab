//! Claude Code adapter.
//!
//! Two execution modes, chosen per run:
//! - Print mode (no explicit credential): `claude -p --output-format stream-json`,
//!   prompt on the command line, stdin closed immediately.
//! - SDK mode (explicit credential): stream-json on both pipes with the stdio
//!   control protocol, so tool approvals come back to us as `can_use_tool`.

pub mod sdk;
pub mod update_mapping;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::api::types::{ApiError, BackendKind};
use crate::protocols::backend::{AgentBackend, RunRequest, RunSummary};
use crate::protocols::host::{PermissionAsk, RunHost};
use crate::protocols::jsonrpc::{LineReader, LineWriter};
use crate::runtime::cancellation::RunCancellation;
use crate::runtime::env::backend_env;
use crate::runtime::process::{BackendProcess, ProcessSpec};

use sdk::{CanUseTool, ControlMessage};
use update_mapping::{ClaudeStreamState, TurnOutcome};

/// Permission modes accepted by the CLI
pub const PERMISSION_MODES: [&str; 4] = ["default", "acceptEdits", "plan", "bypassPermissions"];
pub const DEFAULT_PERMISSION_MODE: &str = "default";

/// How long the CLI gets to exit on its own after the terminal result
const EXIT_GRACE: Duration = Duration::from_secs(5);
const INTERRUPT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const LOG_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaudeMode {
    Print,
    Sdk,
}

impl ClaudeMode {
    pub fn for_request(request: &RunRequest) -> Self {
        if request.explicit_credential().is_some() {
            ClaudeMode::Sdk
        } else {
            ClaudeMode::Print
        }
    }
}

/// Map the requested permission mode through the whitelist.
///
/// `bypassPermissions` needs the secondary confirmation flag; without it the
/// run silently uses `default`.
pub fn resolve_permission_mode(requested: Option<&str>, dangerously_skip_permissions: bool) -> &'static str {
    let Some(requested) = requested.map(str::trim).filter(|m| !m.is_empty()) else {
        return DEFAULT_PERMISSION_MODE;
    };
    match PERMISSION_MODES.iter().find(|m| **m == requested) {
        Some(&"bypassPermissions") if !dangerously_skip_permissions => {
            log::warn!("bypassPermissions requested without confirmation; using default");
            DEFAULT_PERMISSION_MODE
        }
        Some(mode) => *mode,
        None => {
            log::warn!("Unknown permission mode '{requested}'; using default");
            DEFAULT_PERMISSION_MODE
        }
    }
}

/// Command-line arguments for one run.
pub fn build_args(mode: ClaudeMode, request: &RunRequest) -> Vec<String> {
    let permission_mode =
        resolve_permission_mode(request.permission_mode.as_deref(), request.dangerously_skip_permissions);

    let mut args: Vec<String> = match mode {
        ClaudeMode::Print => vec!["-p".into(), "--output-format".into(), "stream-json".into()],
        ClaudeMode::Sdk => vec![
            "--output-format".into(),
            "stream-json".into(),
            "--input-format".into(),
            "stream-json".into(),
            "--permission-prompt-tool".into(),
            "stdio".into(),
        ],
    };
    args.extend([
        "--verbose".to_string(),
        "--include-partial-messages".to_string(),
        "--permission-mode".to_string(),
        permission_mode.to_string(),
    ]);
    if let Some(model) = &request.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if let Some(resume) = &request.resume_handle {
        args.extend(["--resume".to_string(), resume.clone()]);
    }
    if mode == ClaudeMode::Print {
        args.extend(["--".to_string(), request.prompt.clone()]);
    }
    args
}

/// Claude Code backend.
pub struct ClaudeBackend {
    program: PathBuf,
    credential_paths: Vec<PathBuf>,
}

impl ClaudeBackend {
    pub fn new(program: PathBuf, credential_paths: Vec<PathBuf>) -> Self {
        Self {
            program,
            credential_paths,
        }
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    async fn run(
        &self,
        request: RunRequest,
        host: Arc<dyn RunHost>,
        cancel: RunCancellation,
    ) -> Result<RunSummary, ApiError> {
        let mode = ClaudeMode::for_request(&request);
        let env = backend_env(BackendKind::Claude, &request, &self.credential_paths);

        log::info!(
            "Starting Claude run: run={}, mode={mode:?}, resume={}, model={:?}",
            request.run_id,
            request.resume_handle.is_some(),
            request.model
        );

        let spec = ProcessSpec {
            program: self.program.clone(),
            args: build_args(mode, &request),
            cwd: Some(request.cwd.clone()),
            env: env.set,
            env_remove: env.remove,
        };
        let mut process = BackendProcess::spawn(BackendKind::Claude, spec)?;
        let writer = LineWriter::new(process.take_stdin()?);
        let stdout = process.take_stdout()?;

        let mut session = ClaudeSession {
            mode,
            host,
            writer,
            state: ClaudeStreamState::new(),
            approvals: JoinSet::new(),
        };

        let streamed = session.start(&request.prompt).await;
        let streamed = match streamed {
            Ok(()) => session.pump(stdout, &cancel).await,
            Err(e) => Err(e),
        };
        // Drops any approval still waiting on the user
        session.approvals.shutdown().await;

        if let Err(e) = streamed {
            process.terminate();
            let exit = process.wait().await;
            log::info!("Claude run stopped: run={}, error={e}, exit={exit}", request.run_id);
            return Err(e);
        }

        session.writer.close().await;
        let exit = match tokio::time::timeout(EXIT_GRACE, process.wait()).await {
            Ok(exit) => Some(exit),
            Err(_) => {
                log::debug!("Claude did not exit after result; terminating");
                process.terminate();
                None
            }
        };

        match session.state.outcome() {
            Some(TurnOutcome::Success) => Ok(RunSummary {
                resume_handle: session.state.session_id().map(str::to_string),
                usage: session.state.usage().cloned(),
                cost: session.state.cost(),
            }),
            Some(TurnOutcome::Failed(message)) => Err(ApiError::BackendProcess {
                message: message.clone(),
            }),
            None if cancel.is_aborted() => Err(ApiError::Aborted),
            None => Err(ApiError::BackendProcess {
                message: match exit {
                    Some(exit) => format!("Claude exited before completing the turn ({exit})"),
                    None => "Claude closed its output before completing the turn".to_string(),
                },
            }),
        }
    }
}

struct ClaudeSession {
    mode: ClaudeMode,
    host: Arc<dyn RunHost>,
    writer: LineWriter,
    state: ClaudeStreamState,
    approvals: JoinSet<()>,
}

impl ClaudeSession {
    async fn start(&self, prompt: &str) -> Result<(), ApiError> {
        match self.mode {
            ClaudeMode::Print => {
                self.writer.close().await;
                Ok(())
            }
            ClaudeMode::Sdk => {
                self.writer.send(&sdk::initialize_request()).await?;
                self.writer.send(&sdk::user_message(prompt)).await
            }
        }
    }

    /// Read stdout until the terminal result, EOF or abort.
    async fn pump<R>(&mut self, stdout: R, cancel: &RunCancellation) -> Result<(), ApiError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = LineReader::new(stdout);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if self.mode == ClaudeMode::Sdk {
                        let interrupt = sdk::interrupt_request();
                        let _ = tokio::time::timeout(INTERRUPT_WRITE_TIMEOUT, self.writer.send(&interrupt)).await;
                    }
                    return Err(ApiError::Aborted);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        self.handle_line(&line).await;
                        if self.state.is_finished() {
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => return Err(ApiError::io("Failed to read Claude output", e)),
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let message: Value = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(_) => {
                log::debug!("[claude] non-JSON stdout: {}", preview(trimmed));
                return;
            }
        };

        if self.mode == ClaudeMode::Sdk {
            if let Some(control) = sdk::parse_control(&message) {
                self.handle_control(control).await;
                return;
            }
        }

        for event in self.state.process(&message) {
            self.host.emit(event);
        }
    }

    async fn handle_control(&mut self, control: ControlMessage) {
        match control {
            ControlMessage::CanUseTool(request) => self.spawn_approval(request),
            ControlMessage::Unsupported {
                request_id,
                subtype,
            } => {
                log::debug!("[claude] unsupported control request: subtype={subtype}");
                let reply = sdk::error_response(&request_id, &format!("Unsupported control request: {subtype}"));
                if let Err(e) = self.writer.send(&reply).await {
                    log::warn!("[claude] failed to answer control request: {e}");
                }
            }
            ControlMessage::Response {
                request_id,
                error: Some(error),
            } => log::warn!("[claude] control request failed: request_id={request_id}, error={error}"),
            ControlMessage::Response { .. } => {}
        }
    }

    /// Await the user's decision off the read loop so streaming continues.
    fn spawn_approval(&mut self, request: CanUseTool) {
        let host = self.host.clone();
        let writer = self.writer.clone();
        self.approvals.spawn(async move {
            let decision = host
                .request_permission(PermissionAsk {
                    tool_name: request.tool_name.clone(),
                    input_preview: request.input.clone(),
                    tool_call_id: request.tool_use_id.clone(),
                })
                .await;
            log::debug!(
                "[claude] answering can_use_tool: request_id={}, behavior={:?}",
                request.request_id,
                decision.behavior
            );
            if let Err(e) = writer.send(&sdk::permission_response(&request, &decision)).await {
                log::warn!("[claude] failed to send permission decision: {e}");
            }
        });
    }
}

fn preview(line: &str) -> String {
    if line.chars().count() <= LOG_PREVIEW_CHARS {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(LOG_PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}
