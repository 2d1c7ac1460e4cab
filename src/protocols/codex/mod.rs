//! Codex app-server adapter.
//!
//! Drives `codex app-server` over its own bidirectional JSON-RPC link:
//! `initialize` → `initialized` → `thread/start` | `thread/resume` →
//! `turn/start`, then consumes notifications until `turn/completed`, a fatal
//! `error`, process exit or abort. Approval requests from the server are routed
//! through the [`RunHost`] and answered in the server's own vocabulary.

pub mod app_server;
pub mod policy;
pub mod update_mapping;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::api::events::AgentEvent;
use crate::api::types::{ApiError, BackendKind};
use crate::protocols::backend::{AgentBackend, RunRequest, RunSummary};
use crate::protocols::host::RunHost;
use crate::runtime::cancellation::RunCancellation;
use crate::runtime::env::backend_env;
use crate::runtime::process::ProcessSpec;

use app_server::{AppServerConnection, AppServerHandle, ServerMessage};
use policy::{resolve_approval_policy, resolve_sandbox_mode, ApprovalKind};
use update_mapping::{CodexTurnState, TurnCompletion};

const CLIENT_NAME: &str = "agent-bridge";
/// How long the app-server gets to exit after stdin closes
const EXIT_GRACE: Duration = Duration::from_secs(2);
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Codex app-server backend.
pub struct CodexBackend {
    program: PathBuf,
    credential_paths: Vec<PathBuf>,
    request_timeout: Duration,
}

impl CodexBackend {
    pub fn new(program: PathBuf, credential_paths: Vec<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            program,
            credential_paths,
            request_timeout,
        }
    }
}

/// Ids returned by the handshake.
struct OpenedTurn {
    thread_id: String,
    turn_id: Option<String>,
}

#[async_trait]
impl AgentBackend for CodexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Codex
    }

    async fn run(
        &self,
        request: RunRequest,
        host: Arc<dyn RunHost>,
        cancel: RunCancellation,
    ) -> Result<RunSummary, ApiError> {
        let sandbox = resolve_sandbox_mode(request.sandbox_mode.as_deref());
        let approval_policy = resolve_approval_policy(request.approval_policy.as_deref());
        let env = backend_env(BackendKind::Codex, &request, &self.credential_paths);

        log::info!(
            "Starting Codex run: run={}, sandbox={sandbox}, approval={approval_policy}, resume={}, model={:?}",
            request.run_id,
            request.resume_handle.is_some(),
            request.model
        );

        let spec = ProcessSpec {
            program: self.program.clone(),
            args: vec!["app-server".to_string()],
            cwd: Some(request.cwd.clone()),
            env: env.set,
            env_remove: env.remove,
        };
        let mut connection = AppServerConnection::spawn(spec, self.request_timeout)?;
        let link = connection.handle();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ApiError::Aborted),
            opened = open_turn(&link, host.as_ref(), &request, sandbox, approval_policy) => opened,
        };
        let opened = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let exit = connection.terminate().await;
                log::info!("Codex handshake stopped: run={}, error={e}, exit={exit}", request.run_id);
                return Err(e);
            }
        };

        let mut session = CodexSession {
            host,
            link,
            thread_id: opened.thread_id.clone(),
            state: CodexTurnState::new(),
            approvals: JoinSet::new(),
        };
        if let Some(turn_id) = &opened.turn_id {
            session.state.set_turn_id(turn_id.clone());
        }

        let driven = session.drive(&mut connection, &cancel).await;
        // Drops any approval still waiting on the user
        session.approvals.shutdown().await;

        if let Err(e) = driven {
            let exit = connection.terminate().await;
            log::info!("Codex run stopped: run={}, error={e}, exit={exit}", request.run_id);
            return Err(e);
        }

        let exit = connection.shutdown(EXIT_GRACE).await;
        log::debug!("Codex app-server finished: run={}, exit={exit}", request.run_id);

        match session.state.completion() {
            Some(TurnCompletion::Completed) => Ok(RunSummary {
                resume_handle: Some(opened.thread_id),
                usage: session.state.usage().cloned(),
                cost: None,
            }),
            Some(TurnCompletion::Interrupted) | None if cancel.is_aborted() => Err(ApiError::Aborted),
            Some(TurnCompletion::Interrupted) => Err(ApiError::BackendProcess {
                message: "Codex turn was interrupted".to_string(),
            }),
            Some(TurnCompletion::Failed(message)) => Err(ApiError::BackendProcess {
                message: message.clone(),
            }),
            None => Err(ApiError::BackendProcess {
                message: format!("Codex app-server exited before the turn completed ({exit})"),
            }),
        }
    }
}

/// Handshake up to an accepted `turn/start`. Emits `resume.id` with the thread id.
async fn open_turn(
    link: &AppServerHandle,
    host: &dyn RunHost,
    request: &RunRequest,
    sandbox: &str,
    approval_policy: &str,
) -> Result<OpenedTurn, ApiError> {
    link.call(
        "initialize",
        json!({
            "clientInfo": {
                "name": CLIENT_NAME,
                "title": "Agent Bridge",
                "version": env!("CARGO_PKG_VERSION"),
            }
        }),
    )
    .await?;
    link.notify("initialized", json!({})).await?;

    let cwd = request.cwd.to_string_lossy();
    let thread = match &request.resume_handle {
        Some(thread_id) => {
            link.call(
                "thread/resume",
                json!({
                    "threadId": thread_id,
                    "cwd": cwd,
                    "model": request.model,
                    "approvalPolicy": approval_policy,
                    "sandbox": sandbox,
                }),
            )
            .await?
        }
        None => {
            link.call(
                "thread/start",
                json!({
                    "cwd": cwd,
                    "model": request.model,
                    "approvalPolicy": approval_policy,
                    "sandbox": sandbox,
                }),
            )
            .await?
        }
    };
    let thread_id = thread
        .pointer("/thread/id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::protocol("thread response is missing thread.id"))?
        .to_string();
    log::info!("Codex thread ready: run={}, thread={thread_id}", host.run_id());
    host.emit(AgentEvent::ResumeId {
        resume_handle: thread_id.clone(),
    });

    let turn = link
        .call(
            "turn/start",
            json!({
                "threadId": thread_id,
                "input": [{"type": "text", "text": request.prompt}],
                "approvalPolicy": approval_policy,
            }),
        )
        .await?;
    let turn_id = turn
        .pointer("/turn/id")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(OpenedTurn { thread_id, turn_id })
}

struct CodexSession {
    host: Arc<dyn RunHost>,
    link: AppServerHandle,
    thread_id: String,
    state: CodexTurnState,
    approvals: JoinSet<()>,
}

impl CodexSession {
    /// Consume server frames until the turn completes, stdout closes or abort.
    async fn drive(
        &mut self,
        connection: &mut AppServerConnection,
        cancel: &RunCancellation,
    ) -> Result<(), ApiError> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.interrupt().await;
                    return Err(ApiError::Aborted);
                }
                Some(joined) = self.approvals.join_next(), if !self.approvals.is_empty() => {
                    if let Err(e) = joined {
                        log::warn!("[codex] approval task failed: {e}");
                    }
                }
                message = connection.next_message() => match message {
                    Some(ServerMessage::Notification { method, params }) => {
                        for event in self.state.on_notification(&method, &params) {
                            self.host.emit(event);
                        }
                        if self.state.completion().is_some() {
                            return Ok(());
                        }
                    }
                    Some(ServerMessage::Request { id, method, params }) => {
                        self.handle_request(id, &method, params).await;
                    }
                    None => return Ok(()),
                }
            }
        }
    }

    async fn handle_request(&mut self, id: Value, method: &str, params: Value) {
        let Some(kind) = ApprovalKind::from_method(method) else {
            log::debug!("[codex] answering unsupported server request with empty result: method={method}");
            if let Err(e) = self.link.reply(id, json!({})).await {
                log::warn!("[codex] failed to answer server request: {e}");
            }
            return;
        };

        let known_input = kind
            .tool_call_id(&params)
            .and_then(|item_id| self.state.tool_input(&item_id).cloned());
        let ask = kind.ask(&params, known_input.as_ref());
        let host = self.host.clone();
        let link = self.link.clone();
        self.approvals.spawn(async move {
            let decision = host.request_permission(ask).await;
            let reply = kind.reply(&decision);
            log::debug!("[codex] answering {kind:?} approval: {reply}");
            if let Err(e) = link.reply(id, reply).await {
                log::warn!("[codex] failed to send approval decision: {e}");
            }
        });
    }

    /// Best-effort `turn/interrupt` before the process is killed.
    async fn interrupt(&self) {
        let Some(turn_id) = self.state.turn_id() else {
            return;
        };
        let params = json!({"threadId": self.thread_id, "turnId": turn_id});
        match self
            .link
            .call_with_timeout("turn/interrupt", params, INTERRUPT_TIMEOUT)
            .await
        {
            Ok(_) => log::debug!("[codex] turn interrupted: turn={turn_id}"),
            Err(e) => log::debug!("[codex] turn/interrupt failed: turn={turn_id}, error={e}"),
        }
    }
}
