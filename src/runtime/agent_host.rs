//! RuntimeRunHost - Runtime layer implementation of the RunHost trait.
//!
//! This module provides the bridge between protocol adapters and the worker.
//! It captures the run id and translates adapter callbacks into `agent.event`
//! notifications on the outer link.
//!
//! Key design principle: The RunHost implementation holds the run context,
//! so the protocol layer never needs to know about run bookkeeping.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::events::{AgentEvent, RunEvent, RunStatus};
use crate::api::types::{PermissionDecision, RunId, METHOD_AGENT_EVENT};
use crate::protocols::host::{PermissionAsk, RunHost};
use crate::protocols::jsonrpc;
use crate::runtime::cancellation::RunCancellation;
use crate::runtime::permissions::PermissionHub;

/// Ordered outbound frame queue of the outer link.
///
/// Responses and event notifications share one queue so a run's events are
/// always written before its `agent.run` response.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl FrameSink {
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: Value) {
        if self.tx.send(frame).is_err() {
            log::warn!("Outbound link closed; dropping frame");
        }
    }

    /// Send one unified event as an `agent.event` notification.
    pub fn emit(&self, run_id: &str, event: AgentEvent) {
        let kind = event.kind();
        let payload = RunEvent {
            run_id: run_id.to_string(),
            event,
        };
        match serde_json::to_value(&payload) {
            Ok(params) => {
                log::trace!("Emitting agent.event: run={run_id}, type={kind}");
                self.send(jsonrpc::notification(METHOD_AGENT_EVENT, params));
            }
            Err(e) => log::error!("Failed to serialize agent.event: {e} (run={run_id}, type={kind})"),
        }
    }
}

/// Run-scoped state guarded by the host.
#[derive(Default)]
struct HostState {
    resume_handle: Option<String>,
    /// Terminal status reported by the adapter, held until the worker settles
    adapter_terminal: Option<(RunStatus, Option<String>)>,
    terminal_emitted: bool,
}

/// Runtime implementation of the RunHost trait for one run.
pub struct RuntimeRunHost {
    run_id: RunId,
    sink: FrameSink,
    permission_hub: Arc<PermissionHub>,
    cancel: RunCancellation,
    state: Mutex<HostState>,
}

impl RuntimeRunHost {
    pub fn new(
        run_id: RunId,
        sink: FrameSink,
        permission_hub: Arc<PermissionHub>,
        cancel: RunCancellation,
    ) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            sink,
            permission_hub,
            cancel,
            state: Mutex::new(HostState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The resume handle announced during this run, if any.
    pub fn resume_handle(&self) -> Option<String> {
        self.state().resume_handle.clone()
    }

    /// Emit a lifecycle status from the worker.
    ///
    /// Only the first terminal status of a run is emitted. When it matches a
    /// terminal status the adapter reported and carries no message of its own,
    /// the adapter's message is used.
    pub fn emit_lifecycle(&self, status: RunStatus, mut message: Option<String>) {
        {
            let mut state = self.state();
            if status.is_terminal() {
                if state.terminal_emitted {
                    log::debug!("Dropping second terminal status: run={}, status={status:?}", self.run_id);
                    return;
                }
                state.terminal_emitted = true;
                if let Some((reported, reported_message)) = state.adapter_terminal.take() {
                    if reported == status && message.is_none() {
                        message = reported_message;
                    }
                }
            }
        }
        self.sink.emit(&self.run_id, AgentEvent::Status { status, message });
    }
}

#[async_trait::async_trait]
impl RunHost for RuntimeRunHost {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn emit(&self, event: AgentEvent) {
        match &event {
            AgentEvent::ResumeId { resume_handle } => {
                let mut state = self.state();
                if let Some(existing) = &state.resume_handle {
                    if existing != resume_handle {
                        log::warn!(
                            "Ignoring second resume.id: run={}, kept={existing}, got={resume_handle}",
                            self.run_id
                        );
                    }
                    return;
                }
                state.resume_handle = Some(resume_handle.clone());
            }
            AgentEvent::Status { status, message } => {
                if self.cancel.is_aborted() {
                    log::debug!(
                        "Dropping adapter status after abort: run={}, status={status:?}",
                        self.run_id
                    );
                    return;
                }
                if status.is_terminal() {
                    // The worker emits the single terminal status when it settles
                    log::debug!("Holding adapter terminal status: run={}, status={status:?}", self.run_id);
                    self.state().adapter_terminal = Some((*status, message.clone()));
                    return;
                }
            }
            _ => {}
        }
        self.sink.emit(&self.run_id, event);
    }

    async fn request_permission(&self, ask: PermissionAsk) -> PermissionDecision {
        if self.cancel.is_aborted() {
            return PermissionDecision::deny_and_interrupt("Run aborted");
        }

        let sink = self.sink.clone();
        let run_id = self.run_id.clone();
        let request = self
            .permission_hub
            .request(&self.run_id, ask, move |event| sink.emit(&run_id, event));

        tokio::select! {
            decision = request => decision,
            _ = self.cancel.cancelled() => PermissionDecision::deny_and_interrupt("Run aborted"),
        }
    }
}
