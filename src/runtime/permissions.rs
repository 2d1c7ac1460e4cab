//! Permission Hub - correlates tool-use approval requests with user decisions.
//!
//! The PermissionHub is shared by every adapter: the Claude `can_use_tool`
//! callback and the Codex approval server-requests both end up in
//! [`PermissionHub::request`], which alone owns the deadline and the table
//! bookkeeping.
//!
//! # Flow
//!
//! 1. Adapter calls `request()` with the tool name and an input preview
//! 2. PermissionHub emits a `permission.request` event for the run
//! 3. Adapter awaits the oneshot receiver (bounded by the deadline)
//! 4. Host answers via `permission.respond`
//! 5. PermissionHub calls `respond()` which sends the decision through the oneshot
//!
//! Every entry resolves exactly once: by `respond()`, by its deadline, or by
//! `clear_run()` / `clear_all()` at run teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::api::events::AgentEvent;
use crate::api::types::{ApiError, PermissionDecision, PermissionRequestId, RunId};
use crate::protocols::host::PermissionAsk;

/// Default deadline of a permission request (5 minutes)
pub const PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// A pending permission request awaiting user decision
struct PendingPermission {
    run_id: RunId,
    created_at: Instant,
    /// Oneshot sender to deliver the decision
    tx: oneshot::Sender<PermissionDecision>,
}

/// Permission hub for managing permission requests and responses.
pub struct PermissionHub {
    deadline: Duration,
    /// Pending permission requests keyed by request ID.
    /// A std mutex so the drop guard can clean up synchronously.
    pending: Mutex<HashMap<PermissionRequestId, PendingPermission>>,
}

impl Default for PermissionHub {
    fn default() -> Self {
        Self::new(PERMISSION_TIMEOUT)
    }
}

impl PermissionHub {
    /// Create a new PermissionHub with the given per-request deadline.
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PermissionRequestId, PendingPermission>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Request permission for a tool invocation.
    ///
    /// This method:
    /// 1. Allocates a unique request id and stores the sender in the pending map
    /// 2. Hands a `permission.request` event to `emit`
    /// 3. Awaits the decision until the deadline
    ///
    /// Never fails: a timeout or a dropped entry resolves as deny + interrupt.
    pub async fn request<F>(&self, run_id: &str, ask: PermissionAsk, emit: F) -> PermissionDecision
    where
        F: FnOnce(AgentEvent),
    {
        let request_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();

        self.lock().insert(
            request_id.clone(),
            PendingPermission {
                run_id: run_id.to_string(),
                created_at: Instant::now(),
                tx,
            },
        );
        let _guard = PendingGuard {
            hub: self,
            request_id: request_id.clone(),
        };

        log::debug!(
            "Permission requested: run={run_id}, request_id={request_id}, tool={}",
            ask.tool_name
        );

        emit(AgentEvent::PermissionRequest {
            request_id: request_id.clone(),
            tool_name: ask.tool_name,
            input_preview: ask.input_preview,
            tool_call_id: ask.tool_call_id,
            deadline_ms: self.deadline.as_millis() as u64,
        });

        match tokio::time::timeout(self.deadline, &mut rx).await {
            Ok(Ok(decision)) => {
                log::debug!(
                    "Permission decision received: request_id={request_id}, behavior={:?}",
                    decision.behavior
                );
                decision
            }
            Ok(Err(_)) => {
                log::warn!("Permission channel dropped without response: request_id={request_id}");
                PermissionDecision::deny_and_interrupt("Permission request was cancelled")
            }
            Err(_) => {
                let expired = self.lock().remove(&request_id);
                match expired {
                    Some(entry) => {
                        log::info!(
                            "Permission request timed out: request_id={request_id}, waited={:?}",
                            entry.created_at.elapsed()
                        );
                        PermissionDecision::deny_and_interrupt("Permission request timed out")
                    }
                    // A responder removed the entry right at the deadline; its
                    // decision is already in the channel.
                    None => rx.await.unwrap_or_else(|_| {
                        PermissionDecision::deny_and_interrupt("Permission request timed out")
                    }),
                }
            }
        }
    }

    /// Respond to a pending permission request.
    ///
    /// # Errors
    ///
    /// - `OperationNotFound` if no pending request exists for this ID
    pub fn respond(
        &self,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), ApiError> {
        let pending = self.lock().remove(request_id);

        match pending {
            Some(pending) => {
                if pending.tx.send(decision).is_err() {
                    log::warn!(
                        "Failed to send permission decision (receiver dropped): request_id={request_id}"
                    );
                }
                log::info!("Permission responded: request_id={request_id}, run={}", pending.run_id);
                Ok(())
            }
            None => {
                log::warn!("Permission respond for unknown request: request_id={request_id}");
                Err(ApiError::OperationNotFound {
                    operation_id: request_id.to_string(),
                })
            }
        }
    }

    /// Resolve every pending request of one run as deny + interrupt.
    pub fn clear_run(&self, run_id: &str, reason: &str) -> usize {
        let drained: Vec<PendingPermission> = {
            let mut pending = self.lock();
            let ids: Vec<PermissionRequestId> = pending
                .iter()
                .filter(|(_, entry)| entry.run_id == run_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        Self::deny_all(drained, reason)
    }

    /// Resolve every pending request as deny + interrupt.
    pub fn clear_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingPermission> = self.lock().drain().map(|(_, entry)| entry).collect();
        Self::deny_all(drained, reason)
    }

    fn deny_all(entries: Vec<PendingPermission>, reason: &str) -> usize {
        let count = entries.len();
        for entry in entries {
            let _ = entry
                .tx
                .send(PermissionDecision::deny_and_interrupt(reason.to_string()));
        }
        if count > 0 {
            log::info!("Cleared pending permissions: count={count}, reason={reason}");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the entry if the awaiting future is dropped before resolution.
struct PendingGuard<'a> {
    hub: &'a PermissionHub,
    request_id: PermissionRequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.hub.lock().remove(&self.request_id);
    }
}

/// Convenience alias used across the runtime.
pub type SharedPermissionHub = Arc<PermissionHub>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::PermissionBehavior;
    use std::sync::Mutex as StdMutex;

    fn ask(tool: &str) -> PermissionAsk {
        PermissionAsk {
            tool_name: tool.to_string(),
            input_preview: serde_json::json!({"command": "ls"}),
            tool_call_id: Some("toolu_1".to_string()),
        }
    }

    fn capture() -> (Arc<StdMutex<Vec<AgentEvent>>>, impl Fn() -> Option<String>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let reader = events.clone();
        let last_id = move || {
            reader.lock().unwrap().iter().rev().find_map(|e| match e {
                AgentEvent::PermissionRequest { request_id, .. } => Some(request_id.clone()),
                _ => None,
            })
        };
        (events, last_id)
    }

    #[tokio::test]
    async fn test_respond_resolves_request() {
        let hub = Arc::new(PermissionHub::default());
        let (events, last_id) = capture();

        let hub_for_task = hub.clone();
        let events_for_task = events.clone();
        let waiter = tokio::spawn(async move {
            hub_for_task
                .request("run-1", ask("Bash"), |e| events_for_task.lock().unwrap().push(e))
                .await
        });

        let request_id = loop {
            if let Some(id) = last_id() {
                break id;
            }
            tokio::task::yield_now().await;
        };

        hub.respond(&request_id, PermissionDecision::allow()).unwrap();
        let decision = waiter.await.unwrap();

        assert!(decision.is_allow());
        assert!(hub.is_empty());
        // Second respond finds nothing
        assert!(matches!(
            hub.respond(&request_id, PermissionDecision::allow()),
            Err(ApiError::OperationNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_deny_interrupt() {
        let hub = PermissionHub::new(Duration::from_secs(300));
        let mut emitted = Vec::new();

        let decision = hub.request("run-1", ask("Bash"), |e| emitted.push(e)).await;

        assert_eq!(decision.behavior, PermissionBehavior::Deny);
        assert!(decision.interrupt);
        assert!(hub.is_empty());
        match &emitted[0] {
            AgentEvent::PermissionRequest { deadline_ms, .. } => assert_eq!(*deadline_ms, 300_000),
            other => panic!("Expected permission.request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clear_run_only_touches_that_run() {
        let hub = Arc::new(PermissionHub::default());

        let h1 = hub.clone();
        let first = tokio::spawn(async move { h1.request("run-1", ask("Bash"), |_| {}).await });
        let h2 = hub.clone();
        let second = tokio::spawn(async move { h2.request("run-2", ask("Edit"), |_| {}).await });

        while hub.len() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(hub.clear_run("run-1", "aborted"), 1);
        let decision = first.await.unwrap();
        assert_eq!(decision, PermissionDecision::deny_and_interrupt("aborted"));
        assert_eq!(hub.len(), 1);

        assert_eq!(hub.clear_all("shutdown"), 1);
        assert!(!second.await.unwrap().is_allow());
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_waiter_removes_entry() {
        let hub = Arc::new(PermissionHub::default());
        let h = hub.clone();
        let waiter = tokio::spawn(async move { h.request("run-1", ask("Bash"), |_| {}).await });

        while hub.is_empty() {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        assert!(hub.is_empty());
    }
}
