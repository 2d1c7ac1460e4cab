//! Inner JSON-RPC link to a `codex app-server` child.
//!
//! A reader task classifies every stdout line. Responses settle our own
//! [`CorrelationTable`]; server requests and notifications are forwarded in
//! arrival order through one channel, so an approval request is always seen
//! after the `item/started` it refers to. Server requests awaiting our reply are
//! tracked in a separate [`ServerRequestTable`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::types::{ApiError, BackendKind};
use crate::protocols::jsonrpc::{self, CorrelationTable, Incoming, LineReader, LineWriter};
use crate::runtime::process::{BackendProcess, ExitInfo, ProcessSpec};

/// Frames initiated by the app-server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Server request ids awaiting our reply, keyed by rendered id.
#[derive(Default)]
pub struct ServerRequestTable {
    pending: Mutex<HashMap<String, String>>,
}

impl ServerRequestTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, id: &Value, method: &str) {
        if let Some(key) = jsonrpc::id_key(id) {
            self.lock().insert(key, method.to_string());
        }
    }

    /// Returns `false` when the id was already answered or never seen.
    fn remove(&self, id: &Value) -> bool {
        jsonrpc::id_key(id).is_some_and(|key| self.lock().remove(&key).is_some())
    }

    /// Forget every unanswered request, returning their methods.
    fn drain(&self) -> Vec<String> {
        self.lock().drain().map(|(_, method)| method).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cloneable handle for writing to the app-server.
#[derive(Clone)]
pub struct AppServerHandle {
    writer: LineWriter,
    calls: Arc<CorrelationTable>,
    server_requests: Arc<ServerRequestTable>,
    request_timeout: Duration,
}

impl AppServerHandle {
    /// Issue a request and await its response with the link's timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        self.call_with_timeout(method, params, self.request_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        log::debug!("[codex] -> {method}");
        self.calls.call(&self.writer, method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), ApiError> {
        self.writer.send(&jsonrpc::notification(method, params)).await
    }

    /// Answer a server request. Duplicate or unknown ids are not written.
    pub async fn reply(&self, id: Value, result: Value) -> Result<(), ApiError> {
        if !self.server_requests.remove(&id) {
            log::debug!("[codex] not replying to unknown server request id={id}");
            return Ok(());
        }
        self.writer.send(&jsonrpc::response(id, result)).await
    }
}

/// One running app-server child and its link state.
pub struct AppServerConnection {
    process: BackendProcess,
    handle: AppServerHandle,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    reader: JoinHandle<()>,
}

impl AppServerConnection {
    /// Spawn the child and start the reader task.
    pub fn spawn(spec: ProcessSpec, request_timeout: Duration) -> Result<Self, ApiError> {
        let mut process = BackendProcess::spawn(BackendKind::Codex, spec)?;
        let writer = LineWriter::new(process.take_stdin()?);
        let stdout = process.take_stdout()?;

        let calls = Arc::new(CorrelationTable::new());
        let server_requests = Arc::new(ServerRequestTable::default());
        let (tx, inbound) = mpsc::unbounded_channel();

        let calls_for_reader = calls.clone();
        let requests_for_reader = server_requests.clone();
        let reader = tokio::spawn(async move {
            let mut lines = LineReader::new(stdout);
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[codex] stdout read failed: {e}");
                        break;
                    }
                };
                match jsonrpc::parse_line(&line) {
                    Some(Incoming::Response { id, result }) => {
                        calls_for_reader.resolve(&id, result);
                    }
                    Some(Incoming::Request { id, method, params }) => {
                        requests_for_reader.insert(&id, &method);
                        let _ = tx.send(ServerMessage::Request { id, method, params });
                    }
                    Some(Incoming::Notification { method, params }) => {
                        let _ = tx.send(ServerMessage::Notification { method, params });
                    }
                    None => {
                        if !line.trim().is_empty() {
                            log::debug!("[codex stdout] {line}");
                        }
                    }
                }
            }
            let failed = calls_for_reader.fail_all(&ApiError::BackendProcess {
                message: "Codex app-server closed its output".to_string(),
            });
            // Nothing can read a reply once stdout is gone
            let unanswered = requests_for_reader.drain();
            log::debug!(
                "[codex] stdout closed; failed {failed} pending request(s), dropped {} server request(s)",
                unanswered.len()
            );
        });

        Ok(Self {
            process,
            handle: AppServerHandle {
                writer,
                calls,
                server_requests,
                request_timeout,
            },
            inbound,
            reader,
        })
    }

    pub fn handle(&self) -> AppServerHandle {
        self.handle.clone()
    }

    /// Next server-initiated frame; `None` once stdout has closed and the
    /// queue is drained.
    pub async fn next_message(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }

    pub fn pending_calls(&self) -> usize {
        self.handle.calls.len()
    }

    pub fn pending_server_requests(&self) -> usize {
        self.handle.server_requests.len()
    }

    /// Close stdin, give the child `grace` to exit, then kill it.
    pub async fn shutdown(self, grace: Duration) -> ExitInfo {
        self.handle.writer.close().await;
        let exit = match tokio::time::timeout(grace, self.process.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                log::debug!("[codex] app-server still running after {}ms; terminating", grace.as_millis());
                self.process.terminate();
                self.process.wait().await
            }
        };
        self.finish(exit)
    }

    /// Kill the child immediately.
    pub async fn terminate(self) -> ExitInfo {
        self.process.terminate();
        let exit = self.process.wait().await;
        self.finish(exit)
    }

    fn finish(self, exit: ExitInfo) -> ExitInfo {
        self.reader.abort();
        let unanswered = self.handle.server_requests.drain();
        if !unanswered.is_empty() {
            log::debug!("[codex] dropping unanswered server requests: {unanswered:?}");
        }
        self.handle.calls.fail_all(&ApiError::BackendProcess {
            message: format!("Codex app-server exited ({exit})"),
        });
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_request_table_answers_once() {
        let table = ServerRequestTable::default();
        table.insert(&json!(7), "item/commandExecution/requestApproval");

        assert_eq!(table.len(), 1);
        assert!(table.remove(&json!("7")));
        assert!(!table.remove(&json!(7)));
        assert!(table.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_garbled_line_keeps_link_open() {
        use crate::protocols::test_support::write_script;

        let dir = tempfile::tempdir().unwrap();
        let program = write_script(
            dir.path(),
            "codex",
            r#"#!/bin/sh
printf '\377\376\n'
echo '{"jsonrpc":"2.0","method":"turn/started","params":{"turn":{"id":"turn_1"}}}'
read -r line
"#,
        );
        let mut connection =
            AppServerConnection::spawn(ProcessSpec::new(program), Duration::from_secs(5)).unwrap();

        assert!(matches!(
            connection.next_message().await,
            Some(ServerMessage::Notification { ref method, .. }) if method == "turn/started"
        ));
        assert!(connection.process.try_exit().is_none());

        connection.shutdown(Duration::from_secs(1)).await;
    }

    /// Answers nothing: announces a server request, then either waits or exits.
    #[cfg(unix)]
    fn silent_codex(dir: &std::path::Path, then: &str) -> std::path::PathBuf {
        let body = format!(
            r#"#!/bin/sh
read -r line
echo '{{"jsonrpc":"2.0","id":"srv-1","method":"item/commandExecution/requestApproval","params":{{}}}}'
{then}
"#
        );
        crate::protocols::test_support::write_script(dir, "codex", &body)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_mid_turn_empties_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let program = silent_codex(dir.path(), "sleep 30");
        let mut connection =
            AppServerConnection::spawn(ProcessSpec::new(program), Duration::from_secs(30)).unwrap();
        let handle = connection.handle();

        let caller = handle.clone();
        let call = tokio::spawn(async move { caller.call("turn/start", json!({})).await });
        assert!(matches!(
            connection.next_message().await,
            Some(ServerMessage::Request { .. })
        ));
        assert_eq!(connection.pending_calls(), 1);
        assert_eq!(connection.pending_server_requests(), 1);

        connection.terminate().await;

        assert!(call.await.unwrap().is_err());
        assert!(handle.calls.is_empty());
        assert!(handle.server_requests.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_mid_turn_empties_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let program = silent_codex(dir.path(), "exit 3");
        let mut connection =
            AppServerConnection::spawn(ProcessSpec::new(program), Duration::from_secs(30)).unwrap();
        let handle = connection.handle();

        let caller = handle.clone();
        let call = tokio::spawn(async move { caller.call("turn/start", json!({})).await });
        assert!(matches!(
            connection.next_message().await,
            Some(ServerMessage::Request { .. })
        ));
        assert_eq!(connection.next_message().await, None);

        assert!(call.await.unwrap().is_err());
        assert_eq!(connection.pending_calls(), 0);
        assert_eq!(connection.pending_server_requests(), 0);
        // A late reply to the dropped request is not written
        handle.reply(json!("srv-1"), json!({})).await.unwrap();

        assert_eq!(connection.shutdown(Duration::from_secs(1)).await.code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_link_separates_responses_from_server_frames() {
        use crate::protocols::test_support::write_script;

        let dir = tempfile::tempdir().unwrap();
        let program = write_script(
            dir.path(),
            "codex",
            r#"#!/bin/sh
read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
echo 'not json at all'
echo '{"jsonrpc":"2.0","method":"thread/started","params":{"thread":{"id":"th_1"}}}'
echo '{"jsonrpc":"2.0","id":99,"result":{}}'
echo '{"jsonrpc":"2.0","id":"srv-1","method":"item/tool/requestUserInput","params":{}}'
echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"userAgent\":\"fake\"}}"
read -r reply
echo "{\"jsonrpc\":\"2.0\",\"method\":\"echo\",\"params\":$reply}"
"#,
        );
        let mut connection =
            AppServerConnection::spawn(ProcessSpec::new(program), Duration::from_secs(5)).unwrap();
        let handle = connection.handle();

        let result = handle.call("initialize", json!({})).await.unwrap();
        assert_eq!(result, json!({"userAgent": "fake"}));
        assert_eq!(connection.pending_calls(), 0);

        assert!(matches!(
            connection.next_message().await,
            Some(ServerMessage::Notification { ref method, .. }) if method == "thread/started"
        ));
        let Some(ServerMessage::Request { id, method, .. }) = connection.next_message().await else {
            panic!("expected server request");
        };
        assert_eq!(method, "item/tool/requestUserInput");
        assert_eq!(connection.pending_server_requests(), 1);

        handle.reply(id, json!({})).await.unwrap();
        assert_eq!(connection.pending_server_requests(), 0);

        let Some(ServerMessage::Notification { params, .. }) = connection.next_message().await else {
            panic!("expected echoed reply");
        };
        assert_eq!(params["id"], "srv-1");
        assert_eq!(params["result"], json!({}));
        assert_eq!(connection.next_message().await, None);

        connection.shutdown(Duration::from_secs(1)).await;
    }
}
