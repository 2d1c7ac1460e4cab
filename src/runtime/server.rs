//! Worker side of the outer link: line-delimited JSON-RPC over stdio.
//!
//! Each request runs in its own task so `agent.abort` and `permission.respond`
//! are served while `agent.run` is in flight. All outbound frames go through
//! one [`FrameSink`] queue drained by a single writer task, which keeps a run's
//! events ahead of its response.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::api::types::ApiError;
use crate::commands;
use crate::config::BridgeConfig;
use crate::protocols::jsonrpc::{self, Incoming, LineReader, LineWriter, RpcError, INVALID_REQUEST, PARSE_ERROR};
use crate::runtime::agent_host::FrameSink;
use crate::runtime::worker::BridgeWorker;

/// How long in-flight requests get to settle after stdin closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Serve the worker on the process's stdin/stdout until stdin closes.
pub async fn run_stdio(config: BridgeConfig) -> Result<(), ApiError> {
    serve(&config, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve a worker built from `config` on arbitrary streams.
pub async fn serve<R, W>(config: &BridgeConfig, input: R, output: W) -> Result<(), ApiError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + 'static,
{
    let (sink, frames) = FrameSink::channel();
    let worker = BridgeWorker::new(config, sink.clone());
    serve_worker(worker, sink, frames, input, output).await
}

/// Serve an existing worker. `frames` must be the receiving end of `sink`.
pub async fn serve_worker<R, W>(
    worker: Arc<BridgeWorker>,
    sink: FrameSink,
    frames: mpsc::UnboundedReceiver<Value>,
    input: R,
    output: W,
) -> Result<(), ApiError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + 'static,
{
    let writer = LineWriter::new(output);
    let (stop_tx, stop_rx) = oneshot::channel();
    let writer_task = tokio::spawn(write_frames(frames, writer.clone(), stop_rx));

    let mut requests: JoinSet<()> = JoinSet::new();
    let mut lines = LineReader::new(input);
    log::info!("Worker ready: pid={}", std::process::id());

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&worker, &sink, &mut requests, &line),
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read stdin: {e}");
                    break;
                }
            },
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    log::error!("Request task failed: {e}");
                }
            }
        }
    }

    log::info!("stdin closed; shutting down worker");
    worker.shutdown();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while requests.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        log::warn!("In-flight requests did not settle within {}ms", SHUTDOWN_GRACE.as_millis());
        requests.shutdown().await;
    }

    let _ = stop_tx.send(());
    if let Err(e) = writer_task.await {
        log::error!("Writer task failed: {e}");
    }
    writer.close().await;
    Ok(())
}

fn handle_line(worker: &Arc<BridgeWorker>, sink: &FrameSink, requests: &mut JoinSet<()>, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let frame: Value = match serde_json::from_str(trimmed) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Malformed frame on stdin: {e}");
            sink.send(jsonrpc::jsonrpc_error(Value::Null, PARSE_ERROR, &format!("Parse error: {e}")));
            return;
        }
    };

    match jsonrpc::classify(frame) {
        Some(Incoming::Request { id, method, params }) => {
            log::debug!("<- request id={id}, method={method}");
            let worker = worker.clone();
            let sink = sink.clone();
            requests.spawn(async move {
                let reply = match commands::dispatch(&worker, &method, params).await {
                    Ok(result) => jsonrpc::response(id, result),
                    Err(e) => {
                        log::debug!("Request failed: method={method}, error={e}");
                        jsonrpc::error_response(id, RpcError::from(&e))
                    }
                };
                sink.send(reply);
            });
        }
        Some(Incoming::Notification { method, params }) => {
            log::debug!("<- notification method={method}");
            commands::notify(worker, &method, params);
        }
        Some(Incoming::Response { id, .. }) => {
            log::debug!("Ignoring unexpected response from host: id={id}");
        }
        None => sink.send(jsonrpc::jsonrpc_error(Value::Null, INVALID_REQUEST, "Invalid Request")),
    }
}

/// Drain the outbound queue to `writer` until stopped, then flush what is left.
async fn write_frames(
    mut frames: mpsc::UnboundedReceiver<Value>,
    writer: LineWriter,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(&frame).await {
                        log::error!("Failed to write frame to stdout: {e}");
                        return;
                    }
                }
                None => return,
            },
            _ = &mut stop => break,
        }
    }
    while let Ok(frame) = frames.try_recv() {
        if let Err(e) = writer.send(&frame).await {
            log::error!("Failed to write frame to stdout: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use crate::api::events::AgentEvent;
    use crate::api::types::{BackendKind, PROTOCOL_VERSION};
    use crate::protocols::backend::{AgentBackend, RunRequest, RunSummary};
    use crate::protocols::host::RunHost;
    use crate::runtime::cancellation::RunCancellation;
    use crate::runtime::permissions::PermissionHub;
    use crate::runtime::providers::ProviderRegistry;
    use crate::runtime::worker::BackendFactory;

    /// Emits one delta, then runs until aborted.
    struct UntilAborted;

    #[async_trait]
    impl AgentBackend for UntilAborted {
        fn kind(&self) -> BackendKind {
            BackendKind::Claude
        }

        async fn run(
            &self,
            _request: RunRequest,
            host: Arc<dyn RunHost>,
            cancel: RunCancellation,
        ) -> Result<RunSummary, ApiError> {
            host.emit(AgentEvent::AssistantDelta {
                message_id: "m1".to_string(),
                text: "thinking".to_string(),
            });
            cancel.cancelled().await;
            Err(ApiError::Aborted)
        }
    }

    struct Factory;

    #[async_trait]
    impl BackendFactory for Factory {
        async fn create(&self, _kind: BackendKind) -> Result<Arc<dyn AgentBackend>, ApiError> {
            Ok(Arc::new(UntilAborted))
        }
    }

    struct Harness {
        input: Option<DuplexStream>,
        output: tokio::io::Lines<BufReader<DuplexStream>>,
        server: tokio::task::JoinHandle<Result<(), ApiError>>,
    }

    impl Harness {
        fn start() -> Self {
            let (input, server_input) = tokio::io::duplex(64 * 1024);
            let (server_output, output) = tokio::io::duplex(64 * 1024);
            let (sink, frames) = FrameSink::channel();
            let worker = BridgeWorker::with_parts(
                sink.clone(),
                Arc::new(PermissionHub::default()),
                Arc::new(ProviderRegistry::new(HashMap::new(), None)),
                Arc::new(Factory),
            );
            let server = tokio::spawn(serve_worker(worker, sink, frames, server_input, server_output));
            Self {
                input: Some(input),
                output: BufReader::new(output).lines(),
                server,
            }
        }

        async fn send(&mut self, frame: &str) {
            let input = self.input.as_mut().unwrap();
            input.write_all(frame.as_bytes()).await.unwrap();
            input.write_all(b"\n").await.unwrap();
        }

        fn close_input(&mut self) {
            self.input = None;
        }

        async fn next(&mut self) -> Value {
            let line = self.output.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        /// Read frames until the response with `id`, returning it and the
        /// frames seen before it.
        async fn response(&mut self, id: u64) -> (Value, Vec<Value>) {
            let mut before = Vec::new();
            loop {
                let frame = self.next().await;
                if frame["id"] == id {
                    return (frame, before);
                }
                before.push(frame);
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames() {
        let mut h = Harness::start();

        h.send("{not json").await;
        let parse_error = h.next().await;
        assert_eq!(parse_error["id"], Value::Null);
        assert_eq!(parse_error["error"]["code"], -32700);

        h.send(r#"{"jsonrpc":"2.0","id":1,"method":"agent.fly","params":{}}"#).await;
        let (unknown, _) = h.response(1).await;
        assert_eq!(unknown["error"]["code"], -32601);

        h.send(r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocolVersion":99}}"#).await;
        let (mismatch, _) = h.response(2).await;
        assert_eq!(mismatch["error"]["code"], -32001);
        assert_eq!(mismatch["error"]["data"]["type"], "VersionMismatch");

        h.close_input();
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_frame_keeps_serving() {
        let mut h = Harness::start();

        h.input.as_mut().unwrap().write_all(b"\xff\xfe\n").await.unwrap();
        let parse_error = h.next().await;
        assert_eq!(parse_error["error"]["code"], -32700);

        h.send(&format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"initialize","params":{{"protocolVersion":{PROTOCOL_VERSION}}}}}"#
        ))
        .await;
        let (reply, _) = h.response(1).await;
        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);

        h.close_input();
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_initialize_reports_absent_backends() {
        let mut h = Harness::start();

        h.send(&format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"initialize","params":{{"protocolVersion":{PROTOCOL_VERSION},"backendsSupported":["claude","codex"]}}}}"#
        ))
        .await;
        let (reply, _) = h.response(1).await;

        assert_eq!(reply["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(
            reply["result"]["providers"]["codex"],
            json!({"available": false, "version": null, "source": null})
        );
        assert_eq!(reply["result"]["providers"]["claude"]["available"], false);
    }

    #[tokio::test]
    async fn test_run_abort_and_second_run() {
        let mut h = Harness::start();

        h.send(r#"{"jsonrpc":"2.0","id":1,"method":"agent.run","params":{"runId":"r1","backend":"claude","prompt":"hi","cwd":"/tmp"}}"#).await;
        loop {
            let frame = h.next().await;
            if frame["params"]["type"] == "assistant.delta" {
                break;
            }
        }

        h.send(r#"{"jsonrpc":"2.0","id":2,"method":"agent.run","params":{"runId":"r2","backend":"codex","prompt":"hi","cwd":"/tmp"}}"#).await;
        let (busy, _) = h.response(2).await;
        assert_eq!(busy["error"]["data"]["type"], "RunInProgress");

        h.send(r#"{"jsonrpc":"2.0","id":3,"method":"permission.respond","params":{"requestId":"nope","behavior":"allow"}}"#).await;
        let (not_found, _) = h.response(3).await;
        assert_eq!(not_found["result"], json!({"ok": false, "reason": "not_found"}));

        h.send(r#"{"jsonrpc":"2.0","method":"agent.abort","params":{"runId":"other"}}"#).await;
        h.send(r#"{"jsonrpc":"2.0","method":"agent.abort","params":{"runId":"r1"}}"#).await;
        let (run, before) = h.response(1).await;

        assert_eq!(run["result"]["success"], false);
        assert_eq!(run["result"]["aborted"], true);
        let last_status = before
            .iter()
            .filter(|f| f["params"]["type"] == "status")
            .last()
            .unwrap();
        assert_eq!(last_status["params"]["status"], "aborted");
        assert_eq!(last_status["params"]["runId"], "r1");
    }

    #[tokio::test]
    async fn test_stdin_close_aborts_active_run() {
        let mut h = Harness::start();

        h.send(r#"{"jsonrpc":"2.0","id":7,"method":"agent.run","params":{"runId":"r1","backend":"claude","prompt":"hi","cwd":"/tmp"}}"#).await;
        loop {
            if h.next().await["params"]["type"] == "assistant.delta" {
                break;
            }
        }
        h.close_input();

        let (run, _) = h.response(7).await;
        assert_eq!(run["result"]["aborted"], true);
        h.server.await.unwrap().unwrap();
    }
}
