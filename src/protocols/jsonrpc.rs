//! Line-delimited JSON-RPC 2.0 plumbing shared by every link the bridge speaks.
//!
//! The same helpers serve the outer link (host ↔ worker) and the inner link
//! (worker ↔ Codex app-server). Each link owns its own [`CorrelationTable`], so
//! the id spaces never mix.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::api::types::ApiError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Error object of a JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Recover the typed error a bridge peer attached, or wrap the raw one.
    pub fn into_api_error(self) -> ApiError {
        self.data
            .and_then(|data| serde_json::from_value::<ApiError>(data).ok())
            .unwrap_or_else(|| ApiError::ProtocolError {
                message: format!("code={}, message={}", self.code, self.message),
            })
    }
}

impl From<&ApiError> for RpcError {
    fn from(error: &ApiError) -> Self {
        RpcError {
            code: error.code(),
            message: error.to_string(),
            data: serde_json::to_value(error).ok(),
        }
    }
}

/// Classified incoming line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Carries an id and a result or error: settles one of our requests
    Response {
        id: Value,
        result: Result<Value, RpcError>,
    },
    /// Carries an id and a method: the peer expects a reply
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Method only
    Notification { method: String, params: Value },
}

/// Classify one decoded frame. Returns `None` for shapes that are none of the three.
pub fn classify(mut frame: Value) -> Option<Incoming> {
    let obj = frame.as_object_mut()?;
    let id = obj.remove("id").filter(|id| !id.is_null());
    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string());
    let params = obj.remove("params").unwrap_or(Value::Null);

    match (id, method) {
        (Some(id), None) => {
            if let Some(error) = obj.remove("error") {
                let error = serde_json::from_value::<RpcError>(error.clone()).unwrap_or(RpcError {
                    code: -32000,
                    message: error.to_string(),
                    data: None,
                });
                Some(Incoming::Response {
                    id,
                    result: Err(error),
                })
            } else {
                obj.remove("result").map(|result| Incoming::Response {
                    id,
                    result: Ok(result),
                })
            }
        }
        (Some(id), Some(method)) => Some(Incoming::Request { id, method, params }),
        (None, Some(method)) => Some(Incoming::Notification { method, params }),
        (None, None) => None,
    }
}

/// Parse a raw line into a classified frame. Non-JSON lines yield `None`.
pub fn parse_line(line: &str) -> Option<Incoming> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(trimmed).ok().and_then(classify)
}

/// Render an id for use as a table key (`1` and `"1"` are the same request).
pub fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn request(id: impl Into<Value>, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.into(),
        "method": method,
        "params": params
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params
    })
}

pub fn response(id: Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result
    })
}

pub fn error_response(id: Value, error: RpcError) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error
    })
}

pub fn jsonrpc_error(id: Value, code: i64, message: &str) -> Value {
    error_response(
        id,
        RpcError {
            code,
            message: message.to_string(),
            data: None,
        },
    )
}

/// Newline-delimited reader for peer output.
///
/// Unlike `Lines`, a line that is not valid UTF-8 is not an error: it is
/// decoded lossily and logged, so one garbled line never ends the stream.
/// Cancel-safe: a partially read line is kept for the next call.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` at EOF.
    ///
    /// # Errors
    ///
    /// Only real I/O failures of the underlying reader.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        match String::from_utf8(bytes) {
            Ok(line) => Ok(Some(line)),
            Err(e) => {
                log::warn!("Input line is not valid UTF-8 ({} bytes); decoding lossily", e.as_bytes().len());
                Ok(Some(String::from_utf8_lossy(e.as_bytes()).into_owned()))
            }
        }
    }
}

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Serialized, newline-terminated writes to one byte sink.
#[derive(Clone)]
pub struct LineWriter {
    inner: Arc<AsyncMutex<Option<BoxedWriter>>>,
}

impl LineWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            inner: Arc::new(AsyncMutex::new(Some(Box::pin(writer)))),
        }
    }

    /// Write one frame followed by a newline and flush.
    pub async fn send(&self, frame: &Value) -> Result<(), ApiError> {
        let message = serde_json::to_string(frame).map_err(|e| ApiError::ProtocolError {
            message: format!("Failed to serialize JSON-RPC frame: {e}"),
        })?;

        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or_else(|| ApiError::ProtocolError {
            message: "stdin not available".to_string(),
        })?;
        writer
            .write_all(message.as_bytes())
            .await
            .map_err(|e| ApiError::io("Failed to write to stdin", e))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| ApiError::io("Failed to write newline", e))?;
        writer
            .flush()
            .await
            .map_err(|e| ApiError::io("Failed to flush stdin", e))?;
        Ok(())
    }

    /// Drop the sink, signalling EOF to the reader on the other side.
    pub async fn close(&self) {
        let writer = self.inner.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

type Resolver = oneshot::Sender<Result<Value, RpcError>>;

/// Request id → resolver map for requests *we* issued on one link.
///
/// Every registered entry is removed exactly once: by a matching response, by
/// its timeout, by the caller's future being dropped, or by [`fail_all`].
///
/// [`fail_all`]: CorrelationTable::fail_all
pub struct CorrelationTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, Resolver>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self) -> (u64, oneshot::Receiver<Result<Value, RpcError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        (id, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Resolver>> {
        // The map holds no invariants a panicking holder could break.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Settle the entry matching `id`. Unknown ids are dropped and reported as `false`.
    pub fn resolve(&self, id: &Value, result: Result<Value, RpcError>) -> bool {
        let Some(key) = id_key(id) else {
            return false;
        };
        let entry = self.lock().remove(&key);
        match entry {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => {
                log::debug!("[jsonrpc] Dropping response for unknown id={key}");
                false
            }
        }
    }

    /// Reject every outstanding request with `error`.
    pub fn fail_all(&self, error: &ApiError) -> usize {
        let drained: Vec<Resolver> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        let rpc_error = RpcError::from(error);
        for tx in drained {
            let _ = tx.send(Err(rpc_error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Issue a request on `writer` and await the matching response or `timeout`.
    pub async fn call(
        &self,
        writer: &LineWriter,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let (id, rx) = self.register();
        let guard = EntryGuard {
            table: self,
            key: id.to_string(),
        };

        writer.send(&request(id, method, params)).await?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        match outcome {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(error.into_api_error()),
            Ok(Err(_)) => Err(ApiError::ProtocolError {
                message: format!("Response channel for '{method}' dropped"),
            }),
            Err(_) => Err(ApiError::Timeout {
                message: format!("'{method}' did not answer within {}ms", timeout.as_millis()),
            }),
        }
    }
}

/// Removes a table entry when the awaiting call finishes or is dropped.
struct EntryGuard<'a> {
    table: &'a CorrelationTable,
    key: String,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
    }
}
