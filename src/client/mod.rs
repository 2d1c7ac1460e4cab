//! Host Protocol Client - drives the bridge worker from the host application.
//!
//! The client spawns the worker lazily, speaks the outer JSON-RPC link over
//! its stdio and fans `agent.event` notifications out to subscribers. When the
//! worker exits, every outstanding request is rejected with
//! `ApiError::WorkerExited` and the next call transparently respawns it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::api::events::RunEvent;
use crate::api::types::{
    AbortParams, ApiError, BackendKind, InitializeParams, InitializeResult, PermissionDecision,
    PermissionRespondParams, PermissionRespondResult, RunParams, RunResult, METHOD_AGENT_ABORT,
    METHOD_AGENT_EVENT, METHOD_AGENT_RUN, METHOD_INITIALIZE, METHOD_PERMISSION_RESPOND,
    PROTOCOL_VERSION,
};
use crate::config::ENV_CREDENTIAL_PATHS;
use crate::protocols::jsonrpc::{self, CorrelationTable, Incoming, LineReader, LineWriter};
use crate::runtime::process::{BackendProcess, ExitInfo, ProcessSpec};

/// Default timeout of an outer request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default upper bound of one `agent.run`
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// How to launch the worker.
#[derive(Debug, Clone)]
pub struct BridgeClientOptions {
    /// Path of the `agent-bridge-worker` executable
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment for the worker
    pub env: Vec<(String, String)>,
    /// Passed as `HOME` so the worker can find existing backend logins
    pub home_dir: Option<PathBuf>,
    /// Passed as `AGENT_BRIDGE_CREDENTIAL_PATHS`
    pub credential_search_paths: Vec<PathBuf>,
    pub request_timeout: Duration,
    pub run_timeout: Duration,
}

impl BridgeClientOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            home_dir: None,
            credential_search_paths: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    fn process_spec(&self) -> Result<ProcessSpec, ApiError> {
        let mut spec = ProcessSpec::new(&self.program);
        spec.args = self.args.clone();
        spec.env = self.env.clone();
        if let Some(home) = &self.home_dir {
            spec.env
                .push(("HOME".to_string(), home.to_string_lossy().into_owned()));
        }
        if !self.credential_search_paths.is_empty() {
            let joined = std::env::join_paths(&self.credential_search_paths).map_err(|e| {
                ApiError::InvalidInput {
                    message: format!("Invalid credential search path: {e}"),
                }
            })?;
            spec.env.push((
                ENV_CREDENTIAL_PATHS.to_string(),
                joined.to_string_lossy().into_owned(),
            ));
        }
        Ok(spec)
    }
}

/// Per-subscriber event queues.
///
/// Each subscriber owns an unbounded queue, so a slow consumer delays its own
/// events but never loses any. Closed queues are pruned on the next publish.
#[derive(Default)]
struct EventFanout {
    subscribers: std::sync::Mutex<Vec<mpsc::UnboundedSender<RunEvent>>>,
}

impl EventFanout {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<RunEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    fn publish(&self, event: RunEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// One spawned worker and its link state.
struct WorkerLink {
    generation: u64,
    process: Arc<BackendProcess>,
    writer: LineWriter,
    calls: Arc<CorrelationTable>,
}

impl WorkerLink {
    fn is_alive(&self) -> bool {
        self.process.try_exit().is_none()
    }
}

/// What a request needs from the current link.
struct LinkHandles {
    generation: u64,
    writer: LineWriter,
    calls: Arc<CorrelationTable>,
}

/// `initialize` report of one worker generation.
struct InitCache {
    generation: u64,
    external_deps_dir: Option<PathBuf>,
    result: InitializeResult,
}

struct ClientShared {
    options: BridgeClientOptions,
    link: Mutex<Option<WorkerLink>>,
    init: Mutex<Option<InitCache>>,
    events: Arc<EventFanout>,
    generation: AtomicU64,
}

impl ClientShared {
    /// Drop the link and init report of an exited worker, unless a newer
    /// worker already replaced them.
    async fn forget(&self, generation: u64) {
        {
            let mut link = self.link.lock().await;
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                *link = None;
            }
        }
        let mut init = self.init.lock().await;
        if init.as_ref().is_some_and(|cache| cache.generation == generation) {
            *init = None;
        }
    }

    /// Generation of the live worker, if any.
    async fn live_generation(&self) -> Option<u64> {
        self.link
            .lock()
            .await
            .as_ref()
            .filter(|link| link.is_alive())
            .map(|link| link.generation)
    }
}

/// Cloneable handle to the bridge worker.
#[derive(Clone)]
pub struct BridgeClient {
    shared: Arc<ClientShared>,
}

impl BridgeClient {
    pub fn new(options: BridgeClientOptions) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                options,
                link: Mutex::new(None),
                init: Mutex::new(None),
                events: Arc::new(EventFanout::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the worker unless one is alive. Idempotent.
    pub async fn ensure_process(&self) -> Result<(), ApiError> {
        self.link().await.map(|_| ())
    }

    async fn link(&self) -> Result<LinkHandles, ApiError> {
        let mut link = self.shared.link.lock().await;
        let current = match link.take() {
            Some(current) if current.is_alive() => current,
            _ => self.spawn_worker()?,
        };
        let handles = LinkHandles {
            generation: current.generation,
            writer: current.writer.clone(),
            calls: current.calls.clone(),
        };
        *link = Some(current);
        Ok(handles)
    }

    fn spawn_worker(&self) -> Result<WorkerLink, ApiError> {
        let spec = self.shared.options.process_spec()?;
        let mut process = BackendProcess::spawn_worker(spec)?;
        let writer = LineWriter::new(process.take_stdin()?);
        let stdout = process.take_stdout()?;

        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let process = Arc::new(process);
        let calls = Arc::new(CorrelationTable::new());
        log::info!(
            "Bridge worker started: generation={generation}, pid={:?}",
            process.pid()
        );

        tokio::spawn(supervise(
            Arc::downgrade(&self.shared),
            generation,
            Arc::downgrade(&process),
            calls.clone(),
            self.shared.events.clone(),
            stdout,
        ));

        Ok(WorkerLink {
            generation,
            process,
            writer,
            calls,
        })
    }

    /// Issue one outer request and decode its result.
    ///
    /// # Errors
    ///
    /// - `Timeout` if no reply arrives within `timeout`
    /// - `WorkerExited` if the worker dies while the request is pending
    /// - the typed error the worker replied with
    pub async fn request<P, T>(&self, method: &str, params: P, timeout: Duration) -> Result<T, ApiError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        self.call(method, params, timeout)
            .await
            .map(|(result, _)| result)
    }

    /// `request`, also returning the worker generation that answered.
    async fn call<P, T>(&self, method: &str, params: P, timeout: Duration) -> Result<(T, u64), ApiError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|e| ApiError::InvalidInput {
            message: format!("Failed to serialize {method} params: {e}"),
        })?;
        let link = self.link().await?;
        let result = link.calls.call(&link.writer, method, params, timeout).await?;
        let result = serde_json::from_value(result)
            .map_err(|e| ApiError::protocol(format!("Unexpected {method} result: {e}")))?;
        Ok((result, link.generation))
    }

    /// Fire-and-forget notification.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<(), ApiError> {
        let params = serde_json::to_value(params).map_err(|e| ApiError::InvalidInput {
            message: format!("Failed to serialize {method} params: {e}"),
        })?;
        let link = self.link().await?;
        link.writer.send(&jsonrpc::notification(method, params)).await
    }

    /// Receiver of every `agent.event` from now on, in arrival order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunEvent> {
        self.shared.events.subscribe()
    }

    /// Call `handler` for every event until the client is dropped.
    pub fn on_event<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(RunEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        })
    }

    /// `initialize`, memoized on `external_deps_dir`.
    ///
    /// The cached report is returned while the directory is unchanged and the
    /// worker that produced it is still alive.
    pub async fn initialize(&self, external_deps_dir: Option<&Path>) -> Result<InitializeResult, ApiError> {
        let mut cache = self.shared.init.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.external_deps_dir.as_deref() == external_deps_dir
                && self.shared.live_generation().await == Some(cached.generation)
            {
                return Ok(cached.result.clone());
            }
        }

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            backends_supported: BackendKind::ALL.to_vec(),
            external_deps_dir: external_deps_dir.map(|dir| dir.to_string_lossy().into_owned()),
        };
        let (result, generation): (InitializeResult, u64) = self
            .call(METHOD_INITIALIZE, params, self.shared.options.request_timeout)
            .await?;
        *cache = Some(InitCache {
            generation,
            external_deps_dir: external_deps_dir.map(Path::to_path_buf),
            result: result.clone(),
        });
        Ok(result)
    }

    /// `agent.run`; resolves when the run settles.
    pub async fn run(&self, params: RunParams) -> Result<RunResult, ApiError> {
        self.request(METHOD_AGENT_RUN, params, self.shared.options.run_timeout)
            .await
    }

    /// `agent.abort` as a notification.
    pub async fn abort(&self, run_id: &str) -> Result<(), ApiError> {
        self.notify(
            METHOD_AGENT_ABORT,
            AbortParams {
                run_id: run_id.to_string(),
            },
        )
        .await
    }

    pub async fn respond_permission(
        &self,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<PermissionRespondResult, ApiError> {
        self.request(
            METHOD_PERMISSION_RESPOND,
            PermissionRespondParams {
                request_id: request_id.to_string(),
                decision,
            },
            self.shared.options.request_timeout,
        )
        .await
    }

    /// Terminate the worker and clear cached state. The next call respawns.
    pub async fn stop(&self) {
        let link = self.shared.link.lock().await.take();
        *self.shared.init.lock().await = None;
        if let Some(link) = link {
            link.writer.close().await;
            link.process.terminate();
            let exit = link.process.wait().await;
            log::info!("Bridge worker stopped: generation={}, {exit}", link.generation);
        }
    }
}

/// Read worker stdout until it closes, then reject what is pending.
async fn supervise(
    shared: Weak<ClientShared>,
    generation: u64,
    process: Weak<BackendProcess>,
    calls: Arc<CorrelationTable>,
    events: Arc<EventFanout>,
    stdout: ChildStdout,
) {
    let mut lines = LineReader::new(stdout);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle_worker_line(&calls, &events, &line),
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read worker stdout: {e}");
                break;
            }
        }
    }

    let exit = match process.upgrade() {
        Some(process) => process.wait().await,
        None => ExitInfo::default(),
    };
    let failed = calls.fail_all(&ApiError::WorkerExited {
        code: exit.code,
        signal: exit.signal,
    });
    log::warn!("Bridge worker exited: generation={generation}, {exit}, failed_requests={failed}");

    if let Some(shared) = shared.upgrade() {
        shared.forget(generation).await;
    }
}

fn handle_worker_line(calls: &CorrelationTable, events: &EventFanout, line: &str) {
    match jsonrpc::parse_line(line) {
        Some(Incoming::Response { id, result }) => {
            calls.resolve(&id, result);
        }
        Some(Incoming::Notification { method, params }) if method == METHOD_AGENT_EVENT => {
            match serde_json::from_value::<RunEvent>(params) {
                Ok(event) => events.publish(event),
                Err(e) => log::warn!("Dropping malformed agent.event: {e}"),
            }
        }
        Some(Incoming::Notification { method, .. }) => {
            log::debug!("Ignoring worker notification: method={method}");
        }
        Some(Incoming::Request { method, .. }) => {
            log::warn!("Ignoring unexpected request from worker: method={method}");
        }
        None => {
            if !line.trim().is_empty() {
                log::debug!("[worker stdout] {line}");
            }
        }
    }
}
