//! Backend connection lifecycle.
//!
//! The [`ClientManager`] owns one connection per configured backend. Each
//! connection is an rmcp client over a spawned child process. The manager
//! handles initial connect with retries, detects unexpected transport close
//! through a monitor task that awaits the running service, runs a single
//! reconnection task per backend with capped exponential backoff, and parks
//! callers in a FIFO queue while a backend is reconnecting.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rmcp::ServiceExt;
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

use crate::config::BackendServerConfig;

/// Handle callers use to issue MCP requests to a backend.
pub type BackendClient = Peer<RoleClient>;

/// Command, argument vector, environment map of a stdio backend.
type StdioCommand = (String, Vec<String>, HashMap<String, String>);

type WaiterReceiver = oneshot::Receiver<Result<BackendClient, ClientError>>;

/// Default time a caller waits in the queue for a reconnection to finish.
///
/// Must exceed the total reconnection backoff (1+2+4+8+16 = 31 s) plus a
/// buffer for the attempts themselves.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_millis(36_000);

/// Initial-connect schedule: 3 attempts, 500 ms doubling backoff between
/// them (500, 1000, 2000).
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl ConnectPolicy {
    /// Backoff before retrying after failed attempt `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Reconnection schedule: 5 attempts, waits 1, 2, 4, 8, 16 s (capped at
/// 30 s) before each.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt `attempt` (1-based), capped at `max_backoff`.
    fn backoff(&self, attempt: u32) -> Duration {
        (self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))).min(self.max_backoff)
    }
}

/// Errors surfaced by the client manager.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unknown backend '{server}'")]
    UnknownBackend { server: String },

    #[error(
        "backend '{server}' uses unsupported transport type '{transport}'; \
         only stdio backends are supported"
    )]
    UnsupportedTransport {
        server: String,
        transport: &'static str,
    },

    #[error("failed to connect to backend '{server}' after {attempts} attempts: {source}")]
    ConnectFailed {
        server: String,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(
        "backend {server} reconnection failed after {attempts} attempts, \
         manual intervention required"
    )]
    ReconnectExhausted { server: String, attempts: u32 },

    #[error("Request timeout: backend {server} reconnection took longer than {timeout_ms}ms")]
    QueueTimeout { server: String, timeout_ms: u64 },

    #[error("backend '{server}' is disconnecting")]
    Disconnecting { server: String },
}

/// Connection state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnecting,
    Disconnected,
    Reconnecting,
}

/// Introspection snapshot for one backend.
#[derive(Debug, Clone)]
pub struct BackendStats {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    pub queued_requests: usize,
}

/// Outcome of [`ClientManager::connect_all`]. Never an error: per-backend
/// failures are collected.
#[derive(Debug, Default)]
pub struct ConnectAllReport {
    pub successful: Vec<String>,
    pub failed: Vec<(String, ClientError)>,
}

/// A caller parked while its backend reconnects.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<BackendClient, ClientError>>,
}

/// Mutable state of one backend connection.
///
/// Invariant: `client` is `Some` iff `conn == Connected`. The queue is
/// non-empty only while `conn == Reconnecting`; it is drained on success and
/// rejected on exhaustion or disconnect.
struct BackendState {
    conn: ConnectionState,
    client: Option<BackendClient>,
    cancel: Option<rmcp::service::RunningServiceCancellationToken>,
    /// Bumped on every install; ties close notifications to the connection
    /// that produced them so a stale monitor cannot trigger reconnection.
    generation: u64,
    reconnect_attempt: u32,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl BackendState {
    fn new() -> Self {
        Self {
            conn: ConnectionState::Disconnected,
            client: None,
            cancel: None,
            generation: 0,
            reconnect_attempt: 0,
            queue: VecDeque::new(),
            next_waiter_id: 0,
        }
    }

    fn enqueue(&mut self) -> (u64, WaiterReceiver) {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(Waiter { id, tx });
        (id, rx)
    }

    fn remove_waiter(&mut self, id: u64) {
        self.queue.retain(|w| w.id != id);
    }
}

/// Manages connections to all configured backends.
///
/// No process-global state: everything lives in the instance, which is
/// shared behind an `Arc` by the proxy service and the monitor/reconnection
/// tasks it spawns.
pub struct ClientManager {
    backends: HashMap<String, BackendServerConfig>,
    connect_policy: ConnectPolicy,
    reconnect_policy: ReconnectPolicy,
    /// Discard child stderr instead of inheriting it.
    silent: bool,
    states: Mutex<HashMap<String, Arc<Mutex<BackendState>>>>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ClientManager {
    pub fn new(backends: HashMap<String, BackendServerConfig>, silent: bool) -> Self {
        Self::with_policies(
            backends,
            silent,
            ConnectPolicy::default(),
            ReconnectPolicy::default(),
        )
    }

    pub fn with_policies(
        backends: HashMap<String, BackendServerConfig>,
        silent: bool,
        connect_policy: ConnectPolicy,
        reconnect_policy: ReconnectPolicy,
    ) -> Self {
        Self {
            backends,
            connect_policy,
            reconnect_policy,
            silent,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Names of all configured backends.
    pub fn server_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    fn backend_config(&self, server: &str) -> Result<&BackendServerConfig, ClientError> {
        self.backends
            .get(server)
            .ok_or_else(|| ClientError::UnknownBackend {
                server: server.to_string(),
            })
    }

    /// The stdio command triple for a backend; other transports are rejected
    /// here with an error naming the backend and the configured type.
    fn stdio_config(&self, server: &str) -> Result<StdioCommand, ClientError> {
        match self.backend_config(server)? {
            BackendServerConfig::Stdio { command, args, env } => {
                Ok((command.clone(), args.clone(), env.clone()))
            }
            other => Err(ClientError::UnsupportedTransport {
                server: server.to_string(),
                transport: other.transport_label(),
            }),
        }
    }

    /// The state cell for a backend that has already been touched (connected,
    /// queued, or injected), regardless of whether it is configured.
    async fn existing_state(&self, server: &str) -> Option<Arc<Mutex<BackendState>>> {
        let states = self.states.lock().await;
        states.get(server).cloned()
    }

    /// Lazily create the state cell for a configured backend.
    async fn state_for(&self, server: &str) -> Result<Arc<Mutex<BackendState>>, ClientError> {
        self.backend_config(server)?;
        let mut states = self.states.lock().await;
        Ok(states
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BackendState::new())))
            .clone())
    }

    /// Spawn the child process and perform the MCP initialize handshake.
    async fn spawn_service(
        &self,
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> anyhow::Result<RunningService<RoleClient, ()>> {
        let silent = self.silent;
        let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(
            |cmd| {
                cmd.args(args);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                if let Ok(level) = std::env::var("LOG_LEVEL") {
                    cmd.env("LOG_LEVEL", level);
                }
                if silent {
                    cmd.stderr(std::process::Stdio::null());
                }
            },
        ))
        .map_err(|e| anyhow::anyhow!("failed to spawn backend '{server}': {e}"))?;

        let service = ()
            .serve(transport)
            .await
            .map_err(|e| anyhow::anyhow!("failed MCP handshake with backend '{server}': {e}"))?;
        Ok(service)
    }

    /// Install a freshly connected service: store the peer, start the monitor
    /// task that turns an unexpected transport close into reconnection.
    fn install_connected(
        self: &Arc<Self>,
        state: &mut BackendState,
        server: &str,
        service: RunningService<RoleClient, ()>,
    ) -> BackendClient {
        state.generation += 1;
        let generation = state.generation;
        let client = service.peer().clone();

        state.conn = ConnectionState::Connected;
        state.client = Some(client.clone());
        state.cancel = Some(service.cancellation_token());
        state.reconnect_attempt = 0;

        let manager = Arc::clone(self);
        let name = server.to_string();
        tokio::spawn(async move {
            let _ = service.waiting().await;
            manager.on_service_closed(&name, generation).await;
        });

        client
    }

    /// Transport close observed by a monitor task. Unexpected close (still
    /// CONNECTED for the same generation) starts reconnection; anything else
    /// was initiated by us.
    async fn on_service_closed(self: &Arc<Self>, server: &str, generation: u64) {
        let state_arc = {
            let states = self.states.lock().await;
            match states.get(server) {
                Some(arc) => arc.clone(),
                None => return,
            }
        };
        let mut state = state_arc.lock().await;
        if state.generation != generation {
            return;
        }
        match state.conn {
            ConnectionState::Connected => {
                tracing::warn!(backend = server, "backend connection closed unexpectedly");
                state.conn = ConnectionState::Reconnecting;
                state.client = None;
                state.cancel = None;
                self.spawn_reconnect(server.to_string());
            }
            ConnectionState::Disconnecting
            | ConnectionState::Disconnected
            | ConnectionState::Reconnecting => {}
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, server: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.reconnect_loop(&server).await;
        });
    }

    /// The single reconnection task for one backend. Runs at most
    /// `reconnect_policy.attempts` attempts with capped exponential backoff
    /// before each; flushes the queue on success, fails it on exhaustion.
    async fn reconnect_loop(self: &Arc<Self>, server: &str) {
        let Some(state_arc) = self.existing_state(server).await else {
            return;
        };
        let Ok((command, args, env)) = self.stdio_config(server) else {
            // Unconfigured (test-injected) or non-stdio backends cannot be
            // respawned; fail any waiters and stop.
            let mut state = state_arc.lock().await;
            state.conn = ConnectionState::Disconnected;
            Self::fail_queue(&mut state, server, self.reconnect_policy.attempts);
            return;
        };

        let attempts = self.reconnect_policy.attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.reconnect_policy.backoff(attempt)).await;

            {
                let mut state = state_arc.lock().await;
                if state.conn != ConnectionState::Reconnecting {
                    tracing::debug!(backend = server, "reconnection aborted by state change");
                    return;
                }
                state.reconnect_attempt = attempt;
            }

            tracing::info!(backend = server, attempt, attempts, "reconnecting to backend");
            match self.spawn_service(server, &command, &args, &env).await {
                Ok(service) => {
                    let mut state = state_arc.lock().await;
                    if state.conn != ConnectionState::Reconnecting {
                        // Disconnected while we were handshaking.
                        service.cancellation_token().cancel();
                        return;
                    }
                    let client = self.install_connected(&mut state, server, service);
                    let waiters: Vec<Waiter> = state.queue.drain(..).collect();
                    let queued = waiters.len();
                    for waiter in waiters {
                        let _ = waiter.tx.send(Ok(client.clone()));
                    }
                    tracing::info!(
                        backend = server,
                        attempt,
                        flushed = queued,
                        "backend reconnected"
                    );
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        backend = server,
                        attempt,
                        attempts,
                        error = %error,
                        "reconnection attempt failed"
                    );
                }
            }
        }

        let mut state = state_arc.lock().await;
        if state.conn == ConnectionState::Reconnecting {
            state.conn = ConnectionState::Disconnected;
        }
        state.reconnect_attempt = 0;
        Self::fail_queue(&mut state, server, attempts);
        tracing::error!(
            backend = server,
            attempts,
            "backend reconnection exhausted, manual intervention required"
        );
    }

    fn fail_queue(state: &mut BackendState, server: &str, attempts: u32) {
        for waiter in state.queue.drain(..) {
            let _ = waiter.tx.send(Err(ClientError::ReconnectExhausted {
                server: server.to_string(),
                attempts,
            }));
        }
    }

    /// Initial connect with retries. Idempotent: an already connected backend
    /// returns its client immediately.
    pub async fn connect(self: &Arc<Self>, server: &str) -> Result<BackendClient, ClientError> {
        let (command, args, env) = self.stdio_config(server)?;
        let state_arc = self.state_for(server).await?;
        let mut state = state_arc.lock().await;

        match state.conn {
            ConnectionState::Connected => {
                if let Some(client) = &state.client {
                    return Ok(client.clone());
                }
            }
            ConnectionState::Disconnecting => {
                return Err(ClientError::Disconnecting {
                    server: server.to_string(),
                });
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
        }

        let attempts = self.connect_policy.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.spawn_service(server, &command, &args, &env).await {
                Ok(service) => {
                    let client = self.install_connected(&mut state, server, service);
                    // Resolve any waiters parked by a concurrent reconnection.
                    let waiters: Vec<Waiter> = state.queue.drain(..).collect();
                    for waiter in waiters {
                        let _ = waiter.tx.send(Ok(client.clone()));
                    }
                    tracing::info!(backend = server, attempt, "connected to backend");
                    return Ok(client);
                }
                Err(error) => {
                    tracing::warn!(
                        backend = server,
                        attempt,
                        attempts,
                        error = %error,
                        "connect attempt failed"
                    );
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(self.connect_policy.backoff(attempt)).await;
                    }
                }
            }
        }

        // A concurrent reconnection task owns the RECONNECTING state and its
        // queue; leave it to finish on its own schedule.
        if state.conn != ConnectionState::Reconnecting {
            state.conn = ConnectionState::Disconnected;
        }
        Err(ClientError::ConnectFailed {
            server: server.to_string(),
            attempts,
            source: last_error
                .unwrap_or_else(|| anyhow::anyhow!("no connect attempt was executed"))
                .into(),
        })
    }

    /// Connect every configured backend concurrently. Individual failures go
    /// into the report; this never fails as a whole.
    pub async fn connect_all(self: &Arc<Self>) -> ConnectAllReport {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();

        let futures: Vec<_> = names
            .into_iter()
            .map(|name| {
                let manager = Arc::clone(self);
                async move {
                    let result = manager.connect(&name).await;
                    (name, result)
                }
            })
            .collect();

        let mut report = ConnectAllReport::default();
        for (name, result) in futures::future::join_all(futures).await {
            match result {
                Ok(_) => report.successful.push(name),
                Err(error) => report.failed.push((name, error)),
            }
        }
        report
    }

    /// The hot path: return a live client, parking the caller while the
    /// backend reconnects.
    ///
    /// A caller that observes DISCONNECTED starts the reconnection flow
    /// itself; a caller that observes RECONNECTING joins the existing queue.
    /// The per-caller timeout (default 36 s) removes the waiter from the
    /// queue when it fires, without affecting sibling requests.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        server: &str,
        timeout: Option<Duration>,
    ) -> Result<BackendClient, ClientError> {
        // A previously touched backend (including test-injected ones) keeps
        // its state; otherwise the backend must be configured stdio before
        // any queueing happens.
        let state_arc = match self.existing_state(server).await {
            Some(arc) => arc,
            None => {
                let _ = self.stdio_config(server)?;
                self.state_for(server).await?
            }
        };
        let timeout = timeout.unwrap_or(DEFAULT_QUEUE_TIMEOUT);

        let (waiter_id, rx) = {
            let mut state = state_arc.lock().await;
            match state.conn {
                ConnectionState::Connected => {
                    if let Some(client) = &state.client {
                        return Ok(client.clone());
                    }
                    // Incoherent state; treat as disconnected.
                    state.conn = ConnectionState::Reconnecting;
                    let entry = state.enqueue();
                    self.spawn_reconnect(server.to_string());
                    entry
                }
                ConnectionState::Disconnecting => {
                    return Err(ClientError::Disconnecting {
                        server: server.to_string(),
                    });
                }
                ConnectionState::Reconnecting => state.enqueue(),
                ConnectionState::Disconnected => {
                    state.conn = ConnectionState::Reconnecting;
                    let entry = state.enqueue();
                    self.spawn_reconnect(server.to_string());
                    entry
                }
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(ClientError::Disconnecting {
                server: server.to_string(),
            }),
            Err(_elapsed) => {
                let mut state = state_arc.lock().await;
                state.remove_waiter(waiter_id);
                Err(ClientError::QueueTimeout {
                    server: server.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Close one backend connection. Queued waiters, if any, are rejected
    /// with a disconnecting error.
    pub async fn disconnect(&self, server: &str) {
        let state_arc = {
            let states = self.states.lock().await;
            match states.get(server) {
                Some(arc) => arc.clone(),
                None => return,
            }
        };
        let mut state = state_arc.lock().await;
        state.conn = ConnectionState::Disconnecting;
        state.client = None;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        let rejected = state.queue.len();
        for waiter in state.queue.drain(..) {
            let _ = waiter.tx.send(Err(ClientError::Disconnecting {
                server: server.to_string(),
            }));
        }
        state.conn = ConnectionState::Disconnected;
        state.reconnect_attempt = 0;
        if rejected > 0 {
            tracing::warn!(backend = server, rejected, "rejected queued requests on disconnect");
        }
        tracing::info!(backend = server, "disconnected from backend");
    }

    /// Concurrent [`Self::disconnect`] for all known backends.
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = {
            let states = self.states.lock().await;
            states.keys().cloned().collect()
        };
        let futures: Vec<_> = names.iter().map(|name| self.disconnect(name)).collect();
        futures::future::join_all(futures).await;
    }

    pub async fn is_connected(&self, server: &str) -> bool {
        let states = self.states.lock().await;
        match states.get(server) {
            Some(arc) => arc.lock().await.conn == ConnectionState::Connected,
            None => false,
        }
    }

    pub async fn connected_server_names(&self) -> Vec<String> {
        let states: Vec<(String, Arc<Mutex<BackendState>>)> = {
            let map = self.states.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut names = Vec::new();
        for (name, arc) in states {
            if arc.lock().await.conn == ConnectionState::Connected {
                names.push(name);
            }
        }
        names.sort();
        names
    }

    /// Per-backend introspection snapshot. Backends never touched report
    /// DISCONNECTED.
    pub async fn stats(&self) -> HashMap<String, BackendStats> {
        let states: Vec<(String, Arc<Mutex<BackendState>>)> = {
            let map = self.states.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut stats = HashMap::new();
        for name in self.backends.keys() {
            stats.insert(
                name.clone(),
                BackendStats {
                    state: ConnectionState::Disconnected,
                    reconnect_attempt: 0,
                    queued_requests: 0,
                },
            );
        }
        for (name, arc) in states {
            let state = arc.lock().await;
            stats.insert(
                name,
                BackendStats {
                    state: state.conn,
                    reconnect_attempt: state.reconnect_attempt,
                    queued_requests: state.queue.len(),
                },
            );
        }
        stats
    }

    /// Install a pre-connected running service under a backend name.
    ///
    /// Useful for testing with in-process MCP servers (e.g. over
    /// `tokio::io::duplex`). The backend does not need to be present in the
    /// config map; reconnection for such backends fails immediately.
    pub async fn insert_running_service(
        self: &Arc<Self>,
        server: &str,
        service: RunningService<RoleClient, ()>,
    ) -> BackendClient {
        let state_arc = {
            let mut states = self.states.lock().await;
            states
                .entry(server.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BackendState::new())))
                .clone()
        };
        let mut state = state_arc.lock().await;
        self.install_connected(&mut state, server, service)
    }
}
