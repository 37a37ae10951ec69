//! Upstream Node + Lifecycle Controller.
//!
//! One [`UpstreamNode`] per configured upstream. `ensure_active` is the
//! synchronous entry point that either reuses a live connection or dials a
//! fresh one; the mutex guarding [`Inner`] is held across each individual
//! dial attempt, which is what gives the "at-most-one-concurrent-dial"
//! invariant: every concurrent caller serialises on the same lock, and only
//! the first one through actually dials the transport. A crashed node is
//! *not* redialed inline by a caller -- that's `schedule_reconnect`'s job,
//! running on its own timer in the background (spec §4.2); a caller that
//! hits a crashed node gets an immediate transport-error instead of
//! blocking through the backoff.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use hatago_config::{HealthCheckMethod, ToolNamingConfig, UpstreamSpec};
use rmcp::model::{CallToolRequestParam, GetPromptRequestParam, ReadResourceRequestParam};
use rmcp::service::RunningService;
use rmcp::{RoleClient, ServiceError};
use tokio::sync::Mutex;

use crate::client_handler::{ActiveSessions, HubClientHandler};
use crate::connector::{self, Connection, ConnectError};
use crate::error::{HubError, Result};
use crate::idle::IdleManager;
use crate::registry::{DiscoveredPrompt, DiscoveredResource, DiscoveredTool, Registry};
use crate::session::SessionManager;

const RECONNECT_BACKOFF_BASE_MS: u64 = 1_000;
const RECONNECT_BACKOFF_CEILING_MS: u64 = 30_000;
const CHILD_WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Crashed = 4,
}

impl NodeStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Crashed,
            _ => Self::Stopped,
        }
    }
}

struct Inner {
    connection: Option<Connection>,
    reconnect_attempt: u32,
    /// When the current failure streak began; reset to `None` on a
    /// successful dial. Used against `reconnect.maxDurationSecs`.
    first_crash_at: Option<Instant>,
    last_error: Option<String>,
    last_crash_at: Option<Instant>,
}

/// Bump the crash bookkeeping on an already-held guard and return the new
/// attempt count. Free function (not a method) so it can run on a guard
/// the caller already holds, without re-locking `inner`.
fn record_crash_locked(guard: &mut Inner, message: String) -> u32 {
    guard.reconnect_attempt = guard.reconnect_attempt.saturating_add(1);
    if guard.first_crash_at.is_none() {
        guard.first_crash_at = Some(Instant::now());
    }
    guard.last_crash_at = Some(Instant::now());
    guard.last_error = Some(message);
    guard.reconnect_attempt
}

pub struct UpstreamNode {
    pub spec: UpstreamSpec,
    registry: Arc<Registry>,
    global_naming: ToolNamingConfig,
    sessions: Arc<SessionManager>,
    active_sessions: ActiveSessions,
    /// Whether the process is running with the `production` hint set (spec
    /// §4.1); gates the connector's default HTTPS enforcement.
    production: bool,
    status: AtomicU8,
    in_flight_calls: AtomicU32,
    idle: IdleManager,
    /// Deadline applied to every outbound `tools/call`, `resources/read`
    /// and `prompts/get`, taken from config `timeouts.toolCallMs`.
    call_timeout: Duration,
    inner: Mutex<Inner>,
    self_weak: Mutex<Weak<UpstreamNode>>,
}

impl UpstreamNode {
    /// Built via `Arc::new_cyclic` so the node can hand its own
    /// `ClientHandler` a `Weak<Self>` for triggering re-discovery, without
    /// creating a reference cycle with the `Connection` it owns.
    pub fn new(
        spec: UpstreamSpec,
        registry: Arc<Registry>,
        global_naming: ToolNamingConfig,
        call_timeout: Duration,
        sessions: Arc<SessionManager>,
        production: bool,
    ) -> Arc<Self> {
        let idle = IdleManager::new(spec.idle);
        Arc::new_cyclic(|weak| Self {
            spec,
            registry,
            global_naming,
            sessions,
            active_sessions: Arc::new(StdMutex::new(std::collections::HashMap::new())),
            production,
            status: AtomicU8::new(NodeStatus::Stopped as u8),
            in_flight_calls: AtomicU32::new(0),
            idle,
            call_timeout,
            inner: Mutex::new(Inner {
                connection: None,
                reconnect_attempt: 0,
                first_crash_at: None,
                last_error: None,
                last_crash_at: None,
            }),
            self_weak: Mutex::new(weak.clone()),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: NodeStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn idle(&self) -> &IdleManager {
        &self.idle
    }

    fn weak_self(&self) -> Weak<UpstreamNode> {
        self.self_weak.try_lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn build_client_handler(&self) -> HubClientHandler {
        HubClientHandler::new(
            &self.spec.id,
            self.sessions.clone(),
            self.active_sessions.clone(),
            self.weak_self(),
        )
    }

    fn begin_session_call(&self, session_id: &str) {
        let mut active = self.active_sessions.lock().expect("active sessions lock poisoned");
        *active.entry(session_id.to_string()).or_insert(0) += 1;
    }

    fn end_session_call(&self, session_id: &str) {
        let mut active = self.active_sessions.lock().expect("active sessions lock poisoned");
        if let Some(count) = active.get_mut(session_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(session_id);
            }
        }
    }

    /// Drive the node to `Running` if it is not already connected. A node
    /// in `Crashed` is not redialed here -- only the background timer
    /// armed by `schedule_reconnect` dials a crashed node -- so this
    /// returns a fast transport-error instead of blocking through the
    /// backoff.
    pub async fn ensure_active(&self) -> Result<()> {
        let guard = self.inner.lock().await;
        if guard.connection.is_some() {
            return Ok(());
        }
        if self.status() == NodeStatus::Crashed {
            let message = guard
                .last_error
                .clone()
                .unwrap_or_else(|| "upstream crashed".to_string());
            drop(guard);
            return Err(HubError::TransportError {
                upstream: self.spec.id.clone(),
                message,
            });
        }
        drop(guard);
        self.dial_and_activate().await
    }

    /// Dial the transport once and, on success, discover the catalogue and
    /// mark the node running. On failure the node goes `crashed` and
    /// `schedule_reconnect` takes over retrying, bounded by the upstream's
    /// reconnect policy.
    async fn dial_and_activate(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.connection.is_some() {
            return Ok(());
        }

        self.set_status(NodeStatus::Starting);
        let transport = self.spec.transport();
        let handler = self.build_client_handler();

        match connector::connect(&self.spec.id, &transport, handler, self.production).await {
            Ok(connection) => {
                guard.connection = Some(connection);
                guard.reconnect_attempt = 0;
                guard.first_crash_at = None;
                guard.last_error = None;
                drop(guard);
                self.set_status(NodeStatus::Running);
                self.idle.on_activate();
                self.spawn_child_exit_watcher();
                if let Err(error) = self.discover_and_register().await {
                    tracing::warn!(
                        upstream = %self.spec.id,
                        error = %error,
                        "activation discovery failed; node stays running with an empty catalogue"
                    );
                }
                Ok(())
            }
            Err(connect_error) => {
                let (hub_error, retry_allowed) = match connect_error {
                    ConnectError::Transport(error) => (
                        HubError::TransportError {
                            upstream: self.spec.id.clone(),
                            message: error.to_string(),
                        },
                        true,
                    ),
                    ConnectError::Handshake(error) => (
                        HubError::HandshakeError {
                            upstream: self.spec.id.clone(),
                            message: error.to_string(),
                        },
                        true,
                    ),
                    ConnectError::Unauthorised(error) => (
                        HubError::Unauthorised {
                            upstream: self.spec.id.clone(),
                            message: error.to_string(),
                        },
                        self.spec.reconnect.retry_on_unauthorised,
                    ),
                };
                let message = hub_error.to_string();
                let attempt = record_crash_locked(&mut guard, message);
                drop(guard);
                self.set_status(NodeStatus::Crashed);
                if retry_allowed {
                    self.schedule_reconnect(attempt).await;
                } else {
                    tracing::warn!(
                        upstream = %self.spec.id,
                        "not scheduling automatic reconnect after credential rejection (reconnect.retryOnUnauthorised = false)"
                    );
                }
                Err(hub_error)
            }
        }
    }

    /// Transition an already-running (or already-crashed) node to
    /// `crashed`, dropping its connection if it still has one, and arm the
    /// background reconnect timer. Idempotent: calling it twice in a race
    /// just double-counts the attempt, which only makes the next backoff
    /// slightly longer than strictly necessary.
    pub async fn mark_crashed(&self, message: impl Into<String>) {
        let message = message.into();
        let mut guard = self.inner.lock().await;
        if let Some(connection) = guard.connection.take() {
            tokio::spawn(async move { connection.shutdown().await });
        }
        let attempt = record_crash_locked(&mut guard, message);
        drop(guard);
        self.set_status(NodeStatus::Crashed);
        self.schedule_reconnect(attempt).await;
    }

    /// Arm a background timer that redials this node after the backoff
    /// delay for `attempt`, unless the reconnect budget configured on this
    /// upstream is already exhausted or the node has moved on (redialed
    /// manually, or deactivated) before the timer fires.
    async fn schedule_reconnect(&self, attempt: u32) {
        if self.reconnect_budget_exhausted(attempt).await {
            tracing::warn!(
                upstream = %self.spec.id,
                attempt,
                "reconnect budget exhausted; giving up automatic retries until the next manual activation"
            );
            return;
        }
        let weak = self.weak_self();
        let delay = backoff_delay(attempt.saturating_sub(1));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(node) = weak.upgrade() else { return };
            if node.status() != NodeStatus::Crashed {
                return;
            }
            let _ = node.dial_and_activate().await;
        });
    }

    async fn reconnect_budget_exhausted(&self, attempt: u32) -> bool {
        if let Some(max_attempts) = self.spec.reconnect.max_attempts {
            if attempt >= max_attempts {
                return true;
            }
        }
        if let Some(max_duration_secs) = self.spec.reconnect.max_duration_secs {
            let guard = self.inner.lock().await;
            if let Some(first_crash_at) = guard.first_crash_at {
                if first_crash_at.elapsed() >= Duration::from_secs(max_duration_secs) {
                    return true;
                }
            }
        }
        false
    }

    /// For a stdio upstream, poll for the child process exiting on its own
    /// while the node believes itself `Running`, and crash the node when it
    /// does. Polls rather than holding `&mut Child` in a dedicated task so
    /// it can share the connection with the deliberate-shutdown path
    /// (`Connection::shutdown`) through the same `inner` mutex instead of
    /// racing it for ownership of the child.
    fn spawn_child_exit_watcher(&self) {
        if !matches!(self.spec.transport(), hatago_config::TransportSpec::Stdio { .. }) {
            return;
        }
        let weak = self.weak_self();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHILD_WATCH_INTERVAL).await;
                let Some(node) = weak.upgrade() else { return };
                if node.status() != NodeStatus::Running {
                    return;
                }
                let exited = {
                    let mut guard = node.inner.lock().await;
                    match guard.connection.as_mut() {
                        Some(connection) => connection.try_wait_stdio_child().ok().flatten(),
                        None => return,
                    }
                };
                if let Some(status) = exited {
                    node.mark_crashed(format!("upstream child exited unexpectedly: {status}"))
                        .await;
                    return;
                }
            }
        });
    }

    pub async fn refresh_catalogue(&self) -> anyhow::Result<()> {
        self.discover_and_register().await
    }

    async fn discover_and_register(&self) -> anyhow::Result<()> {
        let guard = self.inner.lock().await;
        let Some(connection) = guard.connection.as_ref() else {
            return Ok(());
        };
        let service = connection.service();

        let tools = service.list_tools(None).await?.tools;
        let discovered = tools
            .into_iter()
            .map(|tool| DiscoveredTool {
                original_name: tool.name.to_string(),
                description: tool.description.map(|d| d.to_string()),
                input_schema: serde_json::to_value(tool.input_schema.as_ref())
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect();
        self.registry.register_server_tools(
            &self.spec.id,
            discovered,
            &self.global_naming,
            &self.spec.naming,
        );

        if let Ok(resources) = service.list_resources(None).await {
            let discovered = resources
                .resources
                .into_iter()
                .map(|resource| DiscoveredResource {
                    uri: resource.raw.uri,
                    name: Some(resource.raw.name),
                    mime_type: resource.raw.mime_type,
                })
                .collect();
            self.registry
                .register_server_resources(&self.spec.id, discovered);
        }

        if let Ok(prompts) = service.list_prompts(None).await {
            let discovered = prompts
                .prompts
                .into_iter()
                .map(|prompt| DiscoveredPrompt {
                    original_name: prompt.name,
                    description: prompt.description,
                    arguments: serde_json::to_value(&prompt.arguments).unwrap_or(serde_json::Value::Null),
                })
                .collect();
            self.registry.register_server_prompts(
                &self.spec.id,
                discovered,
                &self.global_naming,
                &self.spec.naming,
            );
        }

        Ok(())
    }

    /// Route a `tools/call` to this node, refcounting the idle manager and
    /// the node's active-session set around the request, and enforcing the
    /// configured per-call deadline.
    pub async fn call_tool(
        &self,
        session_id: &str,
        request: CallToolRequestParam,
    ) -> Result<rmcp::model::CallToolResult> {
        self.ensure_active().await?;
        self.in_flight_calls.fetch_add(1, Ordering::SeqCst);
        self.idle.on_call_start();
        self.begin_session_call(session_id);
        let result = self
            .dispatch_call(|service| service.call_tool(request))
            .await;
        self.end_session_call(session_id);
        self.idle.on_call_end();
        self.in_flight_calls.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Route a `resources/read` to this node, subject to the same deadline.
    pub async fn read_resource(
        &self,
        session_id: &str,
        params: ReadResourceRequestParam,
    ) -> Result<rmcp::model::ReadResourceResult> {
        self.ensure_active().await?;
        self.in_flight_calls.fetch_add(1, Ordering::SeqCst);
        self.idle.on_call_start();
        self.begin_session_call(session_id);
        let result = self
            .dispatch_call(|service| service.read_resource(params))
            .await;
        self.end_session_call(session_id);
        self.idle.on_call_end();
        self.in_flight_calls.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Route a `prompts/get` to this node, subject to the same deadline.
    pub async fn get_prompt(
        &self,
        session_id: &str,
        params: GetPromptRequestParam,
    ) -> Result<rmcp::model::GetPromptResult> {
        self.ensure_active().await?;
        self.in_flight_calls.fetch_add(1, Ordering::SeqCst);
        self.idle.on_call_start();
        self.begin_session_call(session_id);
        let result = self
            .dispatch_call(|service| service.get_prompt(params))
            .await;
        self.end_session_call(session_id);
        self.idle.on_call_end();
        self.in_flight_calls.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Shared body of `call_tool`/`read_resource`/`get_prompt`: grab the
    /// live connection, run `make_call` against its service under the
    /// configured deadline, and classify the outcome. A local timeout does
    /// not by itself mean the transport is dead -- the upstream may just be
    /// slow -- so it surfaces as an ordinary upstream error rather than
    /// crashing the node.
    async fn dispatch_call<T, F, Fut>(&self, make_call: F) -> Result<T>
    where
        F: FnOnce(&RunningService<RoleClient, HubClientHandler>) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ServiceError>>,
    {
        let guard = self.inner.lock().await;
        let Some(connection) = guard.connection.as_ref() else {
            drop(guard);
            return Err(HubError::TransportError {
                upstream: self.spec.id.clone(),
                message: "node has no active connection".to_string(),
            });
        };
        let outcome = tokio::time::timeout(self.call_timeout, make_call(connection.service())).await;
        drop(guard);

        match outcome {
            Ok(result) => self.classify_call_result(result).await,
            Err(_elapsed) => Err(HubError::Timeout {
                upstream: self.spec.id.clone(),
                timeout_secs: self.call_timeout.as_secs(),
            }),
        }
    }

    /// Turn a raw rmcp call outcome into a `HubError`, crashing the node
    /// (and clearing its connection) only for a confirmed transport-level
    /// failure. An ordinary upstream JSON-RPC error leaves the node
    /// running: the upstream answered, it just refused this one call.
    async fn classify_call_result<T>(&self, outcome: std::result::Result<T, ServiceError>) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(error) => {
                let message = error.to_string();
                if is_transport_error(&error) {
                    self.mark_crashed(message.clone()).await;
                    Err(HubError::TransportError {
                        upstream: self.spec.id.clone(),
                        message,
                    })
                } else {
                    Err(HubError::UpstreamError {
                        upstream: self.spec.id.clone(),
                        message,
                    })
                }
            }
        }
    }

    /// Probe liveness of an already-running node without touching the
    /// idle manager's refcount (a health check is not a tool call, spec
    /// §4.2 health-check policy). A node that is not running is not
    /// probed. Any failure here is treated as unhealthy by the caller
    /// (`hub.rs`'s health-check loop), not just a transport-classified one:
    /// a health probe answering with a JSON-RPC error is just as much a
    /// sign the upstream needs reconnecting as a dropped socket would be.
    pub async fn health_check(&self, method: HealthCheckMethod) -> Result<()> {
        let guard = self.inner.lock().await;
        let Some(connection) = guard.connection.as_ref() else {
            return Ok(());
        };
        let service = connection.service();
        let outcome = match method {
            HealthCheckMethod::Ping => service.list_tools(None).await.map(|_| ()),
            HealthCheckMethod::ListTools => service.list_tools(None).await.map(|_| ()),
        };
        drop(guard);
        outcome.map_err(|error| HubError::UpstreamError {
            upstream: self.spec.id.clone(),
            message: error.to_string(),
        })
    }

    /// Gracefully stop the node, e.g. from idle-timeout deactivation or
    /// hub shutdown.
    pub async fn deactivate(&self) {
        self.set_status(NodeStatus::Stopping);
        let mut guard = self.inner.lock().await;
        if let Some(connection) = guard.connection.take() {
            connection.shutdown().await;
        }
        self.registry.clear_server(&self.spec.id);
        self.set_status(NodeStatus::Stopped);
    }

    pub fn in_flight_calls(&self) -> u32 {
        self.in_flight_calls.load(Ordering::SeqCst)
    }
}

/// `TransportSend`/`TransportClosed` indicate the wire itself is dead; any
/// other `ServiceError` (an upstream JSON-RPC error, an unexpected
/// response shape, our own local timeout) is an application-level failure
/// that doesn't warrant tearing down the connection.
fn is_transport_error(error: &ServiceError) -> bool {
    matches!(error, ServiceError::TransportSend(_) | ServiceError::TransportClosed)
}

/// `delay = min(base * 2^attempt, ceiling)`.
fn backoff_delay(attempt: u32) -> Duration {
    let scaled = RECONNECT_BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(scaled.min(RECONNECT_BACKOFF_CEILING_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(4), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(5), Duration::from_millis(RECONNECT_BACKOFF_CEILING_MS));
        assert_eq!(backoff_delay(10), Duration::from_millis(RECONNECT_BACKOFF_CEILING_MS));
    }

    #[test]
    fn is_transport_error_classification() {
        assert!(is_transport_error(&ServiceError::TransportClosed));
        assert!(!is_transport_error(&ServiceError::UnexpectedResponse));
    }

    #[test]
    fn fresh_node_starts_stopped() {
        use hatago_config::{
            ActivationPolicy, HealthCheckPolicy, IdlePolicy, NamingOverrides, ReconnectPolicy, UpstreamSource,
        };
        use std::collections::HashMap;

        let spec = UpstreamSpec {
            id: "demo".to_string(),
            source: UpstreamSource::Local {
                command: "echo-mcp".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            activation: ActivationPolicy::Lazy,
            idle: IdlePolicy::default(),
            health_check: HealthCheckPolicy::default(),
            naming: NamingOverrides::default(),
            reconnect: ReconnectPolicy::default(),
        };
        let node = UpstreamNode::new(
            spec,
            Arc::new(Registry::new()),
            ToolNamingConfig::default(),
            Duration::from_secs(20),
            Arc::new(SessionManager::new()),
            false,
        );
        assert_eq!(node.status(), NodeStatus::Stopped);
        assert_eq!(node.in_flight_calls(), 0);
    }
}
