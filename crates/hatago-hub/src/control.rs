//! Unix-socket control plane used by `hatago status` and `hatago stop`.
//! Each connection carries exactly one newline-delimited JSON-RPC request
//! and one response; the only methods served are `hub/status` and
//! `hub/stop`.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::socket;

/// Permission-denied JSON-RPC error code for `hub/stop` from a foreign uid.
const PERMISSION_DENIED: i64 = -32004;

const MAX_REQUEST_LINE_BYTES: usize = 64 * 1024;
const MAX_REQUESTS_PER_SEC: u32 = 20;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection token bucket guarding the control socket against a
/// runaway or misbehaving client.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_requests_per_sec: u32) -> Self {
        let refill_per_sec = f64::from(max_requests_per_sec.max(1));
        Self {
            capacity: refill_per_sec,
            tokens: refill_per_sec,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct ControlPlane {
    shutdown: CancellationToken,
    accept_task: tokio::task::JoinHandle<()>,
}

impl ControlPlane {
    /// Bind `socket_path` (or use a systemd-activated listener when one is
    /// present) and serve `hub/status` / `hub/stop` until cancelled.
    pub async fn start(hub: Arc<Hub>, socket_path: &Path) -> anyhow::Result<Self> {
        let listener = match socket::bind_systemd_activated_listener()? {
            Some(listener) => listener,
            None => socket::bind_listener(socket_path).await?,
        };
        let owner_uid = socket::current_uid();
        let shutdown = CancellationToken::new();
        let accept_shutdown = shutdown.clone();
        let hub_shutdown = hub.shutdown_token();
        let limiter = Arc::new(tokio::sync::Mutex::new(TokenBucket::new(MAX_REQUESTS_PER_SEC)));

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let hub = hub.clone();
                        let hub_shutdown = hub_shutdown.clone();
                        let limiter = limiter.clone();
                        tokio::spawn(async move {
                            if let Err(error) = handle_connection(stream, &hub, owner_uid, &hub_shutdown, &limiter).await {
                                tracing::debug!(error = %error, "control connection failed");
                            }
                        });
                    }
                }
            }
        });

        Ok(Self { shutdown, accept_task })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.accept_task.await;
    }
}

async fn handle_connection(
    stream: UnixStream,
    hub: &Arc<Hub>,
    owner_uid: u32,
    hub_shutdown: &CancellationToken,
    limiter: &Arc<tokio::sync::Mutex<TokenBucket>>,
) -> anyhow::Result<()> {
    let peer_uid = stream.peer_cred()?.uid();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if !limiter.lock().await.try_consume() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": {"code": -32005, "message": "rate limit exceeded"},
        });
        write_half.write_all(&serde_json::to_vec(&response)?).await?;
        write_half.write_all(b"\n").await?;
        return Ok(());
    }

    let mut line = String::new();
    let bytes = match tokio::time::timeout(REQUEST_READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => {
            let response = json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": {"code": -32001, "message": "control request timed out"},
            });
            write_half.write_all(&serde_json::to_vec(&response)?).await?;
            write_half.write_all(b"\n").await?;
            return Ok(());
        }
    };
    if bytes == 0 {
        return Ok(());
    }

    let response = if line.len() > MAX_REQUEST_LINE_BYTES {
        json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": {"code": -32002, "message": "control request too large"},
        })
    } else {
        match serde_json::from_str::<Value>(line.trim()) {
            Ok(request) => dispatch(&request, hub, peer_uid, owner_uid, hub_shutdown),
            Err(error) => json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": {"code": -32700, "message": format!("invalid control request: {error}")},
            }),
        }
    };

    let payload = serde_json::to_vec(&response)?;
    write_half.write_all(&payload).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

fn dispatch(request: &Value, hub: &Arc<Hub>, peer_uid: u32, owner_uid: u32, hub_shutdown: &CancellationToken) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

    match method {
        "hub/status" => json!({"jsonrpc": "2.0", "id": id, "result": hub.status_payload()}),
        "hub/stop" => {
            if peer_uid != owner_uid {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": PERMISSION_DENIED,
                        "message": "permission denied: only the owning user may stop this hub",
                    },
                })
            } else {
                hub_shutdown.cancel();
                json!({"jsonrpc": "2.0", "id": id, "result": {"stopping": true}})
            }
        }
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("unknown control method '{other}'")},
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatago_config::HubConfig;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader as TokioBufReader};

    async fn spawn_hub() -> Arc<Hub> {
        Arc::new(Hub::new(HubConfig::default(), None, false))
    }

    #[tokio::test]
    async fn status_request_returns_result() -> anyhow::Result<()> {
        let hub = spawn_hub().await;
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("hatago.sock");
        let control = ControlPlane::start(hub, &socket_path).await?;

        let mut client = socket::connect(&socket_path).await?;
        client
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"hub/status\"}\n")
            .await?;
        let mut response = String::new();
        TokioBufReader::new(&mut client).read_line(&mut response).await?;
        let value: Value = serde_json::from_str(response.trim())?;
        assert!(value.get("result").is_some());

        control.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() -> anyhow::Result<()> {
        let hub = spawn_hub().await;
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("hatago.sock");
        let control = ControlPlane::start(hub, &socket_path).await?;

        let mut client = socket::connect(&socket_path).await?;
        client
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"hub/nonsense\"}\n")
            .await?;
        let mut response = String::new();
        TokioBufReader::new(&mut client).read_line(&mut response).await?;
        let value: Value = serde_json::from_str(response.trim())?;
        assert_eq!(value["error"]["code"], -32601);

        control.shutdown().await;
        Ok(())
    }
}
