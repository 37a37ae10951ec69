//! Downstream HTTP surface: `POST /mcp` for JSON-RPC requests, `GET /mcp`
//! for the SSE notification stream, plus `/health`, `/tools` and `/debug`
//! introspection endpoints, routed explicitly rather than through rmcp's
//! fixed SSE transport.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
}

pub struct HttpEndpoint {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl HttpEndpoint {
    pub async fn start(hub: Arc<Hub>, bind: &str, port: u16, max_body_bytes: usize) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid HTTP bind address '{bind}:{port}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let state = AppState { hub };
        let app = axum::Router::new()
            .route("/mcp", post(post_mcp))
            .route("/mcp", get(get_mcp_stream))
            .route("/health", get(get_health))
            .route("/tools", get(get_tools))
            .route("/debug", get(get_debug))
            .with_state(state)
            .layer(DefaultBodyLimit::max(max_body_bytes));

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
            {
                tracing::warn!(error = %error, "hatago HTTP endpoint stopped with error");
            }
        });

        Ok(Self {
            addr: local_addr,
            shutdown,
            server_task,
        })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.server_task.await {
            tracing::debug!(error = %error, "hatago HTTP endpoint join failed");
        }
    }
}

fn session_id_from_headers(headers: &HeaderMap, state: &AppState) -> String {
    if let Some(existing) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        if state.hub.sessions.capabilities(existing).is_some() {
            return existing.to_string();
        }
    }
    state.hub.sessions.create_session(None, Duration::from_secs(state.hub.config.session.ttl_seconds), json!({}))
}

async fn post_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let session_id = session_id_from_headers(&headers, &state);
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = body.get("params").cloned().unwrap_or(Value::Null);
    let id = body.get("id").cloned();

    let envelope = match state.hub.handle_request(method, params, &session_id).await {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": error.json_rpc_code(), "message": error.to_string()},
        }),
    };

    let mut response = Json(envelope).into_response();
    if let Ok(value) = session_id.parse() {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn get_mcp_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?
        .to_string();

    let stream_id = format!("sse-{session_id}");
    let receiver = state
        .hub
        .sessions
        .register_stream(&session_id, &stream_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(receiver).map(|event| {
        Ok(Event::default()
            .event(event.method)
            .json_data(event.params)
            .unwrap_or_else(|_| Event::default()))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn get_health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "name": "hatago",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": state.hub.sessions.session_count(),
    }))
}

async fn get_tools(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<_> = state
        .hub
        .registry
        .list_all_tools()
        .into_iter()
        .map(|t| json!({"name": t.public_name, "description": t.description}))
        .collect();
    Json(json!({"tools": tools}))
}

async fn get_debug(State(state): State<AppState>) -> Json<Value> {
    Json(state.hub.status_payload())
}
