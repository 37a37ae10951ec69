//! Hub core: aggregates many upstream MCP servers behind one endpoint.
//! This crate owns connection lifecycle, naming/collision resolution,
//! request routing and session bookkeeping; `hatago-cli` supplies the
//! process entry point and operator-facing commands.

pub mod client_handler;
pub mod connector;
pub mod control;
pub mod error;
pub mod http;
pub mod hub;
pub mod idle;
pub mod node;
pub mod redact;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod session;
pub mod socket;
pub mod stdio;

pub use control::ControlPlane;
pub use error::{HubError, Result};
pub use hub::Hub;
pub use http::HttpEndpoint;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hatago_config::HubConfig;

/// Grace period allowed for in-flight upstream calls to settle during
/// shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Default max body size accepted on the downstream HTTP surface.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Everything needed to start one hub process, gathered up front so
/// `run_hub` itself only has to sequence the startup/shutdown steps.
pub struct RunOptions {
    pub config: HubConfig,
    pub config_path: Option<PathBuf>,
    pub control_socket_path: PathBuf,
    pub pid_path: PathBuf,
    /// Process-level deployment hint (spec §4.1, `--production` /
    /// `HATAGO_PRODUCTION`): tightens the connector's default HTTPS
    /// enforcement for upstreams that don't opt out with `allowInsecure`.
    pub production: bool,
}

/// Run one hub process to completion: bind the downstream HTTP endpoint
/// and control socket, activate eager upstreams, then block until either
/// `Ctrl-C` or a `hub/stop` control request asks the hub to shut down.
pub async fn run_hub(options: RunOptions) -> anyhow::Result<()> {
    write_pid_file(&options.pid_path)?;

    let hub = Arc::new(Hub::new(
        options.config.clone(),
        options.config_path.as_deref(),
        options.production,
    ));
    hub.activate_eager_nodes().await;
    hub.spawn_background_loops();

    let http = HttpEndpoint::start(
        hub.clone(),
        &options.config.http.host,
        options.config.http.port,
        MAX_BODY_BYTES,
    )
    .await?;
    tracing::info!(addr = %http.addr, "hatago HTTP endpoint listening");

    let control = ControlPlane::start(hub.clone(), &options.control_socket_path).await?;
    tracing::info!(socket = %options.control_socket_path.display(), "hatago control socket listening");

    let shutdown_token = hub.shutdown_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
        }
        _ = shutdown_token.cancelled() => {
            tracing::info!("stop requested over control socket, shutting down");
        }
    }

    control.shutdown().await;
    http.shutdown().await;
    hub.shutdown(SHUTDOWN_GRACE).await;

    cleanup_pid_file(&options.pid_path);
    if !socket::is_systemd_activated() {
        let _ = socket::cleanup_socket_file(&options.control_socket_path).await;
    }

    Ok(())
}

/// Run one hub process against the stdio downstream surface instead of
/// HTTP: stdin/stdout carry a single implicit session's JSON-RPC traffic
/// (spec §6 "Downstream endpoint (stdio mode)"). The control socket is
/// still bound so `hatago status`/`hatago stop` keep working against a
/// stdio-fronted hub.
pub async fn run_hub_stdio(options: RunOptions) -> anyhow::Result<()> {
    write_pid_file(&options.pid_path)?;

    let hub = Arc::new(Hub::new(
        options.config.clone(),
        options.config_path.as_deref(),
        options.production,
    ));
    hub.activate_eager_nodes().await;
    hub.spawn_background_loops();

    let control = ControlPlane::start(hub.clone(), &options.control_socket_path).await?;
    tracing::info!(socket = %options.control_socket_path.display(), "hatago control socket listening");

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let serve_result = stdio::serve(hub.clone(), stdin, stdout).await;
    if let Err(error) = &serve_result {
        tracing::warn!(error = %error, "hatago stdio endpoint stopped with error");
    }

    control.shutdown().await;
    hub.shutdown(SHUTDOWN_GRACE).await;

    cleanup_pid_file(&options.pid_path);
    if !socket::is_systemd_activated() {
        let _ = socket::cleanup_socket_file(&options.control_socket_path).await;
    }

    serve_result
}

fn write_pid_file(pid_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path, std::process::id().to_string())?;
    Ok(())
}

fn cleanup_pid_file(pid_path: &Path) {
    let _ = std::fs::remove_file(pid_path);
}
