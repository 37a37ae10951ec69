//! `hatago`: operator-facing entry point for the hub. `serve` runs the hub
//! process itself; `status` and `stop` talk to a running hub over its
//! control socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hatago_config::HubConfig;
use hatago_hub::RunOptions;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "hatago", version, about = "MCP hub: aggregate many upstream MCP servers behind one endpoint")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub: bind the HTTP endpoint and control socket, activate
    /// eager upstreams, and serve until stopped.
    Serve {
        /// Path to the TOML hub config. Defaults to an empty config.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the control socket path.
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Spawn the hub as a detached background process and return.
        #[arg(long)]
        background: bool,
        /// Run in the foreground (default). Present so a background
        /// relaunch can force it explicitly.
        #[arg(long)]
        foreground: bool,
        /// Accept a systemd-activated listener (`LISTEN_FDS`) instead of
        /// binding the control socket directly.
        #[arg(long)]
        systemd_activation: bool,
        /// Serve the downstream surface over stdin/stdout instead of HTTP.
        #[arg(long)]
        stdio: bool,
        /// Require HTTPS for remote upstreams that don't opt out with
        /// `allowInsecure` (spec §4.1). Off by default, matching a local
        /// dev setup; set for any deployment reachable over a real network.
        #[arg(long, env = "HATAGO_PRODUCTION")]
        production: bool,
    },
    /// Report the running hub's status.
    Status {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Ask the running hub to shut down.
    Stop {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Serve {
            config,
            socket,
            background,
            foreground,
            systemd_activation,
            stdio,
            production,
        } => {
            handle_serve(
                config,
                socket,
                background,
                foreground,
                systemd_activation,
                stdio,
                production,
            )
            .await
        }
        Command::Status { socket } => handle_status(socket).await,
        Command::Stop { socket } => handle_stop(socket).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn handle_serve(
    config_path: Option<PathBuf>,
    socket: Option<PathBuf>,
    background: bool,
    foreground: bool,
    systemd_activation: bool,
    stdio: bool,
    production: bool,
) -> Result<()> {
    let socket_path = socket.unwrap_or_else(hatago_hub::runtime::default_socket_path);

    if background && !foreground {
        if stdio {
            bail!("--background and --stdio are mutually exclusive: a detached hub has no stdio peer");
        }
        let pid = spawn_background(&socket_path, config_path.as_deref(), systemd_activation, production)?;
        println!("hatago started in background (pid={pid})");
        return Ok(());
    }

    let config = match &config_path {
        Some(path) => HubConfig::load_from_path(path)
            .with_context(|| format!("failed to load hub config: {}", path.display()))?,
        None => {
            tracing::debug!("no --config given, running with an empty hub config");
            HubConfig::default()
        }
    };

    let pid_path = hatago_hub::runtime::pid_path_for_socket(&socket_path);
    let options = RunOptions {
        config,
        config_path,
        control_socket_path: socket_path,
        pid_path,
        production,
    };

    if stdio {
        hatago_hub::run_hub_stdio(options).await
    } else {
        hatago_hub::run_hub(options).await
    }
}

async fn handle_status(socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(hatago_hub::runtime::default_socket_path);

    match send_control_request(&socket_path, "hub/status").await {
        Ok(response) => {
            if let Some(result) = response.get("result") {
                println!("hatago is running at {} ({result})", socket_path.display());
            } else {
                println!(
                    "hatago responded at {}, but status payload was empty",
                    socket_path.display()
                );
            }
        }
        Err(_) => println!("hatago is not running at {}", socket_path.display()),
    }
    Ok(())
}

async fn handle_stop(socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(hatago_hub::runtime::default_socket_path);

    let response = send_control_request(&socket_path, "hub/stop")
        .await
        .with_context(|| format!("failed to stop hatago at {}", socket_path.display()))?;

    if response.get("error").is_some() {
        bail!("hatago returned an error while stopping: {response}");
    }

    println!("hatago stop signal sent to {}", socket_path.display());
    Ok(())
}

async fn send_control_request(socket_path: &Path, method: &str) -> Result<Value> {
    let mut stream = hatago_hub::socket::connect(socket_path).await?;
    let request = json!({"jsonrpc": "2.0", "id": 1, "method": method});
    let payload = serde_json::to_string(&request).context("failed to serialize control request")?;
    stream.write_all(payload.as_bytes()).await.context("failed to write control request")?;
    stream.write_all(b"\n").await.context("failed to write control request delimiter")?;
    stream.flush().await.context("failed to flush control request")?;

    let mut line = String::new();
    let bytes = tokio::time::timeout(Duration::from_secs(5), BufReader::new(&mut stream).read_line(&mut line))
        .await
        .context("timed out waiting for control response")?
        .context("failed to read control response")?;
    if bytes == 0 {
        bail!("hatago closed the connection before responding");
    }
    serde_json::from_str(line.trim()).context("failed to parse control response")
}

fn spawn_background(
    socket_path: &Path,
    config_path: Option<&Path>,
    systemd_activation: bool,
    production: bool,
) -> Result<u32> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("serve").arg("--foreground").arg("--socket").arg(socket_path);
    if let Some(config_path) = config_path {
        cmd.arg("--config").arg(config_path);
    }
    if systemd_activation {
        cmd.arg("--systemd-activation");
    }
    if production {
        cmd.arg("--production");
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

    let child = cmd.spawn().context("failed to spawn background hatago process")?;
    Ok(child.id())
}
