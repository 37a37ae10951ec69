//! Upstream Connector: transport-agnostic dialing for stdio, streamable
//! HTTP and SSE upstreams, plus the HTTP/SSE URL safety checks that gate
//! outbound network transports.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use hatago_config::{Credential, TransportSpec};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::RoleClient;
use thiserror::Error;
use tokio::process::Command;

use crate::client_handler::HubClientHandler;

const SHUTDOWN_GRACE_SECS: u64 = 3;

/// Why dialing an upstream failed, distinguished so the caller can decide
/// whether to keep retrying automatically (see `node.rs::dial_and_activate`).
#[derive(Debug, Error)]
pub enum ConnectError {
    /// I/O failure reaching the upstream at all: spawn failure, connection
    /// refused, DNS failure, URL/SSRF rejection.
    #[error("{0}")]
    Transport(anyhow::Error),
    /// The transport connected but the MCP handshake (`initialize`) itself
    /// failed or timed out.
    #[error("{0}")]
    Handshake(anyhow::Error),
    /// The upstream rejected the supplied credential.
    #[error("{0}")]
    Unauthorised(anyhow::Error),
}

/// A live connection to an upstream MCP server. Each variant owns whatever
/// resources its transport needs to keep the connection alive (primarily
/// the child process, for stdio).
pub enum Connection {
    Stdio {
        service: RunningService<RoleClient, HubClientHandler>,
        child: Box<tokio::process::Child>,
    },
    Http {
        service: RunningService<RoleClient, HubClientHandler>,
    },
    Sse {
        service: RunningService<RoleClient, HubClientHandler>,
    },
}

impl Connection {
    pub fn service(&self) -> &RunningService<RoleClient, HubClientHandler> {
        match self {
            Self::Stdio { service, .. } => service,
            Self::Http { service } => service,
            Self::Sse { service } => service,
        }
    }

    /// Non-blocking check for whether a stdio child has exited on its own.
    /// `Ok(None)` for non-stdio transports and for a stdio child still
    /// running. Reaps the child the same way `Child::wait` would, so a
    /// later `shutdown()` on an already-exited child just observes the
    /// cached exit status.
    pub fn try_wait_stdio_child(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        match self {
            Self::Stdio { child, .. } => child.try_wait(),
            Self::Http { .. } | Self::Sse { .. } => Ok(None),
        }
    }

    /// Graceful shutdown: cancel the rmcp service, then give a stdio child
    /// a grace period to exit before killing it.
    pub async fn shutdown(self) {
        match self {
            Self::Stdio { service, mut child } => {
                let _ = service.cancel().await;
                match tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), child.wait())
                    .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        tracing::debug!(error = %error, "failed to wait upstream child process");
                    }
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
            }
            Self::Http { service } | Self::Sse { service } => {
                let _ = service.cancel().await;
            }
        }
    }
}

/// Dial an upstream described by a resolved [`TransportSpec`]. Network
/// transports are subjected to scheme/HTTPS/SSRF checks before the
/// handshake begins. `production` is the process-level deployment hint
/// (spec §4.1): it tightens the default HTTPS requirement but never
/// overrides an explicit per-server `allowInsecure` opt-out.
pub async fn connect(
    upstream_id: &str,
    spec: &TransportSpec,
    handler: HubClientHandler,
    production: bool,
) -> Result<Connection, ConnectError> {
    match spec {
        TransportSpec::Stdio {
            command,
            args,
            env,
            cwd,
        } => connect_stdio(upstream_id, command, args, env, cwd.as_deref(), handler).await,
        TransportSpec::Http {
            url,
            credential,
            allow_insecure,
        } => {
            validate_outbound_url(url, *allow_insecure, production, upstream_id)
                .map_err(ConnectError::Transport)?;
            preflight_ssrf_check(url, upstream_id).map_err(ConnectError::Transport)?;
            connect_http(upstream_id, url, credential, handler).await
        }
        TransportSpec::Sse {
            url,
            credential,
            allow_insecure,
        } => {
            validate_outbound_url(url, *allow_insecure, production, upstream_id)
                .map_err(ConnectError::Transport)?;
            preflight_ssrf_check(url, upstream_id).map_err(ConnectError::Transport)?;
            connect_sse(upstream_id, url, credential, handler).await
        }
    }
}

/// Best-effort classification of a failed handshake: an error whose
/// message carries a 401/403-shaped signal is treated as a credential
/// rejection rather than a generic handshake failure. rmcp's `.serve()`
/// error doesn't preserve the underlying `reqwest::StatusCode` by the time
/// it reaches here, so this is string-sniffing, not a status-code check.
fn classify_handshake_error(upstream_id: &str, error: impl std::fmt::Display) -> ConnectError {
    let text = error.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("unauthorised")
        || lower.contains("forbidden")
    {
        ConnectError::Unauthorised(anyhow!("upstream '{upstream_id}' rejected credentials: {text}"))
    } else {
        ConnectError::Handshake(anyhow!("handshake failed for upstream '{upstream_id}': {text}"))
    }
}

async fn connect_stdio(
    upstream_id: &str,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    cwd: Option<&str>,
    handler: HubClientHandler,
) -> Result<Connection, ConnectError> {
    tracing::debug!(
        upstream = %upstream_id,
        command = %command,
        env = ?crate::redact::redact_env(env),
        "spawning stdio upstream"
    );

    let mut cmd = Command::new(command);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn upstream '{upstream_id}' ('{command}')"))
        .map_err(ConnectError::Transport)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdout for upstream '{upstream_id}'"))
        .map_err(ConnectError::Transport)?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture stdin for upstream '{upstream_id}'"))
        .map_err(ConnectError::Transport)?;
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut sink = tokio::io::sink();
            let _ = tokio::io::copy(&mut stderr, &mut sink).await;
        });
    }

    let service = handler
        .serve((stdout, stdin))
        .await
        .map_err(|error| classify_handshake_error(upstream_id, error))?;

    Ok(Connection::Stdio {
        service,
        child: Box::new(child),
    })
}

/// Render a [`Credential`] as the value of an HTTP `Authorization` header.
fn authorization_header_value(credential: &Credential) -> String {
    match credential {
        Credential::Bearer { token } => format!("Bearer {token}"),
        Credential::Basic { username, password } => {
            use base64::Engine;
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            format!("Basic {encoded}")
        }
    }
}

async fn connect_http(
    upstream_id: &str,
    url: &str,
    credential: &Option<Credential>,
    handler: HubClientHandler,
) -> Result<Connection, ConnectError> {
    use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
    use rmcp::transport::StreamableHttpClientTransport;

    tracing::info!(upstream = %upstream_id, url = %url, "connecting via streamable HTTP");

    let mut config = StreamableHttpClientTransportConfig::with_uri(url);
    if let Some(credential) = credential {
        config.auth_header = Some(authorization_header_value(credential));
    }
    let transport = StreamableHttpClientTransport::from_config(config);
    let service: RunningService<RoleClient, HubClientHandler> = handler
        .serve(transport)
        .await
        .map_err(|error| classify_handshake_error(upstream_id, error))?;
    Ok(Connection::Http { service })
}

async fn connect_sse(
    upstream_id: &str,
    url: &str,
    credential: &Option<Credential>,
    handler: HubClientHandler,
) -> Result<Connection, ConnectError> {
    use rmcp::transport::sse_client::SseClientConfig;
    use rmcp::transport::SseClientTransport;

    tracing::info!(upstream = %upstream_id, url = %url, "connecting via SSE");

    let client = match credential {
        Some(credential) => {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = authorization_header_value(credential);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                value
                    .parse()
                    .with_context(|| format!("upstream '{upstream_id}': invalid credential header"))
                    .map_err(ConnectError::Transport)?,
            );
            reqwest::Client::builder()
                .default_headers(headers)
                .build()
                .with_context(|| format!("upstream '{upstream_id}': failed to build HTTP client"))
                .map_err(ConnectError::Transport)?
        }
        None => reqwest::Client::new(),
    };

    let config = SseClientConfig {
        sse_endpoint: url.to_string().into(),
        ..Default::default()
    };
    let transport = SseClientTransport::start_with_client(client, config)
        .await
        .with_context(|| format!("failed to open SSE stream to upstream '{upstream_id}' at {url}"))
        .map_err(ConnectError::Transport)?;
    let service: RunningService<RoleClient, HubClientHandler> = handler
        .serve(transport)
        .await
        .map_err(|error| classify_handshake_error(upstream_id, error))?;
    Ok(Connection::Sse { service })
}

/// Validate that a URL is safe for outbound network transport: scheme
/// whitelist, plus HTTPS enforcement whose default depends on the
/// process-level `production` hint (spec §4.1). An explicit per-server
/// `allow_insecure = true` always wins, in production or not; absent that,
/// plain HTTP is allowed outside production and rejected inside it.
fn validate_outbound_url(url: &str, allow_insecure: bool, production: bool, upstream_id: &str) -> anyhow::Result<()> {
    let scheme_end = url
        .find("://")
        .ok_or_else(|| anyhow!("upstream '{upstream_id}': URL '{url}' has no scheme"))?;
    let scheme = url[..scheme_end].to_ascii_lowercase();

    match scheme.as_str() {
        "https" => Ok(()),
        "http" if allow_insecure => {
            tracing::warn!(
                upstream = %upstream_id,
                url = %url,
                "using insecure HTTP transport (allowInsecure = true)"
            );
            Ok(())
        }
        "http" if production => bail!(
            "upstream '{upstream_id}': HTTP transport requires HTTPS in production; \
             set allowInsecure = true to allow plain HTTP for this upstream"
        ),
        "http" => Ok(()),
        other => bail!("upstream '{upstream_id}': unsupported URL scheme '{other}://'"),
    }
}

/// Pre-flight DNS resolution to catch outbound connections aimed at
/// private, loopback, link-local, or cloud-metadata addresses. Best-effort:
/// vulnerable to DNS rebinding between this check and the real connection,
/// but catches the common misconfiguration case.
fn preflight_ssrf_check(url: &str, upstream_id: &str) -> anyhow::Result<()> {
    use std::net::ToSocketAddrs;

    let Some((host, port)) = parse_host_port(url) else {
        return Ok(());
    };
    if host.is_empty() {
        return Ok(());
    }

    let socket_addr = format!("{host}:{port}");
    let addrs = match socket_addr.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => return Ok(()),
    };

    for addr in addrs {
        let ip = addr.ip();
        if is_ssrf_dangerous_ip(ip) {
            bail!(
                "upstream '{upstream_id}': resolved IP {ip} is a private/reserved address \
                 (SSRF protection); use stdio transport for local servers"
            );
        }
    }
    Ok(())
}

fn parse_host_port(url: &str) -> Option<(String, u16)> {
    let after_scheme = url.split("://").nth(1)?;
    let authority = after_scheme.split('/').next()?;
    let host_port = authority.rsplit('@').next()?;

    if let Some(bracket_end) = host_port.find(']') {
        let host = &host_port[..=bracket_end];
        let port = host_port[bracket_end + 1..]
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .unwrap_or(if url.starts_with("https") { 443 } else { 80 });
        Some((host.to_string(), port))
    } else if let Some((h, p)) = host_port.rsplit_once(':') {
        let port = p
            .parse()
            .unwrap_or(if url.starts_with("https") { 443 } else { 80 });
        Some((h.to_string(), port))
    } else {
        let port = if url.starts_with("https") { 443 } else { 80 };
        Some((host_port.to_string(), port))
    }
}

fn is_ssrf_dangerous_ip(ip: std::net::IpAddr) -> bool {
    use std::net::{Ipv4Addr, Ipv6Addr};

    match ip {
        std::net::IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4 == Ipv4Addr::UNSPECIFIED
                || (v4.octets()[0] == 169
                    && v4.octets()[1] == 254
                    && v4.octets()[2] == 169
                    && v4.octets()[3] == 254)
        }
        std::net::IpAddr::V6(v6) => v6.is_loopback() || v6 == Ipv6Addr::UNSPECIFIED || is_ipv4_mapped_dangerous(v6),
    }
}

fn is_ipv4_mapped_dangerous(v6: std::net::Ipv6Addr) -> bool {
    let segments = v6.segments();
    if segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
        let mapped = std::net::Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            segments[6] as u8,
            (segments[7] >> 8) as u8,
            segments[7] as u8,
        );
        return is_ssrf_dangerous_ip(std::net::IpAddr::V4(mapped));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_scheme() {
        let err = validate_outbound_url("ftp://example.com", false, false, "demo").unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"));
    }

    #[test]
    fn rejects_plain_http_in_production_without_allow_insecure() {
        let err = validate_outbound_url("http://example.com", false, true, "demo").unwrap_err();
        assert!(err.to_string().contains("requires HTTPS"));
    }

    #[test]
    fn allows_plain_http_outside_production_by_default() {
        assert!(validate_outbound_url("http://example.com", false, false, "demo").is_ok());
    }

    #[test]
    fn allow_insecure_opts_out_even_in_production() {
        assert!(validate_outbound_url("http://example.com", true, true, "demo").is_ok());
    }

    #[test]
    fn blocks_loopback_and_metadata_addresses() {
        assert!(is_ssrf_dangerous_ip("127.0.0.1".parse().unwrap()));
        assert!(is_ssrf_dangerous_ip("169.254.169.254".parse().unwrap()));
        assert!(is_ssrf_dangerous_ip("10.0.0.5".parse().unwrap()));
        assert!(!is_ssrf_dangerous_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn parses_host_and_port() {
        assert_eq!(
            parse_host_port("https://example.com:8443/mcp"),
            Some(("example.com".to_string(), 8443))
        );
        assert_eq!(
            parse_host_port("https://example.com/mcp"),
            Some(("example.com".to_string(), 443))
        );
    }
}
