use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Credential attached to a remote upstream.
///
/// Serialized with an internal tag so TOML/JSON config files can write
/// `credential = { type = "bearer", token = "..." }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credential {
    Bearer { token: String },
    Basic { username: String, password: String },
}

/// Which wire transport a remote upstream speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTransportKind {
    Http,
    Sse,
}

/// The canonical transport an [`crate::UpstreamSpec`] resolves to. This is
/// what the hub's upstream connector actually dials; the
/// `type = "local" | "remote" | "npx"` config tagging is convenience
/// sugar resolved down to one of these three variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportSpec {
    /// Child-process stdio transport.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Streamable HTTP transport.
    Http {
        url: String,
        #[serde(default)]
        credential: Option<Credential>,
        #[serde(default)]
        allow_insecure: bool,
    },
    /// Server-sent-events transport.
    Sse {
        url: String,
        #[serde(default)]
        credential: Option<Credential>,
        #[serde(default)]
        allow_insecure: bool,
    },
}

impl TransportSpec {
    /// Short label used in logs and introspection surfaces.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Http { .. } | Self::Sse { .. })
    }
}

/// The `servers[]` entry shape: tagged by `type` in
/// {`local`, `remote`, `npx`}. Each variant carries the fields needed to
/// build a [`TransportSpec`]; `resolve()` performs that normalisation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpstreamSource {
    /// A locally installed binary spawned directly over stdio.
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// A package run on demand via `npx` (or an equivalent runner), also
    /// spoken over stdio. Kept distinct from `local` because the hub
    /// resolves the runner binary and assembles its argument vector.
    Npx {
        package: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
        /// Override the package runner; defaults to `npx`.
        #[serde(default)]
        runner: Option<String>,
    },
    /// A remote server reached over streamable HTTP or SSE.
    Remote {
        url: String,
        #[serde(default = "default_remote_transport")]
        transport: RemoteTransportKind,
        #[serde(default)]
        credential: Option<Credential>,
        #[serde(default)]
        allow_insecure: bool,
    },
}

fn default_remote_transport() -> RemoteTransportKind {
    RemoteTransportKind::Http
}

impl UpstreamSource {
    /// Normalise the config-level `type` tagging into the canonical
    /// transport the connector dials.
    pub fn resolve(&self) -> TransportSpec {
        match self {
            Self::Local {
                command,
                args,
                env,
                cwd,
            } => TransportSpec::Stdio {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
                cwd: cwd.clone(),
            },
            Self::Npx {
                package,
                args,
                env,
                cwd,
                runner,
            } => {
                let mut full_args = vec!["-y".to_string(), package.clone()];
                full_args.extend(args.iter().cloned());
                TransportSpec::Stdio {
                    command: runner.clone().unwrap_or_else(|| "npx".to_string()),
                    args: full_args,
                    env: env.clone(),
                    cwd: cwd.clone(),
                }
            }
            Self::Remote {
                url,
                transport,
                credential,
                allow_insecure,
            } => match transport {
                RemoteTransportKind::Http => TransportSpec::Http {
                    url: url.clone(),
                    credential: credential.clone(),
                    allow_insecure: *allow_insecure,
                },
                RemoteTransportKind::Sse => TransportSpec::Sse {
                    url: url.clone(),
                    credential: credential.clone(),
                    allow_insecure: *allow_insecure,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npx_source_expands_to_stdio_with_dash_y() {
        let source = UpstreamSource::Npx {
            package: "repomix@latest".to_string(),
            args: vec!["--mcp".to_string()],
            env: HashMap::new(),
            cwd: None,
            runner: None,
        };

        match source.resolve() {
            TransportSpec::Stdio { command, args, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args, vec!["-y", "repomix@latest", "--mcp"]);
            }
            other => panic!("expected stdio transport, got {other:?}"),
        }
    }

    #[test]
    fn remote_source_defaults_to_http() {
        let source = UpstreamSource::Remote {
            url: "https://mcp.example.com".to_string(),
            transport: RemoteTransportKind::Http,
            credential: None,
            allow_insecure: false,
        };
        assert!(source.resolve().is_remote());
    }

    #[test]
    fn remote_source_can_select_sse() {
        let source = UpstreamSource::Remote {
            url: "https://mcp.example.com/sse".to_string(),
            transport: RemoteTransportKind::Sse,
            credential: None,
            allow_insecure: false,
        };
        assert_eq!(source.resolve().label(), "sse");
    }
}
