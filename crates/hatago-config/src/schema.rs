use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::naming::ToolNamingConfig;
use crate::server::UpstreamSpec;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_http_host")]
    pub host: String,
}

fn default_http_port() -> u16 {
    8787
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            host: default_http_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub store: Option<String>,
}

fn default_session_ttl() -> u64 {
    3600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl(),
            persist: false,
            store: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutsConfig {
    #[serde(default = "default_spawn_ms")]
    pub spawn_ms: u64,
    #[serde(default = "default_healthcheck_ms")]
    pub healthcheck_ms: u64,
    #[serde(default = "default_tool_call_ms")]
    pub tool_call_ms: u64,
}

fn default_spawn_ms() -> u64 {
    10_000
}

fn default_healthcheck_ms() -> u64 {
    5_000
}

fn default_tool_call_ms() -> u64 {
    20_000
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            spawn_ms: default_spawn_ms(),
            healthcheck_ms: default_healthcheck_ms(),
            tool_call_ms: default_tool_call_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// Global cap on in-flight upstream calls across the whole hub. `0`
    /// means unbounded.
    #[serde(default)]
    pub global: usize,
    /// Per-upstream cap. `0` means unbounded.
    #[serde(default)]
    pub per_server: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global: 0,
            per_server: 0,
        }
    }
}

/// Top-level configuration schema consumed by the hub core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub tool_naming: ToolNamingConfig,
    #[serde(default)]
    pub servers: Vec<UpstreamSpec>,
}

fn default_version() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            http: HttpConfig::default(),
            session: SessionConfig::default(),
            timeouts: TimeoutsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            tool_naming: ToolNamingConfig::default(),
            servers: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Load and validate a hub config from a TOML file. Config inheritance
    /// and live reload are left to whatever wraps the hub; this is the
    /// single, non-layered ingestion point the core relies on.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hub config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("failed to parse hub config: {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid TOML in hub config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the core depends on: unique upstream ids and
    /// per-upstream well-formedness.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.servers.len());
        for server in &self.servers {
            server.validate().map_err(anyhow::Error::msg)?;
            if !seen.insert(server.id.clone()) {
                bail!("duplicate upstream id: {}", server.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_parses_with_defaults() {
        let config = HubConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config.version, 1);
        assert!(config.servers.is_empty());
        assert_eq!(config.tool_naming.separator, "_");
    }

    #[test]
    fn rejects_duplicate_upstream_ids() {
        let toml = r#"
            [[servers]]
            id = "echo"
            type = "local"
            command = "echo-mcp"

            [[servers]]
            id = "echo"
            type = "local"
            command = "echo-mcp-2"
        "#;
        let err = HubConfig::from_toml_str(toml).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate upstream id"));
    }

    #[test]
    fn parses_mixed_transport_servers() {
        let toml = r#"
            [[servers]]
            id = "echo"
            type = "local"
            command = "echo-mcp"
            activation = "lazy"

            [[servers]]
            id = "deepwiki"
            type = "remote"
            url = "https://mcp.deepwiki.com/mcp"
            transport = "http"
        "#;
        let config = HubConfig::from_toml_str(toml).expect("valid config");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].transport().label(), "stdio");
        assert_eq!(config.servers[1].transport().label(), "http");
    }

    #[test]
    fn load_from_path_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hatago.toml");
        std::fs::write(&path, "version = 1\n").expect("write config");

        let config = HubConfig::load_from_path(&path).expect("load config");
        assert_eq!(config.version, 1);
    }
}
