use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// When the hub starts a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPolicy {
    /// Started at hub start-up.
    Eager,
    /// Started on first route to it; the idle manager is armed.
    #[default]
    Lazy,
    /// Never started automatically.
    Manual,
}

/// When idle-elapsed is reset to zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum IdleResetAt {
    #[default]
    OnCallStart,
    OnCallEnd,
}

/// Per-upstream idle policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdlePolicy {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_min_linger_secs")]
    pub min_linger_secs: u64,
    #[serde(default)]
    pub reset_at: IdleResetAt,
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_min_linger_secs() -> u64 {
    10
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            min_linger_secs: default_min_linger_secs(),
            reset_at: IdleResetAt::default(),
        }
    }
}

/// Health-check probe method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckMethod {
    Ping,
    #[default]
    ListTools,
}

/// Health-check policy. `interval_secs = 0` disables health checking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPolicy {
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub method: HealthCheckMethod,
}

fn default_health_timeout_secs() -> u64 {
    5
}

impl HealthCheckPolicy {
    /// A health-check timeout that exceeds its own interval is rejected
    /// as a configuration error at ingestion rather than tolerated at
    /// runtime (see DESIGN.md).
    pub fn validate(&self, upstream_id: &str) -> Result<(), String> {
        if self.interval_secs > 0 && self.timeout_secs > self.interval_secs {
            return Err(format!(
                "upstream '{upstream_id}': healthCheck.timeoutSecs ({}) exceeds healthCheck.intervalSecs ({})",
                self.timeout_secs, self.interval_secs
            ));
        }
        Ok(())
    }
}

/// Bounds on automatic reconnection after a node crashes. Unset fields mean
/// "no bound": the node keeps retrying, on the standard backoff, forever.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    /// Whether to keep retrying after the upstream rejects credentials
    /// (`unauthorised`). Off by default: a bad credential does not start
    /// working on its own, so retrying just spins the backoff for nothing.
    #[serde(default)]
    pub retry_on_unauthorised: bool,
}

/// Per-upstream naming overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamingOverrides {
    /// Glob patterns; only matching original tool/prompt names are
    /// advertised. Empty means "include everything".
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns excluded after `include` is applied.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Overrides the derived `{serverId}{separator}` prefix for this
    /// upstream only.
    #[serde(default)]
    pub prefix: Option<String>,
    /// original name -> public name, applied before the global naming
    /// strategy and before the user-level alias table.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}
