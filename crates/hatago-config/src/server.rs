use serde::{Deserialize, Serialize};

use crate::policy::{ActivationPolicy, HealthCheckPolicy, IdlePolicy, NamingOverrides, ReconnectPolicy};
use crate::transport::{TransportSpec, UpstreamSource};

/// One configured upstream: immutable once loaded, never mutated by the
/// hub core at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamSpec {
    /// Unique within the hub.
    pub id: String,
    #[serde(flatten)]
    pub source: UpstreamSource,
    #[serde(default)]
    pub activation: ActivationPolicy,
    #[serde(default)]
    pub idle: IdlePolicy,
    #[serde(default)]
    pub health_check: HealthCheckPolicy,
    #[serde(default)]
    pub naming: NamingOverrides,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl UpstreamSpec {
    pub fn transport(&self) -> TransportSpec {
        self.source.resolve()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("upstream id must not be empty".to_string());
        }
        self.health_check.validate(&self.id)?;
        if let TransportSpec::Http { url, .. } | TransportSpec::Sse { url, .. } = self.transport()
        {
            let scheme_end = url.find("://").ok_or_else(|| {
                format!("upstream '{}': URL '{url}' has no scheme", self.id)
            })?;
            let scheme = url[..scheme_end].to_ascii_lowercase();
            if scheme != "http" && scheme != "https" {
                return Err(format!(
                    "upstream '{}': unsupported URL scheme '{scheme}://'",
                    self.id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::HealthCheckPolicy;
    use crate::transport::UpstreamSource;
    use std::collections::HashMap;

    fn spec(id: &str) -> UpstreamSpec {
        UpstreamSpec {
            id: id.to_string(),
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
        }
    }

    #[test]
    fn rejects_empty_id() {
        let mut s = spec("");
        s.id = String::new();
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_timeout_exceeding_interval() {
        let mut s = spec("echo");
        s.health_check = HealthCheckPolicy {
            interval_secs: 5,
            timeout_secs: 10,
            ..HealthCheckPolicy::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_url_scheme() {
        let mut s = spec("remote");
        s.source = UpstreamSource::Remote {
            url: "ftp://example.com".to_string(),
            transport: crate::transport::RemoteTransportKind::Http,
            credential: None,
            allow_insecure: false,
        };
        assert!(s.validate().is_err());
    }
}
