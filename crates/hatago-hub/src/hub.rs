//! Top-level `Hub`: owns the node table, registry, session manager and
//! router, and drives eager activation + health-check timers at start-up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hatago_config::{ActivationPolicy, HubConfig, MetadataCache};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::node::{NodeStatus, UpstreamNode};
use crate::registry::Registry;
use crate::router::Router;
use crate::session::SessionManager;

pub struct Hub {
    pub config: HubConfig,
    pub registry: Arc<Registry>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<Router>,
    nodes: Vec<Arc<UpstreamNode>>,
    node_index: HashMap<String, usize>,
    metadata_path: Option<PathBuf>,
    /// Combined hash of the catalogue last flushed to `metadata_path`, so
    /// the debounce loop only writes when something actually changed.
    last_written_metadata_hash: std::sync::Mutex<Option<String>>,
    shutdown: CancellationToken,
}

/// How often the metadata-cache debounce loop checks for a catalogue
/// change worth flushing to disk (spec: "written ... with debouncing,
/// five-second window").
const METADATA_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(5);

impl Hub {
    /// Build the node table from config (immutable once loaded), loading
    /// the metadata-cache sidecar if one exists. `production` is the
    /// process-level deployment hint (spec §4.1), threaded down to every
    /// node's connector so plain HTTP upstreams are rejected by default
    /// once it's set.
    pub fn new(config: HubConfig, config_path: Option<&std::path::Path>, production: bool) -> Self {
        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(SessionManager::new());
        let call_timeout = Duration::from_millis(config.timeouts.tool_call_ms);
        let nodes: Vec<Arc<UpstreamNode>> = config
            .servers
            .iter()
            .map(|spec| {
                UpstreamNode::new(
                    spec.clone(),
                    registry.clone(),
                    config.tool_naming.clone(),
                    call_timeout,
                    sessions.clone(),
                    production,
                )
            })
            .collect();
        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id().to_string(), i))
            .collect();

        let metadata_path = config_path.map(MetadataCache::sidecar_path);
        let metadata = metadata_path
            .as_ref()
            .and_then(|p| MetadataCache::load(p).ok());

        let router = Arc::new(Router::new(
            registry.clone(),
            nodes.clone(),
            metadata,
            false,
        ));

        Self {
            config,
            registry,
            sessions,
            router,
            nodes,
            node_index,
            metadata_path,
            last_written_metadata_hash: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn node(&self, id: &str) -> Option<&Arc<UpstreamNode>> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Arc<UpstreamNode>] {
        &self.nodes
    }

    /// Start every `eager` upstream concurrently at hub start-up.
    pub async fn activate_eager_nodes(&self) {
        let eager: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.spec.activation == ActivationPolicy::Eager)
            .cloned()
            .collect();
        let handles: Vec<_> = eager
            .into_iter()
            .map(|node| {
                tokio::spawn(async move {
                    if let Err(error) = node.ensure_active().await {
                        tracing::warn!(upstream = %node.id(), error = %error, "eager activation failed");
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Spawn the health-check and idle-deactivation background loops for
    /// every node that declares a policy for them.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        for node in self.nodes.clone() {
            let shutdown = self.shutdown.clone();
            if node.spec.health_check.interval_secs > 0 {
                let health_node = node.clone();
                let health_shutdown = shutdown.clone();
                tokio::spawn(async move { health_check_loop(health_node, health_shutdown).await });
            }
            let idle_node = node.clone();
            tokio::spawn(async move { idle_deactivation_loop(idle_node, shutdown).await });
        }

        let sessions = self.sessions.clone();
        let sweep_shutdown = self.shutdown.clone();
        tokio::spawn(async move { session_sweep_loop(sessions, sweep_shutdown).await });

        if self.metadata_path.is_some() {
            let hub = self.clone();
            let metadata_shutdown = self.shutdown.clone();
            tokio::spawn(async move { metadata_debounce_loop(hub, metadata_shutdown).await });
        }
    }

    pub async fn handle_request(&self, method: &str, params: Value, session_id: &str) -> Result<Value> {
        self.sessions.touch(session_id);
        self.router.handle(method, params, session_id).await
    }

    pub fn status_payload(&self) -> Value {
        let servers: Vec<_> = self
            .nodes
            .iter()
            .map(|node| {
                serde_json::json!({
                    "id": node.id(),
                    "status": status_label(node.status()),
                    "inFlight": node.in_flight_calls(),
                })
            })
            .collect();
        serde_json::json!({
            "servers": servers,
            "sessions": self.sessions.session_count(),
            "tools": self.registry.tool_count(),
        })
    }

    /// Close every node's connection concurrently, within a grace period.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let handles: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| n.status() == NodeStatus::Running)
            .cloned()
            .map(|node| tokio::spawn(async move { node.deactivate().await }))
            .collect();

        let _ = tokio::time::timeout(grace, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if let Some(path) = &self.metadata_path {
            let (cache, _hash) = self.build_metadata_cache();
            let _ = cache.save(path);
        }
    }

    /// Snapshot the current tool/resource/prompt catalogue of every node
    /// into the on-disk cache shape, alongside a combined hash the
    /// debounce loop uses to detect "nothing changed since last flush".
    fn build_metadata_cache(&self) -> (MetadataCache, String) {
        let mut cache = MetadataCache::default();
        let mut combined_parts: Vec<String> = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let tools: Vec<_> = self
                .registry
                .tools_for_server(node.id())
                .into_iter()
                .map(|t| hatago_config::CachedTool {
                    name: t.public_name,
                    description: t.description,
                    input_schema: t.input_schema,
                })
                .collect();
            let resources: Vec<_> = self
                .registry
                .resources_for_server(node.id())
                .into_iter()
                .map(|r| hatago_config::CachedResource {
                    uri: r.uri,
                    name: r.name,
                    mime_type: r.mime_type,
                })
                .collect();
            let prompts: Vec<_> = self
                .registry
                .prompts_for_server(node.id())
                .into_iter()
                .map(|p| hatago_config::CachedPrompt {
                    name: p.public_name,
                    description: p.description,
                    arguments: p.arguments,
                })
                .collect();

            let tools_hash = hatago_config::hash_listing(&tools);
            let resources_hash = hatago_config::hash_listing(&resources);
            let prompts_hash = hatago_config::hash_listing(&prompts);
            combined_parts.push(format!(
                "{}:{tools_hash}:{resources_hash}:{prompts_hash}",
                node.id()
            ));

            cache.servers.insert(
                node.id().to_string(),
                hatago_config::UpstreamMetadata {
                    tools,
                    resources,
                    prompts,
                    tools_hash,
                    resources_hash,
                    prompts_hash,
                    last_updated: Some(chrono::Utc::now()),
                    ..Default::default()
                },
            );
        }
        let combined_hash = hatago_config::hash_listing(&combined_parts);
        (cache, combined_hash)
    }

    /// Flush the metadata cache to `metadata_path` if the catalogue has
    /// changed since the last flush. Called on a timer (debounced) and
    /// unconditionally at shutdown.
    fn flush_metadata_cache_if_changed(&self, path: &std::path::Path) {
        let (cache, hash) = self.build_metadata_cache();
        let mut last = self
            .last_written_metadata_hash
            .lock()
            .expect("metadata hash lock poisoned");
        if last.as_deref() == Some(hash.as_str()) {
            return;
        }
        if let Err(error) = cache.save(path) {
            tracing::warn!(error = %error, path = %path.display(), "failed to write metadata cache");
            return;
        }
        *last = Some(hash);
    }
}

fn status_label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Stopped => "stopped",
        NodeStatus::Starting => "starting",
        NodeStatus::Running => "running",
        NodeStatus::Stopping => "stopping",
        NodeStatus::Crashed => "crashed",
    }
}

async fn health_check_loop(node: Arc<UpstreamNode>, shutdown: CancellationToken) {
    let interval = Duration::from_secs(node.spec.health_check.interval_secs.max(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if node.status() != NodeStatus::Running {
            continue;
        }
        let timeout = Duration::from_secs(node.spec.health_check.timeout_secs);
        let probe = node.health_check(node.spec.health_check.method);
        match tokio::time::timeout(timeout, probe).await {
            Ok(Err(error)) => {
                tracing::warn!(upstream = %node.id(), error = %error, "health check failed; crashing node");
                node.mark_crashed(error.to_string()).await;
            }
            Err(_) => {
                tracing::warn!(upstream = %node.id(), "health check timed out; crashing node");
                node.mark_crashed(format!("health check timed out after {timeout:?}")).await;
            }
            Ok(Ok(())) => {}
        }
    }
}

async fn idle_deactivation_loop(node: Arc<UpstreamNode>, shutdown: CancellationToken) {
    loop {
        let Some(delay) = node.idle().next_deactivation_delay() else {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        if node.status() == NodeStatus::Running && node.idle().is_deactivation_due() {
            node.deactivate().await;
        }
    }
}

async fn metadata_debounce_loop(hub: Arc<Hub>, shutdown: CancellationToken) {
    let Some(path) = hub.metadata_path.clone() else { return };
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(METADATA_DEBOUNCE_INTERVAL) => {}
        }
        hub.flush_metadata_cache_if_changed(&path);
    }
}

async fn session_sweep_loop(sessions: Arc<SessionManager>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        }
        let evicted = sessions.sweep();
        if evicted > 0 {
            tracing::debug!(evicted, "swept expired sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_hub_has_no_nodes_and_empty_status() {
        let hub = Hub::new(HubConfig::default(), None, false);
        assert!(hub.nodes().is_empty());
        let status = hub.status_payload();
        assert_eq!(status["sessions"], 0);
        assert_eq!(status["tools"], 0);
    }

    #[test]
    fn metadata_cache_is_not_rewritten_when_catalogue_is_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("hatago.toml");
        std::fs::write(&config_path, "").expect("write empty config");

        let hub = Hub::new(HubConfig::default(), Some(&config_path), false);
        let cache_path = hatago_config::MetadataCache::sidecar_path(&config_path);

        hub.flush_metadata_cache_if_changed(&cache_path);
        assert!(cache_path.exists());

        std::fs::remove_file(&cache_path).expect("remove cache file");
        hub.flush_metadata_cache_if_changed(&cache_path);
        assert!(
            !cache_path.exists(),
            "unchanged catalogue must not trigger a rewrite"
        );
    }
}
