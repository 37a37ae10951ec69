//! Router: method taxonomy, parameter validation, aggregation
//! of list methods, and targeted single-upstream relay.

use std::collections::HashMap;
use std::sync::Arc;

use hatago_config::{CachedPrompt, CachedResource, CachedTool, MetadataCache};
use rmcp::model::{CallToolRequestParam, GetPromptRequestParam, ReadResourceRequestParam};
use serde_json::{Map, Value, json};

use crate::error::{HubError, Result};
use crate::node::{NodeStatus, UpstreamNode};
use crate::registry::Registry;

/// Separator between an explicit upstream id prefix and the wrapped
/// method name, e.g. `echo__customMethod`.
const UPSTREAM_METHOD_SEPARATOR: &str = "__";

pub struct Router {
    registry: Arc<Registry>,
    /// Nodes in configuration order; aggregation order depends on this.
    nodes: Vec<Arc<UpstreamNode>>,
    node_index: HashMap<String, usize>,
    metadata: Option<MetadataCache>,
    /// Whether an unprefixed, unrecognised method falls back to the
    /// first configured upstream (legacy behaviour). Kept test-selectable
    /// rather than baked in, since both behaviours need to stay reachable
    /// (see DESIGN.md).
    legacy_unprefixed_fallback: bool,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        nodes: Vec<Arc<UpstreamNode>>,
        metadata: Option<MetadataCache>,
        legacy_unprefixed_fallback: bool,
    ) -> Self {
        let node_index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id().to_string(), i))
            .collect();
        Self {
            registry,
            nodes,
            node_index,
            metadata,
            legacy_unprefixed_fallback,
        }
    }

    fn node(&self, id: &str) -> Option<&Arc<UpstreamNode>> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    /// Entry point: classify and dispatch one downstream JSON-RPC call.
    /// `session_id` identifies the caller on the hub's own downstream side
    /// (an SSE/stdio session), so that notifications an upstream pushes
    /// back mid-call can be delivered to the right stream (see
    /// `client_handler.rs`).
    pub async fn handle(&self, method: &str, params: Value, session_id: &str) -> Result<Value> {
        match method {
            "initialize" => Ok(self.handle_initialize()),
            "initialized" | "notifications/initialized" => Ok(Value::Null),
            "shutdown" => Ok(Value::Null),
            "ping" => Ok(json!({})),
            "tools/list" => self.aggregated_tools_list().await,
            "resources/list" => self.aggregated_resources_list().await,
            "prompts/list" => self.aggregated_prompts_list().await,
            "tools/call" => self.handle_tools_call(params, session_id).await,
            "resources/read" => self.handle_resources_read(params, session_id).await,
            "prompts/get" => self.handle_prompts_get(params, session_id).await,
            other => self.handle_targeted(other, params, session_id).await,
        }
    }

    fn handle_initialize(&self) -> Value {
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {"listChanged": true},
                "resources": {"listChanged": true},
                "prompts": {"listChanged": true},
            },
            "serverInfo": {
                "name": "hatago",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    async fn aggregated_tools_list(&self) -> Result<Value> {
        let mut tools = Vec::new();
        for node in &self.nodes {
            if node.status() == NodeStatus::Running {
                for entry in self.registry.tools_for_server(node.id()) {
                    tools.push(json!({
                        "name": entry.public_name,
                        "description": entry.description,
                        "inputSchema": entry.input_schema,
                    }));
                }
            } else if let Some(cached) = self.cached_tools(node.id()) {
                tools.extend(cached);
            }
        }
        Ok(json!({"tools": tools}))
    }

    async fn aggregated_resources_list(&self) -> Result<Value> {
        let mut resources = Vec::new();
        for node in &self.nodes {
            if node.status() == NodeStatus::Running {
                for entry in self.registry.resources_for_server(node.id()) {
                    resources.push(json!({
                        "uri": entry.uri,
                        "name": entry.name,
                        "mimeType": entry.mime_type,
                    }));
                }
            } else if let Some(cached) = self.cached_resources(node.id()) {
                resources.extend(cached);
            }
        }
        Ok(json!({"resources": resources}))
    }

    async fn aggregated_prompts_list(&self) -> Result<Value> {
        let mut prompts = Vec::new();
        for node in &self.nodes {
            if node.status() == NodeStatus::Running {
                for entry in self.registry.prompts_for_server(node.id()) {
                    prompts.push(json!({
                        "name": entry.public_name,
                        "description": entry.description,
                        "arguments": entry.arguments,
                    }));
                }
            } else if let Some(cached) = self.cached_prompts(node.id()) {
                prompts.extend(cached);
            }
        }
        Ok(json!({"prompts": prompts}))
    }

    fn cached_tools(&self, upstream_id: &str) -> Option<Vec<Value>> {
        let meta = self.metadata.as_ref()?.servers.get(upstream_id)?;
        Some(
            meta.tools
                .iter()
                .map(|t: &CachedTool| {
                    json!({"name": t.name, "description": t.description, "inputSchema": t.input_schema})
                })
                .collect(),
        )
    }

    fn cached_resources(&self, upstream_id: &str) -> Option<Vec<Value>> {
        let meta = self.metadata.as_ref()?.servers.get(upstream_id)?;
        Some(
            meta.resources
                .iter()
                .map(|r: &CachedResource| json!({"uri": r.uri, "name": r.name, "mimeType": r.mime_type}))
                .collect(),
        )
    }

    fn cached_prompts(&self, upstream_id: &str) -> Option<Vec<Value>> {
        let meta = self.metadata.as_ref()?.servers.get(upstream_id)?;
        Some(
            meta.prompts
                .iter()
                .map(|p: &CachedPrompt| json!({"name": p.name, "description": p.description, "arguments": p.arguments}))
                .collect(),
        )
    }

    async fn handle_tools_call(&self, params: Value, session_id: &str) -> Result<Value> {
        let public_name = require_string_field(&params, "name")?;
        let arguments = optional_object_field(&params, "arguments")?;

        let resolution = self
            .registry
            .resolve_tool(&public_name)
            .ok_or_else(|| HubError::UnknownTarget(public_name.clone()))?;
        let node = self
            .node(&resolution.upstream_id)
            .ok_or_else(|| HubError::Fatal(format!("tool owner '{}' has no node", resolution.upstream_id)))?;

        let request = CallToolRequestParam {
            name: resolution.original_name.into(),
            arguments,
        };
        let result = node.call_tool(session_id, request).await?;
        serde_json::to_value(result).map_err(|e| HubError::Fatal(e.to_string()))
    }

    async fn handle_resources_read(&self, params: Value, session_id: &str) -> Result<Value> {
        let uri = require_string_field(&params, "uri")?;
        let resolution = self
            .registry
            .resolve_resource(&uri)
            .ok_or_else(|| HubError::UnknownTarget(uri.clone()))?;
        let node = self
            .node(&resolution.upstream_id)
            .ok_or_else(|| HubError::Fatal(format!("resource owner '{}' has no node", resolution.upstream_id)))?;

        let result = node
            .read_resource(session_id, ReadResourceRequestParam { uri: resolution.original_name })
            .await?;
        serde_json::to_value(result).map_err(|e| HubError::Fatal(e.to_string()))
    }

    async fn handle_prompts_get(&self, params: Value, session_id: &str) -> Result<Value> {
        let public_name = require_string_field(&params, "name")?;
        let arguments = optional_string_map_field(&params, "arguments")?;

        let resolution = self
            .registry
            .resolve_prompt(&public_name)
            .ok_or_else(|| HubError::UnknownTarget(public_name.clone()))?;
        let node = self
            .node(&resolution.upstream_id)
            .ok_or_else(|| HubError::Fatal(format!("prompt owner '{}' has no node", resolution.upstream_id)))?;

        let result = node
            .get_prompt(
                session_id,
                GetPromptRequestParam {
                    name: resolution.original_name.into(),
                    arguments,
                },
            )
            .await?;
        serde_json::to_value(result).map_err(|e| HubError::Fatal(e.to_string()))
    }

    /// Targeted fallback for any method not in the fixed taxonomy: an
    /// explicit `<upstreamId>__<method>` prefix is stripped and relayed;
    /// otherwise the legacy "first configured upstream" behaviour applies
    /// only when explicitly enabled.
    async fn handle_targeted(&self, method: &str, params: Value, session_id: &str) -> Result<Value> {
        if let Some((upstream_id, tail)) = method.split_once(UPSTREAM_METHOD_SEPARATOR) {
            if let Some(node) = self.node(upstream_id) {
                return self.relay_raw(node, tail, params, session_id).await;
            }
        }

        if self.legacy_unprefixed_fallback {
            if let Some(first) = self.nodes.first() {
                return self.relay_raw(first, method, params, session_id).await;
            }
        }

        Err(HubError::UnknownTarget(method.to_string()))
    }

    /// Relay an arbitrary method/params pair to a node's upstream
    /// connection verbatim (used by the `<upstreamId>__<method>` escape
    /// hatch; not used by the fixed `tools/call` etc. paths, which go
    /// through name resolution instead).
    async fn relay_raw(
        &self,
        node: &Arc<UpstreamNode>,
        method: &str,
        params: Value,
        session_id: &str,
    ) -> Result<Value> {
        match method {
            "tools/call" => self.handle_tools_call(params, session_id).await,
            "resources/read" => self.handle_resources_read(params, session_id).await,
            "prompts/get" => self.handle_prompts_get(params, session_id).await,
            other => Err(HubError::UnknownTarget(format!("{}__{other}", node.id()))),
        }
    }
}

fn require_string_field(params: &Value, field: &str) -> Result<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HubError::InvalidInput(format!("'{field}' must be a string")))
}

fn optional_object_field(params: &Value, field: &str) -> Result<Option<Map<String, Value>>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(HubError::InvalidInput(format!("'{field}' must be an object"))),
    }
}

fn optional_string_map_field(params: &Value, field: &str) -> Result<Option<HashMap<String, String>>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => {
            let mut out = HashMap::with_capacity(map.len());
            for (k, v) in map {
                let s = v
                    .as_str()
                    .ok_or_else(|| HubError::InvalidInput(format!("'{field}.{k}' must be a string")))?;
                out.insert(k.clone(), s.to_string());
            }
            Ok(Some(out))
        }
        Some(_) => Err(HubError::InvalidInput(format!("'{field}' must be a map of string to string"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_string_field_rejects_missing_and_non_string() {
        assert!(require_string_field(&json!({}), "name").is_err());
        assert!(require_string_field(&json!({"name": 5}), "name").is_err());
        assert!(require_string_field(&json!({"name": "ok"}), "name").is_ok());
    }

    #[test]
    fn optional_string_map_field_rejects_non_string_values() {
        let params = json!({"arguments": {"a": 1}});
        assert!(optional_string_map_field(&params, "arguments").is_err());
    }

    #[test]
    fn optional_string_map_field_accepts_absent_arguments() {
        let params = json!({});
        assert_eq!(optional_string_map_field(&params, "arguments").unwrap(), None);
    }

    #[test]
    fn prefixed_method_is_split_on_double_underscore() {
        let method = "echo__customMethod";
        let (id, tail) = method.split_once(UPSTREAM_METHOD_SEPARATOR).unwrap();
        assert_eq!(id, "echo");
        assert_eq!(tail, "customMethod");
    }
}
