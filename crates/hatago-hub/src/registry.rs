//! Tools/resources/prompts registry.
//!
//! Three parallel indices, each mutated only through an atomic
//! replace-per-upstream operation. Tool and prompt public names are
//! derived by the naming policy and may collide across upstreams;
//! resource URIs are never mangled and use first-writer-wins.

use std::collections::HashMap;
use std::sync::RwLock;

use hatago_config::{NamingOverrides, NamingStrategy, ToolNamingConfig};
use serde_json::Value;

/// A tool as reported by an upstream's `tools/list`, before naming is applied.
#[derive(Debug, Clone)]
pub struct DiscoveredTool {
    pub original_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// A resource as reported by an upstream's `resources/list`.
#[derive(Debug, Clone)]
pub struct DiscoveredResource {
    pub uri: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

/// A prompt as reported by an upstream's `prompts/list`.
#[derive(Debug, Clone)]
pub struct DiscoveredPrompt {
    pub original_name: String,
    pub description: Option<String>,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub public_name: String,
    pub upstream_id: String,
    pub original_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub uri: String,
    pub upstream_id: String,
    pub original_uri: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PromptEntry {
    pub public_name: String,
    pub upstream_id: String,
    pub original_name: String,
    pub description: Option<String>,
    pub arguments: Value,
}

/// What a public name resolves to: the owning upstream and the name to
/// send upstream once the public prefix is stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub upstream_id: String,
    pub original_name: String,
}

fn matches_globs(name: &str, include: &[String], exclude: &[String]) -> bool {
    if !include.is_empty()
        && !include
            .iter()
            .any(|pat| glob::Pattern::new(pat).map(|p| p.matches(name)).unwrap_or(false))
    {
        return false;
    }
    !exclude
        .iter()
        .any(|pat| glob::Pattern::new(pat).map(|p| p.matches(name)).unwrap_or(false))
}

/// Compute the desired public name for one (upstream, original name) pair,
/// before cross-upstream collision resolution.
fn desired_public_name(
    upstream_id: &str,
    original_name: &str,
    global: &ToolNamingConfig,
    overrides: &NamingOverrides,
) -> String {
    let base = match global.strategy {
        NamingStrategy::Namespace => global.format_public_name(upstream_id, original_name),
        NamingStrategy::Alias | NamingStrategy::Error => original_name.replace('.', &global.separator),
    };
    let base = match &overrides.prefix {
        Some(prefix) if matches!(global.strategy, NamingStrategy::Namespace) => {
            format!("{prefix}{}{}", global.separator, original_name.replace('.', &global.separator))
        }
        _ => base,
    };

    let base = overrides
        .aliases
        .get(original_name)
        .cloned()
        .unwrap_or(base);

    global
        .aliases
        .get(original_name)
        .cloned()
        .unwrap_or(base)
}

/// Fully-prefixed fallback name, used when a collision must be broken.
fn prefixed_fallback(upstream_id: &str, original_name: &str, global: &ToolNamingConfig) -> String {
    global.format_public_name(upstream_id, original_name)
}

struct NamedIndex<E> {
    by_server: HashMap<String, Vec<E>>,
    by_public_name: HashMap<String, String>,
}

impl<E> Default for NamedIndex<E> {
    fn default() -> Self {
        Self {
            by_server: HashMap::new(),
            by_public_name: HashMap::new(),
        }
    }
}

pub struct Registry {
    tools: RwLock<NamedIndex<ToolEntry>>,
    prompts: RwLock<NamedIndex<PromptEntry>>,
    resources: RwLock<ResourceIndex>,
}

#[derive(Default)]
struct ResourceIndex {
    by_server: HashMap<String, Vec<ResourceEntry>>,
    by_uri: HashMap<String, String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(NamedIndex::default()),
            prompts: RwLock::new(NamedIndex::default()),
            resources: RwLock::new(ResourceIndex::default()),
        }
    }

    /// Atomic replace: drop this upstream's prior tool entries, then insert
    /// the newly discovered set, applying the naming policy and the
    /// configured collision strategy.
    pub fn register_server_tools(
        &self,
        upstream_id: &str,
        discovered: Vec<DiscoveredTool>,
        global: &ToolNamingConfig,
        overrides: &NamingOverrides,
    ) {
        let mut index = self.tools.write().expect("tools registry lock poisoned");
        if let Some(previous) = index.by_server.remove(upstream_id) {
            for entry in previous {
                if index.by_public_name.get(&entry.public_name).map(String::as_str)
                    == Some(upstream_id)
                {
                    index.by_public_name.remove(&entry.public_name);
                }
            }
        }

        let mut entries = Vec::with_capacity(discovered.len());
        for tool in discovered {
            if !matches_globs(&tool.original_name, &overrides.include, &overrides.exclude) {
                continue;
            }
            let desired = desired_public_name(upstream_id, &tool.original_name, global, overrides);
            let public_name = resolve_collision(
                &mut index.by_public_name,
                desired,
                upstream_id,
                &tool.original_name,
                global,
            );
            let Some(public_name) = public_name else {
                tracing::warn!(
                    upstream = %upstream_id,
                    tool = %tool.original_name,
                    "dropping tool registration: name collision under 'error' naming strategy"
                );
                continue;
            };
            index
                .by_public_name
                .insert(public_name.clone(), upstream_id.to_string());
            entries.push(ToolEntry {
                public_name,
                upstream_id: upstream_id.to_string(),
                original_name: tool.original_name,
                description: tool.description,
                input_schema: tool.input_schema,
            });
        }
        index.by_server.insert(upstream_id.to_string(), entries);
    }

    pub fn register_server_prompts(
        &self,
        upstream_id: &str,
        discovered: Vec<DiscoveredPrompt>,
        global: &ToolNamingConfig,
        overrides: &NamingOverrides,
    ) {
        let mut index = self.prompts.write().expect("prompts registry lock poisoned");
        if let Some(previous) = index.by_server.remove(upstream_id) {
            for entry in previous {
                if index.by_public_name.get(&entry.public_name).map(String::as_str)
                    == Some(upstream_id)
                {
                    index.by_public_name.remove(&entry.public_name);
                }
            }
        }

        let mut entries = Vec::with_capacity(discovered.len());
        for prompt in discovered {
            if !matches_globs(&prompt.original_name, &overrides.include, &overrides.exclude) {
                continue;
            }
            let desired =
                desired_public_name(upstream_id, &prompt.original_name, global, overrides);
            let public_name = resolve_collision(
                &mut index.by_public_name,
                desired,
                upstream_id,
                &prompt.original_name,
                global,
            );
            let Some(public_name) = public_name else {
                tracing::warn!(
                    upstream = %upstream_id,
                    prompt = %prompt.original_name,
                    "dropping prompt registration: name collision under 'error' naming strategy"
                );
                continue;
            };
            index
                .by_public_name
                .insert(public_name.clone(), upstream_id.to_string());
            entries.push(PromptEntry {
                public_name,
                upstream_id: upstream_id.to_string(),
                original_name: prompt.original_name,
                description: prompt.description,
                arguments: prompt.arguments,
            });
        }
        index.by_server.insert(upstream_id.to_string(), entries);
    }

    /// Atomic replace for resources. URIs are never mangled: the first
    /// upstream to register a URI owns it for as long as it keeps
    /// re-registering it; any other upstream's entry for that URI is
    /// dropped.
    pub fn register_server_resources(&self, upstream_id: &str, discovered: Vec<DiscoveredResource>) {
        let mut index = self.resources.write().expect("resources registry lock poisoned");
        if let Some(previous) = index.by_server.remove(upstream_id) {
            for entry in previous {
                if index.by_uri.get(&entry.uri).map(String::as_str) == Some(upstream_id) {
                    index.by_uri.remove(&entry.uri);
                }
            }
        }

        let mut entries = Vec::with_capacity(discovered.len());
        for resource in discovered {
            match index.by_uri.get(&resource.uri) {
                Some(owner) if owner != upstream_id => {
                    tracing::debug!(
                        upstream = %upstream_id,
                        uri = %resource.uri,
                        owner = %owner,
                        "dropping resource registration: URI already owned by another upstream"
                    );
                    continue;
                }
                _ => {}
            }
            index
                .by_uri
                .insert(resource.uri.clone(), upstream_id.to_string());
            entries.push(ResourceEntry {
                uri: resource.uri.clone(),
                upstream_id: upstream_id.to_string(),
                original_uri: resource.uri,
                name: resource.name,
                mime_type: resource.mime_type,
            });
        }
        index.by_server.insert(upstream_id.to_string(), entries);
    }

    pub fn clear_server(&self, upstream_id: &str) {
        {
            let mut index = self.tools.write().expect("tools registry lock poisoned");
            if let Some(previous) = index.by_server.remove(upstream_id) {
                for entry in previous {
                    if index.by_public_name.get(&entry.public_name).map(String::as_str)
                        == Some(upstream_id)
                    {
                        index.by_public_name.remove(&entry.public_name);
                    }
                }
            }
        }
        {
            let mut index = self.prompts.write().expect("prompts registry lock poisoned");
            if let Some(previous) = index.by_server.remove(upstream_id) {
                for entry in previous {
                    if index.by_public_name.get(&entry.public_name).map(String::as_str)
                        == Some(upstream_id)
                    {
                        index.by_public_name.remove(&entry.public_name);
                    }
                }
            }
        }
        {
            let mut index = self.resources.write().expect("resources registry lock poisoned");
            if let Some(previous) = index.by_server.remove(upstream_id) {
                for entry in previous {
                    if index.by_uri.get(&entry.uri).map(String::as_str) == Some(upstream_id) {
                        index.by_uri.remove(&entry.uri);
                    }
                }
            }
        }
    }

    pub fn resolve_tool(&self, public_name: &str) -> Option<Resolution> {
        let index = self.tools.read().expect("tools registry lock poisoned");
        let upstream_id = index.by_public_name.get(public_name)?;
        let entries = index.by_server.get(upstream_id)?;
        entries
            .iter()
            .find(|e| e.public_name == public_name)
            .map(|e| Resolution {
                upstream_id: e.upstream_id.clone(),
                original_name: e.original_name.clone(),
            })
    }

    pub fn resolve_prompt(&self, public_name: &str) -> Option<Resolution> {
        let index = self.prompts.read().expect("prompts registry lock poisoned");
        let upstream_id = index.by_public_name.get(public_name)?;
        let entries = index.by_server.get(upstream_id)?;
        entries
            .iter()
            .find(|e| e.public_name == public_name)
            .map(|e| Resolution {
                upstream_id: e.upstream_id.clone(),
                original_name: e.original_name.clone(),
            })
    }

    pub fn resolve_resource(&self, uri: &str) -> Option<Resolution> {
        let index = self.resources.read().expect("resources registry lock poisoned");
        let upstream_id = index.by_uri.get(uri)?;
        Some(Resolution {
            upstream_id: upstream_id.clone(),
            original_name: uri.to_string(),
        })
    }

    pub fn tools_for_server(&self, upstream_id: &str) -> Vec<ToolEntry> {
        self.tools
            .read()
            .expect("tools registry lock poisoned")
            .by_server
            .get(upstream_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn prompts_for_server(&self, upstream_id: &str) -> Vec<PromptEntry> {
        self.prompts
            .read()
            .expect("prompts registry lock poisoned")
            .by_server
            .get(upstream_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn resources_for_server(&self, upstream_id: &str) -> Vec<ResourceEntry> {
        self.resources
            .read()
            .expect("resources registry lock poisoned")
            .by_server
            .get(upstream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Unordered snapshot of every tool entry; callers needing a stable
    /// aggregation order should iterate upstreams in configuration order
    /// and call `tools_for_server` instead.
    pub fn list_all_tools(&self) -> Vec<ToolEntry> {
        self.tools
            .read()
            .expect("tools registry lock poisoned")
            .by_server
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn tool_count(&self) -> usize {
        self.tools
            .read()
            .expect("tools registry lock poisoned")
            .by_public_name
            .len()
    }
}

/// Apply the configured collision strategy. Returns `None` when the
/// `error` strategy refuses the later registrant.
fn resolve_collision(
    by_public_name: &mut HashMap<String, String>,
    desired: String,
    upstream_id: &str,
    original_name: &str,
    global: &ToolNamingConfig,
) -> Option<String> {
    match by_public_name.get(&desired) {
        None => Some(desired),
        Some(owner) if owner == upstream_id => Some(desired),
        Some(_) => match global.strategy {
            NamingStrategy::Namespace => {
                // The default format already embeds the upstream id, so a
                // collision here only happens via an explicit alias
                // override. Fall back to the fully-qualified name, which
                // is unique by construction (upstream ids are unique
                // within the hub).
                Some(prefixed_fallback(upstream_id, original_name, global))
            }
            NamingStrategy::Alias => {
                // Fall back to the prefixed form for the later registrant:
                // last-writer-wins (see DESIGN.md).
                Some(prefixed_fallback(upstream_id, original_name, global))
            }
            NamingStrategy::Error => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naming() -> ToolNamingConfig {
        ToolNamingConfig::default()
    }

    fn tool(name: &str) -> DiscoveredTool {
        DiscoveredTool {
            original_name: name.to_string(),
            description: None,
            input_schema: Value::Null,
        }
    }

    #[test]
    fn namespace_strategy_never_collides() {
        let registry = Registry::new();
        let global = naming();
        let overrides = NamingOverrides::default();
        registry.register_server_tools("a", vec![tool("ping")], &global, &overrides);
        registry.register_server_tools("b", vec![tool("ping")], &global, &overrides);

        assert_eq!(
            registry.resolve_tool("a_ping").unwrap(),
            Resolution {
                upstream_id: "a".to_string(),
                original_name: "ping".to_string()
            }
        );
        assert_eq!(
            registry.resolve_tool("b_ping").unwrap(),
            Resolution {
                upstream_id: "b".to_string(),
                original_name: "ping".to_string()
            }
        );
    }

    #[test]
    fn alias_strategy_prefers_unprefixed_name_until_collision() {
        let registry = Registry::new();
        let global = ToolNamingConfig {
            strategy: NamingStrategy::Alias,
            ..naming()
        };
        let overrides = NamingOverrides::default();

        registry.register_server_tools("a", vec![tool("ping")], &global, &overrides);
        assert_eq!(registry.resolve_tool("ping").unwrap().upstream_id, "a");

        registry.register_server_tools("b", vec![tool("ping")], &global, &overrides);
        assert_eq!(registry.resolve_tool("ping").unwrap().upstream_id, "a");
        assert_eq!(registry.resolve_tool("b_ping").unwrap().upstream_id, "b");
    }

    #[test]
    fn error_strategy_drops_the_later_entrant() {
        let registry = Registry::new();
        let global = ToolNamingConfig {
            strategy: NamingStrategy::Error,
            ..naming()
        };
        let overrides = NamingOverrides::default();

        registry.register_server_tools("a", vec![tool("ping")], &global, &overrides);
        registry.register_server_tools("b", vec![tool("ping")], &global, &overrides);

        assert_eq!(registry.resolve_tool("ping").unwrap().upstream_id, "a");
        assert!(registry.tools_for_server("b").is_empty());
    }

    #[test]
    fn atomic_replace_drops_stale_entries() {
        let registry = Registry::new();
        let global = naming();
        let overrides = NamingOverrides::default();

        registry.register_server_tools("a", vec![tool("one"), tool("two")], &global, &overrides);
        assert!(registry.resolve_tool("a_one").is_some());

        registry.register_server_tools("a", vec![tool("two")], &global, &overrides);
        assert!(registry.resolve_tool("a_one").is_none());
        assert!(registry.resolve_tool("a_two").is_some());
    }

    #[test]
    fn include_exclude_globs_filter_registration() {
        let registry = Registry::new();
        let global = naming();
        let overrides = NamingOverrides {
            include: vec!["allowed_*".to_string()],
            ..NamingOverrides::default()
        };

        registry.register_server_tools(
            "a",
            vec![tool("allowed_one"), tool("blocked")],
            &global,
            &overrides,
        );
        assert!(registry.resolve_tool("a_allowed_one").is_some());
        assert!(registry.resolve_tool("a_blocked").is_none());
    }

    #[test]
    fn resources_are_first_writer_wins() {
        let registry = Registry::new();
        registry.register_server_resources(
            "a",
            vec![DiscoveredResource {
                uri: "file://shared.txt".to_string(),
                name: Some("shared".to_string()),
                mime_type: None,
            }],
        );
        registry.register_server_resources(
            "b",
            vec![DiscoveredResource {
                uri: "file://shared.txt".to_string(),
                name: Some("shared-from-b".to_string()),
                mime_type: None,
            }],
        );

        let resolved = registry.resolve_resource("file://shared.txt").unwrap();
        assert_eq!(resolved.upstream_id, "a");
    }

    #[test]
    fn clear_server_removes_all_three_indices() {
        let registry = Registry::new();
        let global = naming();
        let overrides = NamingOverrides::default();
        registry.register_server_tools("a", vec![tool("one")], &global, &overrides);
        registry.register_server_resources(
            "a",
            vec![DiscoveredResource {
                uri: "file://a.txt".to_string(),
                name: None,
                mime_type: None,
            }],
        );

        registry.clear_server("a");
        assert!(registry.resolve_tool("a_one").is_none());
        assert!(registry.resolve_resource("file://a.txt").is_none());
    }
}
