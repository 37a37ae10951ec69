use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Collision-resolution strategy for the tools/prompts registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NamingStrategy {
    /// Always prefix; collisions are impossible by construction.
    #[default]
    Namespace,
    /// Prefer the original name; fall back to prefixed on collision.
    Alias,
    /// Refuse registration of the later entrant and log.
    Error,
}

/// Global tool/prompt naming policy (the `toolNaming` config section).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolNamingConfig {
    #[serde(default)]
    pub strategy: NamingStrategy,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// `{serverId}{separator}{originalName}` by default; `{serverId}` and
    /// `{originalName}` are the only recognised placeholders.
    #[serde(default = "default_format")]
    pub format: String,
    /// User-level alias table: original name -> public name, applied after
    /// per-upstream aliases and before the collision strategy.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

fn default_separator() -> String {
    "_".to_string()
}

fn default_format() -> String {
    "{serverId}{separator}{originalName}".to_string()
}

impl Default for ToolNamingConfig {
    fn default() -> Self {
        Self {
            strategy: NamingStrategy::default(),
            separator: default_separator(),
            format: default_format(),
            aliases: HashMap::new(),
        }
    }
}

impl ToolNamingConfig {
    /// Render the default public name for `(server_id, original_name)`
    /// before any alias table or collision handling is applied. Dots in
    /// `original_name` are replaced with the separator for compatibility
    /// with clients that treat dots as a nesting delimiter.
    pub fn format_public_name(&self, server_id: &str, original_name: &str) -> String {
        let sanitised = original_name.replace('.', &self.separator);
        self.format
            .replace("{serverId}", server_id)
            .replace("{separator}", &self.separator)
            .replace("{originalName}", &sanitised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_applies_separator_and_dot_rewrite() {
        let naming = ToolNamingConfig::default();
        assert_eq!(naming.format_public_name("echo", "do.thing"), "echo_do_thing");
    }

    #[test]
    fn custom_format_honours_placeholders() {
        let naming = ToolNamingConfig {
            format: "{serverId}::{originalName}".to_string(),
            ..ToolNamingConfig::default()
        };
        assert_eq!(naming.format_public_name("echo", "ping"), "echo::ping");
    }
}
