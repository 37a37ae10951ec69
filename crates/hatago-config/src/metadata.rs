use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A cached tool/resource/prompt description, opaque beyond the fields the
/// registry needs to answer a `list` call without waking the upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResource {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedPrompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Value,
}

/// One upstream's cached discovery result, persisted as `<config>.metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamMetadata {
    #[serde(default)]
    pub tools: Vec<CachedTool>,
    #[serde(default)]
    pub resources: Vec<CachedResource>,
    #[serde(default)]
    pub prompts: Vec<CachedPrompt>,
    #[serde(default)]
    pub tools_hash: String,
    #[serde(default)]
    pub resources_hash: String,
    #[serde(default)]
    pub prompts_hash: String,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub statistics: Value,
}

/// Hash a cached listing's serialised form so a reload can tell whether an
/// upstream's catalogue actually changed since the cache was last written,
/// without keeping the previous listing around to diff against.
pub fn hash_listing<T: Serialize>(items: &[T]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        let encoded = serde_json::to_vec(item).unwrap_or_default();
        hasher.update(&encoded);
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// The full metadata-cache sidecar file: upstream id -> its cached
/// discovery result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetadataCache {
    #[serde(flatten)]
    pub servers: HashMap<String, UpstreamMetadata>,
}

impl MetadataCache {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read metadata cache: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse metadata cache: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create metadata cache dir: {}", parent.display()))?;
        }
        let raw =
            serde_json::to_string_pretty(self).context("failed to serialise metadata cache")?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write metadata cache: {}", path.display()))
    }

    /// Derive the sidecar path for a given hub config path, e.g.
    /// `hatago.toml` -> `hatago.toml.metadata.json`.
    pub fn sidecar_path(config_path: &Path) -> std::path::PathBuf {
        let mut name = config_path.as_os_str().to_owned();
        name.push(".metadata.json");
        std::path::PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cache_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        let cache = MetadataCache::load(&path).expect("load missing cache");
        assert!(cache.servers.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hatago.toml.metadata.json");

        let mut cache = MetadataCache::default();
        cache.servers.insert(
            "slow".to_string(),
            UpstreamMetadata {
                tools: vec![CachedTool {
                    name: "slow_work".to_string(),
                    description: None,
                    input_schema: Value::Null,
                }],
                ..UpstreamMetadata::default()
            },
        );

        cache.save(&path).expect("save cache");
        let loaded = MetadataCache::load(&path).expect("load cache");
        assert_eq!(loaded, cache);
    }

    #[test]
    fn hash_listing_changes_with_content() {
        let a = vec![CachedTool {
            name: "a".to_string(),
            description: None,
            input_schema: Value::Null,
        }];
        let b = vec![CachedTool {
            name: "b".to_string(),
            description: None,
            input_schema: Value::Null,
        }];
        assert_ne!(hash_listing(&a), hash_listing(&b));
        assert_eq!(hash_listing(&a), hash_listing(&a));
    }

    #[test]
    fn hash_listing_of_empty_slice_is_stable() {
        let empty: Vec<CachedTool> = Vec::new();
        assert_eq!(hash_listing(&empty), hash_listing::<CachedTool>(&[]));
    }

    #[test]
    fn sidecar_path_appends_suffix() {
        let config_path = Path::new("/etc/hatago/hatago.toml");
        let sidecar = MetadataCache::sidecar_path(config_path);
        assert_eq!(
            sidecar,
            std::path::PathBuf::from("/etc/hatago/hatago.toml.metadata.json")
        );
    }
}
