//! On-disk cache of discovered MCP server capabilities.
//!
//! One JSON file per `(server, config-hash)`. The key is derived from the
//! canonical form of the server descriptor, so any descriptor change (a new
//! env var, different args) produces a new key and the stale entry ages out.
//! Process-wide state is a lazily initialized singleton guarded by a single
//! reader/writer lock; disk writes for different keys proceed in parallel.

use crate::config::{CacheSettings, ServerConfig, TransportKind};
use crate::errors::{WeaveError, WeaveResult};
use crate::mcp::capability::{PromptSpec, ResourceSpec, ToolSpec};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, info, warn};

/// Per-tool dispatch decision, frozen at first aggregation. At most one
/// server holds `Primary` for a given tool name across the federated view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    Primary,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub server_name: String,
    pub cache_key: String,
    pub tools: Vec<ToolSpec>,
    pub prompts: Vec<PromptSpec>,
    pub resources: Vec<ResourceSpec>,
    /// Capability summary built at discovery; lets cached runs construct
    /// the system prompt offline.
    pub system_prompt: String,
    pub protocol: TransportKind,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    /// Per-entry TTL in minutes.
    pub ttl_minutes: i64,
    pub tool_ownership: HashMap<String, Ownership>,
    /// Soft invalidation flag.
    pub is_valid: bool,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::minutes(self.ttl_minutes)
    }
}

/// Produce a canonical JSON string with object keys sorted recursively,
/// so keys are stable regardless of insertion order.
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&canonical_value(value)).unwrap_or_default()
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonical_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

/// Stable cache key: `sha256(server_name ‖ canonical(descriptor))`.
/// Two processes seeing the same configuration produce the same key.
pub fn cache_key(server_name: &str, config: &ServerConfig) -> String {
    let descriptor = serde_json::to_value(config).unwrap_or(Value::Null);
    let canonical = canonical_json(&descriptor);
    let mut hasher = Sha256::new();
    hasher.update(server_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub struct CapabilityCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    dir: PathBuf,
    default_ttl_minutes: i64,
}

static GLOBAL: OnceLock<Arc<CapabilityCache>> = OnceLock::new();

impl CapabilityCache {
    pub fn new(dir: PathBuf, default_ttl_minutes: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dir,
            default_ttl_minutes,
        }
    }

    /// The process-wide cache, created on first use from `settings`.
    /// Later calls return the existing instance regardless of settings.
    pub fn global(settings: &CacheSettings) -> Arc<CapabilityCache> {
        GLOBAL
            .get_or_init(|| {
                let dir = if settings.directory.is_empty() {
                    crate::config::weave_home()
                        .map(|home| home.join("cache"))
                        .unwrap_or_else(|_| PathBuf::from(".mcpweave-cache"))
                } else {
                    PathBuf::from(&settings.directory)
                };
                Arc::new(CapabilityCache::new(dir, settings.ttl_minutes))
            })
            .clone()
    }

    pub fn default_ttl_minutes(&self) -> i64 {
        self.default_ttl_minutes
    }

    fn file_path(&self, entry: &CacheEntry) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.json",
            sanitize_file_stem(&entry.server_name),
            &entry.cache_key[..16.min(entry.cache_key.len())]
        ))
    }

    /// Return the entry for `key` if present, valid and unexpired.
    /// Touches `last_accessed`.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(key)?;
        if !entry.is_valid || entry.is_expired(now) {
            debug!(key = %key, server = %entry.server_name, "Cache entry expired or invalidated");
            return None;
        }
        entry.last_accessed = now;
        Some(entry.clone())
    }

    /// Store an entry for `descriptor`, computing its key deterministically,
    /// and persist it as one file. Disk failures are reported but the
    /// in-memory entry still lands; the cache path is never fatal.
    pub fn put(&self, mut entry: CacheEntry, descriptor: &ServerConfig) -> WeaveResult<String> {
        entry.cache_key = cache_key(&entry.server_name, descriptor);
        let key = entry.cache_key.clone();

        let disk_result = self.write_entry_file(&entry);

        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(key.clone(), entry);
        }

        disk_result?;
        Ok(key)
    }

    /// Write one entry file atomically: temp file in the same directory,
    /// then rename.
    fn write_entry_file(&self, entry: &CacheEntry) -> WeaveResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| WeaveError::Cache(format!("create {}: {}", self.dir.display(), e)))?;

        let path = self.file_path(entry);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entry)
            .map_err(|e| WeaveError::Cache(format!("serialize entry: {}", e)))?;
        fs::write(&tmp, content)
            .map_err(|e| WeaveError::Cache(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| WeaveError::Cache(format!("rename {}: {}", path.display(), e)))?;
        debug!(server = %entry.server_name, path = %path.display(), "Cache entry written");
        Ok(())
    }

    /// Lazy re-hydration after a restart: scan the disk directory for a file
    /// carrying `key` and load it into the in-memory map.
    pub fn reload_from_disk(&self, key: &str) -> Option<CacheEntry> {
        let dir_entries = fs::read_dir(&self.dir).ok()?;
        for dir_entry in dir_entries.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<CacheEntry>(&content) else {
                warn!(path = %path.display(), "Unreadable cache file, skipping");
                continue;
            };
            if entry.cache_key == key {
                debug!(key = %key, server = %entry.server_name, "Cache entry reloaded from disk");
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries.insert(key.to_string(), entry);
                drop(entries);
                return self.get(key);
            }
        }
        None
    }

    /// Remove all entries (memory and disk) belonging to `server_name`.
    pub fn invalidate_by_server(&self, server_name: &str) -> usize {
        let removed_entries: Vec<CacheEntry> = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.server_name == server_name)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };

        let mut removed = removed_entries.len();
        for entry in &removed_entries {
            let _ = fs::remove_file(self.file_path(entry));
        }

        // Disk may hold entries from previous descriptor versions that were
        // never loaded this process.
        if let Ok(dir_entries) = fs::read_dir(&self.dir) {
            for dir_entry in dir_entries.flatten() {
                let path = dir_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(content) = fs::read_to_string(&path)
                    && let Ok(entry) = serde_json::from_str::<CacheEntry>(&content)
                    && entry.server_name == server_name
                {
                    let _ = fs::remove_file(&path);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(server = %server_name, count = removed, "Invalidated cache entries");
        }
        removed
    }

    /// Remove expired entries from memory and disk. Idempotent.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<CacheEntry> = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.is_expired(now) || !e.is_valid)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };

        let mut removed = expired.len();
        for entry in &expired {
            let _ = fs::remove_file(self.file_path(entry));
        }

        if let Ok(dir_entries) = fs::read_dir(&self.dir) {
            for dir_entry in dir_entries.flatten() {
                let path = dir_entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(content) = fs::read_to_string(&path)
                    && let Ok(entry) = serde_json::from_str::<CacheEntry>(&content)
                    && (entry.is_expired(now) || !entry.is_valid)
                {
                    let _ = fs::remove_file(&path);
                    removed += 1;
                }
            }
        }

        removed
    }

    /// Full wipe of memory and disk.
    pub fn clear(&self) {
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.clear();
        }
        if let Ok(dir_entries) = fs::read_dir(&self.dir) {
            for dir_entry in dir_entries.flatten() {
                let path = dir_entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        info!("Capability cache cleared");
    }

    /// (total, valid) entry counts currently in memory.
    pub fn stats(&self) -> (usize, usize) {
        let now = Utc::now();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let total = entries.len();
        let valid = entries
            .values()
            .filter(|e| e.is_valid && !e.is_expired(now))
            .count();
        (total, valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config(env_value: &str) -> ServerConfig {
        ServerConfig {
            command: Some("mcp-server".into()),
            args: vec!["--verbose".into()],
            env: HashMap::from([("MODE".to_string(), env_value.to_string())]),
            ..Default::default()
        }
    }

    fn sample_entry(server: &str, ttl_minutes: i64) -> CacheEntry {
        CacheEntry {
            server_name: server.to_string(),
            cache_key: String::new(),
            tools: vec![ToolSpec {
                name: "search".into(),
                description: "Search things".into(),
                parameters: json!({"type": "object", "properties": {}}),
                server: server.to_string(),
            }],
            prompts: vec![],
            resources: vec![],
            system_prompt: format!("Tools from {}", server),
            protocol: TransportKind::Stdio,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
            ttl_minutes,
            tool_ownership: HashMap::from([("search".to_string(), Ownership::Primary)]),
            is_valid: true,
        }
    }

    #[test]
    fn key_stable_across_field_order() {
        // Same descriptor built in different ways hashes identically.
        let a = sample_config("fast");
        let b = sample_config("fast");
        assert_eq!(cache_key("alpha", &a), cache_key("alpha", &b));
    }

    #[test]
    fn key_changes_with_descriptor() {
        let a = sample_config("fast");
        let b = sample_config("slow");
        assert_ne!(cache_key("alpha", &a), cache_key("alpha", &b));
        // And with the server name.
        assert_ne!(cache_key("alpha", &a), cache_key("beta", &a));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"z": 1, "a": {"y": 2, "b": 3}});
        let b = json!({"a": {"b": 3, "y": 2}, "z": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn put_get_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = CapabilityCache::new(tmp.path().to_path_buf(), 60);
        let config = sample_config("fast");

        let key = cache.put(sample_entry("alpha", 60), &config).expect("put");
        let entry = cache.get(&key).expect("hit");
        assert_eq!(entry.server_name, "alpha");
        assert_eq!(entry.tool_ownership["search"], Ownership::Primary);
    }

    #[test]
    fn expired_entry_misses() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = CapabilityCache::new(tmp.path().to_path_buf(), 60);
        let config = sample_config("fast");

        let mut entry = sample_entry("alpha", 10);
        entry.created_at = Utc::now() - Duration::minutes(11);
        let key = cache.put(entry, &config).expect("put");
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn reload_from_disk_after_restart() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = sample_config("fast");

        let key = {
            let cache = CapabilityCache::new(tmp.path().to_path_buf(), 60);
            cache.put(sample_entry("alpha", 60), &config).expect("put")
        };

        // Fresh instance simulates a new process: memory empty, disk warm.
        let cache = CapabilityCache::new(tmp.path().to_path_buf(), 60);
        assert!(cache.get(&key).is_none());
        let entry = cache.reload_from_disk(&key).expect("reload");
        assert_eq!(entry.server_name, "alpha");
        // Now it is in memory too.
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn invalidate_by_server_removes_disk_and_memory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = CapabilityCache::new(tmp.path().to_path_buf(), 60);
        let key_a = cache
            .put(sample_entry("alpha", 60), &sample_config("fast"))
            .unwrap();
        let key_b = cache
            .put(sample_entry("beta", 60), &sample_config("fast"))
            .unwrap();

        let removed = cache.invalidate_by_server("alpha");
        assert_eq!(removed, 1);
        assert!(cache.get(&key_a).is_none());
        assert!(cache.get(&key_b).is_some());
        // Disk copy is gone: a fresh instance cannot reload it.
        let fresh = CapabilityCache::new(tmp.path().to_path_buf(), 60);
        assert!(fresh.reload_from_disk(&key_a).is_none());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = CapabilityCache::new(tmp.path().to_path_buf(), 60);
        let mut stale = sample_entry("alpha", 5);
        stale.created_at = Utc::now() - Duration::minutes(30);
        cache.put(stale, &sample_config("fast")).unwrap();
        cache.put(sample_entry("beta", 60), &sample_config("slow")).unwrap();

        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.cleanup(), 0);
        let (total, valid) = cache.stats();
        assert_eq!(total, 1);
        assert_eq!(valid, 1);
    }

    #[test]
    fn clear_wipes_everything() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = CapabilityCache::new(tmp.path().to_path_buf(), 60);
        cache.put(sample_entry("alpha", 60), &sample_config("fast")).unwrap();
        cache.clear();
        let (total, _) = cache.stats();
        assert_eq!(total, 0);
        assert_eq!(
            fs::read_dir(tmp.path()).unwrap().flatten().count(),
            0,
            "disk files removed"
        );
    }
}
