//! Two-tier response cache: in-memory LRU plus a durable mirror (§4.4).
//!
//! The in-memory tier is protected by a single `Mutex` around LRU mutation
//! (§5: "memory tier protected by a mutex around LRU mutation"); the durable
//! tier is whatever [`crate::storage::GatewayStorage`] backs the gateway
//! with. Parameter hashing is canonical-JSON (object keys sorted at every
//! depth) so cache keys are order-insensitive, satisfying invariant 5 of
//! §8.

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

/// `(type, serverId, qualifiedName, paramHash)` — the cache's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub kind: String,
    pub server_id: Uuid,
    pub qualified_name: String,
    pub param_hash: String,
}

impl CacheKey {
    pub fn new(kind: impl Into<String>, server_id: Uuid, qualified_name: impl Into<String>, params: &serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            server_id,
            qualified_name: qualified_name.into(),
            param_hash: canonical_param_hash(params),
        }
    }

    fn cache_key_string(&self) -> String {
        format!("{}:{}:{}:{}", self.kind, self.server_id, self.qualified_name, self.param_hash)
    }
}

/// Canonical JSON (keys sorted at every depth) hashed with SHA-256, so
/// `{a:1,b:2}` and `{b:2,a:1}` hash identically (§4.2 invariant, §8 law 5).
pub fn canonical_param_hash(params: &serde_json::Value) -> String {
    let canonical = canonicalize(params);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_hit_at: Option<DateTime<Utc>>,
}

/// Durable mirror of the cache, independent of the in-memory LRU tier.
/// Implementations are swapped via [`crate::storage::GatewayStorage`];
/// this trait exists so `ResponseCache` can be unit tested without a real
/// database.
#[async_trait::async_trait]
pub trait DurableCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: CacheEntry);
    async fn invalidate_prefix(&self, prefix: &str);
    /// Drop every entry whose key contains `needle` anywhere, not just as a
    /// prefix. Used for server-id invalidation, since a server id is the
    /// *second* `:`-delimited segment of a durable key
    /// (`"{kind}:{server_id}:{name}:{hash}"`), not a leading one.
    async fn invalidate_contains(&self, needle: &str);
    async fn invalidate_all(&self);
}

/// An in-memory-only durable tier, used when no external store is
/// configured (single-process default per the Non-goals in §1).
#[derive(Default)]
pub struct InMemoryDurableCache {
    inner: Mutex<std::collections::HashMap<String, CacheEntry>>,
}

#[async_trait::async_trait]
impl DurableCache for InMemoryDurableCache {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        self.inner.lock().await.insert(key.to_string(), entry);
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        self.inner.lock().await.retain(|k, _| !k.starts_with(prefix));
    }

    async fn invalidate_contains(&self, needle: &str) {
        self.inner.lock().await.retain(|k, _| !k.contains(needle));
    }

    async fn invalidate_all(&self) {
        self.inner.lock().await.clear();
    }
}

/// Filter for [`ResponseCache::invalidate`].
pub enum InvalidateFilter {
    Server(Uuid),
    Kind(String),
    All,
}

/// Memory-then-durable two-tier response cache.
pub struct ResponseCache {
    memory: Mutex<LruCache<String, CacheEntry>>,
    durable: Arc<dyn DurableCache>,
}

impl ResponseCache {
    pub fn new(capacity: usize, durable: Arc<dyn DurableCache>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity > 0");
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            durable,
        }
    }

    /// Memory hit, else durable hit (promoted to memory), else miss.
    /// Expired entries found on either tier are treated as a miss, never
    /// returned (§4.4, §8 invariant 4).
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let key_str = key.cache_key_string();
        let now = Utc::now();

        {
            let mut mem = self.memory.lock().await;
            if let Some(entry) = mem.get(&key_str) {
                if entry.expires_at > now {
                    let mut hit = entry.clone();
                    hit.hit_count += 1;
                    hit.last_hit_at = Some(now);
                    mem.put(key_str.clone(), hit.clone());
                    return Some(hit);
                }
                mem.pop(&key_str);
            }
        }

        if let Some(entry) = self.durable.get(&key_str).await {
            if entry.expires_at > now {
                let mut hit = entry.clone();
                hit.hit_count += 1;
                hit.last_hit_at = Some(now);
                self.memory.lock().await.put(key_str.clone(), hit.clone());
                self.durable.set(&key_str, hit.clone()).await;
                return Some(hit);
            }
        }

        None
    }

    pub async fn set(&self, key: &CacheKey, payload: serde_json::Value, ttl: std::time::Duration) {
        let now = Utc::now();
        let entry = CacheEntry {
            payload,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            hit_count: 0,
            last_hit_at: None,
        };
        let key_str = key.cache_key_string();
        self.memory.lock().await.put(key_str.clone(), entry.clone());
        self.durable.set(&key_str, entry).await;
    }

    pub async fn invalidate(&self, filter: InvalidateFilter) {
        match filter {
            InvalidateFilter::Server(server_id) => {
                // Server id is the interior `:server_id:` segment of a key
                // (`"{kind}:{server_id}:{name}:{hash}"`), not a prefix.
                let marker = format!(":{server_id}:");
                let mut mem = self.memory.lock().await;
                let stale: Vec<String> = mem.iter().filter(|(k, _)| k.contains(&marker)).map(|(k, _)| k.clone()).collect();
                for k in stale {
                    mem.pop(&k);
                }
                drop(mem);
                self.durable.invalidate_contains(&marker).await;
            }
            InvalidateFilter::Kind(kind) => {
                let mut mem = self.memory.lock().await;
                let stale: Vec<String> = mem
                    .iter()
                    .filter(|(k, _)| k.starts_with(&format!("{kind}:")))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in stale {
                    mem.pop(&k);
                }
                drop(mem);
                self.durable.invalidate_prefix(&format!("{kind}:")).await;
            }
            InvalidateFilter::All => {
                self.memory.lock().await.clear();
                self.durable.invalidate_all().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache {
        ResponseCache::new(2, Arc::new(InMemoryDurableCache::default()))
    }

    #[test]
    fn canonical_hash_is_key_order_insensitive() {
        let a = serde_json::json!({"a": 1, "b": 2});
        let b = serde_json::json!({"b": 2, "a": 1});
        assert_eq!(canonical_param_hash(&a), canonical_param_hash(&b));
    }

    #[test]
    fn canonical_hash_differs_on_value_change() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(canonical_param_hash(&a), canonical_param_hash(&b));
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = cache();
        let sid = Uuid::now_v7();
        let key = CacheKey::new("tool", sid, "fs/read", &serde_json::json!({"path": "/tmp"}));

        assert!(cache.get(&key).await.is_none());
        cache.set(&key, serde_json::json!({"ok": true}), std::time::Duration::from_secs(60)).await;

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.payload, serde_json::json!({"ok": true}));
        assert_eq!(hit.hit_count, 1);
    }

    #[tokio::test]
    async fn key_order_insensitive_lookup_is_a_hit() {
        let cache = cache();
        let sid = Uuid::now_v7();
        let key_a = CacheKey::new("tool", sid, "srv/t", &serde_json::json!({"a": 1, "b": 2}));
        let key_b = CacheKey::new("tool", sid, "srv/t", &serde_json::json!({"b": 2, "a": 1}));

        cache.set(&key_a, serde_json::json!("v"), std::time::Duration::from_secs(60)).await;
        assert!(cache.get(&key_b).await.is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = cache();
        let sid = Uuid::now_v7();
        let key = CacheKey::new("tool", sid, "srv/t", &serde_json::json!({}));
        cache.set(&key, serde_json::json!("v"), std::time::Duration::from_millis(1)).await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn durable_hit_is_promoted_to_memory() {
        let durable = Arc::new(InMemoryDurableCache::default());
        let cache = ResponseCache::new(1, durable.clone());
        let sid = Uuid::now_v7();
        let key = CacheKey::new("tool", sid, "srv/t", &serde_json::json!({}));

        durable
            .set(
                &key.cache_key_string(),
                CacheEntry {
                    payload: serde_json::json!("from-durable"),
                    created_at: Utc::now(),
                    expires_at: Utc::now() + chrono::Duration::seconds(60),
                    hit_count: 0,
                    last_hit_at: None,
                },
            )
            .await;

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.payload, serde_json::json!("from-durable"));
    }

    #[tokio::test]
    async fn invalidate_by_server() {
        let cache = cache();
        let sid = Uuid::now_v7();
        let key = CacheKey::new("tool", sid, "srv/t", &serde_json::json!({}));
        cache.set(&key, serde_json::json!("v"), std::time::Duration::from_secs(60)).await;

        cache.invalidate(InvalidateFilter::Server(sid)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_by_server_purges_the_durable_tier_too() {
        // A memory-only purge isn't enough: `get` re-promotes from the
        // durable tier on a miss, so a durable entry surviving
        // invalidation would make the entry reappear.
        let durable = Arc::new(InMemoryDurableCache::default());
        let cache = ResponseCache::new(4, durable.clone());
        let sid = Uuid::now_v7();
        let key = CacheKey::new("tool", sid, "srv/t", &serde_json::json!({}));
        cache.set(&key, serde_json::json!("v"), std::time::Duration::from_secs(60)).await;

        cache.invalidate(InvalidateFilter::Server(sid)).await;

        assert!(durable.get(&key.cache_key_string()).await.is_none());
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_by_server_does_not_touch_other_servers() {
        let cache = cache();
        let sid_a = Uuid::now_v7();
        let sid_b = Uuid::now_v7();
        let key_a = CacheKey::new("tool", sid_a, "srv/t", &serde_json::json!({}));
        let key_b = CacheKey::new("tool", sid_b, "srv/t", &serde_json::json!({}));
        cache.set(&key_a, serde_json::json!("a"), std::time::Duration::from_secs(60)).await;
        cache.set(&key_b, serde_json::json!("b"), std::time::Duration::from_secs(60)).await;

        cache.invalidate(InvalidateFilter::Server(sid_a)).await;

        assert!(cache.get(&key_a).await.is_none());
        assert!(cache.get(&key_b).await.is_some());
    }
}
