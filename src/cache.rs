//! Read-through response cache over catalog reads.
//!
//! Keys are a deterministic serialization of the normalized query
//! parameters; invalidation is a coarse glob sweep (`products:*`) fired by
//! any write that changes sellable stock or the catalog itself. Precision is
//! deliberately traded for simplicity: TTLs are short and catalog writes are
//! rare next to reads.
//!
//! The cache must never break a request. Every store failure degrades to a
//! miss (reads) or a no-op (writes/invalidation) with a warning in the log.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use crate::error::ApiError;

/// Glob pattern clearing every cached catalog read.
pub const PRODUCTS_PATTERN: &str = "products:*";

pub const LIST_TTL: Duration = Duration::from_secs(300);
pub const DETAIL_TTL: Duration = Duration::from_secs(600);

/// Storage seam behind the cache, so tests can run against an in-memory map
/// instead of a live Redis. Implementations swallow their own errors.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Duration);
    async fn delete_pattern(&self, pattern: &str);
    async fn delete_all(&self);
}

pub struct RedisBackend {
    conn: ConnectionManager,
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                log::warn!("cache get failed for {key}: {e}");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await {
            log::warn!("cache set failed for {key}: {e}");
        }
    }

    async fn delete_pattern(&self, pattern: &str) {
        let mut scan_conn = self.conn.clone();
        let mut keys: Vec<String> = Vec::new();
        match scan_conn.scan_match::<_, String>(pattern).await {
            Ok(mut iter) => {
                while let Some(key) = iter.next_item().await {
                    keys.push(key);
                }
            }
            Err(e) => {
                log::warn!("cache scan failed for {pattern}: {e}");
                return;
            }
        }
        if keys.is_empty() {
            return;
        }
        let count = keys.len();
        let mut conn = self.conn.clone();
        match conn.del::<_, ()>(keys).await {
            Ok(()) => log::debug!("invalidated {count} cache keys for {pattern}"),
            Err(e) => log::warn!("cache delete failed for {pattern}: {e}"),
        }
    }

    async fn delete_all(&self) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await {
            log::warn!("cache flush failed: {e}");
        }
    }
}

/// The cache handle held in application state. `None` backend means the
/// cache is disabled and every operation is a pass-through.
pub struct Cache {
    backend: Option<Box<dyn CacheBackend>>,
}

impl Cache {
    /// Connect to Redis if a URL is configured. A missing URL or a failed
    /// connection yields a disabled cache rather than a startup failure.
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let Some(url) = redis_url else {
            log::info!("REDIS_URL not set, response cache disabled");
            return Self::disabled();
        };
        let client = match redis::Client::open(url) {
            Ok(client) => client,
            Err(e) => {
                log::warn!("invalid REDIS_URL, response cache disabled: {e}");
                return Self::disabled();
            }
        };
        match client.get_connection_manager().await {
            Ok(conn) => Self {
                backend: Some(Box::new(RedisBackend { conn })),
            },
            Err(e) => {
                log::warn!("redis unreachable, response cache disabled: {e}");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    #[cfg(test)]
    pub fn with_backend(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match &self.backend {
            Some(backend) => backend.get(key).await,
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Some(backend) = &self.backend {
            backend.set(key, value, ttl).await;
        }
    }

    pub async fn invalidate(&self, pattern: &str) {
        if let Some(backend) = &self.backend {
            backend.delete_pattern(pattern).await;
        }
    }

    pub async fn clear(&self) {
        if let Some(backend) = &self.backend {
            backend.delete_all().await;
        }
    }
}

/// Outcome of a read-through lookup: the payload plus whether it was served
/// from the cache, so handlers can annotate the response.
pub struct CacheOutcome {
    pub payload: Value,
    pub hit: bool,
}

/// Read-through wrapper. On a hit the stored payload is returned as-is; on a
/// miss the handler runs and its successful payload is stored under `key`
/// before being returned. Handler errors are never cached.
pub async fn with_cache<F, Fut>(
    cache: &Cache,
    key: &str,
    ttl: Duration,
    handler: F,
) -> Result<CacheOutcome, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, ApiError>>,
{
    if let Some(raw) = cache.get(key).await {
        match serde_json::from_str(&raw) {
            Ok(payload) => {
                return Ok(CacheOutcome { payload, hit: true });
            }
            // Corrupt entry: fall through and repopulate.
            Err(e) => log::warn!("discarding unreadable cache entry {key}: {e}"),
        }
    }

    let payload = handler().await?;
    match serde_json::to_string(&payload) {
        Ok(raw) => cache.set(key, &raw, ttl).await,
        Err(e) => log::warn!("failed to serialize payload for {key}: {e}"),
    }
    Ok(CacheOutcome {
        payload,
        hit: false,
    })
}

/// Key for a catalog list read. Parameters arrive pre-normalized (defaults
/// filled, values clamped); the BTreeMap fixes their order so equivalent
/// queries always map to the same key.
pub fn list_key(params: &BTreeMap<&'static str, String>) -> String {
    let mut key = String::from("products:list:");
    for (i, (name, value)) in params.iter().enumerate() {
        if i > 0 {
            key.push('&');
        }
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}

pub fn detail_key(product_id: i64) -> String {
    format!("products:detail:{product_id}")
}

#[cfg(test)]
pub mod memory {
    //! In-memory backend for tests, matching Redis glob semantics for the
    //! subset of patterns the crate uses.

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;

    /// Match `*` (any run) and `?` (any single char) against a key.
    pub fn glob_match(pattern: &str, text: &str) -> bool {
        let (p, t) = (pattern.as_bytes(), text.as_bytes());
        let (mut pi, mut ti) = (0usize, 0usize);
        let mut star: Option<usize> = None;
        let mut mark = 0usize;
        while ti < t.len() {
            if pi < p.len() && (p[pi] == t[ti] || p[pi] == b'?') {
                pi += 1;
                ti += 1;
            } else if pi < p.len() && p[pi] == b'*' {
                star = Some(pi);
                mark = ti;
                pi += 1;
            } else if let Some(s) = star {
                pi = s + 1;
                mark += 1;
                ti = mark;
            } else {
                return false;
            }
        }
        while pi < p.len() && p[pi] == b'*' {
            pi += 1;
        }
        pi == p.len()
    }

    #[derive(Default)]
    pub struct MemoryBackend {
        entries: Mutex<HashMap<String, (String, Instant)>>,
    }

    #[async_trait]
    impl CacheBackend for MemoryBackend {
        async fn get(&self, key: &str) -> Option<String> {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some((value, deadline)) if *deadline > Instant::now() => Some(value.clone()),
                Some(_) => {
                    entries.remove(key);
                    None
                }
                None => None,
            }
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) {
            self.entries.lock().unwrap().insert(
                key.to_string(),
                (value.to_string(), Instant::now() + ttl),
            );
        }

        async fn delete_pattern(&self, pattern: &str) {
            self.entries
                .lock()
                .unwrap()
                .retain(|key, _| !glob_match(pattern, key));
        }

        async fn delete_all(&self) {
            self.entries.lock().unwrap().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{glob_match, MemoryBackend};
    use super::*;
    use serde_json::json;

    fn memory_cache() -> Cache {
        Cache::with_backend(Box::new(MemoryBackend::default()))
    }

    #[test]
    fn list_key_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert("category", "shoes".to_string());
        a.insert("page", "1".to_string());
        a.insert("sort", "newest".to_string());

        let mut b = BTreeMap::new();
        b.insert("sort", "newest".to_string());
        b.insert("category", "shoes".to_string());
        b.insert("page", "1".to_string());

        assert_eq!(list_key(&a), list_key(&b));
        assert_eq!(list_key(&a), "products:list:category=shoes&page=1&sort=newest");
    }

    #[test]
    fn keys_share_the_invalidation_prefix() {
        assert!(glob_match(PRODUCTS_PATTERN, &list_key(&BTreeMap::new())));
        assert!(glob_match(PRODUCTS_PATTERN, &detail_key(42)));
        assert!(!glob_match(PRODUCTS_PATTERN, "orders:list:"));
    }

    #[test]
    fn glob_match_star_and_question() {
        assert!(glob_match("products:*", "products:list:page=1"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("products:detail:?", "products:detail:7"));
        assert!(!glob_match("products:detail:?", "products:detail:77"));
        assert!(!glob_match("products:*", "coupons:SAVE10"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("a*c*e", "abcdf"));
    }

    #[actix_web::test]
    async fn miss_populates_then_hit_serves_cached() {
        let cache = memory_cache();
        let key = detail_key(1);

        let first = with_cache(&cache, &key, Duration::from_secs(60), || async {
            Ok(json!({"id": 1, "stock": 5}))
        })
        .await
        .unwrap();
        assert!(!first.hit);

        // The handler is not consulted again on a hit.
        let second = with_cache(&cache, &key, Duration::from_secs(60), || async {
            panic!("handler must not run on a cache hit")
        })
        .await
        .unwrap();
        assert!(second.hit);
        assert_eq!(second.payload, json!({"id": 1, "stock": 5}));
    }

    #[actix_web::test]
    async fn handler_errors_are_not_cached() {
        let cache = memory_cache();
        let key = detail_key(9);

        let err = with_cache(&cache, &key, Duration::from_secs(60), || async {
            Err(ApiError::NotFound("product"))
        })
        .await;
        assert!(err.is_err());

        let after = with_cache(&cache, &key, Duration::from_secs(60), || async {
            Ok(json!({"id": 9}))
        })
        .await
        .unwrap();
        assert!(!after.hit);
    }

    #[actix_web::test]
    async fn invalidation_forces_recompute() {
        let cache = memory_cache();
        let key = list_key(&BTreeMap::new());

        let stale = with_cache(&cache, &key, Duration::from_secs(60), || async {
            Ok(json!({"stock": 5}))
        })
        .await
        .unwrap();
        assert!(!stale.hit);

        // A stock-changing write sweeps the catalog keys.
        cache.invalidate(PRODUCTS_PATTERN).await;

        let fresh = with_cache(&cache, &key, Duration::from_secs(60), || async {
            Ok(json!({"stock": 3}))
        })
        .await
        .unwrap();
        assert!(!fresh.hit);
        assert_eq!(fresh.payload, json!({"stock": 3}));
    }

    #[actix_web::test]
    async fn invalidation_leaves_foreign_keys_alone() {
        let cache = memory_cache();
        cache.set("products:list:", "a", Duration::from_secs(60)).await;
        cache.set("session:abc", "b", Duration::from_secs(60)).await;

        cache.invalidate(PRODUCTS_PATTERN).await;

        assert!(cache.get("products:list:").await.is_none());
        assert_eq!(cache.get("session:abc").await.as_deref(), Some("b"));
    }

    #[actix_web::test]
    async fn expired_entries_read_as_misses() {
        let cache = memory_cache();
        cache.set("products:list:", "old", Duration::from_secs(0)).await;
        assert!(cache.get("products:list:").await.is_none());
    }

    #[actix_web::test]
    async fn disabled_cache_passes_through() {
        let cache = Cache::disabled();
        let key = detail_key(3);

        cache.set(&key, "x", Duration::from_secs(60)).await;
        assert!(cache.get(&key).await.is_none());

        let outcome = with_cache(&cache, &key, Duration::from_secs(60), || async {
            Ok(json!({"id": 3}))
        })
        .await
        .unwrap();
        assert!(!outcome.hit);
    }

    #[actix_web::test]
    async fn corrupt_entries_are_repopulated() {
        let cache = memory_cache();
        let key = detail_key(4);
        cache.set(&key, "{not json", Duration::from_secs(60)).await;

        let outcome = with_cache(&cache, &key, Duration::from_secs(60), || async {
            Ok(json!({"id": 4}))
        })
        .await
        .unwrap();
        assert!(!outcome.hit);
        assert_eq!(outcome.payload, json!({"id": 4}));
    }
}
