//! Content-addressed cache over a [`KvStore`].
//!
//! Two tiers share one store, separated by key prefix:
//!
//! | Tier | Key | Default TTL | Meaning |
//! |------|-----|-------------|---------|
//! | [`CacheTier::Fragment`] | `frag:{hash}` | 30 days | some caller has submitted this content |
//! | [`CacheTier::Payload`] | `payload:{hash}` | 90 days | summary/embedding already computed |
//!
//! Every hit re-stores the entry with a fresh expiry, whoever the caller
//! is. Entries are never deleted explicitly; they only expire.
//!
//! # Degradation
//!
//! A lookup that errors or exceeds the lookup timeout counts as a miss,
//! so the protocol over-transfers rather than losing data. Puts are
//! retried with exponential backoff and then dropped with a warning.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, warn};

use merkle_sync_core::models::{CacheEntry, Phase1Response};
use merkle_sync_core::store::KvStore;

use crate::config::CacheConfig;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Which cache a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Fragment,
    Payload,
}

impl CacheTier {
    fn key(self, hash: &str) -> String {
        match self {
            CacheTier::Fragment => format!("frag:{}", hash),
            CacheTier::Payload => format!("payload:{}", hash),
        }
    }
}

/// TTLs, timeouts, and retry limits for a [`ContentCache`].
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub fragment_ttl_secs: u64,
    pub payload_ttl_secs: u64,
    pub lookup_timeout: Duration,
    pub put_max_retries: u32,
    pub retry_base_delay: Duration,
}

impl CachePolicy {
    pub fn ttl_secs(&self, tier: CacheTier) -> u64 {
        match tier {
            CacheTier::Fragment => self.fragment_ttl_secs,
            CacheTier::Payload => self.payload_ttl_secs,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            fragment_ttl_secs: config.fragment_ttl_days * SECS_PER_DAY,
            payload_ttl_secs: config.payload_ttl_days * SECS_PER_DAY,
            lookup_timeout: Duration::from_millis(config.lookup_timeout_ms),
            put_max_retries: config.put_max_retries,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

/// Result of a batch existence check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Hashes no caller has submitted yet, in input order.
    pub needed: Vec<String>,
    /// Hashes already present, in input order.
    pub cached: Vec<String>,
    /// Lookups that failed or timed out and were counted as needed.
    pub degraded: usize,
}

impl From<Partition> for Phase1Response {
    fn from(p: Partition) -> Self {
        Phase1Response {
            needed: p.needed,
            cached: p.cached,
        }
    }
}

enum Lookup {
    Hit(CacheEntry),
    Miss,
    Failed,
}

/// Content-addressed cache shared by every caller and project.
#[derive(Clone)]
pub struct ContentCache {
    kv: Arc<dyn KvStore>,
    policy: CachePolicy,
}

impl ContentCache {
    pub fn new(kv: Arc<dyn KvStore>, policy: CachePolicy) -> Self {
        Self { kv, policy }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Whether some caller has already submitted `hash`. Refreshes its TTL.
    pub async fn exists(&self, hash: &str) -> bool {
        matches!(self.lookup(CacheTier::Fragment, hash).await, Lookup::Hit(_))
    }

    /// Entry for `hash` in `tier`, refreshing its TTL on a hit.
    pub async fn get(&self, tier: CacheTier, hash: &str) -> Option<CacheEntry> {
        match self.lookup(tier, hash).await {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Miss | Lookup::Failed => None,
        }
    }

    /// Partitions `hashes` into needed and cached.
    ///
    /// All lookups run concurrently. The partition is exhaustive and
    /// disjoint over the distinct input hashes, and each side keeps input
    /// order. Every hit has its TTL refreshed.
    pub async fn exists_many(&self, hashes: &[String]) -> Partition {
        let mut seen = HashSet::new();
        let distinct: Vec<&String> = hashes.iter().filter(|h| seen.insert(h.as_str())).collect();

        let lookups = join_all(
            distinct
                .iter()
                .map(|hash| self.lookup(CacheTier::Fragment, hash)),
        )
        .await;

        let mut partition = Partition::default();
        for (hash, lookup) in distinct.into_iter().zip(lookups) {
            match lookup {
                Lookup::Hit(_) => partition.cached.push(hash.clone()),
                Lookup::Miss => partition.needed.push(hash.clone()),
                Lookup::Failed => {
                    partition.degraded += 1;
                    partition.needed.push(hash.clone());
                }
            }
        }

        if partition.degraded > 0 {
            warn!(
                degraded = partition.degraded,
                total = seen.len(),
                "cache lookups degraded to needed"
            );
        }
        partition
    }

    /// Stores `payload` for `hash` with the tier's TTL.
    ///
    /// Storing the same hash again overwrites it with an equivalent entry.
    /// Returns `false` if every retry failed; the failure is logged.
    pub async fn put(&self, tier: CacheTier, hash: &str, payload: serde_json::Value) -> bool {
        let ttl = self.policy.ttl_secs(tier);
        let entry = CacheEntry {
            hash: hash.to_string(),
            payload,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl as i64),
        };
        self.store_with_retry(&tier.key(hash), &entry, ttl).await
    }

    /// Stores many entries concurrently. No atomicity across the batch:
    /// returns how many were stored.
    pub async fn put_many(&self, tier: CacheTier, items: Vec<(String, serde_json::Value)>) -> usize {
        let results = join_all(
            items
                .into_iter()
                .map(|(hash, payload)| async move { self.put(tier, &hash, payload).await }),
        )
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    async fn lookup(&self, tier: CacheTier, hash: &str) -> Lookup {
        let key = tier.key(hash);
        let raw = match tokio::time::timeout(self.policy.lookup_timeout, self.kv.get(&key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return Lookup::Miss,
            Ok(Err(e)) => {
                debug!(key = %key, error = %e, "cache lookup failed");
                return Lookup::Failed;
            }
            Err(_) => {
                debug!(key = %key, "cache lookup timed out");
                return Lookup::Failed;
            }
        };

        let mut entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "unreadable cache entry, treating as miss");
                return Lookup::Miss;
            }
        };

        // Refresh on hit; the stored payload is kept as is
        let ttl = self.policy.ttl_secs(tier);
        entry.expires_at = Utc::now() + chrono::Duration::seconds(ttl as i64);
        // The refresh write shares the lookup timeout
        match serde_json::to_string(&entry) {
            Ok(value) => {
                let refresh = self.kv.put(&key, &value, Some(ttl));
                match tokio::time::timeout(self.policy.lookup_timeout, refresh).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(key = %key, error = %e, "ttl refresh failed"),
                    Err(_) => debug!(key = %key, "ttl refresh timed out"),
                }
            }
            Err(e) => debug!(key = %key, error = %e, "ttl refresh skipped"),
        }

        Lookup::Hit(entry)
    }

    async fn store_with_retry(&self, key: &str, entry: &CacheEntry, ttl: u64) -> bool {
        let value = match serde_json::to_string(entry) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "cache entry not serializable");
                return false;
            }
        };

        let mut last_err = None;
        for attempt in 0..=self.policy.put_max_retries {
            if attempt > 0 {
                // Exponential backoff: base, 2×base, 4×base, ...
                let delay = self.policy.retry_base_delay * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }
            match self.kv.put(key, &value, Some(ttl)).await {
                Ok(()) => return true,
                Err(e) => last_err = Some(e),
            }
        }

        warn!(
            key = %key,
            attempts = self.policy.put_max_retries + 1,
            error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "cache put dropped after retries"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkle_sync_core::store::memory::InMemoryKv;
    use serde_json::json;

    fn cache() -> (Arc<InMemoryKv>, ContentCache) {
        let kv = Arc::new(InMemoryKv::new());
        let policy = CachePolicy {
            retry_base_delay: Duration::from_millis(1),
            ..CachePolicy::default()
        };
        (kv.clone(), ContentCache::new(kv, policy))
    }

    #[tokio::test]
    async fn test_put_then_exists() {
        let (_kv, cache) = cache();
        assert!(!cache.exists("h1").await);
        assert!(cache.put(CacheTier::Fragment, "h1", json!({})).await);
        assert!(cache.exists("h1").await);
        assert!(cache.get(CacheTier::Payload, "h1").await.is_none());
    }

    #[tokio::test]
    async fn test_put_twice_single_entry() {
        let (kv, cache) = cache();
        assert!(cache.put(CacheTier::Fragment, "h", json!({})).await);
        assert!(cache.put(CacheTier::Fragment, "h", json!({})).await);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn test_tiers_use_distinct_ttls() {
        let (kv, cache) = cache();
        cache.put(CacheTier::Fragment, "h", json!({})).await;
        cache.put(CacheTier::Payload, "h", json!({"summary": "s"})).await;
        let frag = kv.expires_at("frag:h").unwrap();
        let payload = kv.expires_at("payload:h").unwrap();
        assert!(payload > frag + chrono::Duration::days(50));
    }

    #[tokio::test]
    async fn test_exists_many_partition_keeps_order() {
        let (_kv, cache) = cache();
        cache.put(CacheTier::Fragment, "b", json!({})).await;
        cache.put(CacheTier::Fragment, "d", json!({})).await;

        let input: Vec<String> = ["a", "b", "c", "d", "a"].iter().map(|s| s.to_string()).collect();
        let p = cache.exists_many(&input).await;
        assert_eq!(p.needed, vec!["a", "c"]);
        assert_eq!(p.cached, vec!["b", "d"]);
        assert_eq!(p.degraded, 0);
    }

    #[tokio::test]
    async fn test_exists_many_empty() {
        let (_kv, cache) = cache();
        let p = cache.exists_many(&[]).await;
        assert!(p.needed.is_empty() && p.cached.is_empty());
    }

    #[tokio::test]
    async fn test_hit_refreshes_ttl() {
        let (kv, cache) = cache();
        kv.put(
            "frag:h",
            &serde_json::to_string(&CacheEntry {
                hash: "h".into(),
                payload: json!({}),
                expires_at: Utc::now(),
            })
            .unwrap(),
            Some(5),
        )
        .await
        .unwrap();
        let before = kv.expires_at("frag:h").unwrap();
        assert!(cache.exists("h").await);
        assert!(kv.expires_at("frag:h").unwrap() > before + chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn test_refresh_keeps_first_payload() {
        let (_kv, cache) = cache();
        cache
            .put(CacheTier::Payload, "h", json!({"summary": "first"}))
            .await;
        let entry = cache.get(CacheTier::Payload, "h").await.unwrap();
        assert_eq!(entry.payload["summary"], "first");
    }

    #[tokio::test]
    async fn test_put_many_counts() {
        let (kv, cache) = cache();
        let stored = cache
            .put_many(
                CacheTier::Fragment,
                vec![("x".into(), json!({})), ("y".into(), json!({}))],
            )
            .await;
        assert_eq!(stored, 2);
        assert_eq!(kv.len(), 2);
    }
}
