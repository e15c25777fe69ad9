//! In-memory [`KvStore`] implementation for testing and WASM targets.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Expired entries are
//! hidden from reads immediately and physically removed by
//! [`InMemoryKv::purge_expired`].

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::KvStore;

struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory key-value store.
#[derive(Default)]
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .map(|e| e.values().filter(|v| v.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expiry of a live key, for inspection in tests and tooling.
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|v| v.is_live(now))
            .and_then(|v| v.expires_at)
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, v| v.is_live(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow!("in-memory kv lock poisoned"))?;
        Ok(entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let expires_at = ttl_secs.map(|secs| Utc::now() + Duration::seconds(secs as i64));
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("in-memory kv lock poisoned"))?;
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow!("in-memory kv lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}
