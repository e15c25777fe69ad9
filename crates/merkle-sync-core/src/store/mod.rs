//! Key-value storage contract for Merkle Sync.
//!
//! The [`KvStore`] trait is the only storage surface the server-side
//! cache and project-root records depend on: per-key get, put with an
//! optional TTL, and delete. There are no cross-key transactions and
//! eventual consistency is acceptable.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Handles are opened by the process entry point and injected into
//! components as `Arc<dyn KvStore>`; components never open or close them.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

/// Abstract key-value backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get`](KvStore::get) | Read a live (non-expired) value |
/// | [`put`](KvStore::put) | Insert or overwrite, optionally expiring after `ttl_secs` |
/// | [`delete`](KvStore::delete) | Remove a key; absent keys are not an error |
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`. `ttl_secs = None` never expires.
    ///
    /// Overwriting an existing key replaces both value and expiry.
    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Removes `key`.
    async fn delete(&self, key: &str) -> Result<()>;
}
