//! SQLite-backed [`KvStore`] implementation.
//!
//! Each key is one row of the `kv` table. Expiry is stored as a unix
//! timestamp; reads filter expired rows and [`SqliteKv::sweep_expired`]
//! deletes them (`msync cache sweep`).

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use merkle_sync_core::store::KvStore;

/// SQLite implementation of the [`KvStore`] trait.
///
/// Wraps a [`SqlitePool`] opened by the process entry point; the store
/// never opens or closes the pool itself.
#[derive(Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Deletes expired rows and returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Counts live rows whose key starts with `prefix`.
    pub async fn count_prefix(&self, prefix: &str) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM kv WHERE key LIKE ? || '%' AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(prefix)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = chrono::Utc::now().timestamp();
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = ttl_secs.map(|ttl| now + ttl as i64);

        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteKv {
        let cfg = DbConfig {
            path: tmp.path().join("kv.sqlite"),
        };
        let pool = db::connect(&cfg).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        SqliteKv::new(pool)
    }

    #[tokio::test]
    async fn test_put_get_overwrite_delete() {
        let tmp = TempDir::new().unwrap();
        let kv = open(&tmp).await;

        kv.put("frag:a", "1", Some(3600)).await.unwrap();
        kv.put("frag:a", "1", Some(3600)).await.unwrap();
        assert_eq!(kv.get("frag:a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.count_prefix("frag:").await.unwrap(), 1);

        kv.delete("frag:a").await.unwrap();
        assert_eq!(kv.get("frag:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_rows_hidden_and_swept() {
        let tmp = TempDir::new().unwrap();
        let kv = open(&tmp).await;

        kv.put("old", "v", Some(0)).await.unwrap();
        kv.put("root:me:p", "r", None).await.unwrap();
        assert_eq!(kv.get("old").await.unwrap(), None);
        assert_eq!(kv.sweep_expired().await.unwrap(), 1);
        assert_eq!(kv.get("root:me:p").await.unwrap().as_deref(), Some("r"));
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let tmp = TempDir::new().unwrap();
        let kv = open(&tmp).await;
        migrate::run_migrations(kv.pool()).await.unwrap();
    }
}
