//! 缓存数据访问层（DAO）
//!
//! `kv_cache` 表由 `migrations/` 创建，这里只做读写。

use crate::im::cache::storage::KeyValueStorage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};
use tracing::debug;

/// 基于 SQLite 的键值存储
#[derive(Clone)]
pub struct SqliteKvStorage {
    db: Pool<Sqlite>,
}

impl SqliteKvStorage {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStorage for SqliteKvStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.db)
            .await
            .with_context(|| format!("查询缓存失败: {}", key))?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO kv_cache (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.db)
        .await
        .with_context(|| format!("写入缓存失败: {}", key))?;

        debug!("[CacheDAO] 写入 {}，{} 字节", key, value.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_cache WHERE key = ?")
            .bind(key)
            .execute(&self.db)
            .await
            .with_context(|| format!("删除缓存失败: {}", key))?;
        Ok(())
    }
}
