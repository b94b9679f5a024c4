//! # Locals Repository
//!
//! Per-entity key/value rows in `HomeAssistantEntityLocals`, keyed by
//! `(unique_id, key)`.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// One stored local.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LocalRow {
    pub unique_id: String,
    pub key: String,
    pub value_json: String,
    pub last_modified: DateTime<Utc>,
}

/// Repository for entity locals.
#[derive(Debug, Clone)]
pub struct LocalsRepository {
    pool: SqlitePool,
}

impl LocalsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LocalsRepository { pool }
    }

    /// All locals stored for `unique_id`.
    pub async fn list(&self, unique_id: &str) -> DbResult<Vec<LocalRow>> {
        let rows = sqlx::query_as::<_, LocalRow>(
            r#"
            SELECT unique_id, key, value_json, last_modified
            FROM HomeAssistantEntityLocals
            WHERE unique_id = ?1
            ORDER BY key
            "#,
        )
        .bind(unique_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Creates or replaces one local.
    pub async fn upsert(
        &self,
        unique_id: &str,
        key: &str,
        value_json: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO HomeAssistantEntityLocals (unique_id, key, value_json, last_modified)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(unique_id, key) DO UPDATE SET
                value_json = excluded.value_json,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(unique_id)
        .bind(key)
        .bind(value_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(unique_id = %unique_id, key = %key, "Stored local");
        Ok(())
    }

    /// Removes one local. Returns rows affected.
    pub async fn delete(&self, unique_id: &str, key: &str) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM HomeAssistantEntityLocals WHERE unique_id = ?1 AND key = ?2",
        )
        .bind(unique_id)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Removes every local of `unique_id`. Returns rows affected.
    pub async fn delete_all(&self, unique_id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM HomeAssistantEntityLocals WHERE unique_id = ?1")
            .bind(unique_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    async fn repo() -> LocalsRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().locals()
    }

    #[tokio::test]
    async fn test_upsert_replaces_value() {
        let repo = repo().await;
        let now = Utc::now();

        repo.upsert("sw1", "count", "1", now).await.unwrap();
        repo.upsert("sw1", "count", "2", now).await.unwrap();
        repo.upsert("sw1", "label", "\"porch\"", now).await.unwrap();

        let rows = repo.list("sw1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "count");
        assert_eq!(rows[0].value_json, "2");
    }

    #[tokio::test]
    async fn test_delete_scopes() {
        let repo = repo().await;
        let now = Utc::now();

        repo.upsert("sw1", "a", "1", now).await.unwrap();
        repo.upsert("sw1", "b", "1", now).await.unwrap();
        repo.upsert("sw2", "a", "1", now).await.unwrap();

        assert_eq!(repo.delete("sw1", "a").await.unwrap(), 1);
        assert_eq!(repo.delete("sw1", "a").await.unwrap(), 0);
        assert_eq!(repo.delete_all("sw1").await.unwrap(), 1);

        assert!(repo.list("sw1").await.unwrap().is_empty());
        assert_eq!(repo.list("sw2").await.unwrap().len(), 1);
    }
}
