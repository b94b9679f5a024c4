//! # Entity Repository
//!
//! Snapshot rows in `HomeAssistantEntity`.
//!
//! ## Timestamps
//! ```text
//!  first_observed  set once, when the row is created
//!  last_reported   every write
//!  last_modified   only when state_json actually changed
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use crate::store::EntityRow;

/// Repository for entity snapshot rows.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
}

impl EntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EntityRepository { pool }
    }

    /// Fetches the row for `unique_id`, if any.
    pub async fn find(&self, unique_id: &str) -> DbResult<Option<EntityRow>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT unique_id, entity_id, application_name, state_json,
                   first_observed, last_modified, last_reported
            FROM HomeAssistantEntity
            WHERE unique_id = ?1
            "#,
        )
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Inserts a row unless one already exists. Returns true if inserted.
    pub async fn insert_if_missing(
        &self,
        unique_id: &str,
        application_name: &str,
        state_json: &str,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO HomeAssistantEntity (
                unique_id, application_name, state_json,
                first_observed, last_modified, last_reported
            ) VALUES (?1, ?2, ?3, ?4, ?4, ?4)
            ON CONFLICT(unique_id) DO NOTHING
            "#,
        )
        .bind(unique_id)
        .bind(application_name)
        .bind(state_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            debug!(unique_id = %unique_id, "Created entity row from defaults");
        }
        Ok(inserted)
    }

    /// Rewrites the snapshot of an existing row. Returns rows affected.
    pub async fn update_state(
        &self,
        unique_id: &str,
        state_json: &str,
        now: DateTime<Utc>,
    ) -> DbResult<u64> {
        // SET expressions see the old row, so the CASE compares against the
        // previous snapshot.
        let result = sqlx::query(
            r#"
            UPDATE HomeAssistantEntity
            SET last_modified = CASE WHEN state_json = ?2 THEN last_modified ELSE ?3 END,
                state_json = ?2,
                last_reported = ?3
            WHERE unique_id = ?1
            "#,
        )
        .bind(unique_id)
        .bind(state_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Creates or rewrites the snapshot row.
    pub async fn upsert_state(
        &self,
        unique_id: &str,
        application_name: &str,
        state_json: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO HomeAssistantEntity (
                unique_id, application_name, state_json,
                first_observed, last_modified, last_reported
            ) VALUES (?1, ?2, ?3, ?4, ?4, ?4)
            ON CONFLICT(unique_id) DO UPDATE SET
                last_modified = CASE
                    WHEN HomeAssistantEntity.state_json = excluded.state_json
                    THEN HomeAssistantEntity.last_modified
                    ELSE excluded.last_modified
                END,
                state_json = excluded.state_json,
                last_reported = excluded.last_reported
            "#,
        )
        .bind(unique_id)
        .bind(application_name)
        .bind(state_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records the hub-assigned entity id. Returns rows affected.
    pub async fn set_entity_id(&self, unique_id: &str, entity_id: &str) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE HomeAssistantEntity SET entity_id = ?2 WHERE unique_id = ?1",
        )
        .bind(unique_id)
        .bind(entity_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// All rows written by `application_name`, oldest first.
    pub async fn list_by_application(&self, application_name: &str) -> DbResult<Vec<EntityRow>> {
        let rows = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT unique_id, entity_id, application_name, state_json,
                   first_observed, last_modified, last_reported
            FROM HomeAssistantEntity
            WHERE application_name = ?1
            ORDER BY first_observed, unique_id
            "#,
        )
        .bind(application_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
