use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use insureflow_core::domain::escalation::EscalationRecord;
use insureflow_core::domain::session::SessionId;
use insureflow_core::errors::StoreError;
use insureflow_core::store::EscalationQueue;

use super::{encode_json, parse_json, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Handoff records waiting for a human agent.
pub struct SqlEscalationQueue {
    pool: DbPool,
}

impl SqlEscalationQueue {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<EscalationRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                escalation_id,
                session_id,
                user_id,
                reason,
                metadata_json,
                created_at
             FROM escalation_queue
             WHERE session_id = ?
             ORDER BY created_at ASC",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn count(&self) -> Result<i64, RepositoryError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM escalation_queue").fetch_one(&self.pool).await?)
    }

    async fn insert(&self, record: &EscalationRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO escalation_queue (
                escalation_id,
                session_id,
                user_id,
                reason,
                metadata_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.escalation_id)
        .bind(&record.session_id.0)
        .bind(&record.user_id)
        .bind(&record.reason)
        .bind(encode_json("metadata_json", &record.metadata)?)
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EscalationQueue for SqlEscalationQueue {
    async fn add_to_queue(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        Ok(self.insert(record).await?)
    }
}

fn record_from_row(row: SqliteRow) -> Result<EscalationRecord, RepositoryError> {
    Ok(EscalationRecord {
        escalation_id: row.try_get("escalation_id")?,
        session_id: SessionId(row.try_get("session_id")?),
        user_id: row.try_get("user_id")?,
        reason: row.try_get("reason")?,
        metadata: parse_json("metadata_json", row.try_get("metadata_json")?)?,
        timestamp: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
