use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use insureflow_core::domain::session::{FlowStatus, Session, SessionId, SessionPatch};
use insureflow_core::errors::StoreError;
use insureflow_core::store::SessionStore;

use super::{encode_count, encode_json, parse_count, parse_json, parse_timestamp, RepositoryError};
use crate::DbPool;

const SELECT_SESSION: &str = "SELECT
        session_id,
        user_id,
        current_flow,
        current_step,
        flow_status,
        collected_data_json,
        step_failures,
        completed_actions_json,
        escalated,
        agent_id,
        escalation_reason,
        state_version,
        created_at,
        updated_at
     FROM session
     WHERE session_id = ?";

/// SQLite-backed session store.
///
/// Updates read and write inside one transaction and only commit when the
/// stored `state_version` is still the one that was read. A patch carrying an
/// expected version is refused unless that is the version on disk, which
/// keeps turns from separate processes from overwriting each other.
pub struct SqlSessionStore {
    pool: DbPool,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, session: &Session) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO session (
                session_id,
                user_id,
                current_flow,
                current_step,
                flow_status,
                collected_data_json,
                step_failures,
                completed_actions_json,
                escalated,
                agent_id,
                escalation_reason,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_id.0)
        .bind(&session.user_id)
        .bind(session.current_flow.as_deref())
        .bind(encode_count("current_step", session.current_step)?)
        .bind(session.flow_status.as_str())
        .bind(encode_json("collected_data_json", &session.collected_data)?)
        .bind(i64::from(session.step_failures))
        .bind(encode_json("completed_actions_json", &session.completed_actions)?)
        .bind(session.escalated)
        .bind(session.agent_id.as_deref())
        .bind(session.escalation_reason.as_deref())
        .bind(encode_count("state_version", session.state_version)?)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, session_id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(SELECT_SESSION).bind(&session_id.0).fetch_optional(&self.pool).await?;
        row.map(session_from_row).transpose()
    }

    async fn apply(
        &self,
        session_id: &SessionId,
        patch: SessionPatch,
    ) -> Result<Option<Session>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(SELECT_SESSION).bind(&session_id.0).fetch_optional(&mut *tx).await?;
        let Some(mut session) = row.map(session_from_row).transpose()? else {
            return Ok(None);
        };

        if !patch.applies_to(&session) {
            tx.rollback().await?;
            return Err(RepositoryError::Conflict(session_id.0.clone()));
        }

        let read_version = encode_count("state_version", session.state_version)?;
        session.apply_patch(patch, Utc::now());

        let result = sqlx::query(
            "UPDATE session SET
                current_flow = ?,
                current_step = ?,
                flow_status = ?,
                collected_data_json = ?,
                step_failures = ?,
                completed_actions_json = ?,
                escalated = ?,
                agent_id = ?,
                escalation_reason = ?,
                state_version = ?,
                updated_at = ?
             WHERE session_id = ? AND state_version = ?",
        )
        .bind(session.current_flow.as_deref())
        .bind(encode_count("current_step", session.current_step)?)
        .bind(session.flow_status.as_str())
        .bind(encode_json("collected_data_json", &session.collected_data)?)
        .bind(i64::from(session.step_failures))
        .bind(encode_json("completed_actions_json", &session.completed_actions)?)
        .bind(session.escalated)
        .bind(session.agent_id.as_deref())
        .bind(session.escalation_reason.as_deref())
        .bind(encode_count("state_version", session.state_version)?)
        .bind(session.updated_at.to_rfc3339())
        .bind(&session_id.0)
        .bind(read_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::Conflict(session_id.0.clone()));
        }

        tx.commit().await?;
        Ok(Some(session))
    }
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn create(&self, user_id: &str) -> Result<Session, StoreError> {
        let session = Session::new(SessionId::generate(), user_id);
        self.insert(&session).await?;
        Ok(session)
    }

    async fn get(&self, session_id: &SessionId) -> Result<Session, StoreError> {
        self.find(session_id).await?.ok_or_else(|| StoreError::NotFound(session_id.clone()))
    }

    async fn update(&self, session_id: &SessionId, patch: SessionPatch) -> Result<Session, StoreError> {
        self.apply(session_id, patch).await?.ok_or_else(|| StoreError::NotFound(session_id.clone()))
    }
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    let status_raw = row.try_get::<String, _>("flow_status")?;
    let flow_status = FlowStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown flow status `{status_raw}`")))?;

    Ok(Session {
        session_id: SessionId(row.try_get("session_id")?),
        user_id: row.try_get("user_id")?,
        current_flow: row.try_get("current_flow")?,
        current_step: parse_count("current_step", row.try_get("current_step")?)?,
        flow_status,
        collected_data: parse_json("collected_data_json", row.try_get("collected_data_json")?)?,
        step_failures: parse_count("step_failures", row.try_get("step_failures")?)?,
        completed_actions: parse_json(
            "completed_actions_json",
            row.try_get("completed_actions_json")?,
        )?,
        escalated: row.try_get("escalated")?,
        agent_id: row.try_get("agent_id")?,
        escalation_reason: row.try_get("escalation_reason")?,
        state_version: parse_count("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::json;

    use insureflow_core::domain::session::{
        ActionReceipt, ConversationState, SessionId, SessionPatch,
    };
    use insureflow_core::errors::StoreError;
    use insureflow_core::store::SessionStore;

    use super::SqlSessionStore;
    use crate::{connect_with_settings, migrations::run_pending};

    async fn store() -> SqlSessionStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrations");
        SqlSessionStore::new(pool)
    }

    #[tokio::test]
    async fn created_session_round_trips() {
        let store = store().await;
        let created = store.create("u1").await.expect("create");

        let fetched = store.get(&created.session_id).await.expect("get");

        assert_eq!(fetched, created);
        assert_eq!(fetched.conversation_state(), ConversationState::Idle);
    }

    #[tokio::test]
    async fn update_merges_patch_and_bumps_version() {
        let store = store().await;
        let created = store.create("u1").await.expect("create");

        let mut data = BTreeMap::new();
        data.insert("product_id".to_owned(), json!("pa_standard"));
        let receipt = ActionReceipt::completed(
            "submit_quote",
            "abc",
            BTreeMap::from([("premium".to_owned(), json!("125000"))]),
        );
        let updated = store
            .update(
                &created.session_id,
                SessionPatch::default()
                    .enter_flow("personal_accident")
                    .merge_data(data)
                    .advance_to(2)
                    .record_action("personal_accident/cover_details", receipt.clone()),
            )
            .await
            .expect("update");

        assert_eq!(updated.state_version, 1);
        assert_eq!(
            updated.conversation_state(),
            ConversationState::InFlow { flow_id: "personal_accident".to_owned(), step_index: 2 }
        );

        let reloaded = store.get(&created.session_id).await.expect("get");
        assert_eq!(reloaded, updated);
        assert_eq!(reloaded.completed_actions["personal_accident/cover_details"], receipt);
    }

    #[tokio::test]
    async fn escalation_fields_persist_and_clear() {
        let store = store().await;
        let created = store.create("u1").await.expect("create");

        store
            .update(&created.session_id, SessionPatch::default().escalate("user_requested"))
            .await
            .expect("escalate");
        let joined = store
            .update(&created.session_id, SessionPatch::default().assign_agent("agent-3"))
            .await
            .expect("assign");
        assert!(joined.escalated);
        assert_eq!(joined.escalation_reason.as_deref(), Some("user_requested"));

        let cleared = store
            .update(&created.session_id, SessionPatch::default().clear_escalation())
            .await
            .expect("clear");
        assert!(!cleared.escalated);
        assert_eq!(cleared.agent_id, None);
        assert_eq!(store.get(&created.session_id).await.expect("get"), cleared);
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let store = store().await;
        let missing = SessionId::from("missing");

        assert_eq!(store.get(&missing).await, Err(StoreError::NotFound(missing.clone())));
        assert_eq!(
            store.update(&missing, SessionPatch::default()).await,
            Err(StoreError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn concurrent_updates_never_lose_a_write() {
        let store = Arc::new(store().await);
        let created = store.create("u1").await.expect("create");

        let handles: Vec<_> = (0..5)
            .map(|index| {
                let store = store.clone();
                let session_id = created.session_id.clone();
                tokio::spawn(async move {
                    let mut data = BTreeMap::new();
                    data.insert(format!("field_{index}"), json!(index));
                    store.update(&session_id, SessionPatch::default().merge_data(data)).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("update");
        }

        let reloaded = store.get(&created.session_id).await.expect("get");
        assert_eq!(reloaded.collected_data.len(), 5);
        assert_eq!(reloaded.state_version, 5);
    }

    #[tokio::test]
    async fn stale_expected_version_is_a_conflict() {
        let store = store().await;
        let created = store.create("u1").await.expect("create");
        let advanced = store
            .update(
                &created.session_id,
                SessionPatch::default().expect_version(created.state_version).enter_flow("travel_insurance"),
            )
            .await
            .expect("first writer");

        let stale = store
            .update(
                &created.session_id,
                SessionPatch::default().expect_version(created.state_version).advance_to(1),
            )
            .await;

        assert_eq!(stale, Err(StoreError::Conflict(created.session_id.clone())));
        assert_eq!(store.get(&created.session_id).await.expect("get"), advanced);
    }
}
