use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::escalation::{EscalationReason, EscalationRecord, EscalationStatus};
use crate::domain::session::{ConversationState, FlowStatus, Session, SessionId, SessionPatch};
use crate::errors::{ApplicationError, DomainError};
use crate::flows::states::{transition, FlowEvent};
use crate::store::{EscalationQueue, SessionLocks, SessionStore};

const ACTOR: &str = "escalation-service";

/// Moves sessions between bot control and human-agent control.
pub struct EscalationService {
    store: Arc<dyn SessionStore>,
    queue: Option<Arc<dyn EscalationQueue>>,
    locks: Arc<SessionLocks>,
    audit: Arc<dyn AuditSink>,
}

impl EscalationService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        queue: Option<Arc<dyn EscalationQueue>>,
        locks: Arc<SessionLocks>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { store, queue, locks, audit }
    }

    pub fn locks(&self) -> Arc<SessionLocks> {
        self.locks.clone()
    }

    /// Marks the session as escalated and queues a handoff record.
    ///
    /// Queueing is best effort: a missing or failing backend is logged and
    /// the session stays escalated.
    pub async fn escalate_to_human(
        &self,
        session_id: &SessionId,
        reason: EscalationReason,
        metadata: BTreeMap<String, String>,
        correlation_id: &str,
    ) -> Result<EscalationRecord, ApplicationError> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.store.get(session_id).await?;
        let (_, record) = self.escalate_locked(&session, reason, metadata, correlation_id).await?;
        Ok(record)
    }

    /// Escalation for callers that already hold the session's turn lock.
    pub(crate) async fn escalate_locked(
        &self,
        session: &Session,
        reason: EscalationReason,
        metadata: BTreeMap<String, String>,
        correlation_id: &str,
    ) -> Result<(Session, EscalationRecord), ApplicationError> {
        let current = session.conversation_state();
        let record =
            EscalationRecord::new(session.session_id.clone(), &session.user_id, &reason, metadata);
        if matches!(current, ConversationState::Escalated { .. }) {
            info!(
                event_name = "escalation.already_active",
                correlation_id = %correlation_id,
                session_id = %session.session_id,
                "session is already escalated"
            );
            return Ok((session.clone(), record));
        }
        transition(&current, &FlowEvent::EscalationTriggered, None).map_err(DomainError::from)?;

        let updated = self
            .store
            .update(
                &session.session_id,
                SessionPatch::default().expect_version(session.state_version).escalate(reason.as_str()),
            )
            .await?;

        self.enqueue(&record, correlation_id).await;
        self.audit.emit(
            AuditEvent::new(
                Some(session.session_id.clone()),
                correlation_id,
                "escalation.requested",
                AuditCategory::Escalation,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("reason", reason.as_str())
            .with_metadata("escalation_id", record.escalation_id.clone()),
        );
        info!(
            event_name = "escalation.requested",
            correlation_id = %correlation_id,
            session_id = %session.session_id,
            reason = %reason,
            "session handed off to a human agent"
        );

        Ok((updated, record))
    }

    pub async fn agent_join(
        &self,
        session_id: &SessionId,
        agent_id: &str,
        correlation_id: &str,
    ) -> Result<Session, ApplicationError> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.store.get(session_id).await?;
        transition(
            &session.conversation_state(),
            &FlowEvent::AgentJoined { agent_id: agent_id.to_string() },
            None,
        )
        .map_err(DomainError::from)?;

        let updated = self
            .store
            .update(
                session_id,
                SessionPatch::default().expect_version(session.state_version).assign_agent(agent_id),
            )
            .await?;
        self.audit.emit(
            AuditEvent::new(
                Some(session_id.clone()),
                correlation_id,
                "escalation.agent_joined",
                AuditCategory::Escalation,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("agent_id", agent_id),
        );
        info!(
            event_name = "escalation.agent_joined",
            correlation_id = %correlation_id,
            session_id = %session_id,
            agent_id = %agent_id,
            "agent joined session"
        );
        Ok(updated)
    }

    /// Returns control to the flow engine at the step where escalation began.
    pub async fn end_escalation(
        &self,
        session_id: &SessionId,
        correlation_id: &str,
    ) -> Result<Session, ApplicationError> {
        let _guard = self.locks.acquire(session_id).await;
        let session = self.store.get(session_id).await?;
        let resume = resume_state(&session);
        let outcome = transition(&session.conversation_state(), &FlowEvent::EscalationEnded, Some(&resume))
            .map_err(DomainError::from)?;

        let updated = self
            .store
            .update(session_id, SessionPatch::default().expect_version(session.state_version).clear_escalation())
            .await?;
        self.audit.emit(
            AuditEvent::new(
                Some(session_id.clone()),
                correlation_id,
                "escalation.ended",
                AuditCategory::Escalation,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("resumed_state", format!("{:?}", outcome.to)),
        );
        info!(
            event_name = "escalation.ended",
            correlation_id = %correlation_id,
            session_id = %session_id,
            "control returned to the flow engine"
        );
        Ok(updated)
    }

    pub async fn status(&self, session_id: &SessionId) -> Result<EscalationStatus, ApplicationError> {
        let session = self.store.get(session_id).await?;
        Ok(EscalationStatus {
            session_id: session.session_id,
            escalated: session.escalated,
            agent_id: session.agent_id,
            reason: session.escalation_reason,
        })
    }

    async fn enqueue(&self, record: &EscalationRecord, correlation_id: &str) {
        let Some(queue) = &self.queue else {
            warn!(
                event_name = "escalation.queue.missing",
                correlation_id = %correlation_id,
                session_id = %record.session_id,
                "no queue backend configured, escalation not persisted"
            );
            return;
        };

        if let Err(queue_error) = queue.add_to_queue(record).await {
            error!(
                event_name = "escalation.queue.failed",
                correlation_id = %correlation_id,
                session_id = %record.session_id,
                error = %queue_error,
                "failed to queue escalation record"
            );
        }
    }
}

/// The bot-controlled state a session returns to after an escalation.
fn resume_state(session: &Session) -> ConversationState {
    match (session.flow_status, &session.current_flow) {
        (FlowStatus::InFlow, Some(flow_id)) => {
            ConversationState::InFlow { flow_id: flow_id.clone(), step_index: session.current_step }
        }
        (FlowStatus::Completed, Some(flow_id)) => {
            ConversationState::Completed { flow_id: flow_id.clone() }
        }
        _ => ConversationState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::EscalationService;
    use crate::audit::InMemoryAuditSink;
    use crate::domain::escalation::{EscalationReason, EscalationRecord};
    use crate::domain::session::{ConversationState, SessionPatch};
    use crate::errors::{ApplicationError, StoreError};
    use crate::store::{
        EscalationQueue, InMemoryEscalationQueue, InMemorySessionStore, SessionLocks, SessionStore,
    };

    struct BrokenQueue;

    #[async_trait]
    impl EscalationQueue for BrokenQueue {
        async fn add_to_queue(&self, _record: &EscalationRecord) -> Result<(), StoreError> {
            Err(StoreError::Backend("queue offline".to_owned()))
        }
    }

    fn service(
        store: Arc<InMemorySessionStore>,
        queue: Option<Arc<dyn EscalationQueue>>,
    ) -> EscalationService {
        EscalationService::new(
            store,
            queue,
            Arc::new(SessionLocks::default()),
            Arc::new(InMemoryAuditSink::default()),
        )
    }

    #[tokio::test]
    async fn escalation_marks_session_and_queues_record() {
        let store = Arc::new(InMemorySessionStore::default());
        let queue = Arc::new(InMemoryEscalationQueue::default());
        let service = service(store.clone(), Some(queue.clone()));
        let session = store.create("u1").await.expect("create");

        let mut metadata = BTreeMap::new();
        metadata.insert("channel".to_owned(), "web".to_owned());
        let record = service
            .escalate_to_human(&session.session_id, EscalationReason::UserRequested, metadata, "req-1")
            .await
            .expect("escalate");

        assert_eq!(record.user_id, "u1");
        assert_eq!(record.reason, "user_requested");
        let stored = store.get(&session.session_id).await.expect("get");
        assert!(stored.escalated);
        assert_eq!(stored.agent_id, None);
        assert_eq!(queue.records().await, vec![record]);
    }

    #[tokio::test]
    async fn missing_or_failing_queue_still_escalates() {
        let store = Arc::new(InMemorySessionStore::default());
        let without_queue = service(store.clone(), None);
        let first = store.create("u1").await.expect("create");
        without_queue
            .escalate_to_human(&first.session_id, EscalationReason::UserRequested, BTreeMap::new(), "req-2")
            .await
            .expect("escalate without queue");
        assert!(store.get(&first.session_id).await.expect("get").escalated);

        let with_broken_queue = service(store.clone(), Some(Arc::new(BrokenQueue)));
        let second = store.create("u2").await.expect("create");
        with_broken_queue
            .escalate_to_human(&second.session_id, EscalationReason::AmbiguousIntent, BTreeMap::new(), "req-3")
            .await
            .expect("escalate with broken queue");
        assert!(store.get(&second.session_id).await.expect("get").escalated);
    }

    #[tokio::test]
    async fn agent_join_then_end_resumes_flow_step() {
        let store = Arc::new(InMemorySessionStore::default());
        let service = service(store.clone(), None);
        let session = store.create("u1").await.expect("create");
        store
            .update(
                &session.session_id,
                SessionPatch::default().enter_flow("travel_insurance").advance_to(2).with_step_failures(3),
            )
            .await
            .expect("seed flow");

        service
            .escalate_to_human(&session.session_id, EscalationReason::ValidationFailures, BTreeMap::new(), "req-4")
            .await
            .expect("escalate");
        let joined = service.agent_join(&session.session_id, "agent-9", "req-5").await.expect("join");
        assert!(joined.escalated);
        assert_eq!(joined.agent_id.as_deref(), Some("agent-9"));

        let status = service.status(&session.session_id).await.expect("status");
        assert_eq!(status.reason.as_deref(), Some("validation_failures"));

        let ended = service.end_escalation(&session.session_id, "req-6").await.expect("end");
        assert!(!ended.escalated);
        assert_eq!(ended.agent_id, None);
        assert_eq!(ended.step_failures, 0);
        assert_eq!(
            ended.conversation_state(),
            ConversationState::InFlow { flow_id: "travel_insurance".to_owned(), step_index: 2 }
        );
    }

    #[tokio::test]
    async fn ending_an_inactive_escalation_is_rejected() {
        let store = Arc::new(InMemorySessionStore::default());
        let service = service(store.clone(), None);
        let session = store.create("u1").await.expect("create");

        let error = service.end_escalation(&session.session_id, "req-7").await.expect_err("not escalated");
        assert!(matches!(error, ApplicationError::Domain(_)));
    }

    #[tokio::test]
    async fn unknown_session_cannot_be_escalated() {
        let store = Arc::new(InMemorySessionStore::default());
        let service = service(store, None);

        let error = service
            .escalate_to_human(&"nope".into(), EscalationReason::UserRequested, BTreeMap::new(), "req-8")
            .await
            .expect_err("missing session");
        assert!(matches!(error, ApplicationError::SessionNotFound(_)));
    }
}
