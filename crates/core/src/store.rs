use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use crate::domain::escalation::EscalationRecord;
use crate::domain::session::{Session, SessionId, SessionPatch};
use crate::errors::StoreError;

/// Durable per-session state. Updates to one id are atomic and serialized;
/// different ids never wait on each other.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, user_id: &str) -> Result<Session, StoreError>;

    async fn get(&self, session_id: &SessionId) -> Result<Session, StoreError>;

    async fn update(&self, session_id: &SessionId, patch: SessionPatch) -> Result<Session, StoreError>;
}

/// Destination for human-handoff requests.
#[async_trait]
pub trait EscalationQueue: Send + Sync {
    async fn add_to_queue(&self, record: &EscalationRecord) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: &str) -> Result<Session, StoreError> {
        let session = Session::new(SessionId::generate(), user_id);
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &SessionId) -> Result<Session, StoreError> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned().ok_or_else(|| StoreError::NotFound(session_id.clone()))
    }

    async fn update(&self, session_id: &SessionId, patch: SessionPatch) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session =
            sessions.get_mut(session_id).ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
        if !patch.applies_to(session) {
            return Err(StoreError::Conflict(session_id.clone()));
        }
        session.apply_patch(patch, Utc::now());
        Ok(session.clone())
    }
}

#[derive(Default)]
pub struct InMemoryEscalationQueue {
    records: RwLock<Vec<EscalationRecord>>,
}

impl InMemoryEscalationQueue {
    pub async fn records(&self) -> Vec<EscalationRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl EscalationQueue for InMemoryEscalationQueue {
    async fn add_to_queue(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

const PRUNE_THRESHOLD: usize = 1024;

/// Per-session turn locks.
///
/// A guard is held from reading a session until its turn is committed, so two
/// turns for one session never interleave. Locks for idle sessions are
/// dropped once the table grows past a threshold.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, session_id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(session_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
