//! SessionManager: session persistence, continuations and the
//! per-conversation serialization locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, Error, FlowError};
use crate::flow::model::ReplyType;
use crate::store::Database;

use super::model::{ContinuationKind, PendingContinuation, Session};

/// Async mutexes keyed by conversation id.
///
/// Entries are weak so idle conversations do not accumulate; dead entries are
/// pruned whenever a new lock is created.
#[derive(Default)]
pub struct ConversationLocks {
    locks: StdMutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one conversation.
    pub async fn lock(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            match locks.get(conversation_id).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let fresh = Arc::new(Mutex::new(()));
                    locks.insert(conversation_id.to_string(), Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        mutex.lock_owned().await
    }

    /// Number of conversations with a live lock handle.
    pub fn live(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Owns session and continuation records.
pub struct SessionManager {
    db: Arc<dyn Database>,
    locks: ConversationLocks,
}

impl SessionManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            locks: ConversationLocks::new(),
        }
    }

    pub async fn lock(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(conversation_id).await
    }

    /// Create an active session pinned to a flow version.
    pub async fn create(
        &self,
        conversation_id: &str,
        flow_id: Uuid,
        flow_version: i64,
    ) -> Result<Session, Error> {
        let session = Session::new(conversation_id, flow_id, flow_version);
        match self.db.insert_session(&session).await {
            Ok(()) => {
                info!(
                    session_id = %session.id,
                    conversation_id,
                    flow_id = %flow_id,
                    flow_version,
                    "Session started"
                );
                Ok(session)
            }
            Err(DatabaseError::Constraint(_)) => Err(FlowError::SessionConflict {
                conversation_id: conversation_id.to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Session>, Error> {
        Ok(self.db.get_session(id).await?)
    }

    pub async fn active(&self, conversation_id: &str) -> Result<Option<Session>, Error> {
        Ok(self.db.get_active_session(conversation_id).await?)
    }

    pub async fn list(&self, conversation_id: &str) -> Result<Vec<Session>, Error> {
        Ok(self.db.list_sessions(conversation_id).await?)
    }

    /// Persist the session. Terminal sessions also drop their continuation.
    pub async fn save(&self, session: &mut Session) -> Result<(), Error> {
        session.updated_at = Utc::now();
        self.db.update_session(session).await?;
        if session.status.is_terminal() {
            self.db.delete_session_continuations(session.id).await?;
        }
        Ok(())
    }

    /// Arm the session's single continuation, replacing any earlier one.
    pub async fn arm(
        &self,
        session: &Session,
        node_id: &str,
        kind: ContinuationKind,
        deadline: Option<DateTime<Utc>>,
        reply_type: Option<ReplyType>,
    ) -> Result<PendingContinuation, Error> {
        let continuation = PendingContinuation::new(session, node_id, kind, deadline, reply_type);
        self.db.upsert_continuation(&continuation).await?;
        debug!(
            session_id = %session.id,
            node_id,
            %kind,
            deadline = ?deadline,
            "Continuation armed"
        );
        Ok(continuation)
    }

    pub async fn disarm(&self, session_id: Uuid) -> Result<(), Error> {
        Ok(self.db.delete_session_continuations(session_id).await?)
    }

    pub async fn continuation(&self, id: Uuid) -> Result<Option<PendingContinuation>, Error> {
        Ok(self.db.get_continuation(id).await?)
    }

    pub async fn current_continuation(
        &self,
        session_id: Uuid,
    ) -> Result<Option<PendingContinuation>, Error> {
        Ok(self.db.get_session_continuation(session_id).await?)
    }

    pub async fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingContinuation>, Error> {
        Ok(self.db.due_continuations(now, limit).await?)
    }
}
