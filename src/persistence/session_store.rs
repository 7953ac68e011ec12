//! `SessionStore` port.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::PersistenceError;
use crate::ids::{SessionId, UserId};
use crate::model::{Session, SessionMetaPatch, SessionStatus};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session, PersistenceError>;

    async fn get(
        &self,
        id: SessionId,
        user: Option<UserId>,
    ) -> Result<Session, PersistenceError>;

    async fn list_by_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, PersistenceError>;

    async fn count_by_user(&self, user: UserId) -> Result<usize, PersistenceError>;

    async fn update_meta(
        &self,
        id: SessionId,
        patch: SessionMetaPatch,
    ) -> Result<Session, PersistenceError>;

    /// Deletes the session row itself. The full cascade over artifacts,
    /// messages, and session-contexts is orchestrated by
    /// [`crate::persistence::Ports::delete_session`], which is the unit
    /// a real storage engine would wrap in one database transaction.
    async fn delete(&self, id: SessionId) -> Result<(), PersistenceError>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    rows: DashMap<SessionId, Session>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<Session, PersistenceError> {
        if self.rows.contains_key(&session.session_id) {
            return Err(PersistenceError::Conflict {
                reason: format!("session {} already exists", session.session_id),
            });
        }
        self.rows.insert(session.session_id, session.clone());
        Ok(session)
    }

    async fn get(
        &self,
        id: SessionId,
        user: Option<UserId>,
    ) -> Result<Session, PersistenceError> {
        let row = self
            .rows
            .get(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("session {id}"),
            })?;
        if let Some(user) = user {
            if row.user_id != user {
                return Err(PersistenceError::NotFound {
                    what: format!("session {id}"),
                });
            }
        }
        Ok(row.clone())
    }

    async fn list_by_user(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, PersistenceError> {
        let mut rows: Vec<Session> = self
            .rows
            .iter()
            .filter(|e| e.user_id == user)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|s| s.session_id);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_by_user(&self, user: UserId) -> Result<usize, PersistenceError> {
        Ok(self.rows.iter().filter(|e| e.user_id == user).count())
    }

    async fn update_meta(
        &self,
        id: SessionId,
        patch: SessionMetaPatch,
    ) -> Result<Session, PersistenceError> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("session {id}"),
            })?;
        if let Some(status) = patch.status {
            row.status = status;
        }
        if let Some(title) = patch.title {
            row.title = Some(title);
        }
        if let Some(kind) = patch.kind {
            row.kind = kind;
        }
        if let Some(config) = patch.config {
            row.config = config;
        }
        if let Some(meta) = patch.meta {
            row.meta = meta;
        }
        if let Some(public_meta) = patch.public_meta {
            row.public_meta = public_meta;
        }
        if let Some(last_message_date) = patch.last_message_date {
            row.last_message_date = last_message_date;
        }
        Ok(row.clone())
    }

    async fn delete(&self, id: SessionId) -> Result<(), PersistenceError> {
        self.rows
            .remove(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("session {id}"),
            })?;
        Ok(())
    }
}

/// Construct a fresh, idle session row ready for `SessionStore::create`.
pub fn new_session_row(
    user_id: UserId,
    kind: impl Into<String>,
    config: serde_json::Map<String, serde_json::Value>,
) -> Session {
    let session_id = SessionId::new();
    Session {
        session_id,
        user_id,
        primary_context_id: session_id,
        status: SessionStatus::Idle,
        title: None,
        kind: kind.into(),
        config,
        meta: Default::default(),
        public_meta: Default::default(),
        start_date: Utc::now(),
        last_message_date: Utc::now(),
    }
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
#[allow(dead_code)]
fn check() {
    assert_send_sync::<Arc<dyn SessionStore>>();
}
