//! `SessionContextStore` port: typed, unbounded memory rows attached to a
//! session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use crate::error::PersistenceError;
use crate::ids::{SessionContextId, SessionId};
use crate::model::SessionContext;

#[async_trait]
pub trait SessionContextStore: Send + Sync {
    async fn create(
        &self,
        session_id: SessionId,
        kind: String,
        text: String,
        time: Option<DateTime<Utc>>,
    ) -> Result<SessionContext, PersistenceError>;

    /// Ordered by `id` ascending (UUIDv7 ⇒ chronological).
    async fn list_by_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<SessionContext>, PersistenceError>;

    async fn list_by_type(
        &self,
        session_id: SessionId,
        kind: &str,
    ) -> Result<Vec<SessionContext>, PersistenceError>;

    async fn delete(&self, id: SessionContextId) -> Result<(), PersistenceError>;

    async fn delete_by_type(
        &self,
        session_id: SessionId,
        kind: &str,
    ) -> Result<usize, PersistenceError>;

    async fn delete_by_session(&self, session_id: SessionId) -> Result<(), PersistenceError>;
}

#[derive(Default)]
pub struct InMemorySessionContextStore {
    rows: Mutex<Vec<SessionContext>>,
}

#[async_trait]
impl SessionContextStore for InMemorySessionContextStore {
    async fn create(
        &self,
        session_id: SessionId,
        kind: String,
        text: String,
        time: Option<DateTime<Utc>>,
    ) -> Result<SessionContext, PersistenceError> {
        let row = SessionContext {
            id: SessionContextId::new(),
            session_id,
            kind,
            text,
            time: time.unwrap_or_else(Utc::now),
        };
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list_by_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<SessionContext>, PersistenceError> {
        let mut rows: Vec<SessionContext> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.id);
        Ok(rows)
    }

    async fn list_by_type(
        &self,
        session_id: SessionId,
        kind: &str,
    ) -> Result<Vec<SessionContext>, PersistenceError> {
        Ok(self
            .list_by_session(session_id)
            .await?
            .into_iter()
            .filter(|c| c.kind == kind)
            .collect())
    }

    async fn delete(&self, id: SessionContextId) -> Result<(), PersistenceError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|c| c.id != id);
        if rows.len() == before {
            return Err(PersistenceError::NotFound {
                what: format!("session context {id}"),
            });
        }
        Ok(())
    }

    async fn delete_by_type(
        &self,
        session_id: SessionId,
        kind: &str,
    ) -> Result<usize, PersistenceError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|c| !(c.session_id == session_id && c.kind == kind));
        Ok(before - rows.len())
    }

    async fn delete_by_session(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        self.rows
            .lock()
            .unwrap()
            .retain(|c| c.session_id != session_id);
        Ok(())
    }
}
