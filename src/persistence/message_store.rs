//! `MessageStore` port.
//!
//! Cross-store consistency ("a transaction that also stamps
//! `sessions.last_message_date`") is composed at the [`crate::writer`]
//! layer by calling this port and then [`super::SessionStore::update_meta`]
//! in sequence — the two stores may be different backends in a real
//! system, so the core cannot assume a shared database transaction spans
//! them; it only guarantees the writer never does one without the other.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Mutex;

use crate::error::PersistenceError;
use crate::ids::{MessageId, SessionId};
use crate::model::{Message, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Before,
    After,
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    pub items: Vec<Message>,
    pub has_more: bool,
    pub next_cursor: Option<MessageId>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(
        &self,
        id: MessageId,
        session_id: SessionId,
        kind: MessageType,
        data: Vec<u8>,
        metadata: Map<String, Value>,
    ) -> Result<Message, PersistenceError>;

    async fn get(&self, id: MessageId) -> Result<Message, PersistenceError>;

    async fn update_metadata(
        &self,
        id: MessageId,
        metadata: Map<String, Value>,
    ) -> Result<Message, PersistenceError>;

    /// Fetches `limit + 1` rows internally and trims to `limit`, setting
    /// `has_more` when the extra row existed.
    async fn list_by_session(
        &self,
        session_id: SessionId,
        limit: usize,
        cursor: Option<MessageId>,
        direction: Direction,
    ) -> Result<MessagePage, PersistenceError>;

    /// Strictly-after scan used by "from checkpoint" prompt assembly.
    async fn list_after_message(
        &self,
        session_id: SessionId,
        after_id: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, PersistenceError>;

    async fn list_by_type(
        &self,
        session_id: SessionId,
        kind: MessageType,
    ) -> Result<Vec<Message>, PersistenceError>;

    async fn get_latest(&self, session_id: SessionId) -> Result<Option<Message>, PersistenceError>;

    async fn count_by_session(&self, session_id: SessionId) -> Result<usize, PersistenceError>;

    async fn count_by_type(
        &self,
        session_id: SessionId,
        kind: MessageType,
    ) -> Result<usize, PersistenceError>;

    async fn delete(&self, id: MessageId) -> Result<(), PersistenceError>;

    /// Cascade-delete every message belonging to `session_id` (used by
    /// `SessionStore::delete`'s cascade).
    async fn delete_by_session(&self, session_id: SessionId) -> Result<(), PersistenceError>;
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    rows: Mutex<Vec<Message>>,
    by_id: DashMap<MessageId, usize>,
}

impl InMemoryMessageStore {
    fn ordered_session_rows(&self, session_id: SessionId) -> Vec<Message> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<Message> = rows
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.message_id);
        out
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(
        &self,
        id: MessageId,
        session_id: SessionId,
        kind: MessageType,
        data: Vec<u8>,
        metadata: Map<String, Value>,
    ) -> Result<Message, PersistenceError> {
        let message = Message {
            message_id: id,
            session_id,
            date: Utc::now(),
            kind,
            data,
            metadata,
        };
        let mut rows = self.rows.lock().unwrap();
        rows.push(message.clone());
        self.by_id.insert(id, rows.len() - 1);
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Message, PersistenceError> {
        let idx = *self
            .by_id
            .get(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("message {id}"),
            })?;
        let rows = self.rows.lock().unwrap();
        rows.get(idx).cloned().ok_or_else(|| PersistenceError::NotFound {
            what: format!("message {id}"),
        })
    }

    async fn update_metadata(
        &self,
        id: MessageId,
        metadata: Map<String, Value>,
    ) -> Result<Message, PersistenceError> {
        let idx = *self
            .by_id
            .get(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("message {id}"),
            })?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(idx).ok_or_else(|| PersistenceError::NotFound {
            what: format!("message {id}"),
        })?;
        row.metadata = metadata;
        Ok(row.clone())
    }

    async fn list_by_session(
        &self,
        session_id: SessionId,
        limit: usize,
        cursor: Option<MessageId>,
        direction: Direction,
    ) -> Result<MessagePage, PersistenceError> {
        let all = self.ordered_session_rows(session_id);
        let filtered: Vec<Message> = match (cursor, direction) {
            (None, Direction::After) => all,
            (None, Direction::Before) => all,
            (Some(cursor), Direction::After) => all
                .into_iter()
                .filter(|m| m.message_id > cursor)
                .collect(),
            (Some(cursor), Direction::Before) => all
                .into_iter()
                .filter(|m| m.message_id < cursor)
                .rev()
                .collect(),
        };

        let mut fetched: Vec<Message> = filtered.into_iter().take(limit + 1).collect();
        let has_more = fetched.len() > limit;
        fetched.truncate(limit);

        let next_cursor = if has_more {
            match direction {
                Direction::After => fetched.last().map(|m| m.message_id),
                Direction::Before => fetched.last().map(|m| m.message_id),
            }
        } else {
            None
        };

        if direction == Direction::Before {
            fetched.reverse();
        }

        Ok(MessagePage {
            items: fetched,
            has_more,
            next_cursor,
        })
    }

    async fn list_after_message(
        &self,
        session_id: SessionId,
        after_id: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>, PersistenceError> {
        Ok(self
            .ordered_session_rows(session_id)
            .into_iter()
            .filter(|m| m.message_id > after_id)
            .take(limit)
            .collect())
    }

    async fn list_by_type(
        &self,
        session_id: SessionId,
        kind: MessageType,
    ) -> Result<Vec<Message>, PersistenceError> {
        Ok(self
            .ordered_session_rows(session_id)
            .into_iter()
            .filter(|m| m.kind == kind)
            .collect())
    }

    async fn get_latest(&self, session_id: SessionId) -> Result<Option<Message>, PersistenceError> {
        Ok(self.ordered_session_rows(session_id).into_iter().last())
    }

    async fn count_by_session(&self, session_id: SessionId) -> Result<usize, PersistenceError> {
        Ok(self.ordered_session_rows(session_id).len())
    }

    async fn count_by_type(
        &self,
        session_id: SessionId,
        kind: MessageType,
    ) -> Result<usize, PersistenceError> {
        Ok(self
            .ordered_session_rows(session_id)
            .into_iter()
            .filter(|m| m.kind == kind)
            .count())
    }

    async fn delete(&self, id: MessageId) -> Result<(), PersistenceError> {
        let idx = self
            .by_id
            .remove(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("message {id}"),
            })?
            .1;
        let mut rows = self.rows.lock().unwrap();
        rows.remove(idx);
        // Re-index everything after the removed row.
        self.by_id.clear();
        for (i, m) in rows.iter().enumerate() {
            self.by_id.insert(m.message_id, i);
        }
        Ok(())
    }

    async fn delete_by_session(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|m| m.session_id != session_id);
        self.by_id.clear();
        for (i, m) in rows.iter().enumerate() {
            self.by_id.insert(m.message_id, i);
        }
        Ok(())
    }
}
