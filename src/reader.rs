//! `SessionReader`: the read side of a session's persisted state.
//!
//! Opened with a session id, authenticates via the security port, and
//! caches the session row and parsed primary context. Fluent query
//! builders project `messages()` / `artifacts()` / `contexts()`; `reset()`
//! invalidates the cache after a [`crate::writer::SessionWriter`]
//! mutation the reader's view depends on.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{PersistenceError, ReaderError};
use crate::ids::{ArtifactId, MessageId, SessionId};
use crate::model::{Artifact, ArtifactKind, Message, MessageType, PrimaryContext, Session, SessionContext};
use crate::persistence::Ports;
use crate::registry::{Actor, SecurityPort};

pub struct SessionReader {
    ports: Arc<Ports>,
    security: Arc<dyn SecurityPort>,
    session_id: SessionId,
    session: RwLock<Option<Session>>,
    context: RwLock<Option<PrimaryContext>>,
}

impl SessionReader {
    /// Opens a reader against `session_id`, authenticating `actor` for
    /// read access via the security port.
    pub async fn open(
        ports: Arc<Ports>,
        security: Arc<dyn SecurityPort>,
        session_id: SessionId,
        actor: &Actor,
    ) -> Result<Self, ReaderError> {
        let session = ports.sessions.get(session_id, None).await?;
        security.authorize_read(actor, &session).await?;
        Ok(Self {
            ports,
            security,
            session_id,
            session: RwLock::new(Some(session)),
            context: RwLock::new(None),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Cached snapshot of the session row, fetching on first access (or
    /// after [`Self::reset`]).
    pub async fn state(&self) -> Result<Session, PersistenceError> {
        if let Some(s) = self.session.read().await.clone() {
            return Ok(s);
        }
        let s = self.ports.sessions.get(self.session_id, None).await?;
        *self.session.write().await = Some(s.clone());
        Ok(s)
    }

    /// Cached primary-context mapping, fetching on first access.
    pub async fn primary_context(&self) -> Result<PrimaryContext, PersistenceError> {
        if let Some(c) = self.context.read().await.clone() {
            return Ok(c);
        }
        let c = self.ports.contexts.get(self.session_id).await?;
        *self.context.write().await = Some(c.clone());
        Ok(c)
    }

    /// Forces the next `state()`/`primary_context()` call to re-fetch.
    pub async fn reset(&self) {
        *self.session.write().await = None;
        *self.context.write().await = None;
    }

    #[allow(dead_code)]
    fn security(&self) -> &Arc<dyn SecurityPort> {
        &self.security
    }

    pub fn messages(&self) -> MessageQuery<'_> {
        MessageQuery {
            reader: self,
            limit: None,
            offset: 0,
            after: None,
            from_checkpoint: false,
            of_type: None,
        }
    }

    pub fn artifacts(&self) -> ArtifactQuery<'_> {
        ArtifactQuery {
            reader: self,
            of_kind: None,
        }
    }

    pub fn contexts(&self) -> SessionContextQuery<'_> {
        SessionContextQuery {
            reader: self,
            of_type: None,
        }
    }
}

/// Fluent query over a session's messages.
pub struct MessageQuery<'a> {
    reader: &'a SessionReader,
    limit: Option<usize>,
    offset: usize,
    after: Option<MessageId>,
    from_checkpoint: bool,
    of_type: Option<MessageType>,
}

impl MessageQuery<'_> {
    pub fn last(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, k: usize) -> Self {
        self.offset = k;
        self
    }

    pub fn after(mut self, id: MessageId) -> Self {
        self.after = Some(id);
        self
    }

    /// Anchors the query strictly after the session's current checkpoint
    /// cursor: `message_id > mid`, not `>=`.
    pub fn from_checkpoint(mut self) -> Self {
        self.from_checkpoint = true;
        self
    }

    pub fn of_type(mut self, kind: MessageType) -> Self {
        self.of_type = Some(kind);
        self
    }

    async fn fetch(&self) -> Result<Vec<Message>, PersistenceError> {
        let effective_after = if self.from_checkpoint {
            self.reader
                .primary_context()
                .await?
                .current_checkpoint_id()
        } else {
            self.after
        };

        let mut items = if let Some(after_id) = effective_after {
            self.reader
                .ports
                .messages
                .list_after_message(self.reader.session_id, after_id, usize::MAX)
                .await?
        } else {
            let mut all = Vec::new();
            let mut cursor = None;
            loop {
                let page = self
                    .reader
                    .ports
                    .messages
                    .list_by_session(
                        self.reader.session_id,
                        500,
                        cursor,
                        crate::persistence::Direction::After,
                    )
                    .await?;
                all.extend(page.items);
                if !page.has_more {
                    break;
                }
                cursor = page.next_cursor;
            }
            all
        };

        if let Some(kind) = self.of_type {
            items.retain(|m| m.kind == kind);
        }
        if self.offset > 0 {
            items = items.into_iter().skip(self.offset).collect();
        }
        if let Some(limit) = self.limit {
            let len = items.len();
            items = items.into_iter().skip(len.saturating_sub(limit)).collect();
        }
        Ok(items)
    }

    pub async fn all(self) -> Result<Vec<Message>, PersistenceError> {
        self.fetch().await
    }

    pub async fn one(self) -> Result<Option<Message>, PersistenceError> {
        Ok(self.fetch().await?.into_iter().next_back())
    }

    pub async fn count(self) -> Result<usize, PersistenceError> {
        Ok(self.fetch().await?.len())
    }
}

/// Fluent query over a session's artifacts.
pub struct ArtifactQuery<'a> {
    reader: &'a SessionReader,
    of_kind: Option<ArtifactKind>,
}

impl ArtifactQuery<'_> {
    pub fn of_kind(mut self, kind: ArtifactKind) -> Self {
        self.of_kind = Some(kind);
        self
    }

    async fn fetch(&self) -> Result<Vec<Artifact>, PersistenceError> {
        let mut items = self
            .reader
            .ports
            .artifacts
            .list_by_session(self.reader.session_id)
            .await?;
        if let Some(kind) = &self.of_kind {
            items.retain(|a| &a.kind == kind);
        }
        Ok(items)
    }

    pub async fn all(self) -> Result<Vec<Artifact>, PersistenceError> {
        self.fetch().await
    }

    pub async fn one(self, id: ArtifactId) -> Result<Artifact, PersistenceError> {
        self.reader.ports.artifacts.get(id).await
    }

    pub async fn count(self) -> Result<usize, PersistenceError> {
        Ok(self.fetch().await?.len())
    }
}

/// Fluent query over a session's durable memory rows.
pub struct SessionContextQuery<'a> {
    reader: &'a SessionReader,
    of_type: Option<String>,
}

impl SessionContextQuery<'_> {
    pub fn of_type(mut self, kind: impl Into<String>) -> Self {
        self.of_type = Some(kind.into());
        self
    }

    pub async fn all(self) -> Result<Vec<SessionContext>, PersistenceError> {
        match &self.of_type {
            Some(kind) => {
                self.reader
                    .ports
                    .session_contexts
                    .list_by_type(self.reader.session_id, kind)
                    .await
            }
            None => {
                self.reader
                    .ports
                    .session_contexts
                    .list_by_session(self.reader.session_id)
                    .await
            }
        }
    }

    pub async fn one(self) -> Result<Option<SessionContext>, PersistenceError> {
        Ok(self.all().await?.into_iter().last())
    }

    pub async fn count(self) -> Result<usize, PersistenceError> {
        Ok(self.all().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::persistence::session_store::new_session_row;
    use crate::registry::ScopedSecurity;
    use serde_json::Map;

    async fn setup() -> (Arc<Ports>, Arc<ScopedSecurity>, SessionId, Actor) {
        let ports = Arc::new(Ports::in_memory());
        let user_id = UserId::from_uuid(uuid::Uuid::now_v7());
        let row = new_session_row(user_id, "chat", Map::new());
        let session_id = row.session_id;
        ports.sessions.create(row).await.unwrap();
        ports.contexts.create(session_id).await.unwrap();
        let security = Arc::new(ScopedSecurity {
            required_scope: "test".to_string(),
        });
        let actor = Actor {
            user_id,
            scope: "test".to_string(),
        };
        (ports, security, session_id, actor)
    }

    #[tokio::test]
    async fn caches_session_state_until_reset() {
        let (ports, security, session_id, actor) = setup().await;
        let reader = SessionReader::open(ports.clone(), security, session_id, &actor)
            .await
            .unwrap();
        let first = reader.state().await.unwrap();

        ports
            .sessions
            .update_meta(
                session_id,
                crate::model::SessionMetaPatch {
                    title: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let cached = reader.state().await.unwrap();
        assert_eq!(cached.title, first.title);

        reader.reset().await;
        let refreshed = reader.state().await.unwrap();
        assert_eq!(refreshed.title, Some("renamed".to_string()));
    }

    #[tokio::test]
    async fn from_checkpoint_is_strictly_after() {
        let (ports, security, session_id, actor) = setup().await;
        let reader = SessionReader::open(ports.clone(), security, session_id, &actor)
            .await
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..3 {
            let id = MessageId::new();
            ports
                .messages
                .create(
                    id,
                    session_id,
                    MessageType::User,
                    format!("m{i}").into_bytes(),
                    Map::new(),
                )
                .await
                .unwrap();
            ids.push(id);
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        let mut ctx = reader.primary_context().await.unwrap();
        ctx.entries.insert(
            "current_checkpoint_id".to_string(),
            serde_json::Value::String(ids[0].to_string()),
        );
        ports.contexts.update(session_id, ctx).await.unwrap();
        reader.reset().await;

        let after = reader.messages().from_checkpoint().all().await.unwrap();
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|m| m.message_id > ids[0]));
    }

    #[tokio::test]
    async fn rejects_actor_with_wrong_scope() {
        let (ports, security, session_id, _actor) = setup().await;
        let intruder = Actor {
            user_id: UserId::from_uuid(uuid::Uuid::now_v7()),
            scope: "other".to_string(),
        };
        let err = SessionReader::open(ports, security, session_id, &intruder)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Security(_)));
    }
}
