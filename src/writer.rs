//! `SessionWriter`: the write side of a session's persisted state.
//!
//! Always opened against an actor authenticated for write access. Owns
//! every mutation of a session's row, messages, artifacts, and context
//! KV; the [`crate::reader::SessionReader`] sharing this session must be
//! `reset()` by the caller after a mutation it depends on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::WriterError;
use crate::ids::{ArtifactId, MessageId, SessionContextId, SessionId};
use crate::model::{
    Artifact, ArtifactKind, Message, MessageType, Session, SessionMetaPatch, SessionStatus,
};
use crate::persistence::Ports;
use crate::registry::{Actor, SecurityPort};

pub struct SessionWriter {
    ports: Arc<Ports>,
    session_id: SessionId,
}

impl SessionWriter {
    /// Opens a writer against `session_id`, authenticating `actor` for
    /// write access via the security port.
    pub async fn open(
        ports: Arc<Ports>,
        security: Arc<dyn SecurityPort>,
        session_id: SessionId,
        actor: &Actor,
    ) -> Result<Self, WriterError> {
        let session = ports.sessions.get(session_id, None).await?;
        security.authorize_write(actor, &session).await?;
        Ok(Self { ports, session_id })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn update_meta(&self, patch: SessionMetaPatch) -> Result<Session, WriterError> {
        Ok(self.ports.sessions.update_meta(self.session_id, patch).await?)
    }

    pub async fn update_title(&self, title: impl Into<String>) -> Result<Session, WriterError> {
        self.update_meta(SessionMetaPatch {
            title: Some(title.into()),
            ..Default::default()
        })
        .await
    }

    /// Transitions `status`; when `error_msg` is given, merges it into
    /// `meta.error`.
    pub async fn update_status(
        &self,
        status: SessionStatus,
        error_msg: Option<String>,
    ) -> Result<Session, WriterError> {
        let mut meta = self.ports.sessions.get(self.session_id, None).await?.meta;
        if let Some(msg) = error_msg {
            meta.error = Some(msg);
        }
        self.update_meta(SessionMetaPatch {
            status: Some(status),
            meta: Some(meta),
            ..Default::default()
        })
        .await
    }

    /// Appends a message, stamping `sessions.last_message_date` in the
    /// same logical step. Composed here (rather than inside one store
    /// transaction) since messages and sessions may be different backends.
    pub async fn add_message(
        &self,
        kind: MessageType,
        content: Vec<u8>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Message, WriterError> {
        let mut metadata = metadata.unwrap_or_default();

        let id = match metadata.get("message_id").and_then(|v| v.as_str()) {
            Some(s) => s.parse().unwrap_or_else(|_| MessageId::new()),
            None => MessageId::new(),
        };
        metadata.remove("message_id");

        if matches!(kind, MessageType::Assistant) {
            let session = self.ports.sessions.get(self.session_id, None).await?;
            if !metadata.contains_key("agent") {
                if let Some(agent) = session.config.get("agent") {
                    metadata.insert("agent".to_string(), agent.clone());
                }
            }
            if !metadata.contains_key("model") {
                if let Some(model) = session.config.get("model") {
                    metadata.insert("model".to_string(), model.clone());
                }
            }
        }

        let message = self
            .ports
            .messages
            .create(id, self.session_id, kind, content, metadata)
            .await?;

        self.update_meta(SessionMetaPatch {
            last_message_date: Some(message.date),
            ..Default::default()
        })
        .await?;

        Ok(message)
    }

    pub async fn update_message_meta(
        &self,
        id: MessageId,
        metadata: Map<String, Value>,
    ) -> Result<Message, WriterError> {
        Ok(self.ports.messages.update_metadata(id, metadata).await?)
    }

    /// Stores `args` as JSON text with `status=pending`, the shape
    /// `ToolCaller`/`OperationHandlers` expect for an in-flight call.
    pub async fn add_function_call(
        &self,
        name: &str,
        args: &Value,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Message, WriterError> {
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("name".to_string(), Value::String(name.to_string()));
        metadata.insert("status".to_string(), Value::String("pending".to_string()));
        let content = serde_json::to_vec(args).unwrap_or_default();
        self.add_message(MessageType::Function, content, Some(metadata))
            .await
    }

    /// Merges the outcome of a function call into its existing metadata.
    pub async fn update_function_result(
        &self,
        id: MessageId,
        result: &Value,
        ok: bool,
        extra: Option<Map<String, Value>>,
    ) -> Result<Message, WriterError> {
        let existing = self.ports.messages.get(id).await?;
        let mut metadata = existing.metadata;
        metadata.insert(
            "status".to_string(),
            Value::String(if ok { "success".to_string() } else { "error".to_string() }),
        );
        metadata.insert("result".to_string(), result.clone());
        if let Some(extra) = extra {
            for (k, v) in extra {
                metadata.insert(k, v);
            }
        }
        self.update_message_meta(id, metadata).await
    }

    pub async fn create_artifact(
        &self,
        kind: ArtifactKind,
        title: impl Into<String>,
        content: Vec<u8>,
        meta: Map<String, Value>,
    ) -> Result<Artifact, WriterError> {
        let session = self.ports.sessions.get(self.session_id, None).await?;
        let now = Utc::now();
        let artifact = Artifact {
            artifact_id: ArtifactId::new(),
            session_id: Some(self.session_id),
            user_id: session.user_id,
            kind,
            title: title.into(),
            content,
            meta,
            created_at: now,
            updated_at: now,
        };
        Ok(self.ports.artifacts.create(artifact).await?)
    }

    /// Updates an artifact, verifying it belongs to this session first.
    pub async fn update_artifact(
        &self,
        id: ArtifactId,
        title: Option<String>,
        meta: Option<Map<String, Value>>,
    ) -> Result<Artifact, WriterError> {
        let existing = self.ports.artifacts.get(id).await?;
        if existing.session_id != Some(self.session_id) {
            return Err(WriterError::ArtifactNotInSession {
                artifact: id.to_string(),
                session: self.session_id.to_string(),
            });
        }
        Ok(self.ports.artifacts.update(id, title, meta).await?)
    }

    /// Read-modify-write of a single key on the primary-context mapping.
    pub async fn set_context(&self, key: impl Into<String>, value: Value) -> Result<(), WriterError> {
        let mut ctx = self.ports.contexts.get(self.session_id).await?;
        ctx.entries.insert(key.into(), value);
        self.ports.contexts.update(self.session_id, ctx).await?;
        Ok(())
    }

    pub async fn delete_context(&self, key: &str) -> Result<(), WriterError> {
        let mut ctx = self.ports.contexts.get(self.session_id).await?;
        ctx.entries.remove(key);
        self.ports.contexts.update(self.session_id, ctx).await?;
        Ok(())
    }

    pub async fn add_session_context(
        &self,
        kind: impl Into<String>,
        text: impl Into<String>,
        time: Option<DateTime<Utc>>,
    ) -> Result<crate::model::SessionContext, WriterError> {
        Ok(self
            .ports
            .session_contexts
            .create(self.session_id, kind.into(), text.into(), time)
            .await?)
    }

    pub async fn delete_session_context(&self, id: SessionContextId) -> Result<(), WriterError> {
        Ok(self.ports.session_contexts.delete(id).await?)
    }

    pub async fn delete_session_contexts_by_type(&self, kind: &str) -> Result<usize, WriterError> {
        Ok(self
            .ports
            .session_contexts
            .delete_by_type(self.session_id, kind)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::persistence::session_store::new_session_row;
    use crate::registry::ScopedSecurity;
    use pretty_assertions::assert_eq;

    async fn setup() -> (Arc<Ports>, SessionWriter, SessionId) {
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
        let writer = SessionWriter::open(ports.clone(), security, session_id, &actor)
            .await
            .unwrap();
        (ports, writer, session_id)
    }

    #[tokio::test]
    async fn add_message_stamps_last_message_date() {
        let (ports, writer, session_id) = setup().await;
        let before = ports.sessions.get(session_id, None).await.unwrap().last_message_date;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let msg = writer
            .add_message(MessageType::User, b"hi".to_vec(), None)
            .await
            .unwrap();
        let after = ports.sessions.get(session_id, None).await.unwrap();
        assert!(after.last_message_date >= before);
        assert_eq!(after.last_message_date, msg.date);
    }

    #[tokio::test]
    async fn append_only_order_matches_insertion_order() {
        let (ports, writer, session_id) = setup().await;
        let mut ids = Vec::new();
        for i in 0..4 {
            let m = writer
                .add_message(MessageType::User, format!("m{i}").into_bytes(), None)
                .await
                .unwrap();
            ids.push(m.message_id);
        }
        let page = ports
            .messages
            .list_by_session(session_id, 10, None, crate::persistence::Direction::After)
            .await
            .unwrap();
        assert_eq!(
            page.items.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            ids
        );
    }

    #[tokio::test]
    async fn update_artifact_rejects_foreign_session() {
        let (ports, writer, session_id) = setup().await;
        let other_row = new_session_row(
            UserId::from_uuid(uuid::Uuid::now_v7()),
            "chat",
            Map::new(),
        );
        let other_id = other_row.session_id;
        ports.sessions.create(other_row).await.unwrap();

        let artifact = writer
            .create_artifact(ArtifactKind::Inline, "doc", vec![], Map::new())
            .await
            .unwrap();

        let foreign_security = Arc::new(ScopedSecurity {
            required_scope: "test".to_string(),
        });
        let foreign_writer = SessionWriter::open(
            ports.clone(),
            foreign_security,
            other_id,
            &Actor {
                user_id: ports.sessions.get(other_id, None).await.unwrap().user_id,
                scope: "test".to_string(),
            },
        )
        .await
        .unwrap();

        let err = foreign_writer
            .update_artifact(artifact.artifact_id, Some("renamed".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WriterError::ArtifactNotInSession { .. }));
        let _ = session_id;
    }
}
