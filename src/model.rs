//! Domain entities: sessions, messages, artifacts, and contexts.
//!
//! Known metadata keys (`status`, `control`, `tokens`, `checkpoints`, ...)
//! get their own typed fields; anything else stays in a `serde_json::Map`
//! so the contract remains extensible without the Writer having to know
//! every key a tool or agent might stash on a message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::ids::{ArtifactId, MessageId, SessionContextId, SessionId, UserId};

/// `sessions.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Error,
    Failed,
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Error => "error",
            SessionStatus::Failed => "failed",
            SessionStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// `messages.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    System,
    User,
    Assistant,
    Developer,
    Function,
    PrivateFunction,
    Artifact,
    Delegation,
}

/// `artifacts.kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Inline,
    ViewRef,
    Other(String),
}

/// Rolling bookkeeping the writer maintains on `sessions.meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Running token count reported by the agent runtime across turns.
    #[serde(default)]
    pub tokens: u64,
    /// Message ids at which a checkpoint (summary) was created, most
    /// recent last.
    #[serde(default)]
    pub checkpoints: Vec<MessageId>,
    /// Last error message, set by `update_status` on transition to error.
    #[serde(default)]
    pub error: Option<String>,
    /// Anything else a tool/agent attaches; kept extensible on purpose.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub primary_context_id: SessionId,
    pub status: SessionStatus,
    pub title: Option<String>,
    pub kind: String,
    pub config: Map<String, Value>,
    pub meta: SessionMeta,
    pub public_meta: Map<String, Value>,
    pub start_date: DateTime<Utc>,
    pub last_message_date: DateTime<Utc>,
}

/// One-to-one with [`Session`]; an opaque KV mapping used for transient
/// session-wide state (notably `current_checkpoint_id`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimaryContext {
    pub entries: HashMap<String, Value>,
}

impl PrimaryContext {
    pub fn current_checkpoint_id(&self) -> Option<MessageId> {
        self.entries
            .get("current_checkpoint_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Vec<u8>,
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// The key used to pair a function-call message with its result:
    /// `metadata.call_id` when present, otherwise the message's own id.
    pub fn call_id(&self) -> String {
        self.metadata
            .get("call_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| self.message_id.to_string())
    }

    pub fn status(&self) -> Option<&str> {
        self.metadata.get("status").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub id: SessionContextId,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub session_id: Option<SessionId>,
    pub user_id: UserId,
    pub kind: ArtifactKind,
    pub title: String,
    pub content: Vec<u8>,
    pub meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Patch applied by [`crate::persistence::SessionStore::update_meta`];
/// omitted (`None`) fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionMetaPatch {
    pub status: Option<SessionStatus>,
    pub title: Option<String>,
    pub kind: Option<String>,
    pub config: Option<Map<String, Value>>,
    pub meta: Option<SessionMeta>,
    pub public_meta: Option<Map<String, Value>>,
    pub last_message_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trips_through_serde() {
        let s = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(s, "\"running\"");
        let back: SessionStatus = serde_json::from_str(&s).unwrap();
        assert_eq!(back, SessionStatus::Running);
    }

    #[test]
    fn primary_context_reads_checkpoint_cursor() {
        let mut ctx = PrimaryContext::default();
        let mid = MessageId::new();
        ctx.entries.insert(
            "current_checkpoint_id".to_string(),
            Value::String(mid.to_string()),
        );
        assert_eq!(ctx.current_checkpoint_id(), Some(mid));
    }
}
