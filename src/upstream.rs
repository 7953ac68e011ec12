//! Upstream notification emitter.
//!
//! Fire-and-forget: every emit is a typed event on a per-session or
//! per-message topic, sent to the actor's parent (the relay), which
//! relays it on to the user's hub. Emits never block the bus on a slow
//! or absent subscriber — the channel is unbounded for that reason.

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::ids::{MessageId, SessionId};

/// `session:<session_id>`.
pub fn session_topic(session_id: SessionId) -> String {
    format!("session:{session_id}")
}

/// `session:<session_id>:message:<message_id>`.
pub fn message_topic(session_id: SessionId, message_id: MessageId) -> String {
    format!("session:{session_id}:message:{message_id}")
}

/// Fields merged by a session-level `update` emit; omitted fields leave
/// the subscriber's view of that field untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub title: Option<String>,
    pub public_meta: Option<Map<String, Value>>,
    pub artifact_added: Option<String>,
    pub last_message_date: Option<String>,
}

/// The closed set of emit types.
#[derive(Debug, Clone)]
pub enum Emit {
    Update {
        session_id: SessionId,
        fields: SessionUpdate,
    },
    Error {
        session_id: SessionId,
        message_id: Option<MessageId>,
        code: String,
        message: String,
    },
    Received {
        session_id: SessionId,
        message_id: MessageId,
    },
    ResponseStarted {
        session_id: SessionId,
        message_id: MessageId,
    },
    Invalidate {
        session_id: SessionId,
        message_id: MessageId,
    },
    CommandResponse {
        session_id: SessionId,
        request_id: String,
        success: bool,
        code: Option<String>,
        message: Option<String>,
    },
    Content {
        session_id: SessionId,
        message_id: MessageId,
        content: String,
    },
    FunctionCall {
        session_id: SessionId,
        message_id: MessageId,
        name: String,
        args: Value,
    },
    FunctionSuccess {
        session_id: SessionId,
        message_id: MessageId,
        result: Value,
    },
    FunctionError {
        session_id: SessionId,
        message_id: MessageId,
        message: String,
    },
}

impl Emit {
    pub fn session_id(&self) -> SessionId {
        match self {
            Emit::Update { session_id, .. }
            | Emit::Error { session_id, .. }
            | Emit::Received { session_id, .. }
            | Emit::ResponseStarted { session_id, .. }
            | Emit::Invalidate { session_id, .. }
            | Emit::CommandResponse { session_id, .. }
            | Emit::Content { session_id, .. }
            | Emit::FunctionCall { session_id, .. }
            | Emit::FunctionSuccess { session_id, .. }
            | Emit::FunctionError { session_id, .. } => *session_id,
        }
    }

    /// The topic this emit is published on: the session topic for
    /// session-level events, the message topic otherwise.
    pub fn topic(&self) -> String {
        match self {
            Emit::Update { session_id, .. }
            | Emit::CommandResponse { session_id, .. } => session_topic(*session_id),
            Emit::Error {
                session_id,
                message_id: None,
                ..
            } => session_topic(*session_id),
            Emit::Error {
                session_id,
                message_id: Some(mid),
                ..
            } => message_topic(*session_id, *mid),
            Emit::Received { session_id, message_id }
            | Emit::ResponseStarted { session_id, message_id }
            | Emit::Invalidate { session_id, message_id }
            | Emit::Content { session_id, message_id, .. }
            | Emit::FunctionCall { session_id, message_id, .. }
            | Emit::FunctionSuccess { session_id, message_id, .. }
            | Emit::FunctionError { session_id, message_id, .. } => {
                message_topic(*session_id, *message_id)
            }
        }
    }
}

/// Handle the bus/handlers hold to publish emits; cheap to clone.
#[derive(Clone)]
pub struct Upstream {
    tx: mpsc::UnboundedSender<Emit>,
}

impl Upstream {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Emit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire-and-forget: a closed receiver (parent already gone) is not an
    /// error at this layer.
    pub fn emit(&self, event: Emit) {
        let _ = self.tx.send(event);
    }

    pub fn update(&self, session_id: SessionId, fields: SessionUpdate) {
        self.emit(Emit::Update { session_id, fields });
    }

    pub fn error(&self, session_id: SessionId, message_id: Option<MessageId>, code: &str, message: impl Into<String>) {
        self.emit(Emit::Error {
            session_id,
            message_id,
            code: code.to_string(),
            message: message.into(),
        });
    }

    pub fn command_response(
        &self,
        session_id: SessionId,
        request_id: impl Into<String>,
        success: bool,
        code: Option<String>,
        message: Option<String>,
    ) {
        self.emit(Emit::CommandResponse {
            session_id,
            request_id: request_id.into(),
            success,
            code,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_level_emits_use_the_message_topic() {
        let session_id = SessionId::new();
        let message_id = MessageId::new();
        let emit = Emit::Content {
            session_id,
            message_id,
            content: "hi".to_string(),
        };
        assert_eq!(emit.topic(), format!("session:{session_id}:message:{message_id}"));
    }

    #[test]
    fn session_level_emits_use_the_session_topic() {
        let session_id = SessionId::new();
        let emit = Emit::Update {
            session_id,
            fields: SessionUpdate::default(),
        };
        assert_eq!(emit.topic(), format!("session:{session_id}"));
    }

    #[tokio::test]
    async fn emit_after_receiver_drop_does_not_panic() {
        let (upstream, rx) = Upstream::new();
        drop(rx);
        upstream.update(SessionId::new(), SessionUpdate::default());
    }
}
