//! Persistence ports: the storage contracts the rest of the crate is
//! written against.
//!
//! Each port is a thin `async_trait` contract; the storage engine behind
//! it is an external collaborator. Every port also ships an in-memory
//! reference implementation so the crate is runnable and testable
//! standalone.

pub mod artifact_store;
pub mod context_store;
pub mod message_store;
pub mod session_context_store;
pub mod session_store;

pub use artifact_store::{ArtifactStore, InMemoryArtifactStore};
pub use context_store::{ContextStore, InMemoryContextStore};
pub use message_store::{
    Direction, InMemoryMessageStore, MessagePage, MessageStore,
};
pub use session_context_store::{InMemorySessionContextStore, SessionContextStore};
pub use session_store::{InMemorySessionStore, SessionStore};

pub use crate::error::PersistenceError;

/// Bundles the five ports behind `Arc` so the reader/writer/relay can be
/// constructed from a single handle instead of five.
#[derive(Clone)]
pub struct Ports {
    pub sessions: std::sync::Arc<dyn SessionStore>,
    pub messages: std::sync::Arc<dyn MessageStore>,
    pub contexts: std::sync::Arc<dyn ContextStore>,
    pub session_contexts: std::sync::Arc<dyn SessionContextStore>,
    pub artifacts: std::sync::Arc<dyn ArtifactStore>,
}

impl Ports {
    /// Construct a `Ports` bundle backed entirely by the in-memory
    /// reference implementations (tests, local development).
    pub fn in_memory() -> Self {
        Self {
            sessions: std::sync::Arc::new(InMemorySessionStore::default()),
            messages: std::sync::Arc::new(InMemoryMessageStore::default()),
            contexts: std::sync::Arc::new(InMemoryContextStore::default()),
            session_contexts: std::sync::Arc::new(InMemorySessionContextStore::default()),
            artifacts: std::sync::Arc::new(InMemoryArtifactStore::default()),
        }
    }

    /// Cascade-delete a session: artifacts, messages, session-contexts,
    /// the primary context, then the session row itself.
    pub async fn delete_session(
        &self,
        id: crate::ids::SessionId,
    ) -> Result<(), crate::error::PersistenceError> {
        self.artifacts.delete_by_session(id).await?;
        self.messages.delete_by_session(id).await?;
        self.session_contexts.delete_by_session(id).await?;
        // The primary context may already be gone if this is a retry;
        // treat "not found" as success for idempotent cascade semantics.
        if let Err(e) = self.contexts.delete(id).await {
            if !matches!(e, crate::error::PersistenceError::NotFound { .. }) {
                return Err(e);
            }
        }
        self.sessions.delete(id).await
    }
}
