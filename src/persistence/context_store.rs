//! `ContextStore` port: the primary-context KV mapping, one row per
//! session.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::PersistenceError;
use crate::ids::SessionId;
use crate::model::PrimaryContext;

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn create(&self, session_id: SessionId) -> Result<PrimaryContext, PersistenceError>;

    async fn get(&self, session_id: SessionId) -> Result<PrimaryContext, PersistenceError>;

    /// Read-modify-write replaces the whole mapping in one call, keeping
    /// the atomic-update guarantee the Writer relies on for `set_context`
    /// / `delete_context`.
    async fn update(
        &self,
        session_id: SessionId,
        context: PrimaryContext,
    ) -> Result<PrimaryContext, PersistenceError>;

    async fn delete(&self, session_id: SessionId) -> Result<(), PersistenceError>;

    async fn get_by_type(
        &self,
        session_id: SessionId,
        key_prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, PersistenceError>;
}

#[derive(Default)]
pub struct InMemoryContextStore {
    rows: DashMap<SessionId, PrimaryContext>,
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn create(&self, session_id: SessionId) -> Result<PrimaryContext, PersistenceError> {
        let ctx = PrimaryContext::default();
        self.rows.insert(session_id, ctx.clone());
        Ok(ctx)
    }

    async fn get(&self, session_id: SessionId) -> Result<PrimaryContext, PersistenceError> {
        self.rows
            .get(&session_id)
            .map(|e| e.clone())
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("primary context for session {session_id}"),
            })
    }

    async fn update(
        &self,
        session_id: SessionId,
        context: PrimaryContext,
    ) -> Result<PrimaryContext, PersistenceError> {
        self.rows.insert(session_id, context.clone());
        Ok(context)
    }

    async fn delete(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        self.rows
            .remove(&session_id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("primary context for session {session_id}"),
            })?;
        Ok(())
    }

    async fn get_by_type(
        &self,
        session_id: SessionId,
        key_prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, PersistenceError> {
        let ctx = self.get(session_id).await?;
        Ok(ctx
            .entries
            .into_iter()
            .filter(|(k, _)| k.starts_with(key_prefix))
            .collect())
    }
}
