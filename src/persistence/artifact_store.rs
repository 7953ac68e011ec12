//! `ArtifactStore` port.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::error::PersistenceError;
use crate::ids::{ArtifactId, SessionId, UserId};
use crate::model::{Artifact, ArtifactKind};

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn create(&self, artifact: Artifact) -> Result<Artifact, PersistenceError>;

    async fn get(&self, id: ArtifactId) -> Result<Artifact, PersistenceError>;

    async fn update(
        &self,
        id: ArtifactId,
        title: Option<String>,
        meta: Option<Map<String, Value>>,
    ) -> Result<Artifact, PersistenceError>;

    async fn update_content(
        &self,
        id: ArtifactId,
        content: Vec<u8>,
    ) -> Result<Artifact, PersistenceError>;

    async fn get_content(&self, id: ArtifactId) -> Result<Vec<u8>, PersistenceError>;

    async fn list_by_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<Artifact>, PersistenceError>;

    async fn list_by_kind(
        &self,
        session_id: SessionId,
        kind: &ArtifactKind,
    ) -> Result<Vec<Artifact>, PersistenceError>;

    async fn count_by_session(&self, session_id: SessionId) -> Result<usize, PersistenceError>;

    async fn count_by_user(&self, user_id: UserId) -> Result<usize, PersistenceError>;

    async fn delete_by_session(&self, session_id: SessionId) -> Result<(), PersistenceError>;
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    rows: DashMap<ArtifactId, Artifact>,
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn create(&self, artifact: Artifact) -> Result<Artifact, PersistenceError> {
        self.rows.insert(artifact.artifact_id, artifact.clone());
        Ok(artifact)
    }

    async fn get(&self, id: ArtifactId) -> Result<Artifact, PersistenceError> {
        self.rows
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("artifact {id}"),
            })
    }

    async fn update(
        &self,
        id: ArtifactId,
        title: Option<String>,
        meta: Option<Map<String, Value>>,
    ) -> Result<Artifact, PersistenceError> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("artifact {id}"),
            })?;
        if let Some(title) = title {
            row.title = title;
        }
        if let Some(meta) = meta {
            row.meta = meta;
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn update_content(
        &self,
        id: ArtifactId,
        content: Vec<u8>,
    ) -> Result<Artifact, PersistenceError> {
        let mut row = self
            .rows
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("artifact {id}"),
            })?;
        row.content = content;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn get_content(&self, id: ArtifactId) -> Result<Vec<u8>, PersistenceError> {
        Ok(self.get(id).await?.content)
    }

    async fn list_by_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<Artifact>, PersistenceError> {
        let mut rows: Vec<Artifact> = self
            .rows
            .iter()
            .filter(|e| e.session_id == Some(session_id))
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|a| a.artifact_id);
        Ok(rows)
    }

    async fn list_by_kind(
        &self,
        session_id: SessionId,
        kind: &ArtifactKind,
    ) -> Result<Vec<Artifact>, PersistenceError> {
        Ok(self
            .list_by_session(session_id)
            .await?
            .into_iter()
            .filter(|a| &a.kind == kind)
            .collect())
    }

    async fn count_by_session(&self, session_id: SessionId) -> Result<usize, PersistenceError> {
        Ok(self.list_by_session(session_id).await?.len())
    }

    async fn count_by_user(&self, user_id: UserId) -> Result<usize, PersistenceError> {
        Ok(self.rows.iter().filter(|e| e.user_id == user_id).count())
    }

    async fn delete_by_session(&self, session_id: SessionId) -> Result<(), PersistenceError> {
        self.rows.retain(|_, a| a.session_id != Some(session_id));
        Ok(())
    }
}
