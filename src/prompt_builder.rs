//! `PromptBuilder`: projects persisted messages into a model prompt.
//!
//! Projects the persisted message stream — optionally anchored at the
//! current checkpoint — into a neutral prompt structure the agent
//! runtime consumes. Keeps no state of its own; every call re-reads
//! through the [`crate::reader::SessionReader`] it is given.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::error::PersistenceError;
use crate::model::{Message, MessageType};
use crate::reader::SessionReader;
use crate::registry::UploadStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptRole {
    System,
    User,
    Assistant,
    Developer,
}

#[derive(Debug, Clone)]
pub struct PromptBlock {
    pub role: PromptRole,
    pub content: String,
    /// Marks a cache boundary: set around the context block and around
    /// messages whose metadata marks a checkpoint.
    pub cache_marker: bool,
}

impl PromptBlock {
    fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            cache_marker: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub blocks: Vec<PromptBlock>,
}

pub struct PromptBuilder {
    uploads: Arc<dyn UploadStore>,
}

impl PromptBuilder {
    pub fn new(uploads: Arc<dyn UploadStore>) -> Self {
        Self { uploads }
    }

    /// Builds the prompt for `reader`'s session. When `from_checkpoint` is
    /// set, only messages strictly after the current checkpoint cursor
    /// are projected (the system/context block is still always included).
    pub async fn build(
        &self,
        reader: &SessionReader,
        from_checkpoint: bool,
    ) -> Result<Prompt, PersistenceError> {
        let mut blocks = Vec::new();

        let date_stamp = format!("current date: {}", Utc::now().to_rfc3339());
        blocks.push(PromptBlock::new(PromptRole::System, date_stamp));

        let contexts = reader.contexts().all().await?;
        if !contexts.is_empty() {
            let mut by_type: std::collections::BTreeMap<String, Vec<&str>> =
                std::collections::BTreeMap::new();
            for c in &contexts {
                by_type.entry(c.kind.clone()).or_default().push(c.text.as_str());
            }
            let mut collated = String::new();
            for (kind, texts) in &by_type {
                collated.push_str(&format!("[{kind}]\n"));
                for t in texts {
                    collated.push_str(t);
                    collated.push('\n');
                }
            }
            let mut block = PromptBlock::new(PromptRole::System, collated);
            block.cache_marker = true;
            blocks.push(block);
        }

        let messages = if from_checkpoint {
            reader.messages().from_checkpoint().all().await?
        } else {
            reader.messages().all().await?
        };

        for message in &messages {
            self.project(&mut blocks, message).await;
        }

        Ok(Prompt { blocks })
    }

    async fn project(&self, blocks: &mut Vec<PromptBlock>, message: &Message) {
        let is_checkpoint = message
            .metadata
            .get("checkpoint")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match message.kind {
            MessageType::System => blocks.push(PromptBlock::new(PromptRole::System, message.text())),
            MessageType::Developer => {
                blocks.push(PromptBlock::new(PromptRole::Developer, message.text()))
            }
            MessageType::Assistant => {
                blocks.push(PromptBlock::new(PromptRole::Assistant, message.text()))
            }
            MessageType::User => {
                blocks.push(PromptBlock::new(PromptRole::User, message.text()));
                if let Some(ids) = message.metadata.get("file_uuids").and_then(Value::as_array) {
                    let ids: Vec<String> = ids
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect();
                    if !ids.is_empty() {
                        let uploads = self.uploads.resolve(&ids).await;
                        let listing = uploads
                            .iter()
                            .map(|u| format!("- {} ({}, {} bytes, id={})", u.filename, u.content_type, u.size, u.id))
                            .collect::<Vec<_>>()
                            .join("\n");
                        blocks.push(PromptBlock::new(
                            PromptRole::Developer,
                            format!("attached files:\n{listing}"),
                        ));
                    }
                }
            }
            MessageType::Function | MessageType::PrivateFunction | MessageType::Delegation => {
                let (call_block, result_block) = function_pair(message);
                blocks.push(call_block);
                blocks.push(result_block);
            }
            MessageType::Artifact => {
                blocks.push(PromptBlock::new(PromptRole::Developer, message.text()))
            }
        }

        if is_checkpoint {
            if let Some(last) = blocks.last_mut() {
                last.cache_marker = true;
            }
        }
    }
}

/// Projects a function/private-function/delegation message into its
/// (call, result) pair, keyed implicitly by the message's own
/// [`Message::call_id`].
fn function_pair(message: &Message) -> (PromptBlock, PromptBlock) {
    let name = message
        .metadata
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("");
    let call = PromptBlock::new(
        PromptRole::Assistant,
        format!("call {name}({})", message.text()),
    );
    let result_text = if message.status() == Some("pending") {
        "incomplete".to_string()
    } else {
        message
            .metadata
            .get("result")
            .map(|v| v.to_string())
            .unwrap_or_default()
    };
    let result = PromptBlock::new(PromptRole::Developer, result_text);
    (call, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SessionId, UserId};
    use crate::persistence::session_store::new_session_row;
    use crate::persistence::Ports;
    use crate::registry::{Actor, NoUploads, ScopedSecurity};
    use serde_json::{json, Map};
    use std::sync::Arc;

    async fn reader_for(session_id: SessionId, ports: Arc<Ports>) -> SessionReader {
        let security = Arc::new(ScopedSecurity {
            required_scope: "test".to_string(),
        });
        let user_id = ports.sessions.get(session_id, None).await.unwrap().user_id;
        SessionReader::open(ports, security, session_id, &Actor { user_id, scope: "test".to_string() })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pending_function_result_renders_as_incomplete() {
        let ports = Arc::new(Ports::in_memory());
        let user_id = UserId::from_uuid(uuid::Uuid::now_v7());
        let row = new_session_row(user_id, "chat", Map::new());
        let session_id = row.session_id;
        ports.sessions.create(row).await.unwrap();
        ports.contexts.create(session_id).await.unwrap();

        let mut metadata = Map::new();
        metadata.insert("name".to_string(), json!("search"));
        metadata.insert("status".to_string(), json!("pending"));
        ports
            .messages
            .create(
                crate::ids::MessageId::new(),
                session_id,
                MessageType::Function,
                br#"{"q":"rust"}"#.to_vec(),
                metadata,
            )
            .await
            .unwrap();

        let reader = reader_for(session_id, ports).await;
        let builder = PromptBuilder::new(Arc::new(NoUploads));
        let prompt = builder.build(&reader, false).await.unwrap();

        let last = prompt.blocks.last().unwrap();
        assert_eq!(last.content, "incomplete");
    }

    #[tokio::test]
    async fn system_block_collates_contexts_by_type() {
        let ports = Arc::new(Ports::in_memory());
        let user_id = UserId::from_uuid(uuid::Uuid::now_v7());
        let row = new_session_row(user_id, "chat", Map::new());
        let session_id = row.session_id;
        ports.sessions.create(row).await.unwrap();
        ports.contexts.create(session_id).await.unwrap();
        ports
            .session_contexts
            .create(session_id, "memory".to_string(), "likes rust".to_string(), None)
            .await
            .unwrap();

        let reader = reader_for(session_id, ports).await;
        let builder = PromptBuilder::new(Arc::new(NoUploads));
        let prompt = builder.build(&reader, false).await.unwrap();

        assert!(prompt.blocks.iter().any(|b| b.content.contains("likes rust")));
    }
}
