//! Trait interfaces for collaborators that live outside the core: the
//! agent runtime, the tool/function registries, the security/
//! authentication service, and the upload store. The core only
//! ever talks to these through the traits below; concrete
//! implementations (HTTP clients, model servers, auth services) are
//! injected by the binary that assembles the runtime.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AgentError, SecurityError, ToolError};
use crate::ids::{CallId, SessionId, UserId};
use crate::model::Session;
use crate::prompt_builder::Prompt;

/// `{result, tool_calls, delegate_calls, tokens, metadata,
/// memory_recall?, memory_prompt?}`: the outcome of one agent step.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub result: Option<String>,
    pub tool_calls: Vec<RawToolCall>,
    pub delegate_calls: Vec<RawToolCall>,
    pub tokens: u64,
    pub metadata: serde_json::Map<String, Value>,
    pub memory_recall: Option<String>,
    pub memory_prompt: Option<String>,
}

/// A tool invocation as emitted by the agent runtime, before
/// `ToolCaller` validation mints a [`CallId`] and attaches registry
/// metadata.
#[derive(Debug, Clone)]
pub struct RawToolCall {
    pub name: String,
    /// Arguments as either a decoded object or a JSON string the caller
    /// must decode before dispatch.
    pub arguments: ArgumentPayload,
}

#[derive(Debug, Clone)]
pub enum ArgumentPayload {
    Decoded(Value),
    Encoded(String),
}

#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub from_user: bool,
}

/// The agent/model inference collaborator.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn agent_exists(&self, agent_id: &str) -> bool;

    async fn default_model(&self, agent_id: &str) -> Result<String, AgentError>;

    async fn model_exists(&self, agent_id: &str, model: &str) -> bool;

    async fn step(
        &self,
        agent_id: &str,
        model: &str,
        prompt: &Prompt,
        options: StepOptions,
    ) -> Result<StepOutcome, AgentError>;
}

#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub exclusive: bool,
    pub private: bool,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub call_id: CallId,
}

/// The tool registry: resolves schemas and executes calls.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn schema(&self, name: &str) -> Result<ToolSchema, ToolError>;

    async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: ToolExecutionContext,
    ) -> Result<Value, ToolError>;
}

/// The function registry: checkpoint/title/init/programmatic functions
/// invoked by the bus's background and lifecycle operations.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    async fn call(
        &self,
        function_id: &str,
        args: Value,
        ctx: ToolExecutionContext,
    ) -> Result<Value, AgentError>;
}

/// Identity of the caller driving a [`crate::reader::SessionReader`] or
/// [`crate::writer::SessionWriter`].
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: UserId,
    pub scope: String,
}

/// The security/authentication collaborator.
#[async_trait]
pub trait SecurityPort: Send + Sync {
    async fn authorize_read(&self, actor: &Actor, session: &Session) -> Result<(), SecurityError>;

    async fn authorize_write(&self, actor: &Actor, session: &Session)
        -> Result<(), SecurityError>;
}

/// Default security port: an actor may read/write a session iff it owns
/// it and its scope matches the configured `session_security_scope`.
pub struct ScopedSecurity {
    pub required_scope: String,
}

#[async_trait]
impl SecurityPort for ScopedSecurity {
    async fn authorize_read(
        &self,
        actor: &Actor,
        session: &Session,
    ) -> Result<(), SecurityError> {
        self.authorize_write(actor, session).await
    }

    async fn authorize_write(
        &self,
        actor: &Actor,
        session: &Session,
    ) -> Result<(), SecurityError> {
        if actor.scope != self.required_scope {
            return Err(SecurityError::Unauthorized);
        }
        if actor.user_id != session.user_id {
            return Err(SecurityError::Forbidden {
                actor: actor.user_id.to_string(),
                session: session.session_id.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UploadRef {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// Resolves `metadata.file_uuids` on user messages into display-ready
/// upload metadata for the prompt builder.
#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn resolve(&self, ids: &[String]) -> Vec<UploadRef>;
}

/// A no-op upload store for runtimes/tests that never attach files.
pub struct NoUploads;

#[async_trait]
impl UploadStore for NoUploads {
    async fn resolve(&self, _ids: &[String]) -> Vec<UploadRef> {
        Vec::new()
    }
}
