//! `OperationHandlers`: the per-operation-type handler table. One
//! concrete implementation,
//! [`SessionOperationHandlers`], wires the table to a session's
//! reader/writer/upstream/agent-context/tool-caller/prompt-builder.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::control::{self, ArtifactDirective, ConfigDirective, ContextDirective, ControlOp, MemoryDirective};
use crate::error::BusError;
use crate::ids::{CallId, RequestId, SessionId, UserId};
use crate::model::{ArtifactKind, MessageType, SessionMetaPatch};
use crate::reader::SessionReader;
use crate::registry::{FunctionRegistry, ToolExecutionContext};
use crate::tool_caller::{CallOutcome, ExecutionStrategy, ToolCaller};
use crate::prompt_builder::PromptBuilder;
use crate::agent_context::AgentContext;
use crate::registry::StepOptions;
use crate::upstream::{Emit, SessionUpdate, Upstream};
use crate::writer::SessionWriter;

use super::{ContextCommandAction, Operation, OperationPayload};

#[derive(Debug, Clone, Default)]
pub struct HandlerOutput {
    pub next_ops: Vec<Operation>,
    pub completed: bool,
}

impl HandlerOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn next(ops: Vec<Operation>) -> Self {
        Self {
            next_ops: ops,
            completed: false,
        }
    }
}

pub type HandlerResult = Result<HandlerOutput, BusError>;

#[async_trait]
pub trait OperationHandlers {
    async fn dispatch(&self, op: Operation) -> HandlerResult;

    fn emit_command_response(
        &self,
        request_id: RequestId,
        success: bool,
        code: Option<String>,
        message: Option<String>,
    );
}

pub struct SessionOperationHandlers {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub reader: SessionReader,
    pub writer: SessionWriter,
    pub upstream: Upstream,
    pub agent_ctx: AgentContext,
    pub tool_caller: ToolCaller,
    pub prompt_builder: PromptBuilder,
    pub function_registry: Arc<dyn FunctionRegistry>,
    pub config: Arc<Config>,
}

#[async_trait]
impl OperationHandlers for SessionOperationHandlers {
    async fn dispatch(&self, op: Operation) -> HandlerResult {
        match op.payload {
            OperationPayload::HandleMessage { text, file_uuids } => {
                self.handle_message(text, file_uuids).await
            }
            OperationPayload::AgentStep { from_user } => self.handle_agent_step(from_user).await,
            OperationPayload::AgentContinue => self.handle_agent_step(false).await,
            OperationPayload::ProcessTools { calls } => self.handle_process_tools(calls).await,
            OperationPayload::ControlArtifacts { directives } => {
                self.handle_control_artifacts(directives).await
            }
            OperationPayload::ControlContext { directive } => {
                self.handle_control_context(directive).await
            }
            OperationPayload::ControlMemory { directive } => {
                self.handle_control_memory(directive).await
            }
            OperationPayload::ControlConfig { directive } => {
                self.handle_control_config(directive).await
            }
            OperationPayload::AgentChange { agent_id, model } => {
                self.handle_agent_change(agent_id, model).await
            }
            OperationPayload::ModelChange { model } => self.handle_model_change(model).await,
            OperationPayload::GenerateTitle => self.handle_generate_title().await,
            OperationPayload::CreateCheckpoint => self.handle_create_checkpoint().await,
            OperationPayload::CheckBackgroundTriggers => {
                self.handle_check_background_triggers().await
            }
            OperationPayload::ExecuteFunction { function_id, args } => {
                self.handle_execute_function(function_id, args).await
            }
            OperationPayload::HandleContextCommand { action, key, data } => {
                self.handle_context_command(op.request_id, action, key, data).await
            }
        }
    }

    fn emit_command_response(
        &self,
        request_id: RequestId,
        success: bool,
        code: Option<String>,
        message: Option<String>,
    ) {
        self.upstream
            .command_response(self.session_id, request_id.to_string(), success, code, message);
    }
}

impl SessionOperationHandlers {
    async fn handle_message(&self, text: String, file_uuids: Vec<String>) -> HandlerResult {
        let mut metadata = Map::new();
        if !file_uuids.is_empty() {
            metadata.insert("file_uuids".to_string(), json!(file_uuids));
        }
        let message = self
            .writer
            .add_message(MessageType::User, text.into_bytes(), Some(metadata))
            .await?;
        self.reader.reset().await;
        self.upstream.emit(Emit::Received {
            session_id: self.session_id,
            message_id: message.message_id,
        });
        Ok(HandlerOutput::next(vec![Operation::internal(
            OperationPayload::AgentStep { from_user: true },
        )]))
    }

    async fn handle_agent_step(&self, from_user: bool) -> HandlerResult {
        let anchor = self.reader.messages().last(1).all().await?.into_iter().next();
        if let Some(anchor) = &anchor {
            self.upstream.emit(Emit::ResponseStarted {
                session_id: self.session_id,
                message_id: anchor.message_id,
            });
        }

        let prompt = self.prompt_builder.build(&self.reader, true).await?;
        let outcome = self
            .agent_ctx
            .step(&prompt, StepOptions { from_user })
            .await?;

        let mut next_ops = Vec::new();

        if let Some(text) = &outcome.result {
            let assistant = self
                .writer
                .add_message(MessageType::Assistant, text.clone().into_bytes(), None)
                .await?;
            self.reader.reset().await;
            self.upstream.emit(Emit::Content {
                session_id: self.session_id,
                message_id: assistant.message_id,
                content: text.clone(),
            });
        }

        if outcome.tokens > 0 {
            let mut meta = self.reader.state().await?.meta;
            meta.tokens += outcome.tokens;
            self.writer
                .update_meta(SessionMetaPatch {
                    meta: Some(meta),
                    ..Default::default()
                })
                .await?;
            self.reader.reset().await;
        }

        if let Some(recall) = &outcome.memory_recall {
            self.writer
                .add_session_context("memory_recall", recall.clone(), None)
                .await?;
        }

        if !outcome.tool_calls.is_empty() {
            next_ops.push(Operation::internal(OperationPayload::ProcessTools {
                calls: outcome.tool_calls,
            }));
        }
        next_ops.push(Operation::internal(OperationPayload::CheckBackgroundTriggers));

        Ok(HandlerOutput::next(next_ops))
    }

    async fn handle_process_tools(&self, calls: Vec<crate::registry::RawToolCall>) -> HandlerResult {
        let validation = self.tool_caller.validate(calls).await?;
        if !validation.skipped.is_empty() {
            debug!(skipped = ?validation.skipped, "Exclusive tool found, other tools skipped");
        }

        let mut message_ids = std::collections::HashMap::new();
        for call in &validation.calls {
            let mut metadata = Map::new();
            metadata.insert("call_id".to_string(), json!(call.call_id.to_string()));
            let message = self
                .writer
                .add_function_call(&call.name, &call.arguments, Some(metadata))
                .await?;
            self.reader.reset().await;
            self.upstream.emit(Emit::FunctionCall {
                session_id: self.session_id,
                message_id: message.message_id,
                name: call.name.clone(),
                args: call.arguments.clone(),
            });
            message_ids.insert(call.call_id, message.message_id);
        }

        let ran_any = !validation.calls.is_empty();
        let outcomes = self
            .tool_caller
            .execute(validation.calls, self.session_id, self.user_id, ExecutionStrategy::Parallel)
            .await;

        let mut next_ops = Vec::new();
        for outcome in outcomes {
            let call = outcome.call().clone();
            let message_id = match message_ids.get(&call.call_id) {
                Some(id) => *id,
                None => continue,
            };
            match outcome {
                CallOutcome::Success { result, .. } => {
                    let mut result = result;
                    let directives = control::extract(&mut result);
                    self.writer
                        .update_function_result(message_id, &result, true, None)
                        .await?;
                    self.upstream.emit(Emit::FunctionSuccess {
                        session_id: self.session_id,
                        message_id,
                        result: result.clone(),
                    });
                    if let Some(envelope) = directives {
                        for op in envelope.into_ops() {
                            next_ops.push(control_op_to_operation(op));
                        }
                    }
                }
                CallOutcome::Error { error, .. } => {
                    self.writer
                        .update_function_result(message_id, &json!({"error": error}), false, None)
                        .await?;
                    self.upstream.emit(Emit::FunctionError {
                        session_id: self.session_id,
                        message_id,
                        message: error,
                    });
                }
            }
            self.reader.reset().await;
        }

        if ran_any {
            next_ops.push(Operation::internal(OperationPayload::AgentContinue));
        }

        Ok(HandlerOutput::next(next_ops))
    }

    async fn handle_control_artifacts(&self, directives: Vec<ArtifactDirective>) -> HandlerResult {
        let mut tags = Vec::new();
        for directive in directives {
            let kind = match directive.kind.as_deref() {
                Some("view_ref") => ArtifactKind::ViewRef,
                Some(other) if other != "inline" => ArtifactKind::Other(other.to_string()),
                _ => ArtifactKind::Inline,
            };
            let artifact = if let Some(existing) = directive
                .artifact_id
                .as_deref()
                .and_then(|s| s.parse().ok())
            {
                self.writer
                    .update_artifact(existing, Some(directive.title.clone()), None)
                    .await?
            } else {
                self.writer
                    .create_artifact(kind, directive.title.clone(), directive.content.into_bytes(), Map::new())
                    .await?
            };
            self.upstream.update(
                self.session_id,
                SessionUpdate {
                    artifact_added: Some(artifact.artifact_id.to_string()),
                    ..Default::default()
                },
            );
            tags.push(format!("<artifact id=\"{}\"/>", artifact.artifact_id));
        }
        if !tags.is_empty() {
            self.writer
                .add_message(MessageType::Developer, tags.join("\n").into_bytes(), None)
                .await?;
            self.reader.reset().await;
        }
        Ok(HandlerOutput::empty())
    }

    async fn handle_control_context(&self, directive: ContextDirective) -> HandlerResult {
        for (key, value) in directive.set {
            self.writer.set_context(key, value).await?;
        }
        for key in directive.delete {
            self.writer.delete_context(&key).await?;
        }
        if !directive.public_meta_set.is_empty() || !directive.public_meta_delete.is_empty() {
            let mut session = self.reader.state().await?;
            for (key, value) in directive.public_meta_set {
                session.public_meta.insert(key, value);
            }
            for key in directive.public_meta_delete {
                session.public_meta.remove(&key);
            }
            self.writer
                .update_meta(SessionMetaPatch {
                    public_meta: Some(session.public_meta.clone()),
                    ..Default::default()
                })
                .await?;
            self.upstream.update(
                self.session_id,
                SessionUpdate {
                    public_meta: Some(session.public_meta),
                    ..Default::default()
                },
            );
        }
        self.reader.reset().await;
        Ok(HandlerOutput::empty())
    }

    async fn handle_control_memory(&self, directive: MemoryDirective) -> HandlerResult {
        for add in directive.add {
            self.writer.add_session_context(add.kind, add.text, None).await?;
        }
        for id in directive.delete {
            if let Ok(id) = id.parse() {
                self.writer.delete_session_context(id).await?;
            }
        }
        for kind in directive.clear_by_type {
            self.writer.delete_session_contexts_by_type(&kind).await?;
        }
        Ok(HandlerOutput::empty())
    }

    async fn handle_control_config(&self, directive: ConfigDirective) -> HandlerResult {
        let mut config = self.reader.state().await?.config;
        if let Some(agent) = &directive.agent {
            self.agent_ctx
                .switch_to_agent(agent, directive.model.clone())
                .await?;
            config.insert("agent".to_string(), json!(agent));
        }
        if let Some(model) = &directive.model {
            if directive.agent.is_none() {
                self.agent_ctx.switch_to_model(model).await?;
            }
            config.insert("model".to_string(), json!(model));
        }
        self.writer
            .update_meta(SessionMetaPatch {
                config: Some(config),
                ..Default::default()
            })
            .await?;
        self.reader.reset().await;
        self.upstream.update(
            self.session_id,
            SessionUpdate {
                agent: directive.agent,
                model: directive.model,
                ..Default::default()
            },
        );
        Ok(HandlerOutput::empty())
    }

    async fn handle_agent_change(&self, agent_id: String, model: Option<String>) -> HandlerResult {
        self.agent_ctx.switch_to_agent(&agent_id, model.clone()).await?;
        let resolved_model = match model {
            Some(m) => Some(m),
            None => self.agent_ctx.current_model().await,
        };
        let mut config = self.reader.state().await?.config;
        config.insert("agent".to_string(), json!(agent_id));
        if let Some(m) = &resolved_model {
            config.insert("model".to_string(), json!(m));
        }
        self.writer
            .update_meta(SessionMetaPatch {
                config: Some(config),
                ..Default::default()
            })
            .await?;
        self.reader.reset().await;
        self.upstream.update(
            self.session_id,
            SessionUpdate {
                agent: Some(agent_id),
                model: resolved_model,
                ..Default::default()
            },
        );
        Ok(HandlerOutput::empty())
    }

    async fn handle_model_change(&self, model: String) -> HandlerResult {
        self.agent_ctx.switch_to_model(&model).await?;
        let mut config = self.reader.state().await?.config;
        config.insert("model".to_string(), json!(model));
        self.writer
            .update_meta(SessionMetaPatch {
                config: Some(config),
                ..Default::default()
            })
            .await?;
        self.reader.reset().await;
        self.upstream.update(
            self.session_id,
            SessionUpdate {
                model: Some(model),
                ..Default::default()
            },
        );
        Ok(HandlerOutput::empty())
    }

    async fn handle_generate_title(&self) -> HandlerResult {
        let ctx = ToolExecutionContext {
            session_id: self.session_id,
            user_id: self.user_id,
            call_id: CallId::new(),
        };
        let result = self
            .function_registry
            .call(&self.config.title_function_id, json!({}), ctx)
            .await?;
        if let Some(title) = result.get("title").and_then(Value::as_str) {
            self.writer.update_title(title).await?;
            self.reader.reset().await;
            self.upstream.update(
                self.session_id,
                SessionUpdate {
                    title: Some(title.to_string()),
                    ..Default::default()
                },
            );
        }
        Ok(HandlerOutput::empty())
    }

    async fn handle_create_checkpoint(&self) -> HandlerResult {
        let ctx = ToolExecutionContext {
            session_id: self.session_id,
            user_id: self.user_id,
            call_id: CallId::new(),
        };
        let result = self
            .function_registry
            .call(&self.config.checkpoint_function_id, json!({}), ctx)
            .await?;
        let summary = result
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let latest = self.reader.messages().last(1).all().await?;
        let anchor = latest.into_iter().next();

        if let Some(anchor) = &anchor {
            self.writer
                .set_context("current_checkpoint_id", json!(anchor.message_id.to_string()))
                .await?;
        }
        self.writer
            .add_session_context("checkpoint_summary", summary, None)
            .await?;

        if let Some(anchor) = &anchor {
            let mut meta = self.reader.state().await?.meta;
            meta.checkpoints.push(anchor.message_id);
            self.writer
                .update_meta(SessionMetaPatch {
                    meta: Some(meta),
                    ..Default::default()
                })
                .await?;
        }
        self.reader.reset().await;

        let session = self.reader.state().await?;
        let mut next_ops = Vec::new();
        if session.title.is_none() {
            next_ops.push(Operation::internal(OperationPayload::GenerateTitle));
        }
        Ok(HandlerOutput::next(next_ops))
    }

    async fn handle_check_background_triggers(&self) -> HandlerResult {
        let session = self.reader.state().await?;
        let mut next_ops = Vec::new();
        if session.meta.tokens >= self.config.token_checkpoint_threshold {
            next_ops.push(Operation::internal(OperationPayload::CreateCheckpoint));
        } else if session.title.is_none() {
            let count = self.reader.messages().count().await?;
            if count >= 4 {
                next_ops.push(Operation::internal(OperationPayload::GenerateTitle));
            }
        }
        Ok(HandlerOutput::next(next_ops))
    }

    async fn handle_execute_function(&self, function_id: String, args: Value) -> HandlerResult {
        let ctx = ToolExecutionContext {
            session_id: self.session_id,
            user_id: self.user_id,
            call_id: CallId::new(),
        };
        let mut result = self.function_registry.call(&function_id, args, ctx).await?;
        let directives = control::extract(&mut result);
        let mut next_ops = Vec::new();
        if let Some(envelope) = directives {
            for op in envelope.into_ops() {
                next_ops.push(control_op_to_operation(op));
            }
        }
        Ok(HandlerOutput::next(next_ops))
    }

    async fn handle_context_command(
        &self,
        request_id: Option<RequestId>,
        action: ContextCommandAction,
        key: String,
        data: Option<Value>,
    ) -> HandlerResult {
        let value = match action {
            ContextCommandAction::Read => {
                let ctx = self.reader.primary_context().await?;
                ctx.entries.get(&key).cloned()
            }
            ContextCommandAction::Write => {
                self.writer.set_context(key.clone(), data.unwrap_or(Value::Null)).await?;
                self.reader.reset().await;
                None
            }
            ContextCommandAction::Delete => {
                self.writer.delete_context(&key).await?;
                self.reader.reset().await;
                None
            }
        };
        if let Some(rid) = request_id {
            self.emit_command_response(rid, true, None, value.map(|v| v.to_string()));
        }
        Ok(HandlerOutput::empty())
    }
}

fn control_op_to_operation(op: ControlOp) -> Operation {
    match op {
        ControlOp::Artifacts(directives) => {
            Operation::internal(OperationPayload::ControlArtifacts { directives })
        }
        ControlOp::Context(directive) => {
            Operation::internal(OperationPayload::ControlContext { directive })
        }
        ControlOp::Memory(directive) => {
            Operation::internal(OperationPayload::ControlMemory { directive })
        }
        ControlOp::Config(directive) => {
            Operation::internal(OperationPayload::ControlConfig { directive })
        }
    }
}
