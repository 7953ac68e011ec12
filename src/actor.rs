//! `SessionActor`: the per-session supervisor task.
//!
//! Owns one session's reader/writer/upstream/agent-context/bus. Enters a
//! select loop over its inbox, lifecycle events, and the bus's
//! queue-empty/completion signals. Per the Open Question resolution
//! recorded in DESIGN.md, the bus's `queue_empty` callback is the sole
//! authority for the idle transition — nothing else in this loop flips
//! status back to idle.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::agent_context::AgentContext;
use crate::bus::handlers::SessionOperationHandlers;
use crate::bus::{CommandBus, ContextCommandAction, Operation, OperationPayload};
use crate::config::Config;
use crate::control::ArtifactDirective;
use crate::error::BusError;
use crate::ids::{RequestId, SessionId, UserId};
use crate::model::SessionStatus;
use crate::persistence::Ports;
use crate::prompt_builder::PromptBuilder;
use crate::reader::SessionReader;
use crate::registry::{Actor, AgentRuntime, FunctionRegistry, SecurityPort, ToolRegistry, UploadStore};
use crate::tool_caller::ToolCaller;
use crate::upstream::{Emit, SessionUpdate, Upstream};
use crate::writer::SessionWriter;

/// Payload for the `message` inbox topic.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub text: String,
    pub file_uuids: Vec<String>,
    pub request_id: Option<RequestId>,
}

/// The session control commands accepted on the relay's external inbox
/// topics. `Stop` is accepted both as the standalone `stop` inbox topic and as a
/// `command{command:"stop"}` payload; both paths converge here.
#[derive(Debug, Clone)]
pub enum InboundCommand {
    Stop,
    Agent { name: String, model: Option<String> },
    Model { name: String },
    Artifact(Vec<ArtifactDirective>),
    Context {
        action: ContextCommandAction,
        key: String,
        data: Option<Value>,
    },
}

#[derive(Debug, Clone)]
pub enum ActorInbox {
    Message(InboundMessage),
    Command {
        command: InboundCommand,
        request_id: Option<RequestId>,
    },
    FinishAndExit,
    Continue,
}

#[derive(Debug, Clone, Copy)]
pub enum ActorEvent {
    Cancel,
    LinkDown,
    Exit,
}

/// Handle used by the relay to drive a running actor.
#[derive(Clone)]
pub struct SessionActorHandle {
    inbox_tx: mpsc::UnboundedSender<ActorInbox>,
    event_tx: mpsc::UnboundedSender<ActorEvent>,
}

impl SessionActorHandle {
    pub fn send(&self, msg: ActorInbox) {
        let _ = self.inbox_tx.send(msg);
    }

    pub fn notify(&self, event: ActorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// `true` on a clean exit (bus finished while `finishing`), `false` if
/// the bus tore itself down for a fatal reason — the signal the relay
/// uses to decide between `status=idle` and `status=failed` on exit.
pub type ActorExit = bool;

/// Initial-turn work for a session created this call, named in the
/// session-actor startup contract: an optional agent/model change and an
/// optional init function to run before the session is handed back.
#[derive(Debug, Clone, Default)]
pub struct InitialTurn {
    pub start_func: Option<String>,
    pub start_params: Value,
}

#[allow(clippy::too_many_arguments)]
pub async fn spawn_session_actor(
    ports: Arc<Ports>,
    security: Arc<dyn SecurityPort>,
    config: Arc<Config>,
    agent_runtime: Arc<dyn AgentRuntime>,
    tool_registry: Arc<dyn ToolRegistry>,
    function_registry: Arc<dyn FunctionRegistry>,
    uploads: Arc<dyn UploadStore>,
    session_id: SessionId,
    user_id: UserId,
    newly_created: bool,
    initial_turn: InitialTurn,
    forward: mpsc::UnboundedSender<Emit>,
) -> Result<(SessionActorHandle, tokio::task::JoinHandle<ActorExit>), BusError> {
    let actor = Actor {
        user_id,
        scope: config.session_security_scope.clone(),
    };

    let session = ports.sessions.get(session_id, None).await?;
    if matches!(session.status, SessionStatus::Failed) {
        return Err(BusError::SessionFailed);
    }

    let reader = SessionReader::open(ports.clone(), security.clone(), session_id, &actor).await?;
    // Opened twice: one instance moves into the handlers, one stays here
    // for the actor's own status transitions (running/idle/failed).
    let writer = SessionWriter::open(ports.clone(), security.clone(), session_id, &actor).await?;
    let status_writer = SessionWriter::open(ports.clone(), security.clone(), session_id, &actor).await?;
    let (upstream, mut upstream_rx) = Upstream::new();
    let agent_ctx = AgentContext::new(agent_runtime, config.delegation_func_id.clone());
    let tool_caller = ToolCaller::new(tool_registry);
    let prompt_builder = PromptBuilder::new(uploads);

    let handlers = SessionOperationHandlers {
        session_id,
        user_id,
        reader,
        writer,
        upstream: upstream.clone(),
        agent_ctx,
        tool_caller,
        prompt_builder,
        function_registry,
        config: config.clone(),
    };

    let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<()>();
    let (bus, bus_done) = CommandBus::spawn(handlers, 256, move || {
        let _ = idle_tx.send(());
    });

    if newly_created {
        if let Some(agent) = session.config.get("agent").and_then(|v| v.as_str()) {
            let _ = bus
                .enqueue(Operation::internal(OperationPayload::AgentChange {
                    agent_id: agent.to_string(),
                    model: None,
                }))
                .await;
        }
        if let Some(model) = session.config.get("model").and_then(|v| v.as_str()) {
            let _ = bus
                .enqueue(Operation::internal(OperationPayload::ModelChange {
                    model: model.to_string(),
                }))
                .await;
        }
        if let Some(function_id) = initial_turn.start_func {
            let _ = bus
                .enqueue(Operation::internal(OperationPayload::ExecuteFunction {
                    function_id,
                    args: initial_turn.start_params,
                }))
                .await;
        }
    }

    upstream.update(
        session_id,
        SessionUpdate {
            status: Some(session.status.to_string()),
            ..Default::default()
        },
    );

    let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<ActorInbox>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ActorEvent>();
    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        bus_done.wait().await;
        let _ = done_tx.send(());
    });

    let join = tokio::spawn(async move {
        let mut finishing = false;
        loop {
            tokio::select! {
                biased;

                Some(event) = event_rx.recv() => {
                    match event {
                        ActorEvent::Cancel => bus.stop(),
                        ActorEvent::LinkDown | ActorEvent::Exit => {
                            warn!(%session_id, ?event, "observed link event");
                        }
                    }
                }

                Some(inbox) = inbox_rx.recv() => {
                    match inbox {
                        ActorInbox::Message(msg) => {
                            if bus.is_finishing() {
                                if let Some(rid) = msg.request_id {
                                    upstream.command_response(
                                        session_id,
                                        rid.to_string(),
                                        false,
                                        Some("session_spawn_error".to_string()),
                                        Some("session is finishing".to_string()),
                                    );
                                }
                                continue;
                            }
                            if let Err(e) = status_writer.update_status(SessionStatus::Running, None).await {
                                error!(%session_id, error = %e, "failed to flip status to running");
                            }
                            upstream.update(
                                session_id,
                                SessionUpdate { status: Some(SessionStatus::Running.to_string()), ..Default::default() },
                            );
                            let _ = bus
                                .enqueue(Operation::external(
                                    OperationPayload::HandleMessage { text: msg.text, file_uuids: msg.file_uuids },
                                    msg.request_id,
                                ))
                                .await;
                        }
                        ActorInbox::Command { command, request_id } => {
                            dispatch_command(&bus, command, request_id).await;
                        }
                        ActorInbox::FinishAndExit => {
                            finishing = true;
                            bus.finish();
                        }
                        ActorInbox::Continue => {
                            debug!(%session_id, "advisory continue");
                        }
                    }
                }

                Some(()) = idle_rx.recv() => {
                    if let Err(e) = status_writer.update_status(SessionStatus::Idle, None).await {
                        error!(%session_id, error = %e, "failed to flip status to idle");
                    }
                    upstream.update(
                        session_id,
                        SessionUpdate { status: Some(SessionStatus::Idle.to_string()), ..Default::default() },
                    );
                }

                Some(emit) = upstream_rx.recv() => {
                    let _ = forward.send(emit);
                }

                _ = &mut done_rx => {
                    if finishing || bus.is_finishing() {
                        info!(%session_id, "bus finished, exiting actor");
                        return true;
                    }
                    warn!(%session_id, "bus terminated for a fatal reason");
                    let _ = status_writer
                        .update_status(SessionStatus::Failed, Some("command bus terminated unexpectedly".to_string()))
                        .await;
                    return false;
                }
            }
        }
    });

    Ok((SessionActorHandle { inbox_tx, event_tx }, join))
}

async fn dispatch_command(bus: &CommandBus, command: InboundCommand, request_id: Option<RequestId>) {
    match command {
        InboundCommand::Stop => {
            bus.intercept_next(|_dropped| {});
        }
        InboundCommand::Agent { name, model } => {
            let _ = bus
                .enqueue(Operation::external(
                    OperationPayload::AgentChange { agent_id: name, model },
                    request_id,
                ))
                .await;
        }
        InboundCommand::Model { name } => {
            let _ = bus
                .enqueue(Operation::external(OperationPayload::ModelChange { model: name }, request_id))
                .await;
        }
        InboundCommand::Artifact(directives) => {
            let _ = bus
                .enqueue(Operation::external(
                    OperationPayload::ControlArtifacts { directives },
                    request_id,
                ))
                .await;
        }
        InboundCommand::Context { action, key, data } => {
            let _ = bus
                .enqueue(Operation::external(
                    OperationPayload::HandleContextCommand { action, key, data },
                    request_id,
                ))
                .await;
        }
    }
}
