//! `Relay`: per-user supervisor.
//!
//! One relay per user, long-lived. Owns every live [`SessionActor`], keyed
//! by `session_id`, enforces the per-user session-count limit, recovers
//! crashed/never-spawned sessions on demand, and arms a grace timer on
//! `shutdown`. Unlike the session actor, the relay is not a single select
//! loop: sessions already run their own tasks, so the relay's job is
//! bookkeeping and fan-out, driven from async methods over a
//! mutex-guarded table (`Arc<Mutex<HashMap<...>>>`) plus small helper
//! tasks that observe a session actor's `JoinHandle` and its forwarded
//! `Emit`s.
//!
//! [`SessionActor`]: crate::actor::spawn_session_actor

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::actor::{
    spawn_session_actor, ActorEvent, ActorInbox, InboundCommand, InboundMessage, InitialTurn,
    SessionActorHandle,
};
use crate::config::Config;
use crate::error::{PersistenceError, RelayError};
use crate::ids::{RequestId, SessionId, UserId};
use crate::model::{SessionMetaPatch, SessionStatus};
use crate::persistence::session_store::new_session_row;
use crate::persistence::Ports;
use crate::registry::{AgentRuntime, FunctionRegistry, SecurityPort, ToolExecutionContext, ToolRegistry, UploadStore};
use crate::token::{self, EncryptionKey, StartTokenParams};
use crate::upstream::{Emit, SessionUpdate};

/// Relay-level events, forwarded to the user's hub alongside the
/// per-session [`Emit`]s, which are relayed verbatim under their
/// `session:` topic prefix.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    SessionOpened {
        user_id: UserId,
        session_id: SessionId,
        active_sessions: Vec<SessionId>,
    },
    SessionClosed {
        user_id: UserId,
        session_id: SessionId,
    },
    CommandResponse {
        user_id: UserId,
        request_id: String,
        success: bool,
        code: Option<String>,
        message: Option<String>,
    },
    Session(Emit),
}

/// Request shapes for the relay's inbox topics. Routing a reply back to
/// a particular connection is the caller's concern and is not modeled
/// here.
pub struct OpenRequest {
    pub session_id: Option<SessionId>,
    pub start_token: Option<String>,
    pub request_id: Option<RequestId>,
}

pub struct MessageRequest {
    pub session_id: Option<SessionId>,
    pub text: String,
    pub file_uuids: Vec<String>,
    pub request_id: Option<RequestId>,
}

pub struct CommandRequest {
    pub session_id: Option<SessionId>,
    pub command: InboundCommand,
    pub request_id: Option<RequestId>,
}

struct ActiveSession {
    handle: SessionActorHandle,
    abort: AbortHandle,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

struct RelayState {
    active: HashMap<SessionId, ActiveSession>,
    shutting_down: bool,
}

/// Shared state plus collaborators, cloned into the small background
/// tasks (exit watcher, gc ticker) the relay spawns.
struct Inner {
    user_id: UserId,
    ports: Arc<Ports>,
    security: Arc<dyn SecurityPort>,
    config: Arc<Config>,
    agent_runtime: Arc<dyn AgentRuntime>,
    tool_registry: Arc<dyn ToolRegistry>,
    function_registry: Arc<dyn FunctionRegistry>,
    uploads: Arc<dyn UploadStore>,
    encryption_key: EncryptionKey,
    events: mpsc::UnboundedSender<RelayEvent>,
    state: Mutex<RelayState>,
}

impl Inner {
    /// Single place that reacts to a session actor's exit, whatever
    /// triggered it: clean finish, crash, eviction, or gc.
    async fn handle_exit(&self, session_id: SessionId, clean: bool) {
        let status = if clean { SessionStatus::Idle } else { SessionStatus::Failed };
        if let Err(e) = self
            .ports
            .sessions
            .update_meta(session_id, SessionMetaPatch { status: Some(status), ..Default::default() })
            .await
        {
            warn!(%session_id, error = %e, "failed to persist status on session exit");
        }

        let _ = self.events.send(RelayEvent::Session(Emit::Update {
            session_id,
            fields: SessionUpdate {
                status: Some(status.to_string()),
                ..Default::default()
            },
        }));
        let _ = self.events.send(RelayEvent::SessionClosed {
            user_id: self.user_id,
            session_id,
        });

        let mut state = self.state.lock().await;
        state.active.remove(&session_id);
        let remaining = state.active.len();
        let shutting_down = state.shutting_down;
        drop(state);

        if remaining == 0 && !shutting_down {
            info!(user = %self.user_id, "relay has no active sessions left");
        }
    }

    /// GC sweep: finish any session whose `now - last_activity` exceeds
    /// `session_inactivity`.
    async fn gc(&self) {
        let now = Utc::now();
        let stale: Vec<(SessionId, SessionActorHandle)> = {
            let state = self.state.lock().await;
            state
                .active
                .iter()
                .filter(|(_, s)| {
                    now.signed_duration_since(s.last_activity)
                        .to_std()
                        .map(|age| age > self.config.session_inactivity)
                        .unwrap_or(false)
                })
                .map(|(id, s)| (*id, s.handle.clone()))
                .collect()
        };
        for (id, handle) in stale {
            debug!(%id, "gc: session inactive beyond threshold, finishing");
            handle.send(ActorInbox::FinishAndExit);
        }
    }

    async fn cancel_all(&self) {
        let handles: Vec<SessionActorHandle> = {
            let state = self.state.lock().await;
            state.active.values().map(|s| s.handle.clone()).collect()
        };
        for handle in handles {
            handle.send(ActorInbox::FinishAndExit);
        }
    }
}

pub struct Relay {
    inner: Arc<Inner>,
    shutdown_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        ports: Arc<Ports>,
        security: Arc<dyn SecurityPort>,
        config: Arc<Config>,
        agent_runtime: Arc<dyn AgentRuntime>,
        tool_registry: Arc<dyn ToolRegistry>,
        function_registry: Arc<dyn FunctionRegistry>,
        uploads: Arc<dyn UploadStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), RelayError> {
        let encryption_key = EncryptionKey::from_hex(&config.encryption_key)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            user_id,
            ports,
            security,
            config: config.clone(),
            agent_runtime,
            tool_registry,
            function_registry,
            uploads,
            encryption_key,
            events: events_tx,
            state: Mutex::new(RelayState {
                active: HashMap::new(),
                shutting_down: false,
            }),
        });

        let gc_inner = inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.gc_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gc_inner.gc().await;
            }
        });

        Ok((
            Self {
                inner,
                shutdown_timer: Mutex::new(None),
            },
            events_rx,
        ))
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        self.inner.state.lock().await.active.keys().copied().collect()
    }

    pub async fn is_active(&self, session_id: SessionId) -> bool {
        self.inner.state.lock().await.active.contains_key(&session_id)
    }

    /// Opens a session: cancels any pending shutdown timer, evicts over
    /// the session-count limit if needed, crash-recovers an existing row
    /// or validates a start token and spawns a new one, records it, and
    /// emits `SessionOpened`.
    pub async fn open(&self, req: OpenRequest) -> Result<SessionId, RelayError> {
        self.note_activity().await;

        if let Some(session_id) = req.session_id {
            if self.is_active(session_id).await {
                return Ok(session_id);
            }
            return match self.inner.ports.sessions.get(session_id, Some(self.inner.user_id)).await {
                Ok(_) => self.recover(session_id).await,
                Err(PersistenceError::NotFound { .. }) => Err(RelayError::SessionNotFound {
                    id: session_id.to_string(),
                }),
                Err(e) => Err(RelayError::Persistence(e)),
            };
        }

        let token = req.start_token.ok_or(RelayError::TokenRequired)?;
        let params = token::unpack(&self.inner.encryption_key, &token)?;
        self.spawn_new(params).await
    }

    /// Closes a session, but only if more than one is active for this user.
    pub async fn close(&self, session_id: SessionId) -> Result<(), RelayError> {
        let handle = {
            let state = self.inner.state.lock().await;
            let Some(active) = state.active.get(&session_id) else {
                return Err(RelayError::SessionNotFound {
                    id: session_id.to_string(),
                });
            };
            if state.active.len() <= 1 {
                debug!(%session_id, "refusing to close the last active session");
                return Ok(());
            }
            active.handle.clone()
        };
        handle.send(ActorInbox::FinishAndExit);
        Ok(())
    }

    /// Resolves the target session, updates `last_activity`, recovers it
    /// if not live, and forwards the message to its inbox.
    pub async fn message(&self, req: MessageRequest) -> Result<SessionId, RelayError> {
        self.note_activity().await;
        let session_id = self.resolve_target(req.session_id).await?;
        self.touch(session_id).await;
        let handle = self.live_handle_or_recover(session_id).await?;
        handle.send(ActorInbox::Message(InboundMessage {
            text: req.text,
            file_uuids: req.file_uuids,
            request_id: req.request_id,
        }));
        Ok(session_id)
    }

    /// Same resolution/recovery path as [`Relay::message`].
    pub async fn command(&self, req: CommandRequest) -> Result<SessionId, RelayError> {
        self.note_activity().await;
        let session_id = self.resolve_target(req.session_id).await?;
        self.touch(session_id).await;
        let handle = self.live_handle_or_recover(session_id).await?;
        handle.send(ActorInbox::Command {
            command: req.command,
            request_id: req.request_id,
        });
        Ok(session_id)
    }

    /// Sends a cooperative cancel, then escalates to aborting the actor
    /// task if it hasn't torn itself down within `cancel_timeout`.
    pub async fn cancel(&self, session_id: SessionId) {
        let target = {
            let state = self.inner.state.lock().await;
            state.active.get(&session_id).map(|s| (s.handle.clone(), s.abort.clone()))
        };
        let Some((handle, abort)) = target else { return };
        handle.notify(ActorEvent::Cancel);

        let timeout = self.inner.config.cancel_timeout;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if inner.state.lock().await.active.contains_key(&session_id) {
                warn!(%session_id, "cancel did not complete within cancel_timeout, aborting actor task");
                abort.abort();
            }
        });
    }

    /// Marks the relay `shutting_down` and arms a grace timer.
    pub async fn shutdown(&self) {
        self.inner.state.lock().await.shutting_down = true;
        self.arm_shutdown_timer().await;
    }

    /// Cancels the shutdown grace timer.
    pub async fn resume(&self) {
        self.inner.state.lock().await.shutting_down = false;
        self.cancel_shutdown_timer().await;
    }

    async fn note_activity(&self) {
        let mut state = self.inner.state.lock().await;
        let was_shutting_down = state.shutting_down;
        state.shutting_down = false;
        drop(state);
        if was_shutting_down {
            self.cancel_shutdown_timer().await;
        }
    }

    async fn arm_shutdown_timer(&self) {
        self.cancel_shutdown_timer().await;
        let inner = self.inner.clone();
        let grace = self.inner.config.shutdown_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            inner.cancel_all().await;
        });
        *self.shutdown_timer.lock().await = Some(handle);
    }

    async fn cancel_shutdown_timer(&self) {
        if let Some(handle) = self.shutdown_timer.lock().await.take() {
            handle.abort();
        }
    }

    async fn touch(&self, session_id: SessionId) {
        let mut state = self.inner.state.lock().await;
        if let Some(s) = state.active.get_mut(&session_id) {
            s.last_activity = Utc::now();
        }
    }

    /// Explicit id wins; otherwise the most-recently-active live session;
    /// otherwise the user's most recently touched persisted row (an
    /// existing row is required since `message`/`command` payloads carry
    /// no agent/model to seed a brand-new one — see DESIGN.md).
    async fn resolve_target(&self, explicit: Option<SessionId>) -> Result<SessionId, RelayError> {
        if let Some(id) = explicit {
            return Ok(id);
        }
        {
            let state = self.inner.state.lock().await;
            if let Some(id) = state.active.iter().max_by_key(|(_, s)| s.last_activity).map(|(id, _)| *id) {
                return Ok(id);
            }
        }
        let rows = self
            .inner
            .ports
            .sessions
            .list_by_user(self.inner.user_id, self.inner.config.max_sessions_per_user, 0)
            .await?;
        rows.into_iter()
            .max_by_key(|s| s.last_message_date)
            .map(|s| s.session_id)
            .ok_or_else(|| RelayError::SessionNotFound {
                id: "<no session for user>".to_string(),
            })
    }

    async fn live_handle_or_recover(&self, session_id: SessionId) -> Result<SessionActorHandle, RelayError> {
        {
            let state = self.inner.state.lock().await;
            if let Some(s) = state.active.get(&session_id) {
                return Ok(s.handle.clone());
            }
        }
        self.recover(session_id).await?;
        let state = self.inner.state.lock().await;
        state
            .active
            .get(&session_id)
            .map(|s| s.handle.clone())
            .ok_or_else(|| RelayError::SpawnFailed {
                reason: "actor not found immediately after recovery".to_string(),
            })
    }

    /// Crash recovery: if a session row exists but isn't live, reset a
    /// non-idle row to idle and spawn an actor against it.
    async fn recover(&self, session_id: SessionId) -> Result<SessionId, RelayError> {
        self.evict_if_over_limit().await?;

        let row = self.inner.ports.sessions.get(session_id, Some(self.inner.user_id)).await?;
        if row.status != SessionStatus::Idle {
            self.inner
                .ports
                .sessions
                .update_meta(
                    session_id,
                    SessionMetaPatch {
                        status: Some(SessionStatus::Idle),
                        ..Default::default()
                    },
                )
                .await?;
            let _ = self.inner.events.send(RelayEvent::Session(Emit::Update {
                session_id,
                fields: SessionUpdate {
                    status: Some(SessionStatus::Idle.to_string()),
                    ..Default::default()
                },
            }));
        }

        self.spawn_actor(session_id, row.user_id, false, InitialTurn::default()).await?;
        Ok(session_id)
    }

    async fn spawn_new(&self, params: StartTokenParams) -> Result<SessionId, RelayError> {
        self.evict_if_over_limit().await?;

        let mut config = Map::new();
        config.insert("agent".to_string(), Value::String(params.agent.clone()));
        if let Some(model) = &params.model {
            config.insert("model".to_string(), Value::String(model.clone()));
        }
        for (k, v) in &params.start_params {
            config.insert(k.clone(), v.clone());
        }

        let kind = params.kind.clone().unwrap_or_else(|| "chat".to_string());
        let row = new_session_row(self.inner.user_id, kind, config);
        let session_id = row.session_id;
        self.inner.ports.sessions.create(row).await?;
        self.inner.ports.contexts.create(session_id).await?;

        if !params.context.is_empty() {
            let mut ctx = self.inner.ports.contexts.get(session_id).await?;
            for (k, v) in params.context {
                ctx.entries.insert(k, v);
            }
            self.inner.ports.contexts.update(session_id, ctx).await?;
        }

        let initial_turn = InitialTurn {
            start_func: params.start_func.clone(),
            start_params: Value::Object(params.start_params.clone()),
        };

        self.spawn_actor(session_id, self.inner.user_id, true, initial_turn).await?;
        Ok(session_id)
    }

    async fn spawn_actor(
        &self,
        session_id: SessionId,
        user_id: UserId,
        newly_created: bool,
        initial_turn: InitialTurn,
    ) -> Result<(), RelayError> {
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<Emit>();
        let (handle, join) = spawn_session_actor(
            self.inner.ports.clone(),
            self.inner.security.clone(),
            self.inner.config.clone(),
            self.inner.agent_runtime.clone(),
            self.inner.tool_registry.clone(),
            self.inner.function_registry.clone(),
            self.inner.uploads.clone(),
            session_id,
            user_id,
            newly_created,
            initial_turn,
            forward_tx,
        )
        .await
        .map_err(|e| RelayError::SpawnFailed { reason: e.to_string() })?;

        let abort = join.abort_handle();
        let now = Utc::now();
        {
            let mut state = self.inner.state.lock().await;
            state.active.insert(
                session_id,
                ActiveSession {
                    handle,
                    abort,
                    created_at: now,
                    last_activity: now,
                },
            );
        }

        let events = self.inner.events.clone();
        tokio::spawn(async move {
            while let Some(emit) = forward_rx.recv().await {
                let _ = events.send(RelayEvent::Session(emit));
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let clean = join.await.unwrap_or(false);
            inner.handle_exit(session_id, clean).await;
        });

        let active_sessions = self.active_sessions().await;
        let _ = self.inner.events.send(RelayEvent::SessionOpened {
            user_id: self.inner.user_id,
            session_id,
            active_sessions,
        });

        Ok(())
    }

    /// Evicts the oldest-by-`last_activity` session until there is room
    /// for one more, enforcing the per-user session-count limit. The
    /// victim is removed from the active table
    /// immediately so the caller can spawn its replacement without
    /// waiting on the victim's actor task to actually drain; `handle_exit`
    /// still runs for it once that happens, but finds the slot already
    /// gone and simply persists its final status.
    /// Evicts the oldest-by-`last_activity` session until there's room for
    /// one more. Returns `SessionLimitReached` if the limit is still
    /// exceeded with nothing left to evict (e.g. `max_sessions_per_user`
    /// configured at or below zero).
    async fn evict_if_over_limit(&self) -> Result<(), RelayError> {
        loop {
            let victim = {
                let mut state = self.inner.state.lock().await;
                if state.active.len() < self.inner.config.max_sessions_per_user {
                    return Ok(());
                }
                let oldest = state
                    .active
                    .iter()
                    .min_by_key(|(_, s)| s.last_activity)
                    .map(|(id, _)| *id);
                oldest.and_then(|id| state.active.remove(&id).map(|s| (id, s.handle)))
            };
            match victim {
                Some((session_id, handle)) => {
                    debug!(%session_id, "evicting oldest session to stay under the per-user limit");
                    handle.send(ActorInbox::FinishAndExit);
                }
                None => {
                    let state = self.inner.state.lock().await;
                    return Err(RelayError::SessionLimitReached {
                        count: state.active.len(),
                        max: self.inner.config.max_sessions_per_user,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, ToolError};
    use crate::model::Session;
    use crate::prompt_builder::Prompt;
    use crate::registry::{NoUploads, ScopedSecurity, StepOptions, StepOutcome, ToolSchema};
    use async_trait::async_trait;
    use serde_json::Map as JsonMap;

    struct EchoRuntime;

    #[async_trait]
    impl AgentRuntime for EchoRuntime {
        async fn agent_exists(&self, agent_id: &str) -> bool {
            agent_id == "chat"
        }
        async fn default_model(&self, _agent_id: &str) -> Result<String, AgentError> {
            Ok("m-small".to_string())
        }
        async fn model_exists(&self, _agent_id: &str, _model: &str) -> bool {
            true
        }
        async fn step(
            &self,
            _agent_id: &str,
            _model: &str,
            _prompt: &Prompt,
            _options: StepOptions,
        ) -> Result<StepOutcome, AgentError> {
            Ok(StepOutcome {
                result: Some("hello".to_string()),
                ..Default::default()
            })
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolRegistry for NoTools {
        async fn schema(&self, name: &str) -> Result<ToolSchema, ToolError> {
            Err(ToolError::UnknownTool { name: name.to_string() })
        }
        async fn execute(&self, name: &str, _args: Value, _ctx: ToolExecutionContext) -> Result<Value, ToolError> {
            Err(ToolError::UnknownTool { name: name.to_string() })
        }
    }

    struct NoFunctions;

    #[async_trait]
    impl FunctionRegistry for NoFunctions {
        async fn call(&self, function_id: &str, _args: Value, _ctx: ToolExecutionContext) -> Result<Value, AgentError> {
            Err(AgentError::StepFailed {
                reason: format!("no such function {function_id}"),
            })
        }
    }

    fn test_config(max_sessions: usize) -> Arc<Config> {
        let mut config = Config::for_tests();
        config.max_sessions_per_user = max_sessions;
        Arc::new(config)
    }

    async fn new_relay(
        max_sessions: usize,
    ) -> (Relay, mpsc::UnboundedReceiver<RelayEvent>, UserId, Arc<Config>) {
        let user_id = UserId::from_uuid(uuid::Uuid::now_v7());
        let ports = Arc::new(Ports::in_memory());
        let config = test_config(max_sessions);
        let security = Arc::new(ScopedSecurity {
            required_scope: config.session_security_scope.clone(),
        });
        let (relay, events) = Relay::new(
            user_id,
            ports,
            security,
            config.clone(),
            Arc::new(EchoRuntime),
            Arc::new(NoTools),
            Arc::new(NoFunctions),
            Arc::new(NoUploads),
        )
        .unwrap();
        (relay, events, user_id, config)
    }

    fn token_for(config: &Config, agent: &str) -> String {
        let key = EncryptionKey::from_hex(&config.encryption_key).unwrap();
        let params = StartTokenParams {
            agent: agent.to_string(),
            model: Some("m-small".to_string()),
            kind: None,
            issued_at: None,
            start_func: None,
            start_params: JsonMap::new(),
            context: JsonMap::new(),
        };
        token::pack(&key, params).unwrap()
    }

    #[tokio::test]
    async fn open_without_session_or_token_is_rejected() {
        let (relay, _events, _user, _config) = new_relay(10).await;
        let err = relay
            .open(OpenRequest {
                session_id: None,
                start_token: None,
                request_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TokenRequired));
    }

    #[tokio::test]
    async fn open_with_valid_token_spawns_and_emits_opened() {
        let (relay, mut events, _user, config) = new_relay(10).await;
        let token = token_for(&config, "chat");

        let session_id = relay
            .open(OpenRequest {
                session_id: None,
                start_token: Some(token),
                request_id: None,
            })
            .await
            .unwrap();

        assert!(relay.is_active(session_id).await);

        let mut saw_opened = false;
        for _ in 0..20 {
            match tokio::time::timeout(std::time::Duration::from_millis(100), events.recv()).await {
                Ok(Some(RelayEvent::SessionOpened { session_id: id, .. })) if id == session_id => {
                    saw_opened = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_opened, "expected a SessionOpened event");
    }

    #[tokio::test]
    async fn session_limit_eviction_keeps_exactly_max_active() {
        let (relay, _events, _user, config) = new_relay(2).await;

        let s1 = relay
            .open(OpenRequest {
                session_id: None,
                start_token: Some(token_for(&config, "chat")),
                request_id: None,
            })
            .await
            .unwrap();
        relay.touch(s1).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let _s2 = relay
            .open(OpenRequest {
                session_id: None,
                start_token: Some(token_for(&config, "chat")),
                request_id: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let _s3 = relay
            .open(OpenRequest {
                session_id: None,
                start_token: Some(token_for(&config, "chat")),
                request_id: None,
            })
            .await
            .unwrap();

        assert_eq!(relay.active_sessions().await.len(), 2);
        assert!(!relay.is_active(s1).await, "oldest session should have been evicted");
    }

    #[tokio::test]
    async fn zero_capacity_open_is_rejected_rather_than_evicting_nothing() {
        let (relay, _events, _user, config) = new_relay(0).await;

        let err = relay
            .open(OpenRequest {
                session_id: None,
                start_token: Some(token_for(&config, "chat")),
                request_id: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::SessionLimitReached { count: 0, max: 0 }));
        assert_eq!(relay.active_sessions().await.len(), 0);
    }

    #[tokio::test]
    async fn message_recovers_a_crashed_session() {
        let (relay, _events, user_id, _config) = new_relay(10).await;

        let row = {
            let mut row: Session = new_session_row(user_id, "chat", JsonMap::new());
            row.status = SessionStatus::Running;
            row
        };
        let session_id = row.session_id;

        // Reach into the relay's own ports so the row is visible to it.
        relay.inner.ports.sessions.create(row).await.unwrap();
        relay.inner.ports.contexts.create(session_id).await.unwrap();

        let resolved = relay
            .message(MessageRequest {
                session_id: Some(session_id),
                text: "hi".to_string(),
                file_uuids: vec![],
                request_id: None,
            })
            .await
            .unwrap();

        assert_eq!(resolved, session_id);
        assert!(relay.is_active(session_id).await);
    }

    #[tokio::test]
    async fn close_keeps_the_last_session_alive() {
        let (relay, _events, _user, config) = new_relay(10).await;
        let session_id = relay
            .open(OpenRequest {
                session_id: None,
                start_token: Some(token_for(&config, "chat")),
                request_id: None,
            })
            .await
            .unwrap();

        relay.close(session_id).await.unwrap();
        assert!(relay.is_active(session_id).await, "last session must survive close");
    }
}
