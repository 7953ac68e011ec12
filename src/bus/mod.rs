//! `CommandBus`: the per-session operation queue.
//!
//! A single-consumer operation queue. External callers `enqueue` ops
//! (rejected once the bus is `finishing`); handler output `next_ops` are
//! appended at the tail of the same in-task queue, so control and
//! continuation ops always run after previously enqueued user work. The
//! consumer task itself is a `tokio::select!` loop: one task, one mutable
//! loop state, no shared mutex on the hot path.

pub mod handlers;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::BusError;
use crate::ids::RequestId;
use crate::upstream::Upstream;

pub use handlers::{HandlerOutput, HandlerResult, OperationHandlers};

/// The closed operation-type set the bus understands.
#[derive(Debug, Clone)]
pub enum OperationPayload {
    HandleMessage {
        text: String,
        file_uuids: Vec<String>,
    },
    AgentStep {
        from_user: bool,
    },
    ProcessTools {
        calls: Vec<crate::registry::RawToolCall>,
    },
    AgentContinue,
    ControlArtifacts {
        directives: Vec<crate::control::ArtifactDirective>,
    },
    ControlContext {
        directive: crate::control::ContextDirective,
    },
    ControlMemory {
        directive: crate::control::MemoryDirective,
    },
    ControlConfig {
        directive: crate::control::ConfigDirective,
    },
    AgentChange {
        agent_id: String,
        model: Option<String>,
    },
    ModelChange {
        model: String,
    },
    GenerateTitle,
    CreateCheckpoint,
    CheckBackgroundTriggers,
    ExecuteFunction {
        function_id: String,
        args: serde_json::Value,
    },
    HandleContextCommand {
        action: ContextCommandAction,
        key: String,
        data: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextCommandAction {
    Read,
    Write,
    Delete,
}

impl OperationPayload {
    /// Stable name used in error messages and the `NoHandler`/
    /// `MissingArgument` fatal-error predicate.
    pub fn type_name(&self) -> &'static str {
        match self {
            OperationPayload::HandleMessage { .. } => "handle_message",
            OperationPayload::AgentStep { .. } => "agent_step",
            OperationPayload::ProcessTools { .. } => "process_tools",
            OperationPayload::AgentContinue => "agent_continue",
            OperationPayload::ControlArtifacts { .. } => "control_artifacts",
            OperationPayload::ControlContext { .. } => "control_context",
            OperationPayload::ControlMemory { .. } => "control_memory",
            OperationPayload::ControlConfig { .. } => "control_config",
            OperationPayload::AgentChange { .. } => "agent_change",
            OperationPayload::ModelChange { .. } => "model_change",
            OperationPayload::GenerateTitle => "generate_title",
            OperationPayload::CreateCheckpoint => "create_checkpoint",
            OperationPayload::CheckBackgroundTriggers => "check_background_triggers",
            OperationPayload::ExecuteFunction { .. } => "execute_function",
            OperationPayload::HandleContextCommand { .. } => "handle_context_command",
        }
    }
}

/// An operation on the queue: payload plus the envelope fields every
/// operation carries (`request_id`, `internal`).
#[derive(Debug, Clone)]
pub struct Operation {
    pub payload: OperationPayload,
    pub request_id: Option<RequestId>,
    pub internal: bool,
}

impl Operation {
    pub fn external(payload: OperationPayload, request_id: Option<RequestId>) -> Self {
        Self {
            payload,
            request_id,
            internal: false,
        }
    }

    pub fn internal(payload: OperationPayload) -> Self {
        Self {
            payload,
            request_id: None,
            internal: true,
        }
    }
}

enum ControlMsg {
    Finish,
    Stop,
    InstallInterceptor(Box<dyn FnOnce(Vec<Operation>) + Send>),
}

/// Handle used by producers (the [`crate::actor::SessionActor`]) to talk
/// to the running bus task.
#[derive(Clone)]
pub struct CommandBus {
    queue_tx: mpsc::Sender<Operation>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    finishing: Arc<AtomicBool>,
}

/// Resolves once the bus task's select loop exits.
pub struct BusDone(oneshot::Receiver<()>);

impl BusDone {
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

impl CommandBus {
    /// Spawns the consumer task and returns a handle plus its completion
    /// signal. `queue_empty` runs on the task whenever the combined queue
    /// drains to zero; it is the sole authority for the idle transition
    /// (see the Open Question resolution in DESIGN.md).
    pub fn spawn<H, F>(handlers: H, capacity: usize, queue_empty: F) -> (Self, BusDone)
    where
        H: OperationHandlers + Send + Sync + 'static,
        F: Fn() + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let finishing = Arc::new(AtomicBool::new(false));

        let bus = CommandBus {
            queue_tx,
            control_tx,
            finishing: finishing.clone(),
        };

        tokio::spawn(run(
            Arc::new(handlers),
            queue_rx,
            control_rx,
            finishing,
            Box::new(queue_empty),
            done_tx,
        ));

        (bus, BusDone(done_rx))
    }

    /// Enqueues an externally-submitted operation. Rejected once the bus
    /// is finishing.
    pub async fn enqueue(&self, op: Operation) -> Result<(), BusError> {
        if self.finishing.load(Ordering::SeqCst) {
            return Err(BusError::QueueClosed);
        }
        self.queue_tx
            .send(op)
            .await
            .map_err(|_| BusError::QueueClosed)
    }

    /// Closes the door to new external ops; internal `next_ops` still
    /// drain. The bus stops once pending reaches zero.
    pub fn finish(&self) {
        self.finishing.store(true, Ordering::SeqCst);
        let _ = self.control_tx.send(ControlMsg::Finish);
    }

    /// Terminates the bus immediately, discarding anything still queued.
    pub fn stop(&self) {
        let _ = self.control_tx.send(ControlMsg::Stop);
    }

    /// Installs a one-shot interceptor: the `next_ops` of the *next*
    /// handler result are diverted to it instead of being enqueued. Backs
    /// the `stop` command and the command-success path for agent/model
    /// changes.
    pub fn intercept_next(&self, f: impl FnOnce(Vec<Operation>) + Send + 'static) {
        let _ = self.control_tx.send(ControlMsg::InstallInterceptor(Box::new(f)));
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::SeqCst)
    }
}

async fn run<H: OperationHandlers + Send + Sync + 'static>(
    handlers: Arc<H>,
    mut queue_rx: mpsc::Receiver<Operation>,
    mut control_rx: mpsc::UnboundedReceiver<ControlMsg>,
    finishing: Arc<AtomicBool>,
    queue_empty: Box<dyn Fn() + Send>,
    done_tx: oneshot::Sender<()>,
) {
    let mut local: VecDeque<Operation> = VecDeque::new();
    let mut interceptor: Option<Box<dyn FnOnce(Vec<Operation>) + Send>> = None;

    'outer: loop {
        while let Ok(op) = queue_rx.try_recv() {
            local.push_back(op);
        }
        while let Ok(ctrl) = control_rx.try_recv() {
            if apply_control(ctrl, &finishing, &mut interceptor) {
                break 'outer;
            }
        }

        if local.is_empty() {
            tokio::select! {
                biased;
                ctrl = control_rx.recv() => {
                    match ctrl {
                        Some(ctrl) => {
                            if apply_control(ctrl, &finishing, &mut interceptor) {
                                break 'outer;
                            }
                            continue;
                        }
                        None => break 'outer,
                    }
                }
                op = queue_rx.recv() => {
                    match op {
                        Some(op) => { local.push_back(op); }
                        None => break 'outer,
                    }
                }
            }
            continue;
        }

        let op = local.pop_front().expect("checked non-empty above");
        let request_id = op.request_id;
        let type_name = op.payload.type_name();
        debug!(op = type_name, pending = local.len(), "dispatching operation");

        match handlers.dispatch(op).await {
            Ok(output) => {
                if let Some(f) = interceptor.take() {
                    f(output.next_ops);
                } else {
                    for next in output.next_ops {
                        local.push_back(next);
                    }
                }
                if output.completed && local.is_empty() {
                    // explicit completion with nothing left queued; fall
                    // through to the drain check below.
                }
            }
            Err(err) => {
                warn!(op = type_name, error = %err, "operation handler failed");
                if let Some(rid) = request_id {
                    handlers.emit_command_response(rid, false, Some(err.code().to_string()), Some(err.message()));
                }
                if err.kind().is_fatal() {
                    info!(op = type_name, "fatal error, tearing down bus");
                    break 'outer;
                }
            }
        }

        if local.is_empty() {
            queue_empty();
            if finishing.load(Ordering::SeqCst) {
                break 'outer;
            }
        }
    }

    let _ = done_tx.send(());
}

/// Returns `true` when the loop should terminate.
fn apply_control(
    ctrl: ControlMsg,
    finishing: &Arc<AtomicBool>,
    interceptor: &mut Option<Box<dyn FnOnce(Vec<Operation>) + Send>>,
) -> bool {
    match ctrl {
        ControlMsg::Finish => {
            finishing.store(true, Ordering::SeqCst);
            false
        }
        ControlMsg::Stop => true,
        ControlMsg::InstallInterceptor(f) => {
            *interceptor = Some(f);
            false
        }
    }
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
#[allow(dead_code)]
fn check() {
    assert_send_sync::<CommandBus>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct EchoHandlers {
        idle_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OperationHandlers for EchoHandlers {
        async fn dispatch(&self, op: Operation) -> HandlerResult {
            match op.payload {
                OperationPayload::HandleMessage { .. } => Ok(HandlerOutput {
                    next_ops: vec![Operation::internal(OperationPayload::AgentStep {
                        from_user: true,
                    })],
                    completed: false,
                }),
                OperationPayload::AgentStep { .. } => Ok(HandlerOutput::empty()),
                _ => Ok(HandlerOutput::empty()),
            }
        }

        fn emit_command_response(
            &self,
            _request_id: RequestId,
            _success: bool,
            _code: Option<String>,
            _message: Option<String>,
        ) {
        }
    }

    #[tokio::test]
    async fn drains_and_signals_queue_empty_once() {
        let idle_calls = Arc::new(AtomicUsize::new(0));
        let counter = idle_calls.clone();
        let (bus, done) = CommandBus::spawn(
            EchoHandlers { idle_calls: idle_calls.clone() },
            8,
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.enqueue(Operation::external(
            OperationPayload::HandleMessage {
                text: "hi".to_string(),
                file_uuids: vec![],
            },
            None,
        ))
        .await
        .unwrap();

        bus.finish();
        done.wait().await;
        assert!(idle_calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn rejects_new_ops_once_finishing() {
        let idle_calls = Arc::new(AtomicUsize::new(0));
        let (bus, done) = CommandBus::spawn(
            EchoHandlers { idle_calls },
            8,
            || {},
        );
        bus.finish();
        let err = bus
            .enqueue(Operation::external(OperationPayload::GenerateTitle, None))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::QueueClosed));
        done.wait().await;
    }
}
