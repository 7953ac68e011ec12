//! Error taxonomy shared by every component.
//!
//! Each component owns a `thiserror` enum for its own failure modes
//! (`PersistenceError`, `BusError`, `AgentError`, `ToolError`, `TokenError`,
//! `RelayError`): named struct variants with an `#[error]` message and a
//! single `Other(#[from] anyhow::Error)` catch-all. `ErrorKind` and
//! `code()` project any of them onto a closed taxonomy so callers at the
//! edge (relay, bus) can make uniform decisions without matching on every
//! concrete enum.

use thiserror::Error;

/// Propagation-policy taxonomy: how far an error travels before it stops
/// being recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TransientBackend,
    Agent,
    Tool,
    Fatal,
}

impl ErrorKind {
    /// Fatal errors tear the command bus down; everything else is recoverable.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Fatal)
    }
}

/// The closed, user-visible error-code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidJson,
    SessionLimitReached,
    SessionIdGenError,
    SessionSpawnError,
    InvalidSessionId,
    SessionNotFound,
    InvalidMessageType,
    TokenInvalid,
    AgentError,
    StorageError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "invalid_json",
            ErrorCode::SessionLimitReached => "session_limit_reached",
            ErrorCode::SessionIdGenError => "session_id_gen_error",
            ErrorCode::SessionSpawnError => "session_spawn_error",
            ErrorCode::InvalidSessionId => "invalid_session_id",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::InvalidMessageType => "invalid_message_type",
            ErrorCode::TokenInvalid => "token_invalid",
            ErrorCode::AgentError => "agent_error",
            ErrorCode::StorageError => "storage_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the five persistence ports.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("validation failed for field '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },

    #[error("storage backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PersistenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistenceError::NotFound { .. } => ErrorKind::NotFound,
            PersistenceError::Conflict { .. } => ErrorKind::Conflict,
            PersistenceError::ValidationFailed { .. } => ErrorKind::Validation,
            PersistenceError::BackendUnavailable { .. } => ErrorKind::TransientBackend,
            PersistenceError::Other(_) => ErrorKind::TransientBackend,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            PersistenceError::NotFound { .. } => ErrorCode::SessionNotFound,
            _ => ErrorCode::StorageError,
        }
    }
}

/// Errors raised while sealing/unsealing start tokens.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("start token key must be 16, 24, or 32 bytes of hex, got {len} bytes")]
    InvalidKeyLength { len: usize },

    #[error("start token is not valid hex/base64: {reason}")]
    Malformed { reason: String },

    #[error("start token failed authentication")]
    Tamper,

    #[error("start token is older than the freshness window")]
    Expired,
}

impl TokenError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::TokenInvalid
    }
}

/// Errors raised by `AgentContext` / the agent-runtime collaborator.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown agent id: {id}")]
    UnknownAgent { id: String },

    #[error("unknown model id: {id}")]
    UnknownModel { id: String },

    #[error("agent runtime step failed: {reason}")]
    StepFailed { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::UnknownAgent { .. } | AgentError::UnknownModel { .. } => {
                ErrorKind::Validation
            }
            AgentError::StepFailed { .. } | AgentError::Other(_) => ErrorKind::Agent,
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::AgentError
    }
}

/// Errors raised by `ToolCaller`.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no such tool: {name}")]
    UnknownTool { name: String },

    #[error("more than one exclusive tool call in the same batch")]
    MultipleExclusive,

    #[error("tool call arguments are not valid JSON: {reason}")]
    InvalidArguments { reason: String },

    #[error("tool '{name}' failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::UnknownTool { .. }
            | ToolError::MultipleExclusive
            | ToolError::InvalidArguments { .. } => ErrorKind::Validation,
            ToolError::ExecutionFailed { .. } => ErrorKind::Tool,
        }
    }
}

/// Errors raised by the command bus itself (not by individual handlers).
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no handler registered for operation '{op}'")]
    NoHandler { op: String },

    #[error("operation '{op}' is missing required argument '{arg}'")]
    MissingArgument { op: String, arg: String },

    #[error("failed to open session: {reason}")]
    SessionOpenFailed { reason: String },

    #[error("cannot open a session whose persisted status is 'failed'")]
    SessionFailed,

    #[error("operation queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Writer(#[from] WriterError),
}

impl BusError {
    /// Fatal = {no handler for op; missing required arguments; failed to
    /// open session; cannot open failed session}. Everything that bubbles
    /// up from a recoverable persistence/agent/tool failure stays
    /// recoverable at the bus level.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::NoHandler { .. }
            | BusError::MissingArgument { .. }
            | BusError::SessionOpenFailed { .. }
            | BusError::SessionFailed => ErrorKind::Fatal,
            BusError::QueueClosed => ErrorKind::Fatal,
            BusError::Persistence(e) => e.kind(),
            BusError::Agent(e) => e.kind(),
            BusError::Tool(e) => e.kind(),
            BusError::Reader(e) => e.kind(),
            BusError::Writer(e) => e.kind(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BusError::NoHandler { .. }
            | BusError::MissingArgument { .. }
            | BusError::QueueClosed => ErrorCode::SessionSpawnError,
            BusError::SessionOpenFailed { .. } | BusError::SessionFailed => {
                ErrorCode::SessionNotFound
            }
            BusError::Persistence(e) => e.code(),
            BusError::Agent(e) => e.code(),
            BusError::Tool(_) => ErrorCode::AgentError,
            BusError::Reader(e) => e.code(),
            BusError::Writer(e) => e.code(),
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Errors raised by the security collaborator when opening a
/// reader/writer against a session.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("actor is not authenticated")]
    Unauthorized,

    #[error("actor {actor} may not access session {session}")]
    Forbidden { actor: String, session: String },
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::Unauthorized => ErrorKind::Unauthorized,
            SecurityError::Forbidden { .. } => ErrorKind::Forbidden,
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::SessionNotFound
    }
}

/// Errors raised opening or using a [`crate::reader::SessionReader`].
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ReaderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReaderError::Security(e) => e.kind(),
            ReaderError::Persistence(e) => e.kind(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ReaderError::Security(e) => e.code(),
            ReaderError::Persistence(e) => e.code(),
        }
    }
}

/// Errors raised opening or using a [`crate::writer::SessionWriter`].
#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("artifact {artifact} does not belong to session {session}")]
    ArtifactNotInSession { artifact: String, session: String },
}

impl WriterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriterError::Security(e) => e.kind(),
            WriterError::Persistence(e) => e.kind(),
            WriterError::ArtifactNotInSession { .. } => ErrorKind::Validation,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            WriterError::Security(e) => e.code(),
            WriterError::Persistence(e) => e.code(),
            WriterError::ArtifactNotInSession { .. } => ErrorCode::InvalidSessionId,
        }
    }
}

/// Errors raised by the relay supervisor.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("user already has {count} sessions, the maximum is {max}")]
    SessionLimitReached { count: usize, max: usize },

    #[error("no such session: {id}")]
    SessionNotFound { id: String },

    #[error("start token is required to open a new session")]
    TokenRequired,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("failed to spawn session actor: {reason}")]
    SpawnFailed { reason: String },
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::SessionLimitReached { .. } => ErrorCode::SessionLimitReached,
            RelayError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            RelayError::TokenRequired | RelayError::Token(_) => ErrorCode::TokenInvalid,
            RelayError::Persistence(e) => e.code(),
            RelayError::Bus(e) => e.code(),
            RelayError::SpawnFailed { .. } => ErrorCode::SessionSpawnError,
        }
    }
}
