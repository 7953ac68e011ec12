//! agentrelay - multi-tenant conversational-agent runtime.
//!
//! A [`relay::Relay`] supervises one user's sessions. Each live session is
//! a [`actor::SessionActor`] driving a [`bus::CommandBus`] that sequences
//! agent steps, tool calls, and control directives against state held
//! behind a [`reader::SessionReader`] / [`writer::SessionWriter`] split
//! over [`persistence::Ports`].

#![allow(clippy::too_many_arguments)]
#![allow(clippy::large_enum_variant)]

pub mod actor;
pub mod agent_context;
pub mod bus;
pub mod config;
pub mod control;
pub mod error;
pub mod ids;
pub mod model;
pub mod persistence;
pub mod prompt_builder;
pub mod reader;
pub mod registry;
pub mod relay;
pub mod token;
pub mod tool_caller;
pub mod upstream;
pub mod writer;

pub mod prelude {
    pub use crate::actor::{
        spawn_session_actor, ActorEvent, ActorExit, ActorInbox, InboundCommand, InboundMessage,
        SessionActorHandle,
    };
    pub use crate::config::Config;
    pub use crate::error::{BusError, PersistenceError, ReaderError, RelayError, WriterError};
    pub use crate::ids::{ArtifactId, CallId, MessageId, RequestId, SessionContextId, SessionId, UserId};
    pub use crate::model::{
        Artifact, ArtifactKind, Message, MessageType, PrimaryContext, Session, SessionContext,
        SessionMetaPatch, SessionStatus,
    };
    pub use crate::persistence::Ports;
    pub use crate::relay::{CommandRequest, MessageRequest, OpenRequest, Relay, RelayEvent};
    pub use crate::token::{EncryptionKey, StartTokenParams};
    pub use crate::upstream::Emit;
}

pub use prelude::*;
