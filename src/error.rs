// src/error.rs

use thiserror::Error;

use crate::model::IopType;

/// Errors raised by definition/mapping manipulation and value conversion.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no {kind} named '{name}'")]
    UnknownIop { kind: &'static str, name: String },
    #[error("'{name}' already exists as {existing}")]
    NameClash { name: String, existing: &'static str },
    #[error("cannot convert {from} to {to}: {detail}")]
    Conversion {
        from: IopType,
        to: IopType,
        detail: String,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown type name '{0}'")]
    UnknownType(String),
    #[error("invalid value for '{name}': {detail}")]
    InvalidValue { name: String, detail: String },
    #[error("mapping element {0} not found")]
    UnknownMappingElement(u64),
    #[error("several mapping elements share id {0}")]
    AmbiguousMappingElement(u64),
    #[error("value of '{name}' is {len} bytes, above the frame limit")]
    ValueTooLarge { name: String, len: usize },
    #[error("empty name")]
    EmptyName,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding inbound control messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty message")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("command '{command}' expects {expected}")]
    MissingArgument {
        command: &'static str,
        expected: &'static str,
    },
    #[error("message is not valid UTF-8")]
    NotUtf8,
}

/// Errors raised by the presence layer implementations.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence not started")]
    NotStarted,
    #[error("presence already started")]
    AlreadyStarted,
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("send failed: {0}")]
    Send(String),
}

/// Errors surfaced by the host-facing `Agent` API.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already running")]
    AlreadyRunning,
    #[error("agent is not running")]
    NotRunning,
    #[error("publisher setup failed: {0}")]
    Publisher(#[source] std::io::Error),
    #[error("presence setup failed: {0}")]
    Presence(#[from] PresenceError),
    #[error("reactor thread failed: {0}")]
    Reactor(String),
    #[error("agent cannot be frozen")]
    CannotBeFrozen,
    #[error("channel '{0}' is reserved")]
    ReservedChannel(String),
    #[error("no answer from the reactor")]
    QueryTimeout,
    #[error(transparent)]
    Model(#[from] ModelError),
}
