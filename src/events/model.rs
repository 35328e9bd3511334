use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub ts: SystemTime,
    pub level: LogLevel,
    pub corr_id: Option<String>,
    pub session_id: String,
    pub component: &'static str,
    /// Name of the agent instance that emitted the event, when known.
    pub agent: Option<String>,
    pub suppress_console: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    pub meta: EventMeta,
    pub action: String,
    pub addr: Option<String>,
    pub detail: Option<String>,
}

/// Subscription filter and mapping resolution changes.
#[derive(Debug, Clone, Serialize)]
pub struct MappingEvent {
    pub meta: EventMeta,
    pub action: String,
    pub peer: Option<String>,
    pub output: Option<String>,
    pub detail: Option<String>,
}

/// Inbound control messages, decoded or rejected.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEvent {
    pub meta: EventMeta,
    pub peer: String,
    pub command: String,
    pub accepted: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub meta: EventMeta,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Network(NetworkEvent),
    Mapping(MappingEvent),
    Command(CommandEvent),
    System(SystemEvent),
}

impl LogEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            LogEvent::Network(e) => &e.meta,
            LogEvent::Mapping(e) => &e.meta,
            LogEvent::Command(e) => &e.meta,
            LogEvent::System(e) => &e.meta,
        }
    }
}
