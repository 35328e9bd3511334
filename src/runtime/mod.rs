// src/runtime/mod.rs

//! Per-agent reactor state: directory, subscribers, publication and command
//! dispatch. One `AgentRuntime` lives on the reactor thread of each running
//! `Agent`; the host side talks to it through `ControlMessage`s.

pub mod command;
pub mod directory;
mod processor;
pub mod publication;
pub(crate) mod reactor;
pub mod resolver;
pub mod subscriber;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::config::{Config, FilterPolicy};
use crate::constants::{
    HEADER_CAN_BE_FROZEN, HEADER_COMMANDLINE, HEADER_HOSTNAME, HEADER_IPC, HEADER_PID,
    HEADER_PUBLISHER, PRIVATE_CHANNEL,
};
use crate::error::AgentError;
use crate::events::dispatcher;
use crate::events::model::{CommandEvent, LogEvent, LogLevel, MappingEvent};
use crate::model::{Definition, IopValue, Mapping, SharedModel};
use crate::network::events::emit_network_event;
use crate::network::{
    Frames, InboundData, Peer, Presence, PresenceEvent, Publisher, PublisherConfig,
};

use command::Command;
use directory::Directory;
use publication::PublicationEngine;
use subscriber::Subscriber;

/// Reactor tunables resolved from `Config`.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub broadcast_interval: Duration,
    pub outputs_request_delay: Duration,
    pub expiry: Option<Duration>,
    pub filter_policy: FilterPolicy,
    pub interrupt_on_forced_stop: bool,
    /// Directory for the unix-socket publisher; `None` disables it
    pub ipc_dir: Option<PathBuf>,
    pub allow_console: bool,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broadcast_interval: config.broadcast_interval(),
            outputs_request_delay: config.outputs_request_delay(),
            expiry: config.expiry(),
            filter_policy: config.filter_policy(),
            interrupt_on_forced_stop: config.interrupt_on_forced_stop(),
            ipc_dir: config.ipc_enabled().then(|| config.ipc_dir()),
            allow_console: !config
                .logging
                .as_ref()
                .and_then(|l| l.disable_console)
                .unwrap_or(false),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Notifications delivered to the host through `Agent::subscribe_events`.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    InputUpdated { name: String, value: IopValue },
    OutputUpdated { name: String, value: IopValue },
    ParameterUpdated { name: String, value: IopValue },
    MuteChanged(bool),
    OutputMuteChanged { name: String, muted: bool },
    FreezeChanged(bool),
    /// A peer sent `STOP`; the reactor is shutting down.
    ForcedStop { by: String },
    PeerEntered { peer_id: String, name: String },
    PeerExited { peer_id: String, name: String },
    BusJoined { peer_id: String, name: String, group: String },
    BusLeft { peer_id: String, name: String, group: String },
    BusShout {
        peer_id: String,
        name: String,
        group: String,
        frames: Frames,
    },
    BusWhisper {
        peer_id: String,
        name: String,
        frames: Frames,
    },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    ForcedStop { by: String },
    Expired,
    PresenceLost,
}

/// Read-only questions the host asks the reactor. Answers go back over a
/// std channel so a non-async host thread can wait on them.
pub(crate) enum Query {
    Peers(std_mpsc::Sender<Vec<Peer>>),
    PeerDefinition(String, std_mpsc::Sender<Option<Definition>>),
    PeerMapping(String, std_mpsc::Sender<Option<Mapping>>),
    PeerFilters(String, std_mpsc::Sender<Option<BTreeSet<String>>>),
}

pub(crate) enum ControlMessage {
    Terminate,
    /// Shout a state notice on the private channel.
    Notice(Command),
    BusJoin(String),
    BusLeave(String),
    BusShout { group: String, frames: Frames },
    BusWhisper { peer: String, frames: Frames },
    Query(Query),
}

pub(crate) struct AgentRuntime {
    agent_name: String,
    model: SharedModel,
    settings: RuntimeSettings,
    presence: Box<dyn Presence>,
    directory: Directory,
    subscribers: HashMap<String, Subscriber>,
    engine: PublicationEngine,
    publisher: Option<Publisher>,
    events: broadcast::Sender<AgentEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundData>,
    host_address: String,
    stop_reason: Option<StopReason>,
}

/// Receivers the reactor loop selects over, produced by `AgentRuntime::setup`.
pub(crate) struct RuntimeStreams {
    pub presence_rx: mpsc::UnboundedReceiver<PresenceEvent>,
    pub inbound_rx: mpsc::UnboundedReceiver<InboundData>,
}

impl AgentRuntime {
    /// Bind the publisher, advertise headers, start presence and join the
    /// private channel. On failure the presence is handed back untouched
    /// (apart from headers) so the caller can retry later.
    pub(crate) async fn setup(
        model: SharedModel,
        settings: RuntimeSettings,
        mut publisher_config: PublisherConfig,
        mut presence: Box<dyn Presence>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Result<(Self, RuntimeStreams), (AgentError, Box<dyn Presence>)> {
        let (agent_name, can_be_frozen) = {
            let m = model.read();
            (m.agent_name.clone(), m.can_be_frozen)
        };
        publisher_config.allow_console = settings.allow_console;
        publisher_config.ipc_path = settings
            .ipc_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.sock", presence.node_id())));

        let publisher = match Publisher::bind(publisher_config).await {
            Ok(p) => p,
            Err(e) => return Err((AgentError::Publisher(e), presence)),
        };

        presence.set_name(&agent_name);
        presence.set_header(HEADER_PUBLISHER, &publisher.port().to_string());
        if let Some(path) = publisher.ipc_path() {
            presence.set_header(HEADER_IPC, &path.display().to_string());
        }
        presence.set_header(HEADER_CAN_BE_FROZEN, if can_be_frozen { "1" } else { "0" });
        presence.set_header(HEADER_PID, &std::process::id().to_string());
        presence.set_header(
            HEADER_COMMANDLINE,
            &std::env::args().collect::<Vec<_>>().join(" "),
        );
        if let Ok(host) = hostname::get() {
            presence.set_header(HEADER_HOSTNAME, &host.to_string_lossy());
        }

        let presence_rx = match presence.start().await {
            Ok(rx) => rx,
            Err(e) => {
                publisher.shutdown();
                return Err((AgentError::Presence(e), presence));
            }
        };
        if let Err(e) = presence.join(PRIVATE_CHANNEL) {
            presence.stop().await;
            publisher.shutdown();
            return Err((AgentError::Presence(e), presence));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let host_address = presence.host_address();
        emit_network_event(
            "runtime",
            LogLevel::Info,
            "agent_started",
            Some(host_address.clone()),
            Some(format!(
                "name={} node_id={} publisher={}",
                agent_name,
                presence.node_id(),
                publisher.port()
            )),
            settings.allow_console,
        );
        let runtime = Self {
            agent_name,
            engine: PublicationEngine::new(publisher.handle()),
            publisher: Some(publisher),
            model,
            settings,
            presence,
            directory: Directory::new(),
            subscribers: HashMap::new(),
            events,
            inbound_tx,
            host_address,
            stop_reason: None,
        };
        Ok((
            runtime,
            RuntimeStreams {
                presence_rx,
                inbound_rx,
            },
        ))
    }

    pub(crate) fn engine(&self) -> PublicationEngine {
        self.engine.clone()
    }

    pub(crate) fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    fn request_stop(&mut self, reason: StopReason) {
        self.stop_reason.get_or_insert(reason);
    }

    fn emit(&self, event: AgentEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn emit_mapping_event(
        &self,
        level: LogLevel,
        action: &str,
        peer: Option<&str>,
        output: Option<&str>,
        detail: Option<String>,
    ) {
        let mut meta = dispatcher::agent_meta("resolver", level, &self.agent_name);
        meta.suppress_console = !self.settings.allow_console;
        dispatcher::emit(LogEvent::Mapping(MappingEvent {
            meta,
            action: action.to_string(),
            peer: peer.map(str::to_string),
            output: output.map(str::to_string),
            detail,
        }));
    }

    fn emit_command_event(
        &self,
        level: LogLevel,
        peer: &str,
        command: &str,
        accepted: bool,
        detail: Option<String>,
    ) {
        let mut meta = dispatcher::agent_meta("commands", level, &self.agent_name);
        meta.suppress_console = !self.settings.allow_console;
        dispatcher::emit(LogEvent::Command(CommandEvent {
            meta,
            peer: peer.to_string(),
            command: command.to_string(),
            accepted,
            detail,
        }));
    }

    fn whisper(&mut self, peer_id: &str, command: &Command) {
        if let Err(e) = self.presence.whisper(peer_id, command.to_frames()) {
            emit_network_event(
                "runtime",
                LogLevel::Warn,
                "whisper_failed",
                Some(peer_id.to_string()),
                Some(format!("{}: {}", command.keyword(), e)),
                self.settings.allow_console,
            );
        }
    }

    /// Whisper to every peer that joined our private channel.
    fn whisper_joined(&mut self, command: &Command) {
        for peer_id in self.directory.joined_ids() {
            self.whisper(&peer_id, command);
        }
    }

    fn shout_notice(&mut self, command: &Command) {
        if let Err(e) = self.presence.shout(PRIVATE_CHANNEL, command.to_frames()) {
            emit_network_event(
                "runtime",
                LogLevel::Warn,
                "shout_failed",
                Some(PRIVATE_CHANNEL.to_string()),
                Some(format!("{}: {}", command.keyword(), e)),
                self.settings.allow_console,
            );
        }
    }

    fn peer_name(&self, peer_id: &str) -> String {
        self.directory
            .get(peer_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| peer_id.to_string())
    }

    /// Re-run the resolver for one subscriber and arm its outputs request
    /// when filters were added or survived a wholesale replacement.
    fn resolve_subscriber(&mut self, peer_id: &str) {
        let (delta, has_filters) = {
            let Some(sub) = self.subscribers.get_mut(peer_id) else {
                return;
            };
            let model = self.model.read();
            let delta =
                resolver::resolve(sub, &model.definition, &model.mapping, self.settings.filter_policy);
            (delta, !sub.filters().is_empty())
        };
        if delta.is_empty() && !(delta.reset && has_filters) {
            return;
        }
        let name = self.peer_name(peer_id);
        for output in &delta.added {
            self.emit_mapping_event(LogLevel::Debug, "filter_added", Some(&name), Some(output), None);
        }
        for output in &delta.removed {
            self.emit_mapping_event(LogLevel::Debug, "filter_removed", Some(&name), Some(output), None);
        }
        if !delta.added.is_empty() || (delta.reset && has_filters) {
            let at = tokio::time::Instant::now() + self.settings.outputs_request_delay;
            if let Some(sub) = self.subscribers.get_mut(peer_id) {
                sub.arm_outputs_request(at);
            }
        }
    }
}
