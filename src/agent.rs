// src/agent.rs

//! Host-facing agent handle.
//!
//! `Agent` owns the shared model and, while running, a reactor thread with its
//! own current-thread tokio runtime. Every method here is synchronous and may
//! be called from any thread, including from inside another tokio runtime.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::constants::PRIVATE_CHANNEL;
use crate::error::{AgentError, ModelError};
use crate::model::{AgentModel, Definition, IopKind, IopType, IopValue, Mapping, SharedModel};
use crate::network::{text_frames, Frames, Peer, Presence, PublisherConfig};
use crate::runtime::command::Command;
use crate::runtime::publication::{self, PublicationEngine};
use crate::runtime::{reactor, AgentEvent, ControlMessage, Query, RuntimeSettings};
use crate::utils::sanitize_name;

const EVENT_CAPACITY: usize = 1024;
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

struct Running {
    control: mpsc::UnboundedSender<ControlMessage>,
    engine: PublicationEngine,
    thread: JoinHandle<Box<dyn Presence>>,
}

pub struct Agent {
    model: SharedModel,
    config: Config,
    node_id: String,
    events: broadcast::Sender<AgentEvent>,
    presence: Option<Box<dyn Presence>>,
    running: Option<Running>,
}

macro_rules! typed_read {
    ($fn_name:ident, $kind:expr, $ty:expr, $variant:ident, $ret:ty) => {
        pub fn $fn_name(&self, name: &str) -> Result<$ret, AgentError> {
            match self.read_as($kind, name, $ty)? {
                IopValue::$variant(v) => Ok(v),
                other => Err(ModelError::Conversion {
                    from: other.iop_type(),
                    to: $ty,
                    detail: "unexpected value".into(),
                }
                .into()),
            }
        }
    };
}

impl Agent {
    /// Create a stopped agent. The presence is configured and started by `start`.
    pub fn new(name: &str, config: Config, presence: Box<dyn Presence>) -> Self {
        let mut model = AgentModel::new(sanitize_name(name));
        model.can_be_frozen = config.can_be_frozen();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            model: model.shared(),
            config,
            node_id: presence.node_id().to_string(),
            events,
            presence: Some(presence),
            running: None,
        }
    }

    pub fn name(&self) -> String {
        self.model.read().agent_name.clone()
    }

    /// Peer id other agents see us under.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bind the publisher, start presence and spawn the reactor. Returns once
    /// the reactor is ready, or with the setup error.
    pub fn start(&mut self) -> Result<(), AgentError> {
        if self.is_running() {
            return Err(AgentError::AlreadyRunning);
        }
        self.reap();
        let presence = self
            .presence
            .take()
            .ok_or_else(|| AgentError::Reactor("presence was lost by a previous run".into()))?;

        let settings = RuntimeSettings::from_config(&self.config);
        let publisher_config = PublisherConfig {
            port: self.config.publisher_port(),
            ..PublisherConfig::default()
        };
        let (control, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let model = self.model.clone();
        let events = self.events.clone();
        let thread = std::thread::Builder::new()
            .name(format!("agentmesh-{}", self.name()))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AgentError::Reactor(e.to_string())));
                        return presence;
                    }
                };
                rt.block_on(reactor::run(
                    model,
                    settings,
                    publisher_config,
                    presence,
                    events,
                    control_rx,
                    ready_tx,
                ))
            })
            .map_err(|e| AgentError::Reactor(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(engine)) => {
                self.running = Some(Running {
                    control,
                    engine,
                    thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                self.presence = thread.join().ok();
                Err(e)
            }
            Err(_) => {
                self.presence = thread.join().ok();
                Err(AgentError::Reactor("reactor exited during setup".into()))
            }
        }
    }

    /// Stop the reactor and wait for teardown. No-op when not running.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.control.send(ControlMessage::Terminate);
            self.presence = running.thread.join().ok();
        }
    }

    /// False once `stop` was called or the reactor ended by itself
    /// (peer `STOP`, expiry).
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.thread.is_finished())
    }

    /// Collect a reactor that ended on its own so `start` can run again.
    fn reap(&mut self) {
        if let Some(running) = self.running.take() {
            self.presence = running.thread.join().ok();
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn control(&self, message: ControlMessage) -> Result<(), AgentError> {
        let running = self.running.as_ref().ok_or(AgentError::NotRunning)?;
        running
            .control
            .send(message)
            .map_err(|_| AgentError::NotRunning)
    }

    /// Shout a state notice when running; silently skipped otherwise.
    fn notice(&self, command: Command) {
        let _ = self.control(ControlMessage::Notice(command));
    }

    fn ask<T>(&self, build: impl FnOnce(std_mpsc::Sender<T>) -> Query) -> Result<T, AgentError> {
        let (tx, rx) = std_mpsc::channel();
        self.control(ControlMessage::Query(build(tx)))?;
        rx.recv_timeout(QUERY_TIMEOUT)
            .map_err(|_| AgentError::QueryTimeout)
    }

    // Definition

    fn create(
        &self,
        kind: IopKind,
        name: &str,
        iop_type: IopType,
        value: Option<IopValue>,
    ) -> Result<(), AgentError> {
        let mut m = self.model.write();
        m.definition.create(kind, name, iop_type, value)?;
        m.definition_dirty = true;
        Ok(())
    }

    pub fn create_input(&self, name: &str, iop_type: IopType, value: Option<IopValue>) -> Result<(), AgentError> {
        self.create(IopKind::Input, name, iop_type, value)
    }

    pub fn create_output(&self, name: &str, iop_type: IopType, value: Option<IopValue>) -> Result<(), AgentError> {
        self.create(IopKind::Output, name, iop_type, value)
    }

    pub fn create_parameter(&self, name: &str, iop_type: IopType, value: Option<IopValue>) -> Result<(), AgentError> {
        self.create(IopKind::Parameter, name, iop_type, value)
    }

    fn remove(&self, kind: IopKind, name: &str) -> Result<(), AgentError> {
        let mut m = self.model.write();
        m.definition.remove(kind, name)?;
        m.definition_dirty = true;
        Ok(())
    }

    pub fn remove_input(&self, name: &str) -> Result<(), AgentError> {
        self.remove(IopKind::Input, name)
    }

    pub fn remove_output(&self, name: &str) -> Result<(), AgentError> {
        self.remove(IopKind::Output, name)
    }

    pub fn remove_parameter(&self, name: &str) -> Result<(), AgentError> {
        self.remove(IopKind::Parameter, name)
    }

    pub fn load_definition(&self, json: &str) -> Result<(), AgentError> {
        let mut definition = Definition::from_json(json)?;
        let mut m = self.model.write();
        definition.name = m.agent_name.clone();
        m.replace_definition(definition);
        Ok(())
    }

    pub fn load_definition_file(&self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(ModelError::from)?;
        self.load_definition(&json)?;
        self.model.write().definition_path = Some(path.display().to_string());
        Ok(())
    }

    pub fn export_definition(&self) -> String {
        self.model.read().definition.to_json()
    }

    pub fn definition(&self) -> Definition {
        self.model.read().definition.clone()
    }

    // Values

    /// Store a new input value and notify observers.
    pub fn write_input(&self, name: &str, value: impl Into<IopValue>) -> Result<(), AgentError> {
        let stored = self
            .model
            .write()
            .definition
            .write(IopKind::Input, name, &value.into())?;
        self.emit(AgentEvent::InputUpdated {
            name: name.to_string(),
            value: stored,
        });
        Ok(())
    }

    /// Store a new output value and publish it unless muted or frozen.
    pub fn write_output(&self, name: &str, value: impl Into<IopValue>) -> Result<(), AgentError> {
        let (stored, prepared) = {
            let mut m = self.model.write();
            let stored = m.definition.write(IopKind::Output, name, &value.into())?;
            (stored, publication::prepare(&m, name)?)
        };
        if let (Ok(message), Some(running)) = (prepared, self.running.as_ref()) {
            running.engine.send(message);
        }
        self.emit(AgentEvent::OutputUpdated {
            name: name.to_string(),
            value: stored,
        });
        Ok(())
    }

    pub fn write_parameter(&self, name: &str, value: impl Into<IopValue>) -> Result<(), AgentError> {
        let stored = self
            .model
            .write()
            .definition
            .write(IopKind::Parameter, name, &value.into())?;
        self.emit(AgentEvent::ParameterUpdated {
            name: name.to_string(),
            value: stored,
        });
        Ok(())
    }

    fn read_as(&self, kind: IopKind, name: &str, iop_type: IopType) -> Result<IopValue, AgentError> {
        let m = self.model.read();
        let iop = m.definition.get(kind, name).ok_or_else(|| ModelError::UnknownIop {
            kind: kind.as_str(),
            name: name.to_string(),
        })?;
        Ok(iop.value.convert_to(iop_type)?)
    }

    pub fn read_input(&self, name: &str) -> Option<IopValue> {
        self.model.read().definition.input(name).map(|i| i.value.clone())
    }

    pub fn read_output(&self, name: &str) -> Option<IopValue> {
        self.model.read().definition.output(name).map(|i| i.value.clone())
    }

    pub fn read_parameter(&self, name: &str) -> Option<IopValue> {
        self.model
            .read()
            .definition
            .get(IopKind::Parameter, name)
            .map(|i| i.value.clone())
    }

    typed_read!(read_input_as_int, IopKind::Input, IopType::Integer, Integer, i32);
    typed_read!(read_input_as_double, IopKind::Input, IopType::Double, Double, f64);
    typed_read!(read_input_as_bool, IopKind::Input, IopType::Bool, Bool, bool);
    typed_read!(read_input_as_string, IopKind::Input, IopType::String, String, String);
    typed_read!(read_input_as_data, IopKind::Input, IopType::Data, Data, Vec<u8>);
    typed_read!(read_output_as_int, IopKind::Output, IopType::Integer, Integer, i32);
    typed_read!(read_output_as_double, IopKind::Output, IopType::Double, Double, f64);
    typed_read!(read_output_as_bool, IopKind::Output, IopType::Bool, Bool, bool);
    typed_read!(read_output_as_string, IopKind::Output, IopType::String, String, String);
    typed_read!(read_output_as_data, IopKind::Output, IopType::Data, Data, Vec<u8>);
    typed_read!(read_parameter_as_int, IopKind::Parameter, IopType::Integer, Integer, i32);
    typed_read!(read_parameter_as_double, IopKind::Parameter, IopType::Double, Double, f64);
    typed_read!(read_parameter_as_bool, IopKind::Parameter, IopType::Bool, Bool, bool);
    typed_read!(read_parameter_as_string, IopKind::Parameter, IopType::String, String, String);
    typed_read!(read_parameter_as_data, IopKind::Parameter, IopType::Data, Data, Vec<u8>);

    // Mapping

    pub fn load_mapping(&self, json: &str) -> Result<(), AgentError> {
        let mapping = Mapping::from_json(json)?;
        self.model.write().replace_mapping(mapping);
        Ok(())
    }

    pub fn load_mapping_file(&self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(ModelError::from)?;
        self.load_mapping(&json)?;
        self.model.write().mapping_path = Some(path.display().to_string());
        Ok(())
    }

    pub fn export_mapping(&self) -> String {
        self.model.read().mapping.to_json()
    }

    pub fn mapping(&self) -> Mapping {
        self.model.read().mapping.clone()
    }

    /// Returns the element id.
    pub fn add_mapping_entry(&self, input: &str, agent: &str, output: &str) -> Result<u64, AgentError> {
        let mut m = self.model.write();
        let id = m.mapping.add(input, agent, output)?;
        m.mapping_dirty = true;
        Ok(id)
    }

    pub fn remove_mapping_entry(&self, input: &str, agent: &str, output: &str) -> Result<(), AgentError> {
        let mut m = self.model.write();
        m.mapping.remove(input, agent, output)?;
        m.mapping_dirty = true;
        Ok(())
    }

    pub fn remove_mapping_entry_by_id(&self, id: u64) -> Result<(), AgentError> {
        let mut m = self.model.write();
        m.mapping.remove_by_id(id)?;
        m.mapping_dirty = true;
        Ok(())
    }

    pub fn clear_mapping(&self) {
        let mut m = self.model.write();
        m.mapping.clear();
        m.mapping_dirty = true;
        m.mapping_replaced = true;
    }

    // Mute / freeze / state

    fn set_muted(&self, muted: bool) {
        {
            let mut m = self.model.write();
            if m.muted == muted {
                return;
            }
            m.muted = muted;
        }
        self.emit(AgentEvent::MuteChanged(muted));
        self.notice(Command::Muted(muted));
    }

    pub fn mute(&self) {
        self.set_muted(true)
    }

    pub fn unmute(&self) {
        self.set_muted(false)
    }

    pub fn is_muted(&self) -> bool {
        self.model.read().muted
    }

    fn set_output_muted(&self, name: &str, muted: bool) -> Result<(), AgentError> {
        {
            let mut m = self.model.write();
            let iop = m
                .definition
                .get_mut(IopKind::Output, name)
                .ok_or_else(|| ModelError::UnknownIop {
                    kind: IopKind::Output.as_str(),
                    name: name.to_string(),
                })?;
            iop.muted = muted;
        }
        self.emit(AgentEvent::OutputMuteChanged {
            name: name.to_string(),
            muted,
        });
        self.notice(if muted {
            Command::OutputMuted(name.to_string())
        } else {
            Command::OutputUnmuted(name.to_string())
        });
        Ok(())
    }

    pub fn mute_output(&self, name: &str) -> Result<(), AgentError> {
        self.set_output_muted(name, true)
    }

    pub fn unmute_output(&self, name: &str) -> Result<(), AgentError> {
        self.set_output_muted(name, false)
    }

    fn set_frozen(&self, frozen: bool) -> Result<(), AgentError> {
        {
            let mut m = self.model.write();
            if frozen && !m.can_be_frozen {
                return Err(AgentError::CannotBeFrozen);
            }
            if m.frozen == frozen {
                return Ok(());
            }
            m.frozen = frozen;
        }
        self.emit(AgentEvent::FreezeChanged(frozen));
        self.notice(Command::Frozen(frozen));
        Ok(())
    }

    pub fn freeze(&self) -> Result<(), AgentError> {
        self.set_frozen(true)
    }

    pub fn unfreeze(&self) -> Result<(), AgentError> {
        self.set_frozen(false)
    }

    pub fn is_frozen(&self) -> bool {
        self.model.read().frozen
    }

    /// Takes effect in the `canBeFrozen` header on the next `start`.
    pub fn set_can_be_frozen(&self, can_be_frozen: bool) {
        self.model.write().can_be_frozen = can_be_frozen;
    }

    pub fn set_state(&self, state: &str) {
        self.model.write().state = state.to_string();
        self.notice(Command::State(state.to_string()));
    }

    pub fn state(&self) -> String {
        self.model.read().state.clone()
    }

    // Peers

    pub fn peers(&self) -> Result<Vec<Peer>, AgentError> {
        self.ask(Query::Peers)
    }

    /// Last definition received from a peer, by id or name.
    pub fn peer_definition(&self, peer: &str) -> Result<Option<Definition>, AgentError> {
        self.ask(|tx| Query::PeerDefinition(peer.to_string(), tx))
    }

    pub fn peer_mapping(&self, peer: &str) -> Result<Option<Mapping>, AgentError> {
        self.ask(|tx| Query::PeerMapping(peer.to_string(), tx))
    }

    /// Outputs we currently filter on the peer's publish socket.
    pub fn peer_filters(&self, peer: &str) -> Result<Option<BTreeSet<String>>, AgentError> {
        self.ask(|tx| Query::PeerFilters(peer.to_string(), tx))
    }

    // Bus

    fn check_channel(group: &str) -> Result<(), AgentError> {
        if group == PRIVATE_CHANNEL {
            return Err(AgentError::ReservedChannel(group.to_string()));
        }
        Ok(())
    }

    pub fn bus_join(&self, group: &str) -> Result<(), AgentError> {
        Self::check_channel(group)?;
        self.control(ControlMessage::BusJoin(group.to_string()))
    }

    pub fn bus_leave(&self, group: &str) -> Result<(), AgentError> {
        Self::check_channel(group)?;
        self.control(ControlMessage::BusLeave(group.to_string()))
    }

    pub fn bus_shout(&self, group: &str, frames: Frames) -> Result<(), AgentError> {
        Self::check_channel(group)?;
        self.control(ControlMessage::BusShout {
            group: group.to_string(),
            frames,
        })
    }

    pub fn bus_shout_str(&self, group: &str, text: &str) -> Result<(), AgentError> {
        self.bus_shout(group, text_frames([text]))
    }

    /// Whisper to a peer by id or name.
    pub fn bus_whisper(&self, peer: &str, frames: Frames) -> Result<(), AgentError> {
        self.control(ControlMessage::BusWhisper {
            peer: peer.to_string(),
            frames,
        })
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}
