// src/runtime/processor.rs

//! Presence event handling and command execution on the reactor thread.

use crate::constants::PRIVATE_CHANNEL;
use crate::events::model::LogLevel;
use crate::model::{Definition, IopKind, IopValue, Mapping};
use crate::network::events::emit_network_event;
use crate::network::{DataMessage, Endpoint, InboundData, PresenceEvent, SubscriptionSocket};

use super::command::Command;
use super::directory::{EnterOutcome, ExitOutcome};
use super::publication::{self, Gate};
use super::subscriber::Subscriber;
use super::{AgentEvent, AgentRuntime, ControlMessage, Query, StopReason};

impl AgentRuntime {
    pub(crate) fn handle_presence(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Enter {
                peer_id,
                name,
                address,
                headers,
            } => match self.directory.on_enter(&peer_id, &name, &address, headers) {
                EnterOutcome::New => {
                    emit_network_event(
                        "directory",
                        LogLevel::Info,
                        "peer_enter",
                        Some(address),
                        Some(format!("name={} id={}", name, peer_id)),
                        self.settings.allow_console,
                    );
                    self.emit(AgentEvent::PeerEntered { peer_id, name });
                }
                EnterOutcome::Reconnected(count) => {
                    emit_network_event(
                        "directory",
                        LogLevel::Warn,
                        "peer_reenter",
                        Some(address),
                        Some(format!("name={} id={} reconnections={}", name, peer_id, count)),
                        self.settings.allow_console,
                    );
                }
            },
            PresenceEvent::Exit { peer_id, name } => match self.directory.on_exit(&peer_id) {
                ExitOutcome::Removed(peer) => {
                    if let Some(sub) = self.subscribers.remove(&peer_id) {
                        sub.teardown();
                    }
                    emit_network_event(
                        "directory",
                        LogLevel::Info,
                        "peer_exit",
                        Some(peer.address.clone()),
                        Some(format!("name={} id={}", peer.name, peer_id)),
                        self.settings.allow_console,
                    );
                    self.emit(AgentEvent::PeerExited {
                        peer_id,
                        name: peer.name,
                    });
                }
                ExitOutcome::Decremented(count) => {
                    emit_network_event(
                        "directory",
                        LogLevel::Warn,
                        "peer_exit_stale",
                        None,
                        Some(format!("name={} id={} reconnections={}", name, peer_id, count)),
                        self.settings.allow_console,
                    );
                }
                ExitOutcome::Unknown => {}
            },
            PresenceEvent::Join {
                peer_id,
                name,
                group,
            } => {
                let flipped = self.directory.on_group(&peer_id, &group, true);
                if group == PRIVATE_CHANNEL {
                    if flipped {
                        self.on_peer_joined(&peer_id);
                    }
                } else {
                    self.emit(AgentEvent::BusJoined {
                        peer_id,
                        name,
                        group,
                    });
                }
            }
            PresenceEvent::Leave {
                peer_id,
                name,
                group,
            } => {
                self.directory.on_group(&peer_id, &group, false);
                if group != PRIVATE_CHANNEL {
                    self.emit(AgentEvent::BusLeft {
                        peer_id,
                        name,
                        group,
                    });
                }
            }
            PresenceEvent::Whisper {
                peer_id, frames, ..
            } => match Command::parse(&frames) {
                Ok(command) => self.handle_command(&peer_id, command),
                Err(e) => {
                    let name = self.peer_name(&peer_id);
                    self.emit_command_event(LogLevel::Error, &name, "?", false, Some(e.to_string()));
                }
            },
            PresenceEvent::Shout {
                peer_id,
                name,
                group,
                frames,
            } => {
                if group != PRIVATE_CHANNEL {
                    self.emit(AgentEvent::BusShout {
                        peer_id,
                        name,
                        group,
                        frames,
                    });
                    return;
                }
                match Command::parse(&frames) {
                    Ok(command) if is_notice(&command) => self.handle_command(&peer_id, command),
                    Ok(command) => self.emit_command_event(
                        LogLevel::Warn,
                        &name,
                        command.keyword(),
                        false,
                        Some("only state notices are accepted as shouts".into()),
                    ),
                    Err(e) => {
                        self.emit_command_event(LogLevel::Error, &name, "?", false, Some(e.to_string()))
                    }
                }
            }
        }
    }

    /// A peer joined our private channel: bring it up to date and start
    /// receiving from it.
    fn on_peer_joined(&mut self, peer_id: &str) {
        let catch_up = {
            let m = self.model.read();
            let mut commands = vec![
                Command::ExternalDefinition(m.definition.to_json()),
                Command::ExternalMapping(m.mapping.to_json()),
                Command::Muted(m.muted),
                Command::Frozen(m.frozen),
            ];
            if !m.state.is_empty() {
                commands.push(Command::State(m.state.clone()));
            }
            for output in m.definition.outputs().filter(|o| o.muted) {
                commands.push(Command::OutputMuted(output.name.clone()));
            }
            if let Some(path) = &m.log_file_path {
                commands.push(Command::LogFilePath(path.clone()));
            }
            if let Some(path) = &m.definition_path {
                commands.push(Command::DefinitionFilePath(path.clone()));
            }
            if let Some(path) = &m.mapping_path {
                commands.push(Command::MappingFilePath(path.clone()));
            }
            commands
        };
        for command in &catch_up {
            self.whisper(peer_id, command);
        }
        self.ensure_subscriber(peer_id);
    }

    /// Create the peer's subscriber if it advertises a publisher and has none yet.
    fn ensure_subscriber(&mut self, peer_id: &str) -> bool {
        if self.subscribers.contains_key(peer_id) {
            return true;
        }
        let Some(peer) = self.directory.get(peer_id) else {
            return false;
        };
        let Some(port) = peer.publisher_port() else {
            return false;
        };
        let endpoint = match peer.ipc_endpoint() {
            #[cfg(unix)]
            Some(path) if peer.address == self.host_address => Endpoint::Ipc(std::path::PathBuf::from(path)),
            _ => Endpoint::Tcp(format!("{}:{}", peer.address, port)),
        };
        let name = peer.name.clone();
        emit_network_event(
            "subscriber",
            LogLevel::Info,
            "subscriber_created",
            Some(endpoint.to_string()),
            Some(format!("peer={}", name)),
            self.settings.allow_console,
        );
        let socket = SubscriptionSocket::connect(
            peer_id,
            endpoint,
            self.inbound_tx.clone(),
            self.settings.allow_console,
        );
        self.subscribers.insert(
            peer_id.to_string(),
            Subscriber::new(peer_id, &name, Box::new(socket)),
        );
        true
    }

    pub(crate) fn handle_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Terminate => self.request_stop(StopReason::Requested),
            ControlMessage::Notice(command) => self.shout_notice(&command),
            ControlMessage::BusJoin(group) => {
                if let Err(e) = self.presence.join(&group) {
                    self.log_bus_failure("bus_join_failed", &group, e.to_string());
                }
            }
            ControlMessage::BusLeave(group) => {
                if let Err(e) = self.presence.leave(&group) {
                    self.log_bus_failure("bus_leave_failed", &group, e.to_string());
                }
            }
            ControlMessage::BusShout { group, frames } => {
                if let Err(e) = self.presence.shout(&group, frames) {
                    self.log_bus_failure("bus_shout_failed", &group, e.to_string());
                }
            }
            ControlMessage::BusWhisper { peer, frames } => {
                match self.directory.find(&peer).map(|p| p.id.clone()) {
                    Some(peer_id) => self.whisper(&peer_id, &Command::BusMessage(frames)),
                    None => self.log_bus_failure("bus_whisper_failed", &peer, "unknown peer".into()),
                }
            }
            ControlMessage::Query(query) => self.answer(query),
        }
    }

    fn log_bus_failure(&self, action: &str, target: &str, detail: String) {
        emit_network_event(
            "bus",
            LogLevel::Warn,
            action,
            Some(target.to_string()),
            Some(detail),
            self.settings.allow_console,
        );
    }

    fn answer(&self, query: Query) {
        let subscriber_of = |id_or_name: &str| {
            self.directory
                .find(id_or_name)
                .and_then(|p| self.subscribers.get(&p.id))
        };
        match query {
            Query::Peers(reply) => {
                let _ = reply.send(self.directory.peers().cloned().collect());
            }
            Query::PeerDefinition(peer, reply) => {
                let _ = reply.send(subscriber_of(&peer).and_then(|s| s.definition().cloned()));
            }
            Query::PeerMapping(peer, reply) => {
                let _ = reply.send(subscriber_of(&peer).and_then(|s| s.mapping().cloned()));
            }
            Query::PeerFilters(peer, reply) => {
                let _ = reply.send(subscriber_of(&peer).map(|s| s.filters().clone()));
            }
        }
    }

    /// Data published by a peer we subscribe to.
    pub(crate) fn handle_inbound(&mut self, data: InboundData) {
        let name = match self.subscribers.get(&data.peer_id) {
            Some(sub) => sub.peer_name().to_string(),
            None => return,
        };
        self.deliver(&name, &data.message);
    }

    fn deliver(&mut self, peer_name: &str, message: &DataMessage) {
        let (updates, errors) = {
            let mut model = self.model.write();
            publication::route_inbound(&mut model, peer_name, message)
        };
        for e in errors {
            self.emit_mapping_event(
                LogLevel::Warn,
                "input_write_failed",
                Some(peer_name),
                Some(&message.name),
                Some(e.to_string()),
            );
        }
        for update in updates {
            self.emit(AgentEvent::InputUpdated {
                name: update.input,
                value: update.value,
            });
        }
    }

    pub(crate) fn handle_command(&mut self, peer_id: &str, command: Command) {
        let peer_name = self.peer_name(peer_id);
        let keyword = command.keyword();
        match self.execute(peer_id, &peer_name, command) {
            Ok(detail) => {
                self.emit_command_event(LogLevel::Debug, &peer_name, keyword, true, detail)
            }
            Err(detail) => {
                self.emit_command_event(LogLevel::Warn, &peer_name, keyword, false, Some(detail))
            }
        }
    }

    /// Run one decoded command. `Err` carries the reason it was rejected.
    fn execute(
        &mut self,
        peer_id: &str,
        peer_name: &str,
        command: Command,
    ) -> Result<Option<String>, String> {
        match command {
            Command::Stop => {
                self.request_stop(StopReason::ForcedStop {
                    by: peer_name.to_string(),
                });
            }
            Command::ClearMapping => {
                let mut m = self.model.write();
                m.mapping.clear();
                m.mapping_dirty = true;
                m.mapping_replaced = true;
            }
            Command::Freeze | Command::Unfreeze => {
                let frozen = command == Command::Freeze;
                {
                    let mut m = self.model.write();
                    if !m.can_be_frozen {
                        return Err("agent cannot be frozen".into());
                    }
                    if m.frozen == frozen {
                        return Ok(None);
                    }
                    m.frozen = frozen;
                }
                self.emit(AgentEvent::FreezeChanged(frozen));
                self.shout_notice(&Command::Frozen(frozen));
            }
            Command::MuteAll | Command::UnmuteAll => {
                let muted = command == Command::MuteAll;
                {
                    let mut m = self.model.write();
                    if m.muted == muted {
                        return Ok(None);
                    }
                    m.muted = muted;
                }
                self.emit(AgentEvent::MuteChanged(muted));
                self.shout_notice(&Command::Muted(muted));
            }
            Command::Mute(output) => self.set_output_muted(output, true)?,
            Command::Unmute(output) => self.set_output_muted(output, false)?,
            Command::Set { kind, name, value } => {
                let (stored, prepared) = {
                    let mut m = self.model.write();
                    let iop_type = m
                        .definition
                        .get(kind, &name)
                        .map(|iop| iop.iop_type)
                        .ok_or_else(|| format!("no {} named '{}'", kind.as_str(), name))?;
                    let parsed = IopValue::parse_text(iop_type, &value).map_err(|e| e.to_string())?;
                    let stored = m
                        .definition
                        .write(kind, &name, &parsed)
                        .map_err(|e| e.to_string())?;
                    let prepared = match kind {
                        IopKind::Output => Some(publication::prepare(&m, &name).map_err(|e| e.to_string())?),
                        _ => None,
                    };
                    (stored, prepared)
                };
                self.emit(match kind {
                    IopKind::Input => AgentEvent::InputUpdated {
                        name,
                        value: stored,
                    },
                    IopKind::Output => AgentEvent::OutputUpdated {
                        name,
                        value: stored,
                    },
                    IopKind::Parameter => AgentEvent::ParameterUpdated {
                        name,
                        value: stored,
                    },
                });
                return Ok(match prepared {
                    Some(Ok(message)) => {
                        self.engine.send(message);
                        None
                    }
                    Some(Err(gate)) => Some(gate_detail(gate).into()),
                    None => None,
                });
            }
            Command::Map {
                input,
                agent,
                output,
            } => {
                let mut m = self.model.write();
                m.mapping
                    .add(&input, &agent, &output)
                    .map_err(|e| e.to_string())?;
                m.mapping_dirty = true;
            }
            Command::Unmap {
                input,
                agent,
                output,
            } => {
                let mut m = self.model.write();
                m.mapping
                    .remove(&input, &agent, &output)
                    .map_err(|e| e.to_string())?;
                m.mapping_dirty = true;
            }
            Command::RequestOutputs => {
                let outputs = publication::snapshot_outputs(&self.model.read());
                let count = outputs.len();
                self.whisper(peer_id, &Command::Outputs(outputs));
                return Ok(Some(format!("{} outputs", count)));
            }
            Command::Outputs(values) => {
                let subscribed: Vec<DataMessage> = match self.subscribers.get(peer_id) {
                    Some(sub) => values
                        .into_iter()
                        .filter(|v| sub.filters().contains(&v.name))
                        .collect(),
                    None => return Err("no subscriber for peer".into()),
                };
                for message in &subscribed {
                    self.deliver(peer_name, message);
                }
            }
            Command::GetCurrentInputs => {
                let values = publication::snapshot(&self.model.read(), IopKind::Input);
                self.whisper(peer_id, &Command::CurrentInputs(values));
            }
            Command::GetCurrentParameters => {
                let values = publication::snapshot(&self.model.read(), IopKind::Parameter);
                self.whisper(peer_id, &Command::CurrentParameters(values));
            }
            Command::CurrentInputs(values) | Command::CurrentParameters(values) => {
                return Ok(Some(format!("{} values", values.len())));
            }
            Command::SetLogPath(path) => {
                self.model.write().log_file_path = Some(path.clone());
                self.shout_notice(&Command::LogFilePath(path));
            }
            Command::SetDefinitionPath(path) => {
                self.model.write().definition_path = Some(path.clone());
                self.shout_notice(&Command::DefinitionFilePath(path));
            }
            Command::SetMappingPath(path) => {
                self.model.write().mapping_path = Some(path.clone());
                self.shout_notice(&Command::MappingFilePath(path));
            }
            Command::SaveDefinitionToPath => {
                let (path, json) = {
                    let m = self.model.read();
                    (m.definition_path.clone(), m.definition.to_json())
                };
                let path = path.ok_or("no definition path set")?;
                std::fs::write(&path, json).map_err(|e| format!("{}: {}", path, e))?;
                return Ok(Some(path));
            }
            Command::SaveMappingToPath => {
                let (path, json) = {
                    let m = self.model.read();
                    (m.mapping_path.clone(), m.mapping.to_json())
                };
                let path = path.ok_or("no mapping path set")?;
                std::fs::write(&path, json).map_err(|e| format!("{}: {}", path, e))?;
                return Ok(Some(path));
            }
            Command::ExternalDefinition(json) => {
                if !self.ensure_subscriber(peer_id) {
                    return Err("peer has no publisher".into());
                }
                if let Some(sub) = self.subscribers.get_mut(peer_id) {
                    sub.apply_external_definition(&json)
                        .map_err(|e| e.to_string())?;
                }
                self.resolve_subscriber(peer_id);
            }
            Command::ExternalMapping(json) => {
                if !self.ensure_subscriber(peer_id) {
                    return Err("peer has no publisher".into());
                }
                if let Some(sub) = self.subscribers.get_mut(peer_id) {
                    sub.apply_external_mapping(&json)
                        .map_err(|e| e.to_string())?;
                }
                self.resolve_subscriber(peer_id);
            }
            Command::LoadThisDefinition(json) => {
                let mut definition = Definition::from_json(&json).map_err(|e| e.to_string())?;
                let mut m = self.model.write();
                definition.name = m.agent_name.clone();
                m.replace_definition(definition);
            }
            Command::LoadThisMapping(json) => {
                let mapping = Mapping::from_json(&json).map_err(|e| e.to_string())?;
                self.model.write().replace_mapping(mapping);
            }
            Command::BusMessage(frames) => {
                self.emit(AgentEvent::BusWhisper {
                    peer_id: peer_id.to_string(),
                    name: peer_name.to_string(),
                    frames,
                });
            }
            notice => {
                let peer = self
                    .directory
                    .get_mut(peer_id)
                    .ok_or_else(|| "unknown peer".to_string())?;
                match notice {
                    Command::Muted(v) => peer.muted = v,
                    Command::Frozen(v) => peer.frozen = v,
                    Command::State(s) => peer.state = Some(s),
                    Command::OutputMuted(o) => {
                        peer.muted_outputs.insert(o);
                    }
                    Command::OutputUnmuted(o) => {
                        peer.muted_outputs.remove(&o);
                    }
                    Command::LogFilePath(p) => peer.log_file_path = Some(p),
                    Command::DefinitionFilePath(p) => peer.definition_path = Some(p),
                    Command::MappingFilePath(p) => peer.mapping_path = Some(p),
                    _ => {}
                }
            }
        }
        Ok(None)
    }

    fn set_output_muted(&mut self, output: String, muted: bool) -> Result<(), String> {
        {
            let mut m = self.model.write();
            let iop = m
                .definition
                .get_mut(IopKind::Output, &output)
                .ok_or_else(|| format!("no output named '{}'", output))?;
            iop.muted = muted;
        }
        self.emit(AgentEvent::OutputMuteChanged {
            name: output.clone(),
            muted,
        });
        let notice = if muted {
            Command::OutputMuted(output)
        } else {
            Command::OutputUnmuted(output)
        };
        self.shout_notice(&notice);
        Ok(())
    }
}

fn is_notice(command: &Command) -> bool {
    matches!(
        command,
        Command::Muted(_)
            | Command::Frozen(_)
            | Command::State(_)
            | Command::OutputMuted(_)
            | Command::OutputUnmuted(_)
            | Command::LogFilePath(_)
            | Command::DefinitionFilePath(_)
            | Command::MappingFilePath(_)
    )
}

fn gate_detail(gate: Gate) -> &'static str {
    match gate {
        Gate::AgentMuted => "not published: agent muted",
        Gate::OutputMuted => "not published: output muted",
        Gate::Frozen => "not published: agent frozen",
    }
}
