// src/runtime/reactor.rs

use std::sync::mpsc as std_mpsc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::AgentError;
use crate::events::model::LogLevel;
use crate::model::SharedModel;
use crate::network::events::emit_network_event;
use crate::network::{Presence, PublisherConfig};

use super::command::Command;
use super::publication::PublicationEngine;
use super::{AgentEvent, AgentRuntime, ControlMessage, RuntimeSettings, RuntimeStreams, StopReason};

/// Reactor thread body: set up, report readiness, loop until stopped, tear
/// down. Always hands the presence back so the agent can be restarted.
pub(crate) async fn run(
    model: SharedModel,
    settings: RuntimeSettings,
    publisher_config: PublisherConfig,
    presence: Box<dyn Presence>,
    events: broadcast::Sender<AgentEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    ready: std_mpsc::Sender<Result<PublicationEngine, AgentError>>,
) -> Box<dyn Presence> {
    let (mut runtime, streams) =
        match AgentRuntime::setup(model, settings, publisher_config, presence, events).await {
            Ok(parts) => parts,
            Err((e, presence)) => {
                let _ = ready.send(Err(e));
                return presence;
            }
        };
    if ready.send(Ok(runtime.engine())).is_err() {
        // Host gave up waiting.
        runtime.request_stop(StopReason::Requested);
    } else {
        runtime.run_loop(control_rx, streams).await;
    }
    runtime.teardown().await
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl AgentRuntime {
    pub(crate) async fn run_loop(
        &mut self,
        mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
        streams: RuntimeStreams,
    ) {
        let RuntimeStreams {
            mut presence_rx,
            mut inbound_rx,
        } = streams;
        let start = Instant::now();
        let period = self.settings.broadcast_interval;
        let mut definition_timer = interval_at(start + period, period);
        definition_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut mapping_timer = interval_at(start + period, period);
        mapping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let expiry_at = self.settings.expiry.map(|d| start + d);

        while self.stop_reason.is_none() {
            let outputs_due = self.next_outputs_request();
            tokio::select! {
                msg = control_rx.recv() => match msg {
                    Some(msg) => self.handle_control(msg),
                    None => self.request_stop(StopReason::Requested),
                },
                event = presence_rx.recv() => match event {
                    Some(event) => self.handle_presence(event),
                    None => self.request_stop(StopReason::PresenceLost),
                },
                Some(data) = inbound_rx.recv() => self.handle_inbound(data),
                _ = definition_timer.tick() => self.on_definition_timer(),
                _ = mapping_timer.tick() => self.on_mapping_timer(),
                _ = sleep_until_opt(outputs_due) => self.on_outputs_requests_due(Instant::now()),
                _ = sleep_until_opt(expiry_at) => self.request_stop(StopReason::Expired),
            }
        }
    }

    /// Broadcast the local definition if it changed since the last tick.
    /// Several changes within one interval produce a single broadcast.
    pub(crate) fn on_definition_timer(&mut self) {
        let json = {
            let mut m = self.model.write();
            if !m.take_definition_dirty() {
                return;
            }
            // Input/output changes can alter what resolves.
            m.mapping_dirty = true;
            m.definition.to_json()
        };
        self.whisper_joined(&Command::ExternalDefinition(json));
    }

    /// Broadcast the local mapping if it changed and re-resolve every subscriber.
    pub(crate) fn on_mapping_timer(&mut self) {
        let (json, replaced) = {
            let mut m = self.model.write();
            let (dirty, replaced) = m.take_mapping_dirty();
            if !dirty {
                return;
            }
            (m.mapping.to_json(), replaced)
        };
        self.whisper_joined(&Command::ExternalMapping(json));
        let peer_ids: Vec<String> = self.subscribers.keys().cloned().collect();
        for peer_id in peer_ids {
            if replaced {
                if let Some(sub) = self.subscribers.get_mut(&peer_id) {
                    sub.mark_reset();
                }
            }
            self.resolve_subscriber(&peer_id);
        }
    }

    fn next_outputs_request(&self) -> Option<Instant> {
        self.subscribers
            .values()
            .filter_map(|s| s.outputs_request_deadline())
            .min()
    }

    pub(crate) fn on_outputs_requests_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .subscribers
            .values_mut()
            .filter_map(|s| s.take_due_outputs_request(now).then(|| s.peer_id().to_string()))
            .collect();
        for peer_id in due {
            self.whisper(&peer_id, &Command::RequestOutputs);
        }
    }

    /// Subscribers, then presence, then the publisher.
    pub(crate) async fn teardown(mut self) -> Box<dyn Presence> {
        for (_, sub) in self.subscribers.drain() {
            sub.teardown();
        }
        self.presence.stop().await;
        if let Some(publisher) = self.publisher.take() {
            publisher.shutdown();
        }
        self.directory.clear();

        let reason = self.stop_reason.take().unwrap_or(StopReason::Requested);
        emit_network_event(
            "runtime",
            LogLevel::Info,
            "agent_stopped",
            None,
            Some(format!("name={} reason={:?}", self.agent_name, reason)),
            self.settings.allow_console,
        );
        if let StopReason::ForcedStop { by } = reason {
            self.emit(AgentEvent::ForcedStop { by });
            if self.settings.interrupt_on_forced_stop {
                raise_interrupt();
            }
        }
        self.emit(AgentEvent::Stopped);
        self.presence
    }
}

#[cfg(unix)]
fn raise_interrupt() {
    use nix::sys::signal::{raise, Signal};
    if let Err(e) = raise(Signal::SIGINT) {
        crate::emit_system_event!("runtime", LogLevel::Warn, "sigint_failed", e);
    }
}

#[cfg(not(unix))]
fn raise_interrupt() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PRIVATE_CHANNEL;
    use crate::model::{AgentModel, IopKind, IopType};
    use crate::network::{PresenceEvent, PresenceHub};
    use crate::runtime::command::Command;

    fn test_settings() -> RuntimeSettings {
        RuntimeSettings {
            ipc_dir: None,
            interrupt_on_forced_stop: false,
            allow_console: false,
            ..RuntimeSettings::default()
        }
    }

    fn loopback_publisher() -> PublisherConfig {
        PublisherConfig {
            bind_ip: "127.0.0.1".into(),
            ..PublisherConfig::default()
        }
    }

    /// Drain whatever the runtime's presence has queued so far.
    fn pump(runtime: &mut AgentRuntime, streams: &mut RuntimeStreams) {
        while let Ok(event) = streams.presence_rx.try_recv() {
            runtime.handle_presence(event);
        }
    }

    fn whispered(rx: &mut mpsc::UnboundedReceiver<PresenceEvent>, keyword: &str) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if let PresenceEvent::Whisper { frames, .. } = event {
                if let Ok(cmd) = Command::parse(&frames) {
                    if cmd.keyword() == keyword {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn definition_changes_within_one_interval_broadcast_once() {
        let hub = PresenceHub::new();
        let mut observer = hub.presence();
        let mut observer_rx = observer.start().await.unwrap();
        observer.join(PRIVATE_CHANNEL).unwrap();

        let model = AgentModel::new("A").shared();
        let (events, _) = broadcast::channel(16);
        let (mut runtime, mut streams) = AgentRuntime::setup(
            model.clone(),
            test_settings(),
            loopback_publisher(),
            Box::new(hub.presence()),
            events,
        )
        .await
        .map_err(|(e, _)| e)
        .unwrap();
        pump(&mut runtime, &mut streams);
        // Catch-up on join already sent one definition.
        assert_eq!(whispered(&mut observer_rx, "EXTERNAL_DEFINITION"), 1);

        for name in ["a", "b", "c"] {
            let mut m = model.write();
            m.definition
                .create(IopKind::Output, name, IopType::Integer, None)
                .unwrap();
            m.definition_dirty = true;
        }
        runtime.on_definition_timer();
        runtime.on_definition_timer();
        assert_eq!(whispered(&mut observer_rx, "EXTERNAL_DEFINITION"), 1);
        assert!(model.read().mapping_dirty);

        runtime.on_mapping_timer();
        runtime.on_mapping_timer();
        assert_eq!(whispered(&mut observer_rx, "EXTERNAL_MAPPING"), 1);

        runtime.teardown().await;
    }

    #[tokio::test]
    async fn peer_stop_sets_forced_stop() {
        let hub = PresenceHub::new();
        let mut peer = hub.presence();
        peer.set_name("boss");
        let _peer_rx = peer.start().await.unwrap();

        let (events, mut events_rx) = broadcast::channel(16);
        let (mut runtime, mut streams) = AgentRuntime::setup(
            AgentModel::new("A").shared(),
            test_settings(),
            loopback_publisher(),
            Box::new(hub.presence()),
            events,
        )
        .await
        .map_err(|(e, _)| e)
        .unwrap();
        pump(&mut runtime, &mut streams);

        runtime.handle_command(peer.node_id(), Command::Stop);
        assert_eq!(
            runtime.stop_reason(),
            Some(&StopReason::ForcedStop { by: "boss".into() })
        );
        runtime.teardown().await;

        let mut seen = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&AgentEvent::ForcedStop { by: "boss".into() }));
        assert_eq!(seen.last(), Some(&AgentEvent::Stopped));
    }
}
