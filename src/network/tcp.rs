// src/network/tcp.rs

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::constants::{DEFAULT_AGENT_NAME, PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::error::PresenceError;
use crate::events::model::LogLevel;
use crate::network::bootstrap::connect_to_bootstrap_nodes;
use crate::network::events::emit_network_event;
use crate::network::listener::start_listener;
use crate::network::message::{Message, MessageType, Payload};
use crate::network::peer_manager::PeerManager;
use crate::network::presence::{Frames, Presence, PresenceEvent};

#[derive(Debug, Clone)]
pub struct TcpPresenceConfig {
    pub bind_ip: String,
    /// Address written in our HELLO; peers reach our publisher through it
    pub advertised_ip: String,
    pub port: u16,
    pub bootstrap_nodes: Vec<String>,
    pub gossip: bool,
    pub allow_console: bool,
}

impl Default for TcpPresenceConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".into(),
            advertised_ip: "0.0.0.0".into(),
            port: 0,
            bootstrap_nodes: Vec::new(),
            gossip: true,
            allow_console: true,
        }
    }
}

impl TcpPresenceConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            advertised_ip: config.host_ip(),
            port: config.presence_port(),
            bootstrap_nodes: config.bootstrap_nodes(),
            gossip: config.gossip_enabled(),
            ..Self::default()
        }
    }
}

/// State shared by the listener, dialers and per-connection sessions.
#[derive(Clone)]
pub(crate) struct PresenceContext {
    pub node_id: String,
    pub name: String,
    pub headers: HashMap<String, String>,
    pub groups: Arc<Mutex<BTreeSet<String>>>,
    pub listen_addr: String,
    pub peer_manager: PeerManager,
    pub events: mpsc::UnboundedSender<PresenceEvent>,
    pub gossip: bool,
    pub allow_console: bool,
    pub shutdown: watch::Receiver<bool>,
}

impl PresenceContext {
    pub fn hello(&self) -> Message {
        Message::new(
            &self.node_id,
            MessageType::Hello {
                node_id: self.node_id.clone(),
                name: self.name.clone(),
                listen_addr: Some(self.listen_addr.clone()),
                protocol: Some(PROTOCOL_NAME.to_string()),
                version: Some(PROTOCOL_VERSION.to_string()),
                headers: self.headers.clone(),
                groups: self.groups.lock().iter().cloned().collect(),
            },
            None,
        )
    }

    pub fn line(&self, msg_type: MessageType, payload: Option<Payload>) -> String {
        Message::new(&self.node_id, msg_type, payload).as_json()
    }

    pub fn emit(&self, event: PresenceEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

struct Running {
    ctx: PresenceContext,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
    local_port: u16,
}

/// Presence over plain TCP: a listener, bootstrap dialing, and peer-list
/// gossip so every agent ends up connected to every other one.
pub struct TcpPresence {
    config: TcpPresenceConfig,
    node_id: String,
    name: String,
    headers: HashMap<String, String>,
    groups: Arc<Mutex<BTreeSet<String>>>,
    running: Option<Running>,
}

impl TcpPresence {
    pub fn new(config: TcpPresenceConfig) -> Self {
        Self {
            config,
            node_id: Uuid::new_v4().to_string(),
            name: DEFAULT_AGENT_NAME.to_string(),
            headers: HashMap::new(),
            groups: Arc::new(Mutex::new(BTreeSet::new())),
            running: None,
        }
    }

    /// Actual listening port once started (useful with port 0).
    pub fn local_port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.local_port)
    }

    /// Dialable presence address once started.
    pub fn listen_addr(&self) -> Option<String> {
        self.running.as_ref().map(|r| {
            format!("{}:{}", local_host_address(&self.config.advertised_ip), r.local_port)
        })
    }

    fn running(&self) -> Result<&Running, PresenceError> {
        self.running.as_ref().ok_or(PresenceError::NotStarted)
    }
}

/// Our own host as peers on this machine record it. With nothing advertised,
/// local peers reach us over loopback and observe us there.
fn local_host_address(advertised_ip: &str) -> String {
    match advertised_ip.parse::<std::net::IpAddr>() {
        Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
        _ => advertised_ip.to_string(),
    }
}

#[async_trait]
impl Presence for TcpPresence {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    fn host_address(&self) -> String {
        local_host_address(&self.config.advertised_ip)
    }

    async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, PresenceError> {
        if self.running.is_some() {
            return Err(PresenceError::AlreadyStarted);
        }
        let bind = format!("{}:{}", self.config.bind_ip, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(PresenceError::Bind)?;
        let local_port = listener
            .local_addr()
            .map_err(PresenceError::Bind)?
            .port();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = PresenceContext {
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            headers: self.headers.clone(),
            groups: self.groups.clone(),
            listen_addr: format!("{}:{}", self.config.advertised_ip, local_port),
            peer_manager: PeerManager::new(),
            events: events_tx,
            gossip: self.config.gossip,
            allow_console: self.config.allow_console,
            shutdown: shutdown_rx,
        };
        emit_network_event(
            "presence",
            LogLevel::Info,
            "presence_started",
            Some(ctx.listen_addr.clone()),
            Some(format!("node_id={} name={}", ctx.node_id, ctx.name)),
            ctx.allow_console,
        );
        let listener = tokio::spawn(start_listener(listener, ctx.clone()));
        connect_to_bootstrap_nodes(ctx.clone(), &self.config.bootstrap_nodes);
        self.running = Some(Running {
            ctx,
            shutdown: shutdown_tx,
            listener,
            local_port,
        });
        Ok(events_rx)
    }

    fn join(&mut self, group: &str) -> Result<(), PresenceError> {
        let running = self.running()?;
        if running.ctx.groups.lock().insert(group.to_string()) {
            let line = running.ctx.line(
                MessageType::Join {
                    group: group.to_string(),
                },
                None,
            );
            running.ctx.peer_manager.broadcast(&line);
        }
        Ok(())
    }

    fn leave(&mut self, group: &str) -> Result<(), PresenceError> {
        let running = self.running()?;
        if running.ctx.groups.lock().remove(group) {
            let line = running.ctx.line(
                MessageType::Leave {
                    group: group.to_string(),
                },
                None,
            );
            running.ctx.peer_manager.broadcast(&line);
        }
        Ok(())
    }

    fn whisper(&mut self, peer_id: &str, frames: Frames) -> Result<(), PresenceError> {
        let running = self.running()?;
        if !running.ctx.peer_manager.has_node_id(peer_id) {
            return Err(PresenceError::UnknownPeer(peer_id.to_string()));
        }
        let line = running
            .ctx
            .line(MessageType::Whisper, Some(Payload::from_frames(&frames)));
        running
            .ctx
            .peer_manager
            .send_to(peer_id, line)
            .map_err(PresenceError::Send)
    }

    fn shout(&mut self, group: &str, frames: Frames) -> Result<(), PresenceError> {
        let running = self.running()?;
        let line = running.ctx.line(
            MessageType::Shout {
                group: group.to_string(),
            },
            Some(Payload::from_frames(&frames)),
        );
        running.ctx.peer_manager.send_to_group(group, &line);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let line = running.ctx.line(MessageType::Disconnect, None);
            running.ctx.peer_manager.broadcast(&line);
            let _ = running.shutdown.send(true);
            running.ctx.peer_manager.clear();
            running.listener.abort();
            self.groups.lock().clear();
            emit_network_event(
                "presence",
                LogLevel::Info,
                "presence_stopped",
                Some(running.ctx.listen_addr.clone()),
                None,
                running.ctx.allow_console,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quiet() -> TcpPresenceConfig {
        TcpPresenceConfig {
            port: 0,
            allow_console: false,
            ..TcpPresenceConfig::default()
        }
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<PresenceEvent>, f: F) -> PresenceEvent
    where
        F: Fn(&PresenceEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = rx.recv().await.expect("presence channel closed");
                if f(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for presence event")
    }

    #[tokio::test]
    async fn two_nodes_enter_join_and_whisper() {
        let mut a = TcpPresence::new(quiet());
        a.set_name("A");
        a.set_header("publisher", "6001");
        let mut rx_a = a.start().await.unwrap();
        a.join("G").unwrap();

        let mut cfg_b = quiet();
        cfg_b.bootstrap_nodes = vec![a.listen_addr().unwrap()];
        let mut b = TcpPresence::new(cfg_b);
        b.set_name("B");
        let mut rx_b = b.start().await.unwrap();
        b.join("G").unwrap();

        let enter = next_matching(&mut rx_b, |e| matches!(e, PresenceEvent::Enter { .. })).await;
        match enter {
            PresenceEvent::Enter { name, headers, .. } => {
                assert_eq!(name, "A");
                assert_eq!(headers.get("publisher").map(String::as_str), Some("6001"));
            }
            other => panic!("unexpected {:?}", other),
        }
        next_matching(&mut rx_b, |e| matches!(e, PresenceEvent::Join { group, .. } if group == "G")).await;
        next_matching(&mut rx_a, |e| matches!(e, PresenceEvent::Join { group, .. } if group == "G")).await;

        a.whisper(b.node_id(), vec![bytes::Bytes::from_static(b"ping")])
            .unwrap();
        let w = next_matching(&mut rx_b, |e| matches!(e, PresenceEvent::Whisper { .. })).await;
        assert_eq!(w.peer_id(), a.node_id());

        a.stop().await;
        next_matching(&mut rx_b, |e| matches!(e, PresenceEvent::Exit { .. })).await;
        b.stop().await;
    }

    #[test]
    fn unadvertised_host_compares_as_loopback() {
        assert_eq!(TcpPresence::new(quiet()).host_address(), "127.0.0.1");
        let cfg = TcpPresenceConfig {
            advertised_ip: "10.0.0.4".into(),
            ..quiet()
        };
        assert_eq!(TcpPresence::new(cfg).host_address(), "10.0.0.4");
        let defaults = TcpPresenceConfig::from_config(&Config::default());
        assert_eq!(defaults.advertised_ip, "0.0.0.0");
    }

    #[tokio::test]
    async fn unadvertised_peer_is_recorded_where_it_was_seen() {
        let mut a = TcpPresence::new(quiet());
        let _rx_a = a.start().await.unwrap();
        let mut cfg_b = quiet();
        cfg_b.bootstrap_nodes = vec![a.listen_addr().unwrap()];
        let mut b = TcpPresence::new(cfg_b);
        let mut rx_b = b.start().await.unwrap();

        match next_matching(&mut rx_b, |e| matches!(e, PresenceEvent::Enter { .. })).await {
            PresenceEvent::Enter { address, .. } => assert_eq!(address, b.host_address()),
            other => panic!("unexpected {:?}", other),
        }
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn messaging_before_start_fails() {
        let mut p = TcpPresence::new(quiet());
        assert!(matches!(p.join("G"), Err(PresenceError::NotStarted)));
        assert!(matches!(
            p.shout("G", Vec::new()),
            Err(PresenceError::NotStarted)
        ));
    }
}
