// src/network/local.rs

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::constants::DEFAULT_AGENT_NAME;
use crate::error::PresenceError;
use crate::network::presence::{Frames, Presence, PresenceEvent};

struct HubNode {
    name: String,
    address: String,
    headers: HashMap<String, String>,
    groups: BTreeSet<String>,
    tx: mpsc::UnboundedSender<PresenceEvent>,
}

/// In-process presence network. Every `LocalPresence` created from the same
/// hub sees the others; delivery is FIFO per sender/receiver pair.
#[derive(Clone, Default)]
pub struct PresenceHub {
    nodes: Arc<Mutex<HashMap<String, HubNode>>>,
}

impl PresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A presence handle on this hub advertising `127.0.0.1`.
    pub fn presence(&self) -> LocalPresence {
        LocalPresence::new(self)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Deliver a raw event to a started node, as if the network produced it.
    ///
    /// Simulates glitches such as a duplicate ENTER without a matching EXIT.
    pub fn inject(&self, node_id: &str, event: PresenceEvent) -> Result<(), PresenceError> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(node_id)
            .ok_or_else(|| PresenceError::UnknownPeer(node_id.to_string()))?;
        node.tx
            .send(event)
            .map_err(|_| PresenceError::Send(format!("node {} stopped", node_id)))
    }

    /// The ENTER event other nodes observed for `node_id`.
    pub fn enter_event_for(&self, node_id: &str) -> Option<PresenceEvent> {
        self.nodes.lock().get(node_id).map(|n| PresenceEvent::Enter {
            peer_id: node_id.to_string(),
            name: n.name.clone(),
            address: n.address.clone(),
            headers: n.headers.clone(),
        })
    }
}

/// `Presence` backed by a `PresenceHub`.
pub struct LocalPresence {
    hub: PresenceHub,
    node_id: String,
    name: String,
    address: String,
    headers: HashMap<String, String>,
    started: bool,
}

impl LocalPresence {
    pub fn new(hub: &PresenceHub) -> Self {
        Self {
            hub: hub.clone(),
            node_id: Uuid::new_v4().to_string(),
            name: DEFAULT_AGENT_NAME.to_string(),
            address: "127.0.0.1".to_string(),
            headers: HashMap::new(),
            started: false,
        }
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    fn ensure_started(&self) -> Result<(), PresenceError> {
        if self.started {
            Ok(())
        } else {
            Err(PresenceError::NotStarted)
        }
    }

    /// Update our group set and tell every other node.
    fn set_group(&self, group: &str, joined: bool) -> Result<(), PresenceError> {
        self.ensure_started()?;
        let mut nodes = self.hub.nodes.lock();
        let changed = match nodes.get_mut(&self.node_id) {
            Some(me) if joined => me.groups.insert(group.to_string()),
            Some(me) => me.groups.remove(group),
            None => return Err(PresenceError::NotStarted),
        };
        if !changed {
            return Ok(());
        }
        for (id, node) in nodes.iter() {
            if *id == self.node_id {
                continue;
            }
            let event = if joined {
                PresenceEvent::Join {
                    peer_id: self.node_id.clone(),
                    name: self.name.clone(),
                    group: group.to_string(),
                }
            } else {
                PresenceEvent::Leave {
                    peer_id: self.node_id.clone(),
                    name: self.name.clone(),
                    group: group.to_string(),
                }
            };
            let _ = node.tx.send(event);
        }
        Ok(())
    }
}

#[async_trait]
impl Presence for LocalPresence {
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
        self.address.clone()
    }

    async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, PresenceError> {
        if self.started {
            return Err(PresenceError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut nodes = self.hub.nodes.lock();
        for (id, node) in nodes.iter() {
            // Existing nodes learn about us, and we learn about them with their groups.
            let _ = node.tx.send(PresenceEvent::Enter {
                peer_id: self.node_id.clone(),
                name: self.name.clone(),
                address: self.address.clone(),
                headers: self.headers.clone(),
            });
            let _ = tx.send(PresenceEvent::Enter {
                peer_id: id.clone(),
                name: node.name.clone(),
                address: node.address.clone(),
                headers: node.headers.clone(),
            });
            for group in &node.groups {
                let _ = tx.send(PresenceEvent::Join {
                    peer_id: id.clone(),
                    name: node.name.clone(),
                    group: group.clone(),
                });
            }
        }
        nodes.insert(
            self.node_id.clone(),
            HubNode {
                name: self.name.clone(),
                address: self.address.clone(),
                headers: self.headers.clone(),
                groups: BTreeSet::new(),
                tx,
            },
        );
        self.started = true;
        Ok(rx)
    }

    fn join(&mut self, group: &str) -> Result<(), PresenceError> {
        self.set_group(group, true)
    }

    fn leave(&mut self, group: &str) -> Result<(), PresenceError> {
        self.set_group(group, false)
    }

    fn whisper(&mut self, peer_id: &str, frames: Frames) -> Result<(), PresenceError> {
        self.ensure_started()?;
        let nodes = self.hub.nodes.lock();
        let target = nodes
            .get(peer_id)
            .ok_or_else(|| PresenceError::UnknownPeer(peer_id.to_string()))?;
        target
            .tx
            .send(PresenceEvent::Whisper {
                peer_id: self.node_id.clone(),
                name: self.name.clone(),
                frames,
            })
            .map_err(|_| PresenceError::Send(format!("peer {} stopped", peer_id)))
    }

    fn shout(&mut self, group: &str, frames: Frames) -> Result<(), PresenceError> {
        self.ensure_started()?;
        let nodes = self.hub.nodes.lock();
        for (id, node) in nodes.iter() {
            if *id == self.node_id || !node.groups.contains(group) {
                continue;
            }
            let _ = node.tx.send(PresenceEvent::Shout {
                peer_id: self.node_id.clone(),
                name: self.name.clone(),
                group: group.to_string(),
                frames: frames.clone(),
            });
        }
        Ok(())
    }

    async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        let mut nodes = self.hub.nodes.lock();
        nodes.remove(&self.node_id);
        for node in nodes.values() {
            let _ = node.tx.send(PresenceEvent::Exit {
                peer_id: self.node_id.clone(),
                name: self.name.clone(),
            });
        }
    }
}

impl Drop for LocalPresence {
    fn drop(&mut self) {
        if self.started {
            let mut nodes = self.hub.nodes.lock();
            nodes.remove(&self.node_id);
            for node in nodes.values() {
                let _ = node.tx.send(PresenceEvent::Exit {
                    peer_id: self.node_id.clone(),
                    name: self.name.clone(),
                });
            }
        }
    }
}
