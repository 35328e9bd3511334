// src/network/peer_manager.rs

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::network::message::PeerAddr;

pub type ConnId = u64;

/// What a remote node told us in its HELLO, plus group membership learned since.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub node_id: String,
    pub name: String,
    pub address: String,
    pub listen_addr: Option<String>,
    pub headers: HashMap<String, String>,
    pub groups: BTreeSet<String>,
}

struct PeerEntry {
    info: PeerInfo,
    // Oldest first; outgoing lines use the first one so per-peer ordering holds.
    connections: Vec<(ConnId, UnboundedSender<String>)>,
}

/// Registry of live TCP presence sessions keyed by node id.
///
/// A node may hold several connections at once (simultaneous dials); it is
/// reported as entered on the first and exited when the last one closes.
#[derive(Clone, Default)]
pub struct PeerManager {
    peers: Arc<Mutex<HashMap<String, PeerEntry>>>,
    next_conn: Arc<AtomicU64>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a connection; returns true when it is the node's first.
    pub fn add_connection(
        &self,
        info: PeerInfo,
        conn: ConnId,
        sender: UnboundedSender<String>,
    ) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(&info.node_id) {
            Some(entry) => {
                entry.connections.push((conn, sender));
                false
            }
            None => {
                peers.insert(
                    info.node_id.clone(),
                    PeerEntry {
                        info,
                        connections: vec![(conn, sender)],
                    },
                );
                true
            }
        }
    }

    /// Drop a connection; returns the peer when it was the node's last.
    pub fn remove_connection(&self, node_id: &str, conn: ConnId) -> Option<PeerInfo> {
        let mut peers = self.peers.lock();
        let entry = peers.get_mut(node_id)?;
        entry.connections.retain(|(id, _)| *id != conn);
        if entry.connections.is_empty() {
            peers.remove(node_id).map(|e| e.info)
        } else {
            None
        }
    }

    pub fn has_node_id(&self, node_id: &str) -> bool {
        self.peers.lock().contains_key(node_id)
    }

    /// True when some connected node advertised `addr` as its listening address.
    pub fn has_listen_addr(&self, addr: &str) -> bool {
        self.peers
            .lock()
            .values()
            .any(|e| e.info.listen_addr.as_deref() == Some(addr))
    }

    pub fn list_node_ids(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn peer_info(&self, node_id: &str) -> Option<PeerInfo> {
        self.peers.lock().get(node_id).map(|e| e.info.clone())
    }

    /// Gossip material: every connected node with a known listening address.
    pub fn listen_addrs(&self) -> Vec<PeerAddr> {
        self.peers
            .lock()
            .values()
            .filter_map(|e| {
                e.info.listen_addr.as_ref().map(|addr| PeerAddr {
                    node_id: e.info.node_id.clone(),
                    addr: addr.clone(),
                })
            })
            .collect()
    }

    /// Record a group change; returns the peer name when membership actually changed.
    pub fn set_group(&self, node_id: &str, group: &str, joined: bool) -> Option<String> {
        let mut peers = self.peers.lock();
        let entry = peers.get_mut(node_id)?;
        let changed = if joined {
            entry.info.groups.insert(group.to_string())
        } else {
            entry.info.groups.remove(group)
        };
        changed.then(|| entry.info.name.clone())
    }

    pub fn send_to(&self, node_id: &str, line: String) -> Result<(), String> {
        let peers = self.peers.lock();
        let entry = peers
            .get(node_id)
            .ok_or_else(|| format!("unknown node {}", node_id))?;
        let (_, sender) = entry
            .connections
            .first()
            .ok_or_else(|| format!("no connection to {}", node_id))?;
        sender
            .send(line)
            .map_err(|_| format!("writer for {} closed", node_id))
    }

    /// Send to every connected node; returns how many accepted the line.
    pub fn broadcast(&self, line: &str) -> usize {
        self.peers
            .lock()
            .values()
            .filter_map(|e| e.connections.first())
            .filter(|(_, s)| s.send(line.to_string()).is_ok())
            .count()
    }

    /// Send to every node that joined `group`.
    pub fn send_to_group(&self, group: &str, line: &str) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|e| e.info.groups.contains(group))
            .filter_map(|e| e.connections.first())
            .filter(|(_, s)| s.send(line.to_string()).is_ok())
            .count()
    }

    /// Forget every node, closing their writers.
    pub fn clear(&self) -> Vec<PeerInfo> {
        self.peers.lock().drain().map(|(_, e)| e.info).collect()
    }
}
