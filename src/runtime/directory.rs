// src/runtime/directory.rs

use std::collections::HashMap;

use crate::constants::PRIVATE_CHANNEL;
use crate::network::Peer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnterOutcome {
    New,
    /// Known id announced again; carries the new reconnect counter
    Reconnected(u32),
}

#[derive(Debug, Clone)]
pub enum ExitOutcome {
    Unknown,
    /// Stale exit for a superseded session; carries the remaining counter
    Decremented(u32),
    Removed(Peer),
}

/// Known remote agents keyed by peer id.
#[derive(Debug, Default)]
pub struct Directory {
    peers: HashMap<String, Peer>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_enter(
        &mut self,
        peer_id: &str,
        name: &str,
        address: &str,
        headers: HashMap<String, String>,
    ) -> EnterOutcome {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.reconnections += 1;
                EnterOutcome::Reconnected(peer.reconnections)
            }
            None => {
                self.peers.insert(
                    peer_id.to_string(),
                    Peer::new(
                        peer_id.to_string(),
                        name.to_string(),
                        address.to_string(),
                        headers,
                    ),
                );
                EnterOutcome::New
            }
        }
    }

    pub fn on_exit(&mut self, peer_id: &str) -> ExitOutcome {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return ExitOutcome::Unknown;
        };
        if peer.reconnections > 0 {
            peer.reconnections -= 1;
            return ExitOutcome::Decremented(peer.reconnections);
        }
        match self.peers.remove(peer_id) {
            Some(peer) => ExitOutcome::Removed(peer),
            None => ExitOutcome::Unknown,
        }
    }

    /// Record a group change. Returns true when the private-channel membership flipped.
    pub fn on_group(&mut self, peer_id: &str, group: &str, joined: bool) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        if joined {
            peer.groups.insert(group.to_string());
        } else {
            peer.groups.remove(group);
        }
        if group == PRIVATE_CHANNEL && peer.joined != joined {
            peer.joined = joined;
            return true;
        }
        false
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    /// Look a peer up by id first, then by display name.
    pub fn find(&self, id_or_name: &str) -> Option<&Peer> {
        self.peers
            .get(id_or_name)
            .or_else(|| self.peers.values().find(|p| p.name == id_or_name))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Peers that joined our private channel and receive broadcasts.
    pub fn joined_ids(&self) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.joined)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_enter_bumps_counter_and_exit_unwinds_it() {
        let mut dir = Directory::new();
        assert_eq!(dir.on_enter("p1", "A", "10.0.0.1", HashMap::new()), EnterOutcome::New);
        assert_eq!(
            dir.on_enter("p1", "A", "10.0.0.1", HashMap::new()),
            EnterOutcome::Reconnected(1)
        );
        assert!(matches!(dir.on_exit("p1"), ExitOutcome::Decremented(0)));
        assert_eq!(dir.len(), 1);
        assert!(matches!(dir.on_exit("p1"), ExitOutcome::Removed(p) if p.name == "A"));
        assert!(dir.is_empty());
        assert!(matches!(dir.on_exit("p1"), ExitOutcome::Unknown));
    }

    #[test]
    fn private_channel_join_is_tracked() {
        let mut dir = Directory::new();
        dir.on_enter("p1", "A", "10.0.0.1", HashMap::new());
        assert!(!dir.on_group("p1", "OTHER", true));
        assert!(dir.on_group("p1", PRIVATE_CHANNEL, true));
        assert!(!dir.on_group("p1", PRIVATE_CHANNEL, true));
        assert_eq!(dir.joined_ids(), vec!["p1".to_string()]);
        assert!(dir.on_group("p1", PRIVATE_CHANNEL, false));
        assert!(dir.joined_ids().is_empty());
        assert!(!dir.on_group("ghost", PRIVATE_CHANNEL, true));
    }

    #[test]
    fn find_by_name_or_id() {
        let mut dir = Directory::new();
        dir.on_enter("p1", "A", "10.0.0.1", HashMap::new());
        assert_eq!(dir.find("A").map(|p| p.id.as_str()), Some("p1"));
        assert_eq!(dir.find("p1").map(|p| p.name.as_str()), Some("A"));
        assert!(dir.find("B").is_none());
    }
}
