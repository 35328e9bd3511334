// src/network/peer.rs

use std::collections::{BTreeSet, HashMap};

use crate::constants::{HEADER_CAN_BE_FROZEN, HEADER_IPC, HEADER_PUBLISHER};

/// A remote agent as tracked by the directory.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub name: String,
    /// Host address the peer announced on ENTER
    pub address: String,
    pub headers: HashMap<String, String>,
    /// Duplicate ENTERs seen without a matching EXIT
    pub reconnections: u32,
    /// Set once the peer joined the private channel
    pub joined: bool,
    pub groups: BTreeSet<String>,
    /// State notices the peer whispered or shouted
    pub muted: bool,
    pub frozen: bool,
    pub state: Option<String>,
    pub muted_outputs: BTreeSet<String>,
    pub log_file_path: Option<String>,
    pub definition_path: Option<String>,
    pub mapping_path: Option<String>,
}

impl Peer {
    pub fn new(id: String, name: String, address: String, headers: HashMap<String, String>) -> Self {
        Self {
            id,
            name,
            address,
            headers,
            reconnections: 0,
            joined: false,
            groups: BTreeSet::new(),
            muted: false,
            frozen: false,
            state: None,
            muted_outputs: BTreeSet::new(),
            log_file_path: None,
            definition_path: None,
            mapping_path: None,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// TCP port of the peer's publish socket, when advertised.
    pub fn publisher_port(&self) -> Option<u16> {
        self.header(HEADER_PUBLISHER).and_then(|p| p.parse().ok())
    }

    pub fn ipc_endpoint(&self) -> Option<&str> {
        self.header(HEADER_IPC)
    }

    pub fn can_be_frozen(&self) -> bool {
        self.header(HEADER_CAN_BE_FROZEN) == Some("1")
    }

    pub fn display(&self) -> String {
        format!(
            "Peer[id: {}, name: {}, address: {}]",
            self.id, self.name, self.address
        )
    }
}
