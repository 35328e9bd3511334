// src/network/presence.rs

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::PresenceError;

/// Multi-part message body as carried by whispers and shouts.
pub type Frames = Vec<Bytes>;

/// Build frames from string parts.
pub fn text_frames<I, S>(parts: I) -> Frames
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts
        .into_iter()
        .map(|p| Bytes::from(p.into().into_bytes()))
        .collect()
}

/// Membership and messaging notifications produced by a presence layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Enter {
        peer_id: String,
        name: String,
        /// Host address the peer advertised (or was observed at)
        address: String,
        headers: HashMap<String, String>,
    },
    Exit {
        peer_id: String,
        name: String,
    },
    Join {
        peer_id: String,
        name: String,
        group: String,
    },
    Leave {
        peer_id: String,
        name: String,
        group: String,
    },
    Whisper {
        peer_id: String,
        name: String,
        frames: Frames,
    },
    Shout {
        peer_id: String,
        name: String,
        group: String,
        frames: Frames,
    },
}

impl PresenceEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PresenceEvent::Enter { peer_id, .. }
            | PresenceEvent::Exit { peer_id, .. }
            | PresenceEvent::Join { peer_id, .. }
            | PresenceEvent::Leave { peer_id, .. }
            | PresenceEvent::Whisper { peer_id, .. }
            | PresenceEvent::Shout { peer_id, .. } => peer_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PresenceEvent::Enter { .. } => "ENTER",
            PresenceEvent::Exit { .. } => "EXIT",
            PresenceEvent::Join { .. } => "JOIN",
            PresenceEvent::Leave { .. } => "LEAVE",
            PresenceEvent::Whisper { .. } => "WHISPER",
            PresenceEvent::Shout { .. } => "SHOUT",
        }
    }
}

/// Discovery/transport primitive with join/leave/whisper/shout semantics
/// and per-peer headers exchanged on entry.
///
/// Name and headers must be set before `start`; group and messaging calls
/// fail with `PresenceError::NotStarted` until then.
#[async_trait]
pub trait Presence: Send {
    /// Our own peer identifier.
    fn node_id(&self) -> &str;

    fn set_name(&mut self, name: &str);

    fn set_header(&mut self, key: &str, value: &str);

    /// Host address peers see us at; compared against theirs for same-host detection.
    fn host_address(&self) -> String;

    /// Announce ourselves and return the event stream.
    async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, PresenceError>;

    fn join(&mut self, group: &str) -> Result<(), PresenceError>;

    fn leave(&mut self, group: &str) -> Result<(), PresenceError>;

    fn whisper(&mut self, peer_id: &str, frames: Frames) -> Result<(), PresenceError>;

    fn shout(&mut self, group: &str, frames: Frames) -> Result<(), PresenceError>;

    /// Leave the network; peers observe an EXIT.
    async fn stop(&mut self);
}
