pub mod bootstrap;
pub(crate) mod events;
pub mod framing;
pub mod listener;
pub mod local;
pub mod message;
pub mod peer;
pub mod peer_manager;
pub mod presence;
pub mod publisher;
pub mod subscription;
pub mod tcp;
pub mod transport;

pub use local::{LocalPresence, PresenceHub};
pub use message::{DataMessage, Message, MessageType};
pub use peer::Peer;
pub use peer_manager::PeerManager;
pub use presence::{text_frames, Frames, Presence, PresenceEvent};
pub use publisher::{Publisher, PublisherConfig, PublisherHandle};
pub use subscription::{Endpoint, InboundData, SubscriptionSocket};
pub use tcp::{TcpPresence, TcpPresenceConfig};
