//! agentmesh public prelude (curated stable-intent exports).
//! Import with: `use agentmesh::prelude::*;`
//!
//! Items here are considered *stable-intent* prior to 1.0.0. Their shape may
//! still adjust minimally until the first tagged release.

pub use crate::agent::Agent;
pub use crate::config::{Config, FilterPolicy};
pub use crate::error::{AgentError, ModelError};
pub use crate::model::{Definition, IopKind, IopType, IopValue, Mapping};
pub use crate::network::{LocalPresence, Presence, PresenceHub, TcpPresence, TcpPresenceConfig};
pub use crate::runtime::AgentEvent;
