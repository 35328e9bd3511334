//! # agentmesh
//!
//! Brokerless peer-to-peer agent middleware. Independently started agents
//! discover each other, exchange definitions (their inputs, outputs and
//! parameters) and mappings (which remote outputs feed which local inputs),
//! and stream typed values between them over publish/subscribe sockets.
//!
//! ## Design Principles
//! * One reactor per agent on its own thread; the host talks to it through
//!   the synchronous [`agent::Agent`] handle.
//! * Discovery is pluggable behind [`network::Presence`]: an in-process hub
//!   for same-process agents and tests, and a TCP mesh for real deployments.
//! * Filtering happens on the publisher side, by exact output name.
//! * Event-driven instrumentation (JSON line log + console) through `events`.
//!
//! ## Key Modules
//! * `agent` – Host API: definition/mapping editing, values, mute/freeze, bus.
//! * `model` – Definitions, mappings, IOP values and conversions.
//! * `runtime` – Directory, subscribers, resolver, commands and the reactor.
//! * `network` – Presence implementations, publisher/subscriber sockets, framing.
//! * `config` – TOML configuration.
//! * `events` – Structured logging/events dispatcher.

pub mod agent;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod model;
pub mod network;
pub mod prelude; // curated stable-intent re-exports
pub mod runtime;
pub mod utils; // common helpers (naming, etc.)

pub use agent::Agent;
