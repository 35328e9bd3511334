//! Central place for protocol constants and default values.

/// Default agent name when none is configured.
pub const DEFAULT_AGENT_NAME: &str = "no_name";

/// Left padding used to align log lines with those that include emoji prefixes.
pub const ICON_PLACEHOLDER: &str = "   "; // Three spaces for alignment

/// Protocol branding shown in HELLO and logs
pub const PROTOCOL_NAME: &str = "agentmesh";
/// Protocol version for compatibility checks (bump when wire format changes)
pub const PROTOCOL_VERSION: &str = "1";

/// Application / crate version (populated from Cargo.toml via env! macro)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Presence group every agent joins; definitions, mappings and commands travel here.
pub const PRIVATE_CHANNEL: &str = "AGENTMESH_PRIVATE";

/// Wildcard accepted in the agent field of a mapping element.
pub const MAPPING_WILDCARD: &str = "*";

/// Maximum length of agent and IOP names; longer names are truncated.
pub const MAX_NAME_LENGTH: usize = 1024;

// Presence header keys
pub const HEADER_PUBLISHER: &str = "publisher";
pub const HEADER_LOGGER: &str = "logger";
pub const HEADER_IPC: &str = "ipc";
pub const HEADER_CAN_BE_FROZEN: &str = "canBeFrozen";
pub const HEADER_PID: &str = "pid";
pub const HEADER_COMMANDLINE: &str = "commandline";
pub const HEADER_HOSTNAME: &str = "hostname";

/// Default debounce window for definition/mapping broadcasts.
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 1000;
/// Default delay between activating filters and requesting current outputs.
pub const DEFAULT_OUTPUTS_REQUEST_DELAY_MS: u64 = 100;

/// Largest pub/sub frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;
/// Largest STRING or DATA value an IOP may hold; leaves room for the name,
/// type tag and part headers within one frame.
pub const MAX_VALUE_LENGTH: usize = MAX_FRAME_LENGTH - 8 * 1024;

/// Human friendly composite version string used in logs.
pub fn full_version() -> String {
    format!("v{} (protocol={})", APP_VERSION, PROTOCOL_VERSION)
}
