use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_AGENT_NAME, DEFAULT_BROADCAST_INTERVAL_MS, DEFAULT_OUTPUTS_REQUEST_DELAY_MS,
};
use crate::events::model::LogLevel;

/// Runtime configuration, usually deserialized from a TOML file.
/// Every section is optional; accessors below resolve the defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub agent: Option<AgentConfig>,
    pub network: Option<NetworkConfig>,
    pub timing: Option<TimingConfig>,
    pub mapping: Option<MappingConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    pub name: Option<String>,
    /// Whether peers may freeze this agent (advertised as `canBeFrozen`)
    pub can_be_frozen: Option<bool>,
    /// Raise SIGINT in the process when a peer sends STOP (default true)
    pub interrupt_on_forced_stop: Option<bool>,
    /// Definition JSON loaded at startup by the binary
    pub definition_path: Option<String>,
    /// Mapping JSON loaded at startup by the binary
    pub mapping_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NetworkConfig {
    /// Address advertised to peers and compared against theirs for same-host
    /// detection. Unset (or `0.0.0.0`) lets each peer use the address it sees us at.
    pub host_ip: Option<String>,
    /// TCP port of the publish socket (0 = ephemeral)
    pub publisher_port: Option<u16>,
    /// Expose an additional unix-socket publisher for same-host subscribers
    pub enable_ipc: Option<bool>,
    /// Directory holding the unix-socket publisher endpoint
    pub ipc_dir: Option<String>,
    /// TCP presence listening port
    pub presence_port: Option<u16>,
    /// TCP presence peers dialed at startup (host:port)
    pub bootstrap_nodes: Option<Vec<String>>,
    /// Exchange peer lists so every agent connects to every other one (default true)
    pub gossip: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TimingConfig {
    /// Debounce window for definition/mapping broadcasts
    pub broadcast_interval_ms: Option<u64>,
    /// Delay between activating new filters on a peer and requesting its outputs
    pub outputs_request_delay_ms: Option<u64>,
    /// Stop the agent after this many seconds (disabled when unset)
    pub expiry_secs: Option<u64>,
}

/// What the resolver does with filters no mapping element asks for anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterPolicy {
    /// Keep them until a wholesale definition/mapping replacement (historical behavior).
    #[default]
    Retain,
    /// Unsubscribe them on the next resolution pass.
    Prune,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MappingConfig {
    pub filter_policy: Option<FilterPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Path to JSON line log (rotated). If unset, defaults to logs/agentmesh.jsonl
    pub json_path: Option<String>,
    /// Max size in bytes before rotation (default 5MB)
    pub json_max_bytes: Option<usize>,
    /// Number of rotated files to retain (default 3)
    pub json_rotate: Option<u32>,
    /// Disable console sink (default false)
    pub disable_console: Option<bool>,
    /// Disable JSON file sink (default false)
    pub disable_file: Option<bool>,
    /// Minimum level printed on the console (default info)
    pub console_level: Option<LogLevel>,
}

impl Config {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    /// Load a TOML file; a missing file yields the default config and `false`.
    pub fn load_or_default(path: &str) -> anyhow::Result<(Self, bool)> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok((
                Self::from_toml_str(&content)
                    .map_err(|e| anyhow::anyhow!("failed to parse config file '{}': {}", path, e))?,
                true,
            )),
            Err(_) => Ok((Self::default(), false)),
        }
    }

    pub fn agent_name(&self) -> String {
        self.agent
            .as_ref()
            .and_then(|a| a.name.clone())
            .unwrap_or_else(|| DEFAULT_AGENT_NAME.to_string())
    }

    pub fn can_be_frozen(&self) -> bool {
        self.agent
            .as_ref()
            .and_then(|a| a.can_be_frozen)
            .unwrap_or(false)
    }

    pub fn interrupt_on_forced_stop(&self) -> bool {
        self.agent
            .as_ref()
            .and_then(|a| a.interrupt_on_forced_stop)
            .unwrap_or(true)
    }

    pub fn host_ip(&self) -> String {
        self.network
            .as_ref()
            .and_then(|n| n.host_ip.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn publisher_port(&self) -> u16 {
        self.network
            .as_ref()
            .and_then(|n| n.publisher_port)
            .unwrap_or(0)
    }

    pub fn ipc_enabled(&self) -> bool {
        cfg!(unix)
            && self
                .network
                .as_ref()
                .and_then(|n| n.enable_ipc)
                .unwrap_or(true)
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.network
            .as_ref()
            .and_then(|n| n.ipc_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("agentmesh"))
    }

    pub fn presence_port(&self) -> u16 {
        self.network
            .as_ref()
            .and_then(|n| n.presence_port)
            .unwrap_or(5670)
    }

    pub fn bootstrap_nodes(&self) -> Vec<String> {
        self.network
            .as_ref()
            .and_then(|n| n.bootstrap_nodes.clone())
            .unwrap_or_default()
    }

    pub fn gossip_enabled(&self) -> bool {
        self.network
            .as_ref()
            .and_then(|n| n.gossip)
            .unwrap_or(true)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(
            self.timing
                .as_ref()
                .and_then(|t| t.broadcast_interval_ms)
                .unwrap_or(DEFAULT_BROADCAST_INTERVAL_MS)
                .max(1),
        )
    }

    pub fn outputs_request_delay(&self) -> Duration {
        Duration::from_millis(
            self.timing
                .as_ref()
                .and_then(|t| t.outputs_request_delay_ms)
                .unwrap_or(DEFAULT_OUTPUTS_REQUEST_DELAY_MS),
        )
    }

    pub fn expiry(&self) -> Option<Duration> {
        self.timing
            .as_ref()
            .and_then(|t| t.expiry_secs)
            .map(Duration::from_secs)
    }

    pub fn filter_policy(&self) -> FilterPolicy {
        self.mapping
            .as_ref()
            .and_then(|m| m.filter_policy)
            .unwrap_or_default()
    }
}
