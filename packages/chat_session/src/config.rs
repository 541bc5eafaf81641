use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SessionError;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [transport]
//                    reconnect_delay_ms = 2000
//
//   env var:         CHAT_TRANSPORT__RECONNECT_DELAY_MS=2000   (double underscore = nesting)
//
//   (single underscore stays within field names: CHAT_SESSION__RECEIPT_TIMEOUT_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub channels: ChannelsFileConfig,
    #[serde(default)]
    pub directory: DirectoryFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Broker connection tunables (lives under `[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Value of the STOMP `host` header. Defaults to the endpoint's host.
    #[serde(default)]
    pub virtual_host: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// How often we promise to send heartbeats (0 = never).
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_outgoing_ms: u64,
    /// How often we want heartbeats from the broker (0 = never).
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_incoming_ms: u64,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            virtual_host: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_outgoing_ms: default_heartbeat_ms(),
            heartbeat_incoming_ms: default_heartbeat_ms(),
        }
    }
}

/// Broker destinations (lives under `[channels]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelsFileConfig {
    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: String,
    /// Private queue template; `{id}` is replaced with the local identity id.
    #[serde(default = "default_private_queue")]
    pub private_queue: String,
    #[serde(default = "default_send_destination")]
    pub send_destination: String,
    #[serde(default = "default_join_destination")]
    pub join_destination: String,
    #[serde(default = "default_leave_destination")]
    pub leave_destination: String,
}

impl Default for ChannelsFileConfig {
    fn default() -> Self {
        Self {
            broadcast_topic: default_broadcast_topic(),
            private_queue: default_private_queue(),
            send_destination: default_send_destination(),
            join_destination: default_join_destination(),
            leave_destination: default_leave_destination(),
        }
    }
}

/// Directory service tunables (lives under `[directory]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryFileConfig {
    #[serde(default = "default_directory_url")]
    pub base_url: String,
    #[serde(default = "default_online_path")]
    pub online_path: String,
    #[serde(default = "default_directory_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DirectoryFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_directory_url(),
            online_path: default_online_path(),
            timeout_ms: default_directory_timeout_ms(),
        }
    }
}

/// Session lifecycle tunables (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Wait for broker receipts on SUBSCRIBE before going active.
    #[serde(default = "default_await_receipts")]
    pub await_receipts: bool,
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    /// Re-announce Join after an outage longer than this (0 = never).
    #[serde(default)]
    pub reannounce_after_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            await_receipts: default_await_receipts(),
            receipt_timeout_ms: default_receipt_timeout_ms(),
            reannounce_after_secs: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_endpoint() -> String {
    "ws://localhost:8080/ws/websocket".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_heartbeat_ms() -> u64 {
    4_000
}
fn default_broadcast_topic() -> String {
    "/topic/public".to_string()
}
fn default_private_queue() -> String {
    "/user/{id}/queue/messages".to_string()
}
fn default_send_destination() -> String {
    "/app/chat.sendMessage".to_string()
}
fn default_join_destination() -> String {
    "/app/chat.addUser".to_string()
}
fn default_leave_destination() -> String {
    "/app/chat.removeUser".to_string()
}
fn default_directory_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_online_path() -> String {
    "/api/users/online".to_string()
}
fn default_directory_timeout_ms() -> u64 {
    5_000
}
fn default_await_receipts() -> bool {
    true
}
fn default_receipt_timeout_ms() -> u64 {
    5_000
}
fn default_event_capacity() -> usize {
    1024
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_TRANSPORT__ENDPOINT=ws://...`  →  `transport.endpoint = "ws://..."`
///   `CHAT_SESSION__AWAIT_RECEIPTS=false`  →  `session.await_receipts = false`
pub fn load_config(config_toml: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_toml {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("CHAT_").split("__"))
}

/// Extract the layered file config.
pub fn load_file_config(config_toml: Option<&Path>) -> Result<FileConfig, SessionError> {
    load_config(config_toml)
        .extract()
        .map_err(|e| SessionError::Config(e.to_string()))
}

/// Render a file config as TOML, e.g. to show the effective settings.
pub fn render_toml(fc: &FileConfig) -> Result<String, SessionError> {
    toml::to_string_pretty(fc).map_err(|e| SessionError::Config(e.to_string()))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the session)
// =============================================================================

/// Transport configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub endpoint: String,
    pub virtual_host: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
    /// Capacity of the transport event broadcast.
    pub event_capacity: usize,
}

impl TransportConfig {
    pub fn from_file(fc: &TransportFileConfig, event_capacity: usize) -> Self {
        Self {
            endpoint: fc.endpoint.clone(),
            virtual_host: fc.virtual_host.clone(),
            connect_timeout: Duration::from_millis(fc.connect_timeout_ms),
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            heartbeat_outgoing: Duration::from_millis(fc.heartbeat_outgoing_ms),
            heartbeat_incoming: Duration::from_millis(fc.heartbeat_incoming_ms),
            event_capacity,
        }
    }
}

/// Broker destinations (runtime view).
#[derive(Clone, Debug)]
pub struct ChannelsConfig {
    pub broadcast_topic: String,
    pub private_queue: String,
    pub send_destination: String,
    pub join_destination: String,
    pub leave_destination: String,
}

impl ChannelsConfig {
    pub fn from_file(fc: &ChannelsFileConfig) -> Self {
        Self {
            broadcast_topic: fc.broadcast_topic.clone(),
            private_queue: fc.private_queue.clone(),
            send_destination: fc.send_destination.clone(),
            join_destination: fc.join_destination.clone(),
            leave_destination: fc.leave_destination.clone(),
        }
    }

    /// Private queue name for `id`, derived deterministically from the template.
    pub fn private_queue_for(&self, id: &str) -> String {
        self.private_queue.replace("{id}", id)
    }
}

/// Directory service configuration (runtime view).
#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub online_path: String,
    pub timeout: Duration,
}

impl DirectoryConfig {
    pub fn from_file(fc: &DirectoryFileConfig) -> Self {
        Self {
            base_url: fc.base_url.clone(),
            online_path: fc.online_path.clone(),
            timeout: Duration::from_millis(fc.timeout_ms),
        }
    }

    pub fn online_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.online_path.trim_start_matches('/')
        )
    }
}

/// Everything a session needs, resolved from `FileConfig`.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub channels: ChannelsConfig,
    pub directory: DirectoryConfig,
    pub await_receipts: bool,
    pub receipt_timeout: Duration,
    /// `None` = never re-announce Join after a reconnect.
    pub reannounce_after: Option<Duration>,
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let event_capacity = fc.session.event_capacity.max(1);
        Self {
            transport: TransportConfig::from_file(&fc.transport, event_capacity),
            channels: ChannelsConfig::from_file(&fc.channels),
            directory: DirectoryConfig::from_file(&fc.directory),
            await_receipts: fc.session.await_receipts,
            receipt_timeout: Duration::from_millis(fc.session.receipt_timeout_ms),
            reannounce_after: if fc.session.reannounce_after_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.session.reannounce_after_secs))
            },
            event_capacity,
        }
    }

    /// Resolve the layered figment into a runtime config.
    pub fn load(config_toml: Option<&Path>) -> Result<Self, SessionError> {
        Ok(Self::from_file(&load_file_config(config_toml)?))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
