//! Relay configuration.

use bridle_governor::GovernorPolicy;
use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    0
}

fn default_max_connections() -> usize {
    50
}

fn default_max_payload_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_chunk_bytes() -> usize {
    bridle_ops::DEFAULT_CHUNK_BYTES
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_idle_session_ttl_secs() -> u64 {
    300
}

fn default_sample_interval_secs() -> u64 {
    5
}

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Websocket clients accepted before new upgrades are refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// `maxPayloadBytes` advertised in the handshake ack; larger responses
    /// are chunked.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Byte size of each chunk of an oversized response.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// How long a fresh socket may take to send `ops_hello`.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Interval between server-initiated `ops_ping` frames.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Consecutive unanswered pings before the socket is closed.
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
    /// Sessions idle past this TTL are expired by the sampler sweep.
    #[serde(default = "default_idle_session_ttl_secs")]
    pub idle_session_ttl_secs: u64,
    /// Interval between governor pressure samples.
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    /// Admission governor policy.
    #[serde(default)]
    pub governor: GovernorPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_payload_bytes: default_max_payload_bytes(),
            chunk_bytes: default_chunk_bytes(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_missed_pongs: default_max_missed_pongs(),
            idle_session_ttl_secs: default_idle_session_ttl_secs(),
            sample_interval_secs: default_sample_interval_secs(),
            governor: GovernorPolicy::default(),
        }
    }
}
