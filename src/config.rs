//! Runtime configuration for the hub and the players

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of the shared pipeline hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Name given to the shared pipeline bin
    pub pipeline_name: String,
    /// Node kind inserted between a fan-out branch and a sink
    pub buffer_node_kind: String,
    /// Node kind duplicating a source to several branches
    pub fanout_node_kind: String,
    /// How long a disconnect may wait for its gates before teardown is forced
    #[serde(rename = "drain_timeout_ms", with = "millis")]
    pub drain_timeout: Duration,
    #[serde(rename = "health_interval_ms", with = "millis")]
    pub health_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "mediahub-pipeline".to_string(),
            buffer_node_kind: "queue".to_string(),
            fanout_node_kind: "tee".to_string(),
            drain_timeout: Duration::from_millis(2000),
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Settings shared by every playback backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Bounded wait used when polling a state change result
    #[serde(rename = "state_query_timeout_ms", with = "millis")]
    pub state_query_timeout: Duration,
    pub initial_volume: f64,
    /// Ask URI playback to download ahead when the resource is not live
    pub enable_download_buffering: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            state_query_timeout: Duration::from_millis(250),
            initial_volume: 1.0,
            enable_download_buffering: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hub: HubConfig,
    pub player: PlayerConfig,
}

/// Parse a JSON configuration document. Missing sections and fields keep
/// their defaults.
pub fn load_from_str(json: &str) -> Result<Config, serde_json::Error> {
    serde_json::from_str(json)
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
