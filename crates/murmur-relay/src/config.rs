use murmur_types::{DEFAULT_INPUT_SAMPLE_RATE, DEFAULT_OUTPUT_SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::RelayError;

fn default_token_ttl_seconds() -> u64 {
    3600
}

fn default_room() -> String {
    "lobby".to_string()
}

fn default_agent_identity() -> String {
    "murmur-relay".to_string()
}

/// Connection settings for the LiveKit room the relay joins.
#[derive(Clone, Serialize, Deserialize)]
pub struct LiveKitConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing)]
    pub api_secret: String,
    /// JWT token TTL in seconds for the relay's join token. Default: 3600 (1 hour).
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
    /// Room the relay joins.
    #[serde(default = "default_room")]
    pub room: String,
    /// Identity the relay joins with. Participants whose identity starts with
    /// this value are never relayed.
    #[serde(default = "default_agent_identity")]
    pub agent_identity: String,
}

impl Default for LiveKitConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            token_ttl_seconds: default_token_ttl_seconds(),
            room: default_room(),
            agent_identity: default_agent_identity(),
        }
    }
}

impl fmt::Debug for LiveKitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("room", &self.room)
            .field("agent_identity", &self.agent_identity)
            .finish()
    }
}

impl LiveKitConfig {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            ..Self::default()
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }
}

fn default_transform_url() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_model_id() -> String {
    "eleven_multilingual_sts_v2".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_quota_cooldown_secs() -> u64 {
    60
}

fn default_output_sample_rate() -> u32 {
    DEFAULT_OUTPUT_SAMPLE_RATE
}

/// Settings for the external voice-transformation service.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_transform_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// How long all requests are skipped after a quota response.
    #[serde(default = "default_quota_cooldown_secs")]
    pub quota_cooldown_secs: u64,
    /// Sample rate of the PCM the service returns.
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            base_url: default_transform_url(),
            api_key: String::new(),
            model_id: default_model_id(),
            timeout_ms: default_timeout_ms(),
            quota_cooldown_secs: default_quota_cooldown_secs(),
            output_sample_rate: default_output_sample_rate(),
        }
    }
}

impl fmt::Debug for TransformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model_id", &self.model_id)
            .field("timeout_ms", &self.timeout_ms)
            .field("quota_cooldown_secs", &self.quota_cooldown_secs)
            .field("output_sample_rate", &self.output_sample_rate)
            .finish()
    }
}

impl TransformConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn quota_cooldown(&self) -> Duration {
        Duration::from_secs(self.quota_cooldown_secs)
    }
}

/// Tuning for the per-speaker relay loops and session recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Sample rate of inbound participant audio.
    pub input_sample_rate: u32,
    /// Duration of one transformation chunk.
    pub chunk_ms: u32,
    /// Minimum spacing between emitted chunks per speaker.
    pub min_interval_ms: u32,
    /// Speech level (dBFS) below which a chunk is not sent.
    pub silence_threshold_db: f32,
    /// Duration of each frame captured into an output channel.
    pub frame_ms: u32,
    /// Delay before the single retry when a track arrives before its route.
    pub route_retry_delay_ms: u64,
    /// Window during which a second channel fault does not recreate the route.
    pub recreate_debounce_ms: u64,
    /// Delay before the single reconnect attempt after a connection loss.
    pub reconnect_delay_ms: u64,
    /// Prefix of published output track names.
    pub output_track_prefix: String,
    /// Capacity of each inbound frame queue.
    pub frame_queue_capacity: usize,
    /// Period of the maintenance sweep over quota and recreation markers.
    pub sweep_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            chunk_ms: 1000,
            min_interval_ms: 200,
            silence_threshold_db: crate::silence::DEFAULT_SILENCE_THRESHOLD_DB,
            frame_ms: 20,
            route_retry_delay_ms: 1000,
            recreate_debounce_ms: 5000,
            reconnect_delay_ms: 5000,
            output_track_prefix: "voice-".to_string(),
            frame_queue_capacity: 256,
            sweep_interval_ms: 1000,
        }
    }
}

impl RelayConfig {
    /// Checks the values the pipeline divides by or compares against.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.input_sample_rate == 0 {
            return Err(RelayError::Config(
                "input_sample_rate must be non-zero".to_string(),
            ));
        }
        if self.chunk_ms == 0 {
            return Err(RelayError::Config("chunk_ms must be non-zero".to_string()));
        }
        if self.frame_ms == 0 {
            return Err(RelayError::Config("frame_ms must be non-zero".to_string()));
        }
        if self.silence_threshold_db > 0.0 {
            return Err(RelayError::Config(format!(
                "silence_threshold_db must be at most 0 dBFS, got {}",
                self.silence_threshold_db
            )));
        }
        Ok(())
    }

    pub fn route_retry_delay(&self) -> Duration {
        Duration::from_millis(self.route_retry_delay_ms)
    }

    pub fn recreate_debounce(&self) -> Duration {
        Duration::from_millis(self.recreate_debounce_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Name of the output track published for `identity`.
    pub fn output_track_name(&self, identity: &str) -> String {
        format!("{}{}", self.output_track_prefix, identity)
    }
}
