//! Server configuration loading from file and environment variables.

use murmur_relay::{LiveKitConfig, RelayConfig, TransformConfig};
use murmur_types::{VoiceAssignment, DEFAULT_VOICE_ID, DEFAULT_VOICE_NAME};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Room the relay joins.
    #[serde(default)]
    pub livekit: LiveKitConfig,

    /// Voice-transformation service.
    #[serde(default)]
    pub transform: TransformConfig,

    /// Relay loop tuning.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Where participant voices come from.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Network configuration for the HTTP status server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "murmur_relay=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Voice preference source.
///
/// With `url` set, voices are looked up from the control plane; otherwise the
/// `voices` entries are served from memory.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub url: Option<String>,

    /// Voice used when a participant has no preference or lookup fails.
    #[serde(default = "default_voice_id")]
    pub default_voice_id: String,

    #[serde(default = "default_display_name")]
    pub default_display_name: String,

    #[serde(default)]
    pub voices: Vec<VoiceEntry>,
}

/// A static voice preference.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceEntry {
    pub identity: String,
    pub voice_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl DirectoryConfig {
    pub fn default_voice(&self) -> VoiceAssignment {
        VoiceAssignment::new(&self.default_voice_id, &self.default_display_name)
    }

    /// Static entries as `(identity, assignment)` pairs.
    pub fn entries(&self) -> Vec<(String, VoiceAssignment)> {
        self.voices
            .iter()
            .map(|entry| {
                let name = entry
                    .display_name
                    .clone()
                    .unwrap_or_else(|| entry.voice_id.clone());
                (
                    entry.identity.clone(),
                    VoiceAssignment::new(&entry.voice_id, name),
                )
            })
            .collect()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_voice_id() -> String {
    DEFAULT_VOICE_ID.to_string()
}

fn default_display_name() -> String {
    DEFAULT_VOICE_NAME.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_voice_id: default_voice_id(),
            default_display_name: default_display_name(),
            voices: Vec::new(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks values the relay cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.transform.output_sample_rate == 0 {
            return Err(ConfigError::Invalid(
                "transform.output_sample_rate must be non-zero".to_string(),
            ));
        }
        if self.livekit.api_key.is_empty() || self.livekit.api_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "livekit.api_key and livekit.api_secret must be set".to_string(),
            ));
        }
        if self.livekit.room.trim().is_empty() {
            return Err(ConfigError::Invalid("livekit.room must be set".to_string()));
        }
        if self.livekit.agent_identity.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "livekit.agent_identity must be set".to_string(),
            ));
        }
        if self.directory.default_voice_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "directory.default_voice_id must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Applies environment overrides, reading variables through `var`.
///
/// - `MURMUR_HOST` / `MURMUR_PORT` override `server.host` / `server.port`
/// - `MURMUR_LOG_LEVEL` overrides `logging.level`
/// - `MURMUR_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `LIVEKIT_URL`, `LIVEKIT_API_KEY`, `LIVEKIT_API_SECRET` and `MURMUR_ROOM`
///   override the `[livekit]` section
/// - `MURMUR_TRANSFORM_URL` / `MURMUR_TRANSFORM_API_KEY` override
///   `transform.base_url` / `transform.api_key`
/// - `MURMUR_DIRECTORY_URL` overrides `directory.url`
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("MURMUR_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("MURMUR_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = var("MURMUR_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("MURMUR_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = var("LIVEKIT_URL") {
        config.livekit.url = url;
    }
    if let Some(key) = var("LIVEKIT_API_KEY") {
        config.livekit.api_key = key;
    }
    if let Some(secret) = var("LIVEKIT_API_SECRET") {
        config.livekit.api_secret = secret;
    }
    if let Some(room) = var("MURMUR_ROOM") {
        config.livekit.room = room;
    }
    if let Some(url) = var("MURMUR_TRANSFORM_URL") {
        config.transform.base_url = url;
    }
    if let Some(key) = var("MURMUR_TRANSFORM_API_KEY") {
        config.transform.api_key = key;
    }
    if let Some(url) = var("MURMUR_DIRECTORY_URL") {
        config.directory.url = Some(url).filter(|u| !u.trim().is_empty());
    }
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides and validates the result.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = read_config_file(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Parses the TOML file at `path`. A missing file yields defaults.
pub fn read_config_file(path: Option<&str>) -> Result<Config, ConfigError> {
    match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::FileRead(e)),
        },
        None => Ok(Config::default()),
    }
}
