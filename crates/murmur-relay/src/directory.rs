//! Voice-assignment lookup.
//!
//! The control plane owns per-user voice preferences; the relay only reads
//! them. A missing entry or a failed lookup falls back to a default voice.

use crate::endpoint::join_path;
use crate::error::DirectoryError;
use async_trait::async_trait;
use murmur_types::VoiceAssignment;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Read-only lookup of a participant's voice.
#[async_trait]
pub trait VoiceDirectory: Send + Sync {
    async fn lookup(&self, identity: &str) -> Result<Option<VoiceAssignment>, DirectoryError>;
}

/// Looks up `identity`, falling back to `default` on absence or failure.
pub async fn resolve_assignment(
    directory: &dyn VoiceDirectory,
    identity: &str,
    default: &VoiceAssignment,
) -> VoiceAssignment {
    match directory.lookup(identity).await {
        Ok(Some(voice)) => voice,
        Ok(None) => {
            tracing::debug!(identity, voice_id = %default.voice_id, "no voice preference, using default");
            default.clone()
        }
        Err(e) => {
            tracing::warn!(identity, error = %e, "voice lookup failed, using default voice");
            default.clone()
        }
    }
}

/// Voice preferences held in memory.
#[derive(Debug, Default)]
pub struct InMemoryVoiceDirectory {
    voices: RwLock<HashMap<String, VoiceAssignment>>,
}

impl InMemoryVoiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, VoiceAssignment)>) -> Self {
        Self {
            voices: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn set(&self, identity: impl Into<String>, voice: VoiceAssignment) {
        self.voices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.into(), voice);
    }

    pub fn remove(&self, identity: &str) -> Option<VoiceAssignment> {
        self.voices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity)
    }

    pub fn len(&self) -> usize {
        self.voices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VoiceDirectory for InMemoryVoiceDirectory {
    async fn lookup(&self, identity: &str) -> Result<Option<VoiceAssignment>, DirectoryError> {
        Ok(self
            .voices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoiceRecord {
    voice_id: Option<String>,
    display_name: Option<String>,
}

/// Reads voice preferences from the control plane over HTTP.
///
/// `GET {base_url}/voices/{identity}` answers `404` for unknown users and
/// `{"voiceId": "...", "displayName": "..."}` otherwise.
#[derive(Debug, Clone)]
pub struct HttpVoiceDirectory {
    base_url: String,
    http: reqwest::Client,
}

impl HttpVoiceDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }
}

#[async_trait]
impl VoiceDirectory for HttpVoiceDirectory {
    async fn lookup(&self, identity: &str) -> Result<Option<VoiceAssignment>, DirectoryError> {
        let url = join_path(&self.base_url, &["voices", identity])
            .map_err(DirectoryError::Unavailable)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(DirectoryError::Unavailable(format!("HTTP {}", status)));
        }

        let record: VoiceRecord = response
            .json()
            .await
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;

        match record.voice_id.filter(|id| !id.trim().is_empty()) {
            Some(voice_id) => {
                let display_name = record.display_name.unwrap_or_else(|| voice_id.clone());
                Ok(Some(VoiceAssignment::new(voice_id, display_name)))
            }
            None => Ok(None),
        }
    }
}
