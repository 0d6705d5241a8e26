//! Client for the external voice-transformation service.
//!
//! [`TransformClient`] owns the local gating (quota cooldown, silence,
//! undersized chunks) and the quota bookkeeping. The actual request goes
//! through a [`TransformBackend`], which classifies every response into a
//! [`TransformFailure`] at the boundary so callers never inspect messages.

use crate::config::TransformConfig;
use crate::endpoint::join_path;
use crate::quota::QuotaState;
use crate::silence::SilenceGate;
use crate::wav::{decode_pcm_s16le, encode_wav};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Longest error body kept for logging.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Markers the service uses in 401 bodies when the account is out of quota.
const QUOTA_MARKERS: [&str; 4] = [
    "quota_exceeded",
    "quota exceeded",
    "rate_limit",
    "too_many_concurrent_requests",
];

/// Coarse failure classes, used for log fields and backoff decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Quota,
    Timeout,
    Service,
    EmptyResponse,
    Request,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quota => "quota",
            Self::Timeout => "timeout",
            Self::Service => "service_error",
            Self::EmptyResponse => "empty_response",
            Self::Request => "request",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformFailure {
    #[error("transformation quota or rate limit exhausted")]
    Quota,

    #[error("transformation request timed out: {0}")]
    Timeout(String),

    #[error("transformation service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("transformation service returned an empty body")]
    EmptyResponse,

    #[error("transformation request failed: {0}")]
    Request(String),
}

impl TransformFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Quota => FailureKind::Quota,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Service { .. } => FailureKind::Service,
            Self::EmptyResponse => FailureKind::EmptyResponse,
            Self::Request(_) => FailureKind::Request,
        }
    }
}

/// Why a chunk was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Quota cooldown is active.
    Quota,
    /// The chunk is below the speech threshold.
    Silence,
    /// The chunk is too short to be worth a request.
    Undersized,
}

/// Outcome of a successful [`TransformClient::convert`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    /// Transformed mono PCM at the service's output rate.
    Converted(Vec<i16>),
    /// Nothing was sent.
    Skipped(SkipReason),
}

/// One request against the transformation service.
#[async_trait]
pub trait TransformBackend: Send + Sync {
    /// Sends an encoded WAV for `voice_id` and returns the raw PCM body.
    async fn transform(&self, voice_id: &str, wav: Vec<u8>) -> Result<Vec<u8>, TransformFailure>;
}

/// Decides whether an error response signals quota or rate-limit exhaustion.
pub fn is_quota_response(status: u16, body: &str) -> bool {
    match status {
        429 => true,
        401 => {
            let lowered = body.to_ascii_lowercase();
            QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker))
        }
        _ => false,
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        body.to_string()
    } else {
        let mut cut: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        cut.push('…');
        cut
    }
}

/// Speech-to-speech endpoint over HTTP.
///
/// `POST {base_url}/v1/speech-to-speech/{voice_id}?output_format=pcm_{rate}`
/// with the API key in `xi-api-key` and the audio as the `audio` part of a
/// multipart body.
pub struct HttpTransformBackend {
    config: TransformConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for HttpTransformBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransformBackend")
            .field("config", &self.config)
            .finish()
    }
}

impl HttpTransformBackend {
    pub fn new(config: TransformConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10).min(config.timeout()))
            .timeout(config.timeout())
            .build()?;
        Ok(Self { config, http })
    }

    fn endpoint(&self, voice_id: &str) -> Result<url::Url, TransformFailure> {
        join_path(&self.config.base_url, &["v1", "speech-to-speech", voice_id])
            .map_err(TransformFailure::Request)
    }
}

#[async_trait]
impl TransformBackend for HttpTransformBackend {
    async fn transform(&self, voice_id: &str, wav: Vec<u8>) -> Result<Vec<u8>, TransformFailure> {
        tracing::debug!(voice_id, size = wav.len(), "transformation request");

        let audio = reqwest::multipart::Part::bytes(wav)
            .file_name("chunk.wav")
            .mime_str("audio/wav")
            .map_err(|e| TransformFailure::Request(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("audio", audio)
            .text("model_id", self.config.model_id.clone());

        let response = self
            .http
            .post(self.endpoint(voice_id)?)
            .query(&[(
                "output_format",
                format!("pcm_{}", self.config.output_sample_rate),
            )])
            .header("xi-api-key", &self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_quota_response(status.as_u16(), &body) {
                return Err(TransformFailure::Quota);
            }
            return Err(TransformFailure::Service {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let bytes = response.bytes().await.map_err(classify_send_error)?;
        if bytes.is_empty() {
            return Err(TransformFailure::EmptyResponse);
        }
        Ok(bytes.to_vec())
    }
}

fn classify_send_error(e: reqwest::Error) -> TransformFailure {
    if e.is_timeout() || e.is_connect() {
        TransformFailure::Timeout(e.to_string())
    } else {
        TransformFailure::Request(e.to_string())
    }
}

/// Gated, quota-aware conversion of one chunk.
pub struct TransformClient {
    backend: Arc<dyn TransformBackend>,
    quota: Arc<QuotaState>,
    gate: SilenceGate,
    input_sample_rate: u32,
}

impl TransformClient {
    pub fn new(
        backend: Arc<dyn TransformBackend>,
        quota: Arc<QuotaState>,
        gate: SilenceGate,
        input_sample_rate: u32,
    ) -> Self {
        Self {
            backend,
            quota,
            gate,
            input_sample_rate,
        }
    }

    pub fn quota(&self) -> &Arc<QuotaState> {
        &self.quota
    }

    /// Fewest samples worth a request: 10 ms of input.
    fn min_samples(&self) -> usize {
        (self.input_sample_rate / 100).max(1) as usize
    }

    /// Converts `chunk` into `voice_id`.
    ///
    /// Skips without any network call while quota is exhausted, when the
    /// chunk is silence, or when it is shorter than 10 ms.
    pub async fn convert(
        &self,
        voice_id: &str,
        chunk: &[i16],
    ) -> Result<Conversion, TransformFailure> {
        if chunk.len() < self.min_samples() {
            return Ok(Conversion::Skipped(SkipReason::Undersized));
        }
        if self.quota.is_exhausted() {
            return Ok(Conversion::Skipped(SkipReason::Quota));
        }
        if !self.gate.is_speech(chunk) {
            return Ok(Conversion::Skipped(SkipReason::Silence));
        }

        let wav = encode_wav(chunk, self.input_sample_rate)
            .map_err(|e| TransformFailure::Request(format!("failed to encode WAV: {}", e)))?;

        match self.backend.transform(voice_id, wav).await {
            Ok(body) => {
                let pcm = decode_pcm_s16le(&body);
                if pcm.is_empty() {
                    return Err(TransformFailure::EmptyResponse);
                }
                self.quota.mark_success();
                Ok(Conversion::Converted(pcm))
            }
            Err(TransformFailure::Quota) => {
                if self.quota.exhausted_since().is_none() {
                    tracing::warn!(
                        voice_id,
                        cooldown_secs = self.quota.cooldown().as_secs(),
                        "transformation quota exhausted, pausing requests"
                    );
                }
                self.quota.mark_exhausted();
                Err(TransformFailure::Quota)
            }
            Err(other) => Err(other),
        }
    }
}
