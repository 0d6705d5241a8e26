//! Murmur server library logic.
//!
//! Wires the relay core together from [`config::Config`] and exposes a small
//! HTTP surface for health checks and session status.

pub mod background;
pub mod config;

use axum::{routing::get, Extension, Json, Router};
use config::Config;
use murmur_relay::{
    CoordinatorSettings, HttpTransformBackend, HttpVoiceDirectory, InMemoryVoiceDirectory,
    QuotaState, RoomConnector, SessionCoordinator, SilenceGate, TokenIssuer, TransformClient,
    VoiceDirectory,
};
use murmur_types::SessionStatus;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay's session.
    pub coordinator: Arc<SessionCoordinator>,
}

/// Errors that prevent the relay from being assembled.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build HTTP client for {service}: {reason}")]
    HttpClient {
        service: &'static str,
        reason: String,
    },
}

/// Builds the voice directory described by `config.directory`.
pub fn build_directory(config: &Config) -> Result<Arc<dyn VoiceDirectory>, StartupError> {
    match &config.directory.url {
        Some(url) => {
            tracing::info!(url = %url, "using control-plane voice directory");
            let directory =
                HttpVoiceDirectory::new(url.clone()).map_err(|e| StartupError::HttpClient {
                    service: "voice directory",
                    reason: e.to_string(),
                })?;
            Ok(Arc::new(directory))
        }
        None => {
            let entries = config.directory.entries();
            tracing::info!(count = entries.len(), "using static voice directory");
            Ok(Arc::new(InMemoryVoiceDirectory::with_entries(entries)))
        }
    }
}

/// Assembles the session coordinator on top of `connector`.
pub fn build_coordinator(
    config: &Config,
    connector: Arc<dyn RoomConnector>,
) -> Result<Arc<SessionCoordinator>, StartupError> {
    let backend =
        HttpTransformBackend::new(config.transform.clone()).map_err(|e| {
            StartupError::HttpClient {
                service: "voice transformation",
                reason: e.to_string(),
            }
        })?;
    let transform = Arc::new(TransformClient::new(
        Arc::new(backend),
        Arc::new(QuotaState::new(config.transform.quota_cooldown())),
        SilenceGate::new(config.relay.silence_threshold_db),
        config.relay.input_sample_rate,
    ));

    Ok(Arc::new(SessionCoordinator::new(
        TokenIssuer::new(config.livekit.clone()),
        connector,
        build_directory(config)?,
        transform,
        CoordinatorSettings {
            relay: config.relay.clone(),
            output_sample_rate: config.transform.output_sample_rate,
            default_voice: config.directory.default_voice(),
        },
    )))
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Reports the relay session.
async fn status(Extension(state): Extension<Arc<AppState>>) -> Json<SessionStatus> {
    Json(state.coordinator.status())
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
