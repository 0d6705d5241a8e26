use crate::config::LiveKitConfig;
use crate::error::RelayError;
use livekit_api::access_token::{AccessToken, VideoGrants};
use std::time::Duration;

/// Mints LiveKit join tokens for the relay agent.
///
/// A fresh token is minted for every connect attempt so a reconnect never
/// presents an expired one.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    config: LiveKitConfig,
}

impl TokenIssuer {
    pub fn new(config: LiveKitConfig) -> Self {
        Self { config }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn room(&self) -> &str {
        &self.config.room
    }

    pub fn agent_identity(&self) -> &str {
        &self.config.agent_identity
    }

    /// Token letting the relay join its room, publish transformed voices
    /// and subscribe to every participant's microphone.
    pub fn agent_token(&self) -> Result<String, RelayError> {
        self.generate_join_token(
            &self.config.room,
            &self.config.agent_identity,
            "Voice Relay",
        )
    }

    pub fn generate_join_token(
        &self,
        room_name: &str,
        participant_identity: &str,
        participant_name: &str,
    ) -> Result<String, RelayError> {
        let token = AccessToken::with_api_key(&self.config.api_key, &self.config.api_secret)
            .with_identity(participant_identity)
            .with_name(participant_name)
            .with_grants(VideoGrants {
                room_join: true,
                room: room_name.to_string(),
                can_publish: true,
                can_subscribe: true,
                can_publish_data: false,
                ..Default::default()
            })
            .with_ttl(Duration::from_secs(self.config.token_ttl_seconds));

        token.to_jwt().map_err(RelayError::Token)
    }
}
