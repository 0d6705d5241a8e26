//! Voice assignment definitions.
//!
//! A `VoiceAssignment` maps a participant to the voice their speech is
//! transformed into. It is looked up once when the participant joins and
//! stays fixed for the rest of that participant's session.

use serde::{Deserialize, Serialize};

/// Voice id used when the directory has no entry for a participant.
pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

/// Display name paired with [`DEFAULT_VOICE_ID`].
pub const DEFAULT_VOICE_NAME: &str = "Rachel";

/// The voice a participant speaks with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceAssignment {
    /// Identifier of the target voice at the transformation service.
    pub voice_id: String,
    /// Human-readable voice name.
    pub display_name: String,
}

impl VoiceAssignment {
    pub fn new(voice_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            voice_id: voice_id.into(),
            display_name: display_name.into(),
        }
    }
}

impl Default for VoiceAssignment {
    fn default() -> Self {
        Self::new(DEFAULT_VOICE_ID, DEFAULT_VOICE_NAME)
    }
}
