use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("LiveKit token error: {0}")]
    Token(#[from] livekit_api::access_token::AccessTokenError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Faults reported by the real-time transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("failed to publish track '{name}': {reason}")]
    PublishFailed { name: String, reason: String },

    #[error("session is not connected")]
    NotConnected,

    #[error("session closed")]
    Closed,
}

/// Result of pushing one frame into an output channel.
///
/// The transport decides once whether the channel is dead; callers match on
/// the variant and never inspect message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The channel will not accept further audio and must be replaced.
    #[error("output channel is no longer valid")]
    ChannelInvalid,

    #[error("frame capture failed: {0}")]
    Other(String),
}

/// Faults from the voice-assignment lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("voice directory unavailable: {0}")]
    Unavailable(String),

    #[error("malformed directory response: {0}")]
    Malformed(String),
}
