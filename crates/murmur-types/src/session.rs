//! Session connection state and status reporting types.

use serde::{Deserialize, Serialize};

/// Connection state of the relay's single room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Why the transport dropped the session.
///
/// Mirrors the reason codes a real-time transport reports with its
/// disconnected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The media or signalling connection was lost.
    ConnectionLost,
    /// The signalling socket closed without a leave message.
    SignalClose,
    /// The relay itself asked to leave.
    ClientInitiated,
    /// Another participant joined with the same identity.
    DuplicateIdentity,
    /// The server is shutting down.
    ServerShutdown,
    /// The relay was removed from the room by an operator.
    ParticipantRemoved,
    /// The room was deleted.
    RoomDeleted,
    /// The transport reported a reason we do not know about.
    Unknown,
}

impl DisconnectReason {
    /// Whether this disconnect is a transport fault that warrants a reconnect.
    ///
    /// Intentional and server-initiated disconnects are final.
    pub fn is_reconnect_eligible(self) -> bool {
        matches!(self, Self::ConnectionLost | Self::SignalClose)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection_lost",
            Self::SignalClose => "signal_close",
            Self::ClientInitiated => "client_initiated",
            Self::DuplicateIdentity => "duplicate_identity",
            Self::ServerShutdown => "server_shutdown",
            Self::ParticipantRemoved => "participant_removed",
            Self::RoomDeleted => "room_deleted",
            Self::Unknown => "unknown",
        }
    }
}

/// Counters describing what the relay pipeline has done since start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub streams_started: u64,
    pub chunks_converted: u64,
    pub chunks_skipped_silence: u64,
    pub chunks_skipped_quota: u64,
    pub chunks_failed: u64,
    pub frames_published: u64,
    pub routes_recreated: u64,
}

/// Point-in-time view of the relay session, served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub room: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub routes: usize,
    pub active_streams: Vec<String>,
    pub quota_exhausted: bool,
    pub stats: RelayStatsSnapshot,
}
