//! Boundary of the real-time transport the relay runs on.
//!
//! The relay consumes presence and track events from a room, reads inbound
//! audio as a queue of frames, and publishes one output channel per routed
//! participant. Everything transport-specific lives behind these traits.

use crate::error::{CaptureError, TransportError};
use async_trait::async_trait;
use murmur_types::{ConnectionState, DisconnectReason};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A block of PCM delivered by an inbound track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Interleaved 16-bit samples.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    pub fn mono(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }
}

/// Inbound audio of one subscribed track, in arrival order.
///
/// The sender side closing marks the end of the track.
pub type FrameStream = mpsc::Receiver<AudioFrame>;

/// Events delivered by a connected session.
#[derive(Debug)]
pub enum RoomEvent {
    ParticipantConnected {
        identity: String,
    },
    ParticipantDisconnected {
        identity: String,
    },
    TrackSubscribed {
        identity: String,
        track_sid: String,
        frames: FrameStream,
    },
    TrackUnsubscribed {
        identity: String,
        track_sid: String,
    },
    Disconnected {
        reason: DisconnectReason,
    },
}

/// Identifies a published output track so it can be unpublished.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublishHandle {
    pub track_sid: String,
    pub name: String,
}

/// Options passed when joining a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomOptions {
    pub room: String,
    pub identity: String,
    /// Sample rate the transport should deliver inbound audio at.
    pub input_sample_rate: u32,
    /// Capacity of each inbound track's frame queue.
    pub frame_queue_capacity: usize,
}

/// An audio channel the relay writes transformed frames into.
#[async_trait]
pub trait OutputChannel: Send + Sync {
    /// Pushes one fixed-size block of mono PCM.
    async fn capture_frame(&self, samples: &[i16]) -> Result<(), CaptureError>;
}

/// A live connection to a room.
#[async_trait]
pub trait RoomSession: Send + Sync {
    /// Identities of the remote participants present right now.
    fn participants(&self) -> Vec<String>;

    /// Creates a fresh output channel and publishes it under `name`.
    async fn publish_output(
        &self,
        name: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<(Arc<dyn OutputChannel>, PublishHandle), TransportError>;

    async fn unpublish(&self, handle: &PublishHandle) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;

    async fn disconnect(&self);
}

/// Opens sessions.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        options: &RoomOptions,
    ) -> Result<(Arc<dyn RoomSession>, mpsc::UnboundedReceiver<RoomEvent>), TransportError>;
}
