//! Real-time voice relay.
//!
//! Joins a LiveKit room as a hidden agent, subscribes to every participant's
//! microphone, converts each speaker's speech into their assigned voice
//! through a speech-to-speech service, and publishes the result as one
//! output track per participant (`voice-{identity}`).
//!
//! The crate is organised around three long-lived components:
//!
//! - [`SessionCoordinator`] owns the room connection, presence handling and
//!   recovery after connection loss.
//! - [`RouteRegistry`] maps participants to their published output channel.
//! - [`AudioRelayPipeline`] runs one ordered chunk/convert/publish loop per
//!   speaker, sharing a single [`TransformClient`] and its quota state.
//!
//! The media transport sits behind the traits in [`transport`];
//! [`loopback`] provides an in-process implementation.

pub mod chunker;
pub mod config;
pub mod coordinator;
pub mod directory;
mod endpoint;
pub mod error;
pub mod loopback;
pub mod pipeline;
pub mod quota;
pub mod routes;
pub mod silence;
pub mod stats;
pub mod token;
pub mod transform;
pub mod transport;
pub mod wav;

pub use chunker::{ChunkAccumulator, ChunkerConfig};
pub use config::{LiveKitConfig, RelayConfig, TransformConfig};
pub use coordinator::{CoordinatorSettings, SessionCoordinator, SessionCycle, VoiceAssignments};
pub use directory::{resolve_assignment, HttpVoiceDirectory, InMemoryVoiceDirectory, VoiceDirectory};
pub use error::{CaptureError, DirectoryError, RelayError, TransportError};
pub use loopback::{LoopbackConnector, LoopbackOutput, LoopbackRoom};
pub use pipeline::{AudioRelayPipeline, PipelineSettings, RecentlyRecreated, StartOutcome};
pub use quota::QuotaState;
pub use routes::{Route, RouteRegistry, RouteSettings};
pub use silence::{speech_level_db, SilenceGate};
pub use stats::RelayStats;
pub use token::TokenIssuer;
pub use transform::{
    Conversion, FailureKind, HttpTransformBackend, SkipReason, TransformBackend, TransformClient,
    TransformFailure,
};
pub use transport::{
    AudioFrame, FrameStream, OutputChannel, PublishHandle, RoomConnector, RoomEvent, RoomOptions,
    RoomSession,
};
