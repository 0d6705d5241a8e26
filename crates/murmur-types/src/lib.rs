//! Shared types for the Murmur voice relay.
//!
//! This crate holds the plain data types that cross crate boundaries: voice
//! assignments handed out by the control plane, the session connection
//! state machine, transport disconnect reasons, and the status snapshot
//! reported by the server.
//!
//! Nothing in here performs I/O. The relay core (`murmur-relay`) and the
//! process entry point (`murmur-server`) both depend on it, which keeps the
//! dependency graph free of cycles.

pub mod session;
pub mod voice;

pub use session::{ConnectionState, DisconnectReason, RelayStatsSnapshot, SessionStatus};
pub use voice::{VoiceAssignment, DEFAULT_VOICE_ID, DEFAULT_VOICE_NAME};

/// Sample rate (Hz) the relay asks the transport to deliver inbound audio at.
pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate (Hz) of the PCM returned by the transformation service.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 16_000;

/// Published output tracks are always mono.
pub const OUTPUT_CHANNELS: u16 = 1;
