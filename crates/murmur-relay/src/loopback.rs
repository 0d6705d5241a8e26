//! In-process room transport.
//!
//! `LoopbackRoom` plays the part of the media server: it tracks remote
//! participants, hands out inbound tracks as frame queues, records every
//! output channel the relay publishes together with the audio captured into
//! it, and can inject the faults a real transport produces (failed connects
//! and publishes, dead output channels, dropped connections).
//!
//! The relay talks to it only through the [`transport`](crate::transport)
//! traits, so it exercises the same code paths a native transport would.

use crate::error::{CaptureError, TransportError};
use crate::transport::{
    AudioFrame, OutputChannel, PublishHandle, RoomConnector, RoomEvent, RoomOptions, RoomSession,
};
use async_trait::async_trait;
use murmur_types::{ConnectionState, DisconnectReason};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Frame queue capacity used before the relay has connected.
const DEFAULT_TRACK_QUEUE_CAPACITY: usize = 1024;

/// An output channel published into a [`LoopbackRoom`].
#[derive(Debug)]
pub struct LoopbackOutput {
    name: String,
    track_sid: String,
    sample_rate: u32,
    captured: Mutex<Vec<i16>>,
    frames: AtomicUsize,
    faults: Mutex<VecDeque<CaptureError>>,
    invalid: AtomicBool,
}

impl LoopbackOutput {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn track_sid(&self) -> &str {
        &self.track_sid
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Every sample captured so far, in order.
    pub fn captured(&self) -> Vec<i16> {
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    /// Makes the next capture fail with `fault`. Faults queue up.
    pub fn inject_fault(&self, fault: CaptureError) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(fault);
    }

    /// Marks the channel permanently unusable.
    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputChannel for LoopbackOutput {
    async fn capture_frame(&self, samples: &[i16]) -> Result<(), CaptureError> {
        if self.is_invalid() {
            return Err(CaptureError::ChannelInvalid);
        }
        if let Some(fault) = self
            .faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(fault);
        }
        self.captured
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(samples);
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RoomInner {
    participants: Vec<String>,
    events: Option<mpsc::UnboundedSender<RoomEvent>>,
    generation: u64,
    connects: u32,
    last_token: Option<String>,
    last_options: Option<RoomOptions>,
    failing_connects: u32,
    failing_publishes: u32,
    outputs: HashMap<String, Arc<LoopbackOutput>>,
    publish_log: Vec<String>,
    unpublish_log: Vec<String>,
    next_sid: u64,
}

impl RoomInner {
    fn emit(&mut self, event: RoomEvent) -> bool {
        match &self.events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// The simulated media server. Cheap to clone; clones share the room.
#[derive(Clone, Default)]
pub struct LoopbackRoom {
    inner: Arc<Mutex<RoomInner>>,
}

impl LoopbackRoom {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoomInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A participant enters the room.
    pub fn join(&self, identity: &str) {
        let mut inner = self.lock();
        if !inner.participants.iter().any(|p| p == identity) {
            inner.participants.push(identity.to_string());
        }
        inner.emit(RoomEvent::ParticipantConnected {
            identity: identity.to_string(),
        });
    }

    /// A participant leaves the room.
    pub fn leave(&self, identity: &str) {
        let mut inner = self.lock();
        inner.participants.retain(|p| p != identity);
        inner.emit(RoomEvent::ParticipantDisconnected {
            identity: identity.to_string(),
        });
    }

    /// Subscribes the relay to a new microphone track of `identity`.
    ///
    /// Dropping the returned sender ends the track.
    pub fn open_track(&self, identity: &str) -> mpsc::Sender<AudioFrame> {
        let mut inner = self.lock();
        let capacity = inner
            .last_options
            .as_ref()
            .map_or(DEFAULT_TRACK_QUEUE_CAPACITY, |o| o.frame_queue_capacity.max(1));
        let (tx, rx) = mpsc::channel(capacity);
        inner.next_sid += 1;
        let track_sid = format!("TR_in_{}", inner.next_sid);
        inner.emit(RoomEvent::TrackSubscribed {
            identity: identity.to_string(),
            track_sid,
            frames: rx,
        });
        tx
    }

    /// Drops the relay's connection, reporting `reason`.
    pub fn drop_connection(&self, reason: DisconnectReason) {
        let mut inner = self.lock();
        inner.emit(RoomEvent::Disconnected { reason });
        inner.events = None;
        inner.generation += 1;
        for output in inner.outputs.values() {
            output.invalidate();
        }
        inner.outputs.clear();
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Makes the next `count` publish attempts fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().events.is_some()
    }

    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn last_token(&self) -> Option<String> {
        self.lock().last_token.clone()
    }

    pub fn last_options(&self) -> Option<RoomOptions> {
        self.lock().last_options.clone()
    }

    /// The output currently published under `name`.
    pub fn output(&self, name: &str) -> Option<Arc<LoopbackOutput>> {
        self.lock().outputs.get(name).cloned()
    }

    /// Names of all currently published outputs, sorted.
    pub fn published(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().outputs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn publish_count(&self, name: &str) -> usize {
        self.lock().publish_log.iter().filter(|n| *n == name).count()
    }

    pub fn unpublish_count(&self, name: &str) -> usize {
        self.lock()
            .unpublish_log
            .iter()
            .filter(|n| *n == name)
            .count()
    }
}

/// A connection handed out by [`LoopbackConnector`].
pub struct LoopbackSession {
    room: LoopbackRoom,
    generation: u64,
}

impl LoopbackSession {
    fn is_current(&self, inner: &RoomInner) -> bool {
        inner.events.is_some() && inner.generation == self.generation
    }
}

#[async_trait]
impl RoomSession for LoopbackSession {
    fn participants(&self) -> Vec<String> {
        self.room.lock().participants.clone()
    }

    async fn publish_output(
        &self,
        name: &str,
        sample_rate: u32,
        _channels: u16,
    ) -> Result<(Arc<dyn OutputChannel>, PublishHandle), TransportError> {
        let mut inner = self.room.lock();
        if !self.is_current(&inner) {
            return Err(TransportError::NotConnected);
        }
        if inner.failing_publishes > 0 {
            inner.failing_publishes -= 1;
            return Err(TransportError::PublishFailed {
                name: name.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }

        inner.next_sid += 1;
        let track_sid = format!("TR_out_{}", inner.next_sid);
        let output = Arc::new(LoopbackOutput {
            name: name.to_string(),
            track_sid: track_sid.clone(),
            sample_rate,
            captured: Mutex::new(Vec::new()),
            frames: AtomicUsize::new(0),
            faults: Mutex::new(VecDeque::new()),
            invalid: AtomicBool::new(false),
        });
        if let Some(previous) = inner.outputs.insert(name.to_string(), output.clone()) {
            previous.invalidate();
        }
        inner.publish_log.push(name.to_string());

        let handle = PublishHandle {
            track_sid,
            name: name.to_string(),
        };
        Ok((output, handle))
    }

    async fn unpublish(&self, handle: &PublishHandle) -> Result<(), TransportError> {
        let mut inner = self.room.lock();
        if !self.is_current(&inner) {
            return Err(TransportError::NotConnected);
        }
        let matches = inner
            .outputs
            .get(&handle.name)
            .is_some_and(|o| o.track_sid == handle.track_sid);
        if matches {
            if let Some(output) = inner.outputs.remove(&handle.name) {
                output.invalidate();
            }
        }
        inner.unpublish_log.push(handle.name.clone());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_current(&self.room.lock()) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn disconnect(&self) {
        let mut inner = self.room.lock();
        if self.is_current(&inner) {
            inner.events = None;
            inner.generation += 1;
            for output in inner.outputs.values() {
                output.invalidate();
            }
            inner.outputs.clear();
        }
    }
}

/// Connects the relay to a [`LoopbackRoom`].
#[derive(Clone)]
pub struct LoopbackConnector {
    room: LoopbackRoom,
}

impl LoopbackConnector {
    pub fn new(room: LoopbackRoom) -> Self {
        Self { room }
    }
}

#[async_trait]
impl RoomConnector for LoopbackConnector {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        options: &RoomOptions,
    ) -> Result<(Arc<dyn RoomSession>, mpsc::UnboundedReceiver<RoomEvent>), TransportError> {
        let mut inner = self.room.lock();
        inner.connects += 1;
        inner.last_token = Some(token.to_string());
        inner.last_options = Some(options.clone());

        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(TransportError::ConnectFailed(format!(
                "injected connect failure for {}",
                url
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.events = Some(tx);
        inner.generation += 1;
        let session = LoopbackSession {
            room: self.room.clone(),
            generation: inner.generation,
        };
        tracing::debug!(room = %options.room, identity = %options.identity, "loopback session opened");
        Ok((Arc::new(session), rx))
    }
}
