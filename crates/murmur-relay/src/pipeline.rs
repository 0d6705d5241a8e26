//! Per-speaker relay loops.
//!
//! Each speaker with an inbound track gets exactly one task that reads its
//! frames in order, accumulates them into chunks, converts each chunk
//! through the [`TransformClient`] and captures the result into the
//! speaker's route. Chunking happens inline, so a speaker never has two
//! chunks in flight.
//!
//! A speaker without a loop is idle. A loop moves through
//! `Streaming -> Draining -> Stopped`. It ends
//! when its track ends (after one flush attempt) or when it is cancelled
//! because the participant left or the session cycle was torn down.
//! Cancellation is cooperative: it is observed while waiting for frames and
//! before every frame capture, never in the middle of an HTTP request.
//! A chunk whose speaker has no route is skipped; the loop never creates
//! routes of its own.

use crate::chunker::{ChunkAccumulator, ChunkerConfig};
use crate::error::CaptureError;
use crate::routes::RouteRegistry;
use crate::stats::RelayStats;
use crate::transform::{Conversion, SkipReason, TransformClient, TransformFailure};
use crate::transport::{AudioFrame, FrameStream};
use crate::wav::downmix_to_mono;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Loop state of one speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpeakerState {
    Streaming,
    Draining,
    Stopped,
}

/// What happened to a track-subscribed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new loop was spawned.
    Started,
    /// The identity already has a loop; the new track is ignored.
    AlreadyStreaming,
    /// The track belongs to the relay itself.
    SelfLoop,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub input_sample_rate: u32,
    pub chunk: ChunkerConfig,
    /// Samples per captured output frame.
    pub output_frame_samples: usize,
    pub route_retry_delay: Duration,
    /// Tracks from identities starting with this prefix are never relayed.
    pub self_identity_prefix: String,
}

/// Short-lived markers of identities whose route was just recreated.
#[derive(Debug)]
pub struct RecentlyRecreated {
    window: Duration,
    marks: Mutex<HashMap<String, Instant>>,
}

impl RecentlyRecreated {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Marks `identity` unless it is already marked. Returns true if marked now.
    pub fn try_mark(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        match marks.get(identity) {
            Some(at) if now.saturating_duration_since(*at) < self.window => false,
            _ => {
                marks.insert(identity.to_string(), now);
                true
            }
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        let now = Instant::now();
        self.marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.window)
    }

    /// Drops expired markers and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        let before = marks.len();
        marks.retain(|_, at| now.saturating_duration_since(*at) < self.window);
        before - marks.len()
    }
}

struct StreamHandle {
    id: u64,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

pub struct AudioRelayPipeline {
    routes: Arc<RouteRegistry>,
    transform: Arc<TransformClient>,
    settings: PipelineSettings,
    stats: Arc<RelayStats>,
    recently_recreated: Arc<RecentlyRecreated>,
    streams: Mutex<HashMap<String, StreamHandle>>,
    next_stream_id: AtomicU64,
    cancel: CancellationToken,
}

impl AudioRelayPipeline {
    pub fn new(
        routes: Arc<RouteRegistry>,
        transform: Arc<TransformClient>,
        settings: PipelineSettings,
        stats: Arc<RelayStats>,
        recently_recreated: Arc<RecentlyRecreated>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            routes,
            transform,
            settings,
            stats,
            recently_recreated,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn is_streaming(&self, identity: &str) -> bool {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(identity)
    }

    pub fn active_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Starts relaying `frames` for `identity`.
    ///
    /// If the route does not exist yet, the loop waits once for the retry
    /// delay and gives up if it is still missing.
    pub fn start_stream(self: &Arc<Self>, identity: &str, frames: FrameStream) -> StartOutcome {
        if !self.settings.self_identity_prefix.is_empty()
            && identity.starts_with(&self.settings.self_identity_prefix)
        {
            tracing::debug!(identity, "ignoring relay's own track");
            return StartOutcome::SelfLoop;
        }

        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if streams.contains_key(identity) {
            tracing::debug!(identity, "already streaming, ignoring duplicate track");
            return StartOutcome::AlreadyStreaming;
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(self.clone().run_stream(
            identity.to_string(),
            id,
            frames,
            cancel.clone(),
        ));
        streams.insert(
            identity.to_string(),
            StreamHandle {
                id,
                cancel,
                _task: task,
            },
        );
        StartOutcome::Started
    }

    /// Cancels `identity`'s loop. Returns whether one was running.
    pub fn stop_stream(&self, identity: &str) -> bool {
        let handle = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity);
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::debug!(identity, "stream cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every loop.
    pub fn stop_all(&self) {
        let handles: Vec<StreamHandle> = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.cancel.cancel();
        }
    }

    fn finish(&self, identity: &str, id: u64) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if streams.get(identity).is_some_and(|h| h.id == id) {
            streams.remove(identity);
        }
    }

    async fn wait_for_route(&self, identity: &str, cancel: &CancellationToken) -> bool {
        if self.routes.contains(identity) {
            return true;
        }
        tracing::debug!(
            identity,
            delay_ms = self.settings.route_retry_delay.as_millis() as u64,
            "track arrived before route, retrying once"
        );
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(self.settings.route_retry_delay) => {}
        }
        if self.routes.contains(identity) {
            return true;
        }
        tracing::warn!(identity, "route still missing after retry, abandoning stream");
        false
    }

    async fn run_stream(
        self: Arc<Self>,
        identity: String,
        id: u64,
        mut frames: FrameStream,
        cancel: CancellationToken,
    ) {
        if !self.wait_for_route(&identity, &cancel).await {
            self.finish(&identity, id);
            return;
        }

        let mut state = SpeakerState::Streaming;
        self.stats.stream_started();
        tracing::info!(identity = %identity, "speaker stream started");

        let mut accumulator = ChunkAccumulator::new(self.settings.chunk);
        let mut rate_warned = false;

        while state == SpeakerState::Streaming {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                frame = frames.recv() => Some(frame),
            };
            match next {
                None => state = SpeakerState::Stopped,
                Some(None) => state = SpeakerState::Draining,
                Some(Some(frame)) => {
                    if let Some(samples) = self.normalize(&identity, frame, &mut rate_warned) {
                        accumulator.push(samples);
                    }
                    if accumulator.is_ready() {
                        let chunk = accumulator.drain();
                        self.relay_chunk(&identity, &chunk, &cancel).await;
                    }
                }
            }
        }

        if state == SpeakerState::Draining {
            if let Some(tail) = accumulator.flush() {
                self.relay_chunk(&identity, &tail, &cancel).await;
            }
        }

        self.finish(&identity, id);
        tracing::info!(identity = %identity, cancelled = cancel.is_cancelled(), "speaker stream stopped");
    }

    /// Turns an inbound frame into mono samples at the input rate, or drops it.
    fn normalize(&self, identity: &str, frame: AudioFrame, rate_warned: &mut bool) -> Option<Vec<i16>> {
        if frame.samples.is_empty() || frame.channels == 0 {
            return None;
        }
        if frame.sample_rate != self.settings.input_sample_rate {
            if !*rate_warned {
                tracing::warn!(
                    identity,
                    got = frame.sample_rate,
                    expected = self.settings.input_sample_rate,
                    "dropping frames with unexpected sample rate"
                );
                *rate_warned = true;
            }
            return None;
        }
        if frame.channels == 1 {
            Some(frame.samples)
        } else {
            Some(downmix_to_mono(&frame.samples, frame.channels))
        }
    }

    /// Converts one chunk and publishes the result into the speaker's route.
    async fn relay_chunk(
        &self,
        identity: &str,
        chunk: &[i16],
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        let Some(route) = self.routes.get(identity) else {
            tracing::debug!(identity, "no route, chunk skipped");
            return;
        };

        match self.transform.convert(&route.voice.voice_id, chunk).await {
            Ok(Conversion::Converted(pcm)) => {
                self.stats.chunk_converted();
                self.publish(identity, &pcm, cancel).await;
            }
            Ok(Conversion::Skipped(SkipReason::Silence)) => {
                self.stats.chunk_skipped_silence();
                tracing::trace!(identity, "chunk below speech threshold");
            }
            Ok(Conversion::Skipped(SkipReason::Quota)) | Err(TransformFailure::Quota) => {
                self.stats.chunk_skipped_quota();
                tracing::debug!(identity, "quota exhausted, chunk skipped");
            }
            Ok(Conversion::Skipped(SkipReason::Undersized)) => {
                tracing::trace!(identity, samples = chunk.len(), "undersized chunk skipped");
            }
            Err(failure) => {
                self.stats.chunk_failed();
                tracing::warn!(
                    identity,
                    voice_id = %route.voice.voice_id,
                    kind = failure.kind().as_str(),
                    error = %failure,
                    "transformation failed, dropping chunk"
                );
            }
        }
    }

    /// Captures `pcm` into the route frame by frame, in order.
    async fn publish(&self, identity: &str, pcm: &[i16], cancel: &CancellationToken) {
        let frame_len = self.settings.output_frame_samples.max(1);
        for piece in pcm.chunks(frame_len) {
            if cancel.is_cancelled() {
                return;
            }
            let Some(route) = self.routes.get(identity) else {
                tracing::debug!(identity, "route gone, abandoning chunk");
                return;
            };

            let padded;
            let frame: &[i16] = if piece.len() == frame_len {
                piece
            } else {
                padded = {
                    let mut block = piece.to_vec();
                    block.resize(frame_len, 0);
                    block
                };
                &padded
            };

            match route.output.capture_frame(frame).await {
                Ok(()) => self.stats.frame_published(),
                Err(CaptureError::ChannelInvalid) => {
                    if !cancel.is_cancelled() {
                        self.recover_channel(identity).await;
                    }
                    return;
                }
                Err(CaptureError::Other(reason)) => {
                    tracing::warn!(identity, reason = %reason, "frame capture failed, abandoning chunk");
                    return;
                }
            }
        }
    }

    /// Recreates a route whose output channel died, at most once per window.
    async fn recover_channel(&self, identity: &str) {
        if !self.recently_recreated.try_mark(identity) {
            tracing::debug!(identity, "output channel invalid, recreation debounced");
            return;
        }
        tracing::info!(identity, "output channel invalid, recreating route");
        match self.routes.recreate_route(identity).await {
            Ok(Some(_)) => self.stats.route_recreated(),
            Ok(None) => tracing::debug!(identity, "route removed before it could be recreated"),
            Err(e) => tracing::error!(identity, error = %e, "failed to recreate route"),
        }
    }
}
