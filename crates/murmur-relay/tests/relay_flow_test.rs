use async_trait::async_trait;
use murmur_relay::{
    AudioFrame, CaptureError, CoordinatorSettings, DirectoryError, InMemoryVoiceDirectory,
    LiveKitConfig, LoopbackConnector, LoopbackRoom, QuotaState, RelayConfig, SessionCoordinator,
    SilenceGate, TokenIssuer, TransformBackend, TransformClient, TransformFailure, VoiceDirectory,
};
use murmur_types::{ConnectionState, DisconnectReason, VoiceAssignment};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Duration;

const RATE: u32 = 16_000;
/// 20 ms at 16 kHz.
const FRAME: usize = 320;
/// Samples returned by the backend per converted chunk.
const REPLY_SAMPLES: usize = 1_700;

#[derive(Default)]
struct RecordingBackend {
    calls: Mutex<Vec<(String, usize)>>,
    script: Mutex<VecDeque<Result<Vec<u8>, TransformFailure>>>,
}

impl RecordingBackend {
    fn push_response(&self, response: Result<Vec<u8>, TransformFailure>) {
        self.script.lock().unwrap().push_back(response);
    }

    fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TransformBackend for RecordingBackend {
    async fn transform(&self, voice_id: &str, wav: Vec<u8>) -> Result<Vec<u8>, TransformFailure> {
        let samples = (wav.len() - 44) / 2;
        self.calls
            .lock()
            .unwrap()
            .push((voice_id.to_string(), samples));
        if let Some(response) = self.script.lock().unwrap().pop_front() {
            return response;
        }
        Ok((0..REPLY_SAMPLES)
            .flat_map(|_| 1000i16.to_le_bytes())
            .collect())
    }
}

/// In-memory voices with optional per-identity lookup latency.
#[derive(Default)]
struct ScriptedDirectory {
    voices: InMemoryVoiceDirectory,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedDirectory {
    fn set(&self, identity: &str, voice: VoiceAssignment) {
        self.voices.set(identity, voice);
    }

    fn delay(&self, identity: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(identity.to_string(), delay);
    }
}

#[async_trait]
impl VoiceDirectory for ScriptedDirectory {
    async fn lookup(&self, identity: &str) -> Result<Option<VoiceAssignment>, DirectoryError> {
        let delay = self.delays.lock().unwrap().get(identity).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.voices.lookup(identity).await
    }
}

struct Harness {
    room: LoopbackRoom,
    backend: Arc<RecordingBackend>,
    directory: Arc<ScriptedDirectory>,
    coordinator: Arc<SessionCoordinator>,
}

fn harness() -> Harness {
    let room = LoopbackRoom::new();
    let backend = Arc::new(RecordingBackend::default());
    let directory = Arc::new(ScriptedDirectory::default());
    let transform = Arc::new(TransformClient::new(
        backend.clone(),
        Arc::new(QuotaState::new(Duration::from_secs(60))),
        SilenceGate::default(),
        RATE,
    ));
    let coordinator = Arc::new(SessionCoordinator::new(
        TokenIssuer::new(LiveKitConfig::new("ws://loopback", "devkey", "secret")),
        Arc::new(LoopbackConnector::new(room.clone())),
        directory.clone(),
        transform,
        CoordinatorSettings {
            relay: RelayConfig::default(),
            output_sample_rate: RATE,
            default_voice: VoiceAssignment::new("default-voice", "Default"),
        },
    ));
    Harness {
        room,
        backend,
        directory,
        coordinator,
    }
}

fn speech_frame() -> AudioFrame {
    let samples = (0..FRAME)
        .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
        .collect();
    AudioFrame::mono(samples, RATE)
}

async fn send_ms(tx: &mpsc::Sender<AudioFrame>, ms: usize, frame: fn() -> AudioFrame) {
    for _ in 0..ms / 20 {
        tx.send(frame()).await.unwrap();
    }
}

/// Polls `check` while letting spawned tasks and (paused) timers run.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::test(start_paused = true)]
async fn participants_present_at_connect_are_routed_before_events() {
    let h = harness();
    h.directory.set("alice", VoiceAssignment::new("v-alice", "Nova"));
    h.room.join("alice");

    h.coordinator.connect().await.unwrap();

    assert_eq!(h.coordinator.connection_state(), ConnectionState::Connected);
    assert_eq!(h.room.published(), vec!["voice-alice".to_string()]);
    assert_eq!(h.coordinator.assignment("alice").unwrap().voice_id, "v-alice");
    assert_eq!(h.room.last_options().unwrap().identity, "murmur-relay");
    assert!(h.room.last_token().is_some());
}

#[tokio::test(start_paused = true)]
async fn joining_participant_gets_route_before_audio() {
    let h = harness();
    h.directory.set("bob", VoiceAssignment::new("v-bob", "Adam"));
    h.coordinator.connect().await.unwrap();

    h.room.join("bob");
    assert!(eventually(|| h.room.output("voice-bob").is_some()).await);

    let tx = h.room.open_track("bob");
    send_ms(&tx, 1000, speech_frame).await;
    drop(tx);

    assert!(eventually(|| h.backend.call_count() == 1).await);
    assert_eq!(h.backend.calls()[0].0, "v-bob");
    assert!(eventually(|| h.room.output("voice-bob").unwrap().frame_count() > 0).await);
}

#[tokio::test(start_paused = true)]
async fn unknown_participant_uses_default_voice() {
    let h = harness();
    h.coordinator.connect().await.unwrap();

    h.room.join("carol");
    assert!(eventually(|| h.coordinator.assignment("carol").is_some()).await);
    assert_eq!(
        h.coordinator.assignment("carol").unwrap().voice_id,
        "default-voice"
    );
}

#[tokio::test(start_paused = true)]
async fn one_and_a_half_seconds_of_speech_makes_two_requests() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();

    let tx = h.room.open_track("alice");
    send_ms(&tx, 1500, speech_frame).await;
    drop(tx);

    assert!(eventually(|| h.backend.call_count() == 2).await);
    settle().await;
    let sizes: Vec<usize> = h.backend.calls().iter().map(|(_, n)| *n).collect();
    assert_eq!(sizes, vec![16_000, 8_000]);

    // Each reply is split into 20 ms frames, the last one zero-padded.
    let output = h.room.output("voice-alice").unwrap();
    let per_reply = REPLY_SAMPLES.div_ceil(FRAME);
    assert_eq!(output.frame_count(), 2 * per_reply);
    let captured = output.captured();
    assert_eq!(captured.len(), 2 * per_reply * FRAME);
    assert_eq!(captured[REPLY_SAMPLES - 1], 1000);
    assert_eq!(captured[REPLY_SAMPLES], 0);

    let stats = h.coordinator.status().stats;
    assert_eq!(stats.chunks_converted, 2);
    assert_eq!(stats.frames_published, (2 * per_reply) as u64);
}

#[tokio::test(start_paused = true)]
async fn short_tail_is_discarded() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();

    let tx = h.room.open_track("alice");
    send_ms(&tx, 1200, speech_frame).await;
    drop(tx);

    assert!(eventually(|| h.coordinator.status().active_streams.is_empty()).await);
    assert_eq!(h.backend.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn silence_never_reaches_the_service() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();

    let tx = h.room.open_track("alice");
    send_ms(&tx, 2000, || AudioFrame::mono(vec![0; FRAME], RATE)).await;
    drop(tx);

    assert!(eventually(|| h.coordinator.status().active_streams.is_empty()).await);
    assert_eq!(h.backend.call_count(), 0);
    assert!(h.coordinator.status().stats.chunks_skipped_silence >= 1);
}

#[tokio::test(start_paused = true)]
async fn stereo_frames_are_downmixed() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();

    let tx = h.room.open_track("alice");
    for _ in 0..50 {
        let samples = (0..FRAME * 2)
            .map(|i| if (i / 2) % 2 == 0 { 8000 } else { -8000 })
            .collect();
        tx.send(AudioFrame {
            samples,
            sample_rate: RATE,
            channels: 2,
        })
        .await
        .unwrap();
    }
    drop(tx);

    assert!(eventually(|| h.backend.call_count() == 1).await);
    assert_eq!(h.backend.calls()[0].1, 16_000);
}

#[tokio::test(start_paused = true)]
async fn quota_exhaustion_pauses_every_speaker() {
    let h = harness();
    h.room.join("alice");
    h.room.join("bob");
    h.coordinator.connect().await.unwrap();
    h.backend.push_response(Err(TransformFailure::Quota));

    let alice = h.room.open_track("alice");
    send_ms(&alice, 1000, speech_frame).await;
    drop(alice);
    assert!(eventually(|| h.coordinator.status().quota_exhausted).await);
    assert_eq!(h.backend.call_count(), 1);

    let bob = h.room.open_track("bob");
    send_ms(&bob, 1000, speech_frame).await;
    drop(bob);
    assert!(eventually(|| h.coordinator.status().stats.chunks_skipped_quota >= 2).await);
    assert_eq!(h.backend.call_count(), 1);
    assert!(h.room.output("voice-bob").unwrap().captured().is_empty());

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(!h.coordinator.status().quota_exhausted);

    let bob = h.room.open_track("bob");
    send_ms(&bob, 1000, speech_frame).await;
    drop(bob);
    assert!(eventually(|| h.backend.call_count() == 2).await);
}

#[tokio::test(start_paused = true)]
async fn service_failure_drops_only_that_chunk() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();
    h.backend.push_response(Err(TransformFailure::Service {
        status: 500,
        body: "internal".to_string(),
    }));

    let tx = h.room.open_track("alice");
    send_ms(&tx, 1000, speech_frame).await;
    assert!(eventually(|| h.backend.call_count() == 1).await);
    settle().await;
    send_ms(&tx, 1000, speech_frame).await;
    drop(tx);

    assert!(eventually(|| h.backend.call_count() == 2).await);
    settle().await;
    let status = h.coordinator.status();
    assert_eq!(status.stats.chunks_failed, 1);
    assert_eq!(status.stats.chunks_converted, 1);
    assert!(!status.quota_exhausted);
}

#[tokio::test(start_paused = true)]
async fn invalid_channel_is_recreated_once_per_window() {
    let h = harness();
    h.room.join("bob");
    h.coordinator.connect().await.unwrap();
    let first = h.room.output("voice-bob").unwrap();
    first.inject_fault(CaptureError::ChannelInvalid);

    let tx = h.room.open_track("bob");
    send_ms(&tx, 1000, speech_frame).await;
    assert!(eventually(|| h.room.publish_count("voice-bob") == 2).await);
    assert_eq!(h.coordinator.status().stats.routes_recreated, 1);

    // A second fault inside the window does not recreate again.
    let second = h.room.output("voice-bob").unwrap();
    assert_ne!(first.track_sid(), second.track_sid());
    second.inject_fault(CaptureError::ChannelInvalid);
    settle().await;
    send_ms(&tx, 1000, speech_frame).await;
    assert!(eventually(|| h.backend.call_count() == 2).await);
    settle().await;
    assert_eq!(h.room.publish_count("voice-bob"), 2);
    assert_eq!(h.room.published(), vec!["voice-bob".to_string()]);

    // Once the window has passed, a new fault recreates again.
    tokio::time::advance(Duration::from_secs(5)).await;
    second.inject_fault(CaptureError::ChannelInvalid);
    send_ms(&tx, 1000, speech_frame).await;
    drop(tx);
    assert!(eventually(|| h.room.publish_count("voice-bob") == 3).await);
    assert_eq!(h.room.published(), vec!["voice-bob".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn other_capture_errors_abandon_the_chunk_without_recreating() {
    let h = harness();
    h.room.join("bob");
    h.coordinator.connect().await.unwrap();
    h.room
        .output("voice-bob")
        .unwrap()
        .inject_fault(CaptureError::Other("buffer full".to_string()));

    let tx = h.room.open_track("bob");
    send_ms(&tx, 1000, speech_frame).await;
    drop(tx);

    assert!(eventually(|| h.coordinator.status().active_streams.is_empty()).await);
    assert_eq!(h.room.publish_count("voice-bob"), 1);
    assert_eq!(h.room.output("voice-bob").unwrap().frame_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_track_for_same_speaker_is_ignored() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();

    let first = h.room.open_track("alice");
    let second = h.room.open_track("alice");

    assert!(eventually(|| second.is_closed()).await);
    assert!(!first.is_closed());
    assert_eq!(h.coordinator.status().active_streams, vec!["alice".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn leaving_participant_is_fully_torn_down() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();
    let tx = h.room.open_track("alice");
    assert!(eventually(|| !h.coordinator.status().active_streams.is_empty()).await);

    h.room.leave("alice");

    assert!(eventually(|| h.room.published().is_empty()).await);
    assert!(eventually(|| tx.is_closed()).await);
    let status = h.coordinator.status();
    assert!(status.active_streams.is_empty());
    assert_eq!(status.routes, 0);
    assert!(h.coordinator.assignment("alice").is_none());
}

#[tokio::test(start_paused = true)]
async fn route_removed_while_streaming_stays_removed() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();
    let tx = h.room.open_track("alice");
    send_ms(&tx, 1000, speech_frame).await;
    assert!(eventually(|| h.coordinator.status().stats.chunks_converted == 1).await);

    let cycle = h.coordinator.current_cycle().unwrap();
    assert!(cycle.routes().remove_route("alice").await);
    assert!(h.room.published().is_empty());

    // The loop keeps running but treats the missing route as "do not send".
    send_ms(&tx, 1000, speech_frame).await;
    settle().await;
    assert!(cycle.pipeline().is_streaming("alice"));
    assert!(h.room.published().is_empty());
    assert_eq!(h.room.publish_count("voice-alice"), 1);
    assert_eq!(h.coordinator.status().routes, 0);
    assert_eq!(h.backend.call_count(), 1);
    drop(tx);
}

#[tokio::test(start_paused = true)]
async fn leave_without_route_or_stream_is_a_no_op() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();
    let cycle = h.coordinator.current_cycle().unwrap();
    assert!(!cycle.pipeline().stop_stream("ghost"));

    h.room.leave("ghost");
    settle().await;

    assert_eq!(h.coordinator.connection_state(), ConnectionState::Connected);
    assert_eq!(h.room.published(), vec!["voice-alice".to_string()]);
    assert_eq!(h.room.unpublish_count("voice-alice"), 0);
    assert_eq!(h.coordinator.status().routes, 1);

    // Later events still go through.
    h.room.join("bob");
    assert!(eventually(|| h.room.output("voice-bob").is_some()).await);
    let tx = h.room.open_track("alice");
    send_ms(&tx, 1000, speech_frame).await;
    drop(tx);
    assert!(eventually(|| h.backend.call_count() == 1).await);
}

#[tokio::test(start_paused = true)]
async fn relay_never_routes_or_relays_itself() {
    let h = harness();
    h.coordinator.connect().await.unwrap();

    h.room.join("murmur-relay-2");
    let tx = h.room.open_track("murmur-relay");

    assert!(eventually(|| tx.is_closed()).await);
    settle().await;
    assert!(h.room.published().is_empty());
    assert!(h.coordinator.assignment("murmur-relay-2").is_none());
}

#[tokio::test(start_paused = true)]
async fn track_before_route_waits_for_one_retry() {
    let h = harness();
    h.coordinator.connect().await.unwrap();

    let tx = h.room.open_track("erin");
    h.room.join("erin");
    send_ms(&tx, 1000, speech_frame).await;
    drop(tx);

    assert!(eventually(|| h.backend.call_count() == 1).await);
}

#[tokio::test(start_paused = true)]
async fn track_without_route_is_abandoned() {
    let h = harness();
    h.coordinator.connect().await.unwrap();

    let tx = h.room.open_track("ghost");
    assert!(eventually(|| tx.is_closed()).await);
    assert!(h.coordinator.status().active_streams.is_empty());
    assert_eq!(h.coordinator.status().stats.streams_started, 0);
}

#[tokio::test(start_paused = true)]
async fn connection_loss_triggers_one_reconnect() {
    let h = harness();
    h.room.join("alice");
    h.coordinator.connect().await.unwrap();

    h.room.drop_connection(DisconnectReason::ConnectionLost);
    assert!(eventually(|| h.coordinator.connection_state() == ConnectionState::Disconnected).await);
    assert_eq!(h.room.connect_count(), 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(eventually(|| h.coordinator.connection_state() == ConnectionState::Connected).await);
    assert_eq!(h.room.connect_count(), 2);
    assert_eq!(h.coordinator.reconnect_attempts(), 1);
    assert_eq!(h.room.published(), vec!["voice-alice".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn join_finishing_after_teardown_leaves_no_assignment() {
    let h = harness();
    h.directory.set("dave", VoiceAssignment::new("v-dave", "Dave"));
    h.directory.delay("dave", Duration::from_secs(10));
    h.coordinator.connect().await.unwrap();
    let first = h.coordinator.current_cycle().unwrap();

    h.room.join("dave");
    settle().await;
    h.room.drop_connection(DisconnectReason::ConnectionLost);
    assert!(eventually(|| h.coordinator.connection_state() == ConnectionState::Disconnected).await);
    h.room.leave("dave");

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(eventually(|| h.coordinator.connection_state() == ConnectionState::Connected).await);
    let second = h.coordinator.current_cycle().unwrap();
    assert_ne!(first.id(), second.id());

    // The first cycle's lookup completes well after the reconnect.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.coordinator.assignment("dave").is_none());
    assert!(first.assignments().is_empty());
    assert!(second.assignments().is_empty());
    assert!(h.room.output("voice-dave").is_none());
}

#[tokio::test(start_paused = true)]
async fn server_signal_close_also_reconnects() {
    let h = harness();
    h.coordinator.connect().await.unwrap();

    h.room.drop_connection(DisconnectReason::SignalClose);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(eventually(|| h.room.connect_count() == 2).await);
}

#[tokio::test(start_paused = true)]
async fn deliberate_disconnects_do_not_reconnect() {
    for reason in [
        DisconnectReason::ClientInitiated,
        DisconnectReason::DuplicateIdentity,
        DisconnectReason::RoomDeleted,
    ] {
        let h = harness();
        h.coordinator.connect().await.unwrap();

        h.room.drop_connection(reason);
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(h.room.connect_count(), 1, "{:?} must not reconnect", reason);
        assert_eq!(h.coordinator.connection_state(), ConnectionState::Disconnected);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_is_not_retried() {
    let h = harness();
    h.coordinator.connect().await.unwrap();
    h.room.fail_next_connects(1);

    h.room.drop_connection(DisconnectReason::ConnectionLost);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(eventually(|| h.room.connect_count() == 2).await);

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(h.room.connect_count(), 2);
    assert_eq!(h.coordinator.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_reconnect() {
    let h = harness();
    h.coordinator.connect().await.unwrap();

    h.room.drop_connection(DisconnectReason::ConnectionLost);
    assert!(eventually(|| h.coordinator.connection_state() == ConnectionState::Disconnected).await);
    h.coordinator.shutdown().await;

    tokio::time::advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(h.room.connect_count(), 1);
    assert!(h.coordinator.connect().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_unpublishes_everything() {
    let h = harness();
    h.room.join("alice");
    h.room.join("bob");
    h.coordinator.connect().await.unwrap();
    assert_eq!(h.room.published().len(), 2);

    h.coordinator.disconnect().await;

    assert!(h.room.published().is_empty());
    assert!(!h.room.is_connected());
    let status = h.coordinator.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.routes, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_initial_connect_is_reported() {
    let h = harness();
    h.room.fail_next_connects(1);

    assert!(h.coordinator.connect().await.is_err());
    assert_eq!(h.coordinator.connection_state(), ConnectionState::Disconnected);
}
