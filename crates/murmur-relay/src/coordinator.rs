//! Room session lifecycle.
//!
//! The coordinator owns the relay's connection to its room. It mints a join
//! token, connects, routes every participant already present and then
//! consumes presence and track events in arrival order. Everything that
//! belongs to one connection (the session, its routes and speaker loops)
//! lives in a [`SessionCycle`]; a disconnect tears the whole cycle down and
//! an eligible one schedules a single delayed reconnect that builds a new
//! cycle from scratch.

use crate::chunker::ChunkerConfig;
use crate::config::RelayConfig;
use crate::directory::{resolve_assignment, VoiceDirectory};
use crate::error::{RelayError, TransportError};
use crate::pipeline::{AudioRelayPipeline, PipelineSettings, RecentlyRecreated, StartOutcome};
use crate::routes::{RouteRegistry, RouteSettings};
use crate::stats::RelayStats;
use crate::token::TokenIssuer;
use crate::transform::TransformClient;
use crate::transport::{RoomConnector, RoomEvent, RoomOptions, RoomSession};
use murmur_types::{ConnectionState, DisconnectReason, SessionStatus, VoiceAssignment};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Voice resolved for each participant currently in the room.
#[derive(Debug, Default)]
pub struct VoiceAssignments {
    inner: RwLock<HashMap<String, VoiceAssignment>>,
}

impl VoiceAssignments {
    pub fn insert(&self, identity: &str, voice: VoiceAssignment) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.to_string(), voice);
    }

    pub fn get(&self, identity: &str) -> Option<VoiceAssignment> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    pub fn remove(&self, identity: &str) -> Option<VoiceAssignment> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity)
    }

    pub fn clear(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Settings that are not owned by any collaborator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub relay: RelayConfig,
    pub output_sample_rate: u32,
    pub default_voice: VoiceAssignment,
}

/// State belonging to one connection.
pub struct SessionCycle {
    id: u64,
    session: Arc<dyn RoomSession>,
    routes: Arc<RouteRegistry>,
    pipeline: Arc<AudioRelayPipeline>,
    assignments: VoiceAssignments,
    cancel: CancellationToken,
}

impl SessionCycle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn RoomSession> {
        &self.session
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn pipeline(&self) -> &Arc<AudioRelayPipeline> {
        &self.pipeline
    }

    /// Voices resolved during this connection. Dropped with the cycle.
    pub fn assignments(&self) -> &VoiceAssignments {
        &self.assignments
    }
}

pub struct SessionCoordinator {
    issuer: TokenIssuer,
    connector: Arc<dyn RoomConnector>,
    directory: Arc<dyn VoiceDirectory>,
    transform: Arc<TransformClient>,
    settings: CoordinatorSettings,
    stats: Arc<RelayStats>,
    recently_recreated: Arc<RecentlyRecreated>,
    state: Mutex<ConnectionState>,
    cycle: Mutex<Option<Arc<SessionCycle>>>,
    cycle_counter: AtomicU64,
    reconnect_attempts: AtomicU32,
    shutdown: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(
        issuer: TokenIssuer,
        connector: Arc<dyn RoomConnector>,
        directory: Arc<dyn VoiceDirectory>,
        transform: Arc<TransformClient>,
        settings: CoordinatorSettings,
    ) -> Self {
        let recently_recreated = Arc::new(RecentlyRecreated::new(
            settings.relay.recreate_debounce(),
        ));
        Self {
            issuer,
            connector,
            directory,
            transform,
            settings,
            stats: Arc::new(RelayStats::default()),
            recently_recreated,
            state: Mutex::new(ConnectionState::Disconnected),
            cycle: Mutex::new(None),
            cycle_counter: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn transform(&self) -> &Arc<TransformClient> {
        &self.transform
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// The live connection, if any.
    pub fn current_cycle(&self) -> Option<Arc<SessionCycle>> {
        self.cycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn assignment(&self, identity: &str) -> Option<VoiceAssignment> {
        self.current_cycle()?.assignments.get(identity)
    }

    fn is_self(&self, identity: &str) -> bool {
        let own = self.issuer.agent_identity();
        !own.is_empty() && identity.starts_with(own)
    }

    fn build_cycle(&self, session: Arc<dyn RoomSession>) -> Arc<SessionCycle> {
        let relay = &self.settings.relay;
        let id = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.shutdown.child_token();

        let routes = Arc::new(RouteRegistry::new(
            session.clone(),
            RouteSettings {
                track_prefix: relay.output_track_prefix.clone(),
                output_sample_rate: self.settings.output_sample_rate,
            },
        ));
        let pipeline = Arc::new(AudioRelayPipeline::new(
            routes.clone(),
            self.transform.clone(),
            PipelineSettings {
                input_sample_rate: relay.input_sample_rate,
                chunk: ChunkerConfig {
                    sample_rate: relay.input_sample_rate,
                    chunk_ms: relay.chunk_ms,
                    min_interval_ms: relay.min_interval_ms,
                },
                output_frame_samples: (self.settings.output_sample_rate as usize
                    * relay.frame_ms as usize)
                    / 1000,
                route_retry_delay: relay.route_retry_delay(),
                self_identity_prefix: self.issuer.agent_identity().to_string(),
            },
            self.stats.clone(),
            self.recently_recreated.clone(),
            cancel.clone(),
        ));

        Arc::new(SessionCycle {
            id,
            session,
            routes,
            pipeline,
            assignments: VoiceAssignments::default(),
            cancel,
        })
    }

    /// Connects to the room and starts consuming its events.
    ///
    /// Participants already present get their voice and route before any
    /// event is processed.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed.into());
        }
        if self.current_cycle().is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let token = match self.issuer.agent_token() {
            Ok(token) => token,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let options = RoomOptions {
            room: self.issuer.room().to_string(),
            identity: self.issuer.agent_identity().to_string(),
            input_sample_rate: self.settings.relay.input_sample_rate,
            frame_queue_capacity: self.settings.relay.frame_queue_capacity,
        };

        let (session, events) = match self
            .connector
            .connect(self.issuer.url(), &token, &options)
            .await
        {
            Ok(connected) => connected,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        let cycle = self.build_cycle(session);
        *self.cycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(cycle.clone());
        self.set_state(ConnectionState::Connected);
        tracing::info!(
            room = %options.room,
            identity = %options.identity,
            cycle = cycle.id,
            "connected to room"
        );

        for identity in cycle.session.participants() {
            if self.is_self(&identity) {
                continue;
            }
            self.assign_and_route(&cycle, &identity).await;
        }

        tokio::spawn(self.clone().run_events(cycle, events));
        Ok(())
    }

    async fn run_events(
        self: Arc<Self>,
        cycle: Arc<SessionCycle>,
        mut events: mpsc::UnboundedReceiver<RoomEvent>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cycle.cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Some(RoomEvent::ParticipantConnected { identity }) => {
                    if self.is_self(&identity) {
                        continue;
                    }
                    tokio::spawn(self.clone().on_participant_joined(cycle.clone(), identity));
                }
                Some(RoomEvent::ParticipantDisconnected { identity }) => {
                    self.on_participant_left(&cycle, &identity).await;
                }
                Some(RoomEvent::TrackSubscribed {
                    identity,
                    track_sid,
                    frames,
                }) => match cycle.pipeline.start_stream(&identity, frames) {
                    StartOutcome::Started => {
                        tracing::info!(identity = %identity, track_sid = %track_sid, "relaying track");
                    }
                    StartOutcome::AlreadyStreaming | StartOutcome::SelfLoop => {}
                },
                Some(RoomEvent::TrackUnsubscribed {
                    identity,
                    track_sid,
                }) => {
                    tracing::debug!(identity = %identity, track_sid = %track_sid, "track unsubscribed");
                }
                Some(RoomEvent::Disconnected { reason }) => {
                    self.on_disconnected(&cycle, reason);
                    return;
                }
                None => {
                    self.on_disconnected(&cycle, DisconnectReason::ConnectionLost);
                    return;
                }
            }
        }
    }

    async fn assign_and_route(&self, cycle: &SessionCycle, identity: &str) {
        let voice =
            resolve_assignment(self.directory.as_ref(), identity, &self.settings.default_voice)
                .await;
        // The cycle may have been torn down during the lookup.
        if cycle.cancel.is_cancelled() {
            return;
        }
        cycle.assignments.insert(identity, voice.clone());
        if let Err(e) = cycle.routes.create_route(identity, voice).await {
            tracing::warn!(identity, error = %e, "failed to create route");
        }
    }

    async fn on_participant_joined(self: Arc<Self>, cycle: Arc<SessionCycle>, identity: String) {
        if cycle.cancel.is_cancelled() {
            return;
        }
        tracing::info!(identity = %identity, "participant joined");
        self.assign_and_route(&cycle, &identity).await;

        // The participant may have left while the route was being created.
        let present = cycle.session.participants().iter().any(|p| *p == identity);
        if !present && !cycle.cancel.is_cancelled() {
            tracing::debug!(identity = %identity, "participant left during join, discarding route");
            cycle.routes.remove_route(&identity).await;
            cycle.assignments.remove(&identity);
        }
    }

    async fn on_participant_left(&self, cycle: &SessionCycle, identity: &str) {
        cycle.pipeline.stop_stream(identity);
        cycle.routes.remove_route(identity).await;
        cycle.assignments.remove(identity);
        tracing::info!(identity, "participant left");
    }

    /// Stops everything owned by cycle `id`. Returns the cycle if it was current.
    fn teardown_cycle(&self, id: u64) -> Option<Arc<SessionCycle>> {
        let cycle = {
            let mut slot = self.cycle.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|c| c.id == id) {
                slot.take()
            } else {
                None
            }
        }?;
        cycle.cancel.cancel();
        cycle.pipeline.stop_all();
        cycle.assignments.clear();
        self.set_state(ConnectionState::Disconnected);
        Some(cycle)
    }

    fn on_disconnected(self: &Arc<Self>, cycle: &SessionCycle, reason: DisconnectReason) {
        if self.teardown_cycle(cycle.id).is_none() {
            return;
        }

        if !reason.is_reconnect_eligible() {
            tracing::info!(reason = reason.as_str(), "disconnected from room, not reconnecting");
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let delay = self.settings.relay.reconnect_delay();
        tracing::warn!(
            reason = reason.as_str(),
            delay_ms = delay.as_millis() as u64,
            "connection lost, scheduling reconnect"
        );
        let lost = cycle.id;
        tokio::spawn(self.clone().reconnect_after(delay, lost));
    }

    // Boxed: the reconnect future awaits `connect`, which in turn spawns the
    // event loop that schedules reconnects.
    fn reconnect_after(
        self: Arc<Self>,
        delay: Duration,
        lost: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Someone else connected since the loss.
            if self.current_cycle().is_some() || self.cycle_counter.load(Ordering::SeqCst) != lost {
                return;
            }

            self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            match self.connect().await {
                Ok(()) => tracing::info!("reconnected to room"),
                Err(e) => tracing::error!(error = %e, "reconnect failed, staying disconnected"),
            }
        })
    }

    /// Leaves the room on purpose. No reconnect follows.
    pub async fn disconnect(&self) {
        let Some(id) = self.current_cycle().map(|c| c.id) else {
            return;
        };
        if let Some(cycle) = self.teardown_cycle(id) {
            cycle.routes.remove_all().await;
            cycle.session.disconnect().await;
            tracing::info!(cycle = cycle.id, "left room");
        }
    }

    /// Disconnects and cancels any pending reconnect.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.disconnect().await;
    }

    /// Drops expired recreation markers and clears an elapsed quota pause.
    pub fn sweep(&self) {
        let expired = self.recently_recreated.sweep();
        let cleared = self.transform.quota().sweep();
        if expired > 0 || cleared {
            tracing::debug!(expired_markers = expired, quota_cleared = cleared, "maintenance sweep");
        }
    }

    pub fn status(&self) -> SessionStatus {
        let cycle = self.current_cycle();
        SessionStatus {
            room: self.issuer.room().to_string(),
            state: self.connection_state(),
            reconnect_attempts: self.reconnect_attempts(),
            routes: cycle.as_ref().map_or(0, |c| c.routes.len()),
            active_streams: cycle
                .as_ref()
                .map(|c| c.pipeline.active_streams())
                .unwrap_or_default(),
            quota_exhausted: self.transform.quota().is_exhausted(),
            stats: self.stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_track_presence() {
        let assignments = VoiceAssignments::default();
        assignments.insert("alice", VoiceAssignment::new("v1", "Nova"));
        assert_eq!(assignments.get("alice").unwrap().voice_id, "v1");
        assert_eq!(assignments.len(), 1);

        assert!(assignments.remove("alice").is_some());
        assert!(assignments.remove("alice").is_none());
        assert!(assignments.is_empty());
    }
}
