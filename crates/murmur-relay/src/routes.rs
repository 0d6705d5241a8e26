//! Per-participant output routes.
//!
//! A route is the published output channel a participant's transformed
//! voice is written into. The registry is the single source of truth for
//! whether a route exists: a missing route means "do not publish", never an
//! error. Structural changes (create, recreate, remove) are serialized by one
//! async lock so publish/unpublish pairs never interleave; lookups only take
//! a short read lock on the map.

use crate::error::RelayError;
use crate::transport::{OutputChannel, PublishHandle, RoomSession};
use murmur_types::{VoiceAssignment, OUTPUT_CHANNELS};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// A participant's published output.
pub struct Route {
    pub identity: String,
    /// Name the output is published under.
    pub route_key: String,
    pub voice: VoiceAssignment,
    pub output: Arc<dyn OutputChannel>,
    pub publication: PublishHandle,
    /// Increases every time a route is (re)created.
    pub generation: u64,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("identity", &self.identity)
            .field("route_key", &self.route_key)
            .field("voice", &self.voice)
            .field("publication", &self.publication)
            .field("generation", &self.generation)
            .finish()
    }
}

/// How routes are named and sized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    pub track_prefix: String,
    pub output_sample_rate: u32,
}

impl RouteSettings {
    pub fn route_key(&self, identity: &str) -> String {
        format!("{}{}", self.track_prefix, identity)
    }
}

pub struct RouteRegistry {
    session: Arc<dyn RoomSession>,
    settings: RouteSettings,
    routes: RwLock<HashMap<String, Arc<Route>>>,
    structure: Mutex<()>,
    generation: AtomicU64,
}

impl RouteRegistry {
    pub fn new(session: Arc<dyn RoomSession>, settings: RouteSettings) -> Self {
        Self {
            session,
            settings,
            routes: RwLock::new(HashMap::new()),
            structure: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &RouteSettings {
        &self.settings
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Route>> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn take(&self, identity: &str) -> Option<Arc<Route>> {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(identity)
    }

    async fn unpublish_quietly(&self, route: &Route) {
        if let Err(e) = self.session.unpublish(&route.publication).await {
            tracing::debug!(
                identity = %route.identity,
                route_key = %route.route_key,
                error = %e,
                "ignoring unpublish failure"
            );
        }
    }

    async fn publish(&self, identity: &str, voice: VoiceAssignment) -> Result<Arc<Route>, RelayError> {
        let route_key = self.settings.route_key(identity);
        let (output, publication) = self
            .session
            .publish_output(&route_key, self.settings.output_sample_rate, OUTPUT_CHANNELS)
            .await?;

        let route = Arc::new(Route {
            identity: identity.to_string(),
            route_key,
            voice,
            output,
            publication,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        });
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.to_string(), route.clone());
        Ok(route)
    }

    /// Publishes a fresh output for `identity` and registers it.
    ///
    /// An existing route with the same voice is returned unchanged; one with
    /// a different voice is unpublished and replaced. If publishing fails no
    /// route is left registered.
    pub async fn create_route(
        &self,
        identity: &str,
        voice: VoiceAssignment,
    ) -> Result<Arc<Route>, RelayError> {
        let _guard = self.structure.lock().await;

        if let Some(existing) = self.get(identity) {
            if existing.voice == voice {
                return Ok(existing);
            }
            if let Some(old) = self.take(identity) {
                self.unpublish_quietly(&old).await;
            }
        }

        let route = self.publish(identity, voice).await?;
        tracing::info!(
            identity,
            route_key = %route.route_key,
            voice_id = %route.voice.voice_id,
            "route published"
        );
        Ok(route)
    }

    /// Replaces `identity`'s route with a freshly published one carrying the
    /// same voice. Unpublish errors on the old route are ignored.
    ///
    /// Returns `Ok(None)` when there was no route to replace.
    pub async fn recreate_route(&self, identity: &str) -> Result<Option<Arc<Route>>, RelayError> {
        let _guard = self.structure.lock().await;

        let Some(old) = self.take(identity) else {
            return Ok(None);
        };
        self.unpublish_quietly(&old).await;

        let route = self.publish(identity, old.voice.clone()).await?;
        tracing::info!(
            identity,
            route_key = %route.route_key,
            generation = route.generation,
            "route recreated"
        );
        Ok(Some(route))
    }

    /// Unpublishes and forgets `identity`'s route. Returns whether one existed.
    pub async fn remove_route(&self, identity: &str) -> bool {
        let _guard = self.structure.lock().await;

        match self.take(identity) {
            Some(route) => {
                self.unpublish_quietly(&route).await;
                tracing::info!(identity, route_key = %route.route_key, "route removed");
                true
            }
            None => false,
        }
    }

    /// Removes every route.
    pub async fn remove_all(&self) {
        for identity in self.identities() {
            self.remove_route(&identity).await;
        }
    }
}
