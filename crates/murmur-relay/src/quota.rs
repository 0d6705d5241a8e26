//! Process-wide quota exhaustion state for the transformation service.
//!
//! Exhaustion is a timestamp. While it is younger than the cooldown every
//! transformation attempt is skipped locally. It clears on the first check
//! after the cooldown, on the maintenance sweep, or on a successful call.
//! Writers race benignly: the last write wins.

use std::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug, Default)]
struct QuotaInner {
    exhausted_since: Option<Instant>,
    last_success: Option<Instant>,
}

#[derive(Debug)]
pub struct QuotaState {
    cooldown: Duration,
    inner: Mutex<QuotaInner>,
}

impl QuotaState {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            inner: Mutex::new(QuotaInner::default()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Records a quota or rate-limit response at the current time.
    pub fn mark_exhausted(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.exhausted_since = Some(Instant::now());
    }

    /// Records a successful call, clearing any exhaustion.
    pub fn mark_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.exhausted_since = None;
        inner.last_success = Some(Instant::now());
    }

    /// Whether requests must currently be skipped.
    ///
    /// An exhaustion older than the cooldown is cleared as a side effect.
    pub fn is_exhausted(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.exhausted_since {
            Some(since) if now.saturating_duration_since(since) < self.cooldown => true,
            Some(_) => {
                inner.exhausted_since = None;
                tracing::info!("transformation quota cooldown elapsed, resuming requests");
                false
            }
            None => false,
        }
    }

    pub fn exhausted_since(&self) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exhausted_since
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_success
    }

    /// Clears an expired exhaustion. Returns true if one was cleared.
    pub fn sweep(&self) -> bool {
        let was_set = self.exhausted_since().is_some();
        was_set && !self.is_exhausted()
    }
}
