use murmur_types::RelayStatsSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay counters, shared by every speaker loop.
#[derive(Debug, Default)]
pub struct RelayStats {
    streams_started: AtomicU64,
    chunks_converted: AtomicU64,
    chunks_skipped_silence: AtomicU64,
    chunks_skipped_quota: AtomicU64,
    chunks_failed: AtomicU64,
    frames_published: AtomicU64,
    routes_recreated: AtomicU64,
}

impl RelayStats {
    pub fn stream_started(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_converted(&self) {
        self.chunks_converted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_skipped_silence(&self) {
        self.chunks_skipped_silence.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_skipped_quota(&self) {
        self.chunks_skipped_quota.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_recreated(&self) {
        self.routes_recreated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            streams_started: self.streams_started.load(Ordering::Relaxed),
            chunks_converted: self.chunks_converted.load(Ordering::Relaxed),
            chunks_skipped_silence: self.chunks_skipped_silence.load(Ordering::Relaxed),
            chunks_skipped_quota: self.chunks_skipped_quota.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            routes_recreated: self.routes_recreated.load(Ordering::Relaxed),
        }
    }
}
