//! Per-speaker accumulation of inbound PCM into transformation chunks.
//!
//! A chunk is ready once the buffered audio reaches the chunk duration and
//! the minimum interval since the previous chunk has passed. The interval
//! caps the request rate against the transformation service no matter how
//! bursty the inbound frames are.

use tokio::time::{Duration, Instant};

/// Sizing of the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub sample_rate: u32,
    pub chunk_ms: u32,
    pub min_interval_ms: u32,
}

impl ChunkerConfig {
    /// Number of samples in one full chunk.
    pub fn chunk_samples(&self) -> usize {
        (u64::from(self.chunk_ms) * u64::from(self.sample_rate) / 1000) as usize
    }

    /// Minimum number of samples a final partial chunk must hold.
    pub fn flush_min_samples(&self) -> usize {
        self.chunk_samples() / 2
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.min_interval_ms))
    }
}

/// Buffer of one speaker's sample blocks, in arrival order.
#[derive(Debug)]
pub struct ChunkAccumulator {
    config: ChunkerConfig,
    blocks: Vec<Vec<i16>>,
    buffered: usize,
    last_emit: Option<Instant>,
}

impl ChunkAccumulator {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            buffered: 0,
            last_emit: None,
        }
    }

    /// Appends one block. Empty blocks are ignored.
    pub fn push(&mut self, block: Vec<i16>) {
        if block.is_empty() {
            return;
        }
        self.buffered += block.len();
        self.blocks.push(block);
    }

    pub fn buffered_ms(&self) -> u64 {
        self.buffered as u64 * 1000 / u64::from(self.config.sample_rate.max(1))
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Instant::now())
    }

    /// Whether a chunk may be drained at `now`.
    pub fn is_ready_at(&self, now: Instant) -> bool {
        if self.buffered == 0 || self.buffered < self.config.chunk_samples() {
            return false;
        }
        match self.last_emit {
            Some(last) => now.saturating_duration_since(last) >= self.config.min_interval(),
            None => true,
        }
    }

    /// Concatenates and clears the buffer, stamping the emit time.
    pub fn drain(&mut self) -> Vec<i16> {
        self.drain_at(Instant::now())
    }

    pub fn drain_at(&mut self, now: Instant) -> Vec<i16> {
        let mut chunk = Vec::with_capacity(self.buffered);
        for block in self.blocks.drain(..) {
            chunk.extend_from_slice(&block);
        }
        self.buffered = 0;
        self.last_emit = Some(now);
        chunk
    }

    /// Emits the remaining partial chunk at end of stream.
    ///
    /// Tails shorter than half a chunk are discarded. The buffer is empty
    /// afterwards in both cases.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        if self.buffered < self.config.flush_min_samples().max(1) {
            self.blocks.clear();
            self.buffered = 0;
            return None;
        }
        Some(self.drain())
    }
}
