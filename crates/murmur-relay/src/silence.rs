//! Speech/silence classification by signal level.
//!
//! A block's level is its RMS amplitude, normalized to [-1, 1] and expressed
//! in dB relative to full scale. Digital silence would be `-inf`, so levels
//! are clamped to [`LEVEL_FLOOR_DB`].

/// Lowest level ever reported.
pub const LEVEL_FLOOR_DB: f32 = -120.0;

/// Level at or above which a block counts as speech.
pub const DEFAULT_SILENCE_THRESHOLD_DB: f32 = -55.0;

/// Speech level of `samples` in dBFS, clamped to [`LEVEL_FLOOR_DB`].
///
/// An empty block is reported at the floor.
pub fn speech_level_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return LEVEL_FLOOR_DB;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = f64::from(s) / 32768.0;
            normalized * normalized
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();

    if rms <= 0.0 {
        return LEVEL_FLOOR_DB;
    }
    let db = (20.0 * rms.log10()) as f32;
    db.max(LEVEL_FLOOR_DB)
}

/// Classifies blocks against a single fixed threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceGate {
    threshold_db: f32,
}

impl SilenceGate {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    /// Returns true when the block is loud enough to be worth transforming.
    pub fn is_speech(&self, samples: &[i16]) -> bool {
        speech_level_db(samples) >= self.threshold_db
    }
}

impl Default for SilenceGate {
    fn default() -> Self {
        Self::new(DEFAULT_SILENCE_THRESHOLD_DB)
    }
}
