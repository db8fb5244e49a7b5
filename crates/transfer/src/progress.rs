use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Receives upload progress as a percentage in `[0, 100]`.
pub trait ProgressSink: Send + Sync {
    fn update(&self, percent: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn update(&self, percent: f64) {
        self(percent)
    }
}

/// A sink that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn update(&self, _percent: f64) {}
}

/// What a progress percentage is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressBasis {
    /// Completed bytes over total bytes.
    #[default]
    Bytes,
    /// Completed chunks over total chunks.
    Chunks,
}

// ---------------------------------------------------------------------------
// MonotonicProgress
// ---------------------------------------------------------------------------

/// Wraps a [`ProgressSink`] so reported values never decrease.
///
/// Chunk completions map onto `[0, ceiling]`; only [`complete`](Self::complete)
/// reports 100. Sink calls happen under the internal lock, so a sink never
/// sees two updates interleave.
pub struct MonotonicProgress {
    sink: Arc<dyn ProgressSink>,
    basis: ProgressBasis,
    total_bytes: u64,
    total_chunks: u32,
    ceiling: f64,
    state: Mutex<ProgressState>,
}

#[derive(Debug, Default)]
struct ProgressState {
    completed_bytes: u64,
    completed_chunks: u32,
    last: f64,
}

impl MonotonicProgress {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        basis: ProgressBasis,
        total_bytes: u64,
        total_chunks: u32,
    ) -> Self {
        Self {
            sink,
            basis,
            total_bytes,
            total_chunks,
            ceiling: 100.0,
            state: Mutex::new(ProgressState::default()),
        }
    }

    /// Caps chunk-driven progress at `ceiling` percent.
    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        self.ceiling = ceiling.clamp(0.0, 100.0);
        self
    }

    /// Records a finished chunk of `bytes` and reports the new percentage.
    pub fn record_chunk(&self, bytes: u64) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.completed_bytes = state.completed_bytes.saturating_add(bytes);
        state.completed_chunks = state.completed_chunks.saturating_add(1);

        let fraction = match self.basis {
            ProgressBasis::Bytes if self.total_bytes > 0 => {
                state.completed_bytes as f64 / self.total_bytes as f64
            }
            ProgressBasis::Chunks if self.total_chunks > 0 => {
                f64::from(state.completed_chunks) / f64::from(self.total_chunks)
            }
            _ => 1.0,
        };
        let percent = fraction.min(1.0) * self.ceiling;
        self.emit(&mut state, percent)
    }

    /// Reports an explicit percentage, ignored if below the last report.
    pub fn report(&self, percent: f64) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.emit(&mut state, percent)
    }

    /// Reports 100.
    pub fn complete(&self) {
        self.report(100.0);
    }

    /// The last value handed to the sink.
    pub fn last(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
    }

    pub fn completed_bytes(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed_bytes
    }

    fn emit(&self, state: &mut ProgressState, percent: f64) -> f64 {
        if percent.is_nan() {
            return state.last;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > state.last {
            state.last = percent;
            self.sink.update(percent);
        }
        state.last
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100).max(2),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        if s.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample marks the start of the window.
        let total_bytes: u64 = s.samples.iter().skip(1).map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimated time to move `remaining_bytes`, if any speed is known.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(remaining_bytes as f64 / speed).ok()
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        s.samples.clear();
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}
