use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Aggregate progress of one transfer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    /// `completed_bytes / total_bytes` in `[0, 1]`.
    pub fraction: f64,
    pub bytes_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Duration>,
}

/// Callback invoked with progress snapshots.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Aggregates per-chunk completions into a progress fraction and notifies
/// callbacks after every completed chunk.
///
/// The fraction only ever grows: chunks are counted once, when they complete.
pub struct ProgressTracker {
    inner: RwLock<TrackerInner>,
    speed: SpeedCalculator,
}

#[derive(Default)]
struct TrackerInner {
    callbacks: Vec<ProgressCallback>,
    total_bytes: u64,
    completed_bytes: u64,
    total_chunks: usize,
    completed_chunks: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TrackerInner::default()),
            speed: SpeedCalculator::new(None, None),
        }
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.callbacks.push(callback);
    }

    /// Starts a new transfer of `total_bytes` split into `total_chunks`.
    pub fn reset(&self, total_bytes: u64, total_chunks: usize) {
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.total_bytes = total_bytes;
            inner.completed_bytes = 0;
            inner.total_chunks = total_chunks;
            inner.completed_chunks = 0;
        }
        self.speed.reset();
    }

    /// Records one completed chunk and notifies callbacks.
    pub fn chunk_completed(&self, bytes: u64) -> TransferProgress {
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.completed_bytes = (inner.completed_bytes + bytes).min(inner.total_bytes);
            inner.completed_chunks = (inner.completed_chunks + 1).min(inner.total_chunks);
        }
        self.speed.add_sample(bytes);

        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let progress = self.build(&inner);
        for cb in &inner.callbacks {
            cb(progress.clone());
        }
        progress
    }

    /// Current progress without notifying anyone.
    pub fn snapshot(&self) -> TransferProgress {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        self.build(&inner)
    }

    fn build(&self, inner: &TrackerInner) -> TransferProgress {
        let fraction = if inner.total_bytes > 0 {
            inner.completed_bytes as f64 / inner.total_bytes as f64
        } else if inner.total_chunks > 0 && inner.completed_chunks == inner.total_chunks {
            1.0
        } else {
            0.0
        };
        TransferProgress {
            completed_bytes: inner.completed_bytes,
            total_bytes: inner.total_bytes,
            completed_chunks: inner.completed_chunks,
            total_chunks: inner.total_chunks,
            fraction,
            bytes_per_second: self.speed.bytes_per_second(),
            eta: self.speed.eta(inner.total_bytes - inner.completed_bytes),
        }
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
    /// - `window_size`: time window for speed calculation (default 10 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(10)),
            }),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.lock();
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
    /// The first sample only marks the start of the window, so fewer than
    /// 2 samples give 0.0.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        let bytes: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        self.lock().samples.clear();
    }

    fn lock(&self) -> MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tracker_fraction_is_monotonic() {
        let tracker = ProgressTracker::new();
        tracker.reset(1000, 4);
        let mut last = 0.0;
        for bytes in [250, 250, 250, 250] {
            let p = tracker.chunk_completed(bytes);
            assert!(p.fraction >= last);
            last = p.fraction;
        }
        let p = tracker.snapshot();
        assert_eq!(p.completed_bytes, 1000);
        assert_eq!(p.completed_chunks, 4);
        assert!((p.fraction - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tracker_notifies_callbacks() {
        let tracker = ProgressTracker::new();
        let received = Arc::new(Mutex::new(Vec::<u64>::new()));
        let r = Arc::clone(&received);
        tracker.on_progress(Box::new(move |p| {
            r.lock().unwrap().push(p.completed_bytes);
        }));

        tracker.reset(300, 3);
        tracker.chunk_completed(100);
        tracker.chunk_completed(100);

        assert_eq!(*received.lock().unwrap(), vec![100, 200]);
    }

    #[test]
    fn tracker_zero_length_transfer() {
        let tracker = ProgressTracker::new();
        tracker.reset(0, 1);
        assert_eq!(tracker.snapshot().fraction, 0.0);
        let p = tracker.chunk_completed(0);
        assert_eq!(p.fraction, 1.0);
    }

    #[test]
    fn tracker_reset_clears_counts() {
        let tracker = ProgressTracker::new();
        tracker.reset(100, 1);
        tracker.chunk_completed(100);
        tracker.reset(200, 2);
        let p = tracker.snapshot();
        assert_eq!(p.completed_bytes, 0);
        assert_eq!(p.total_bytes, 200);
    }

    #[test]
    fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn speed_calculator_single_sample() {
        let calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_multiple_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(500);
        std::thread::sleep(Duration::from_millis(50));
        calc.add_sample(500);

        assert!(calc.bytes_per_second() > 0.0);
        let eta = calc.eta(10_000);
        assert!(eta.is_some_and(|d| d.as_secs_f64() > 0.0));
    }

    #[test]
    fn speed_calculator_reset() {
        let calc = SpeedCalculator::new(None, None);
        calc.add_sample(100);
        calc.add_sample(200);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_max_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        assert!(calc.lock().samples.len() <= 5);
    }
}
