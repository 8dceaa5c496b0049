//! Run-wide counters shared by the read loop, the workers and the manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use daq_core::ErrorKind;
use parking_lot::Mutex;

/// Bytes and read cycles, guarded separately from any board.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateCounters {
    /// Bytes read from all boards.
    pub bytes: u64,
    /// Read cycles that returned data.
    pub read_cycles: u64,
}

impl RateCounters {
    /// Count one read cycle of `bytes`.
    pub fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        self.read_cycles += 1;
    }
}

/// Throughput since the previous [`RateMeter::sample`].
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Rate {
    /// Bytes read per second.
    pub bytes_per_sec: f64,
    /// Trigger records decoded per second.
    pub events_per_sec: f64,
}

/// Remembers the totals at the last sample.
#[derive(Debug)]
pub struct RateMeter {
    at: Instant,
    bytes: u64,
    events: u64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self {
            at: Instant::now(),
            bytes: 0,
            events: 0,
        }
    }
}

impl RateMeter {
    /// Rate between the previous call and now, given the current totals.
    pub fn sample(&mut self, bytes: u64, events: u64) -> Rate {
        let now = Instant::now();
        let secs = now.duration_since(self.at).as_secs_f64();
        let rate = if secs > 0.0 {
            Rate {
                bytes_per_sec: bytes.saturating_sub(self.bytes) as f64 / secs,
                events_per_sec: events.saturating_sub(self.events) as f64 / secs,
            }
        } else {
            Rate::default()
        };
        *self = Self { at: now, bytes, events };
        rate
    }
}

/// Decode and sink counters plus the first worker-side error.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    /// Trigger records decoded.
    pub events: AtomicU64,
    /// Occurrences produced.
    pub occurrences: AtomicU64,
    /// Regions the decoders skipped.
    pub decode_anomalies: AtomicU64,
    /// Backward time steps.
    pub clock_anomalies: AtomicU64,
    /// Batches the sink accepted.
    pub batches_flushed: AtomicU64,
    /// Inserts retried under the retry policy.
    pub sink_retries: AtomicU64,
    /// Batches given up on.
    pub dropped_batches: AtomicU64,
    /// Occurrences in those batches.
    pub dropped_occurrences: AtomicU64,
    /// Failed transfers.
    pub bus_errors: AtomicU64,
    /// Blocks rejected by the boards.
    pub malformed_blocks: AtomicU64,
    worker_error: Mutex<Option<ErrorKind>>,
    anomaly: Mutex<Option<ErrorKind>>,
}

impl PipelineCounters {
    /// Add `n` to one of the counters.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of one of the counters.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Keep the first error raised by a worker.
    pub fn raise(&self, kind: ErrorKind) {
        self.worker_error.lock().get_or_insert(kind);
    }

    /// Error kept by [`PipelineCounters::raise`].
    pub fn worker_error(&self) -> Option<ErrorKind> {
        *self.worker_error.lock()
    }

    /// Keep the first data anomaly a worker saw. Ranked below `raise`.
    pub fn note_anomaly(&self, kind: ErrorKind) {
        self.anomaly.lock().get_or_insert(kind);
    }

    /// Anomaly kept by [`PipelineCounters::note_anomaly`].
    pub fn anomaly(&self) -> Option<ErrorKind> {
        *self.anomaly.lock()
    }

    /// Zero everything for a new run.
    pub fn reset(&self) {
        for counter in [
            &self.events,
            &self.occurrences,
            &self.decode_anomalies,
            &self.clock_anomalies,
            &self.batches_flushed,
            &self.sink_retries,
            &self.dropped_batches,
            &self.dropped_occurrences,
            &self.bus_errors,
            &self.malformed_blocks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.worker_error.lock() = None;
        *self.anomaly.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_since_previous_sample() {
        let mut meter = RateMeter::default();
        std::thread::sleep(Duration::from_millis(20));
        let rate = meter.sample(1_000, 10);
        assert!(rate.bytes_per_sec > 0.0);
        assert!(rate.events_per_sec > 0.0);
        std::thread::sleep(Duration::from_millis(5));
        let idle = meter.sample(1_000, 10);
        assert_eq!(idle.bytes_per_sec, 0.0);
    }

    #[test]
    fn test_first_worker_error_wins() {
        let counters = PipelineCounters::default();
        counters.raise(ErrorKind::Sink);
        counters.raise(ErrorKind::DecodeAnomaly);
        assert_eq!(counters.worker_error(), Some(ErrorKind::Sink));
        counters.reset();
        assert_eq!(counters.worker_error(), None);
    }

    #[test]
    fn test_anomaly_slot_is_separate_from_errors() {
        let counters = PipelineCounters::default();
        counters.note_anomaly(ErrorKind::DecodeAnomaly);
        assert_eq!(counters.worker_error(), None);
        assert_eq!(counters.anomaly(), Some(ErrorKind::DecodeAnomaly));
        counters.reset();
        assert_eq!(counters.anomaly(), None);
    }
}
