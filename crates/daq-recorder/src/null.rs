use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use daq_core::{Occurrence, SinkConfig};

use crate::error::{InsertError, SinkError};
use crate::sink::{config_kind, ErrorSlot, Recorder, SinkStats, WorkerHandle};

/// Counts and discards.
#[derive(Debug, Default)]
pub struct NullSink {
    workers: AtomicUsize,
    batches: AtomicU64,
    occurrences: AtomicU64,
    failed: AtomicU64,
    shut_down: AtomicBool,
    last_error: ErrorSlot,
}

impl NullSink {
    /// Sink that counts and discards.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Recorder for NullSink {
    fn initialize(&self) -> Result<(), SinkError> {
        self.shut_down.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn register_worker(&self) -> WorkerHandle {
        WorkerHandle(self.workers.fetch_add(1, Ordering::SeqCst))
    }

    fn insert_batch(&self, _worker: WorkerHandle, batch: Vec<Occurrence>) -> Result<(), InsertError> {
        if self.shut_down.load(Ordering::SeqCst) {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.last_error.record(&SinkError::ShutDown);
            return Err(InsertError::new(SinkError::ShutDown, batch));
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.occurrences
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn update_target(&self, config: &SinkConfig) -> Result<(), SinkError> {
        match config {
            SinkConfig::None => Ok(()),
            other => Err(SinkError::TargetMismatch {
                current: "none",
                requested: config_kind(other),
            }),
        }
    }

    fn shutdown(&self) -> Result<(), SinkError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    fn stats(&self) -> SinkStats {
        SinkStats {
            batches: self.batches.load(Ordering::Relaxed),
            occurrences: self.occurrences.load(Ordering::Relaxed),
            failed_batches: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_counts_and_refuses_after_shutdown() {
        let sink = NullSink::new();
        sink.initialize().unwrap();
        let w = sink.register_worker();
        let batch = vec![Occurrence::whole(1, 10, Bytes::from_static(b"abcd")); 3];
        sink.insert_batch(w, batch.clone()).unwrap();
        assert_eq!(sink.stats().occurrences, 3);

        sink.shutdown().unwrap();
        let err = sink.insert_batch(w, batch).unwrap_err();
        assert_eq!(err.batch.len(), 3);
        assert_eq!(sink.last_error().as_deref(), Some("Sink is shut down"));

        sink.initialize().unwrap();
        assert!(sink.insert_batch(w, Vec::new()).is_ok());
    }
}
