//! Decode workers.
//!
//! Every worker scans all boards, starting at its own offset so that workers
//! spread over boards, and takes a board's whole queue once it is ready. The
//! decoded occurrences accumulate locally and go to the sink in batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use daq_board::BoardInterface;
use daq_core::{DaqError, DaqResult, ErrorKind, Occurrence, ProcessingConfig, SinkErrorPolicy};
use daq_recorder::{InsertError, Recorder, Sink, WorkerHandle};
use tracing::{debug, error, info, warn};

use crate::counters::PipelineCounters;
use crate::decode::decode_batch;

/// Sleep when a scan found nothing to do.
const IDLE_SLEEP: Duration = Duration::from_micros(500);

/// Base delay between insert retries, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// State shared by all workers of a run.
pub struct WorkerContext {
    /// Boards scanned for ready queues.
    pub boards: Arc<[Arc<BoardInterface>]>,
    /// Where batches go.
    pub sink: Arc<Sink>,
    /// Decode mode and sink policy.
    pub processing: ProcessingConfig,
    /// Set once the read loop has made its last read.
    pub readout_done: Arc<AtomicBool>,
    /// Run counters.
    pub counters: Arc<PipelineCounters>,
}

/// The running worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `processing.workers` threads named `worker-N`.
    pub fn spawn(context: Arc<WorkerContext>) -> DaqResult<Self> {
        let count = context.processing.workers;
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let context = Arc::clone(&context);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || Worker::new(index, context).run())
                .map_err(DaqError::Io)?;
            handles.push(handle);
        }
        info!(workers = count, mode = ?context.processing.mode, "Worker pool started");
        Ok(Self { handles })
    }

    /// Number of worker threads.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True for a pool of zero workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to drain and exit.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

struct Worker {
    index: usize,
    context: Arc<WorkerContext>,
    handle: WorkerHandle,
    batch: Vec<Occurrence>,
}

impl Worker {
    fn new(index: usize, context: Arc<WorkerContext>) -> Self {
        let handle = context.sink.register_worker();
        Self {
            index,
            context,
            handle,
            batch: Vec::new(),
        }
    }

    fn run(mut self) {
        debug!(worker = self.index, "Worker started");
        let mut idle_since: Option<Instant> = None;
        loop {
            if self.scan() {
                idle_since = None;
                continue;
            }
            if self.quiescent() {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.context.processing.idle_grace {
                    break;
                }
            } else {
                idle_since = None;
            }
            thread::sleep(IDLE_SLEEP);
        }
        self.flush();
        debug!(worker = self.index, "Worker finished");
    }

    /// Nothing more can arrive: the read loop is done and every board is
    /// inactive and empty.
    fn quiescent(&self) -> bool {
        self.context.readout_done.load(Ordering::SeqCst)
            && self
                .context
                .boards
                .iter()
                .all(|b| !b.is_active() && !b.has_pending())
    }

    /// One pass over all boards. Returns whether any batch was decoded.
    fn scan(&mut self) -> bool {
        let boards = Arc::clone(&self.context.boards);
        let done = self.context.readout_done.load(Ordering::SeqCst);
        let mut worked = false;
        for k in 0..boards.len() {
            let board = &boards[(self.index + k) % boards.len()];
            if !board.has_pending() {
                continue;
            }
            if !done && !board.is_ready(&self.context.processing.threshold) {
                continue;
            }
            let Some(mut decode_state) = board.try_lock_decode() else {
                continue;
            };
            let Some(drained) = board.try_drain() else {
                continue;
            };
            let blocks = drained.blocks.len();
            let decoded = decode_batch(drained, &mut decode_state, &self.context.processing);
            drop(decode_state);

            let counters = &self.context.counters;
            PipelineCounters::add(&counters.events, decoded.records);
            PipelineCounters::add(&counters.occurrences, decoded.occurrences.len() as u64);
            PipelineCounters::add(&counters.clock_anomalies, decoded.clock_anomalies);
            if decoded.anomalies > 0 {
                PipelineCounters::add(&counters.decode_anomalies, decoded.anomalies);
                counters.note_anomaly(ErrorKind::DecodeAnomaly);
                warn!(
                    worker = self.index,
                    board = board.id(),
                    anomalies = decoded.anomalies,
                    kind = %ErrorKind::DecodeAnomaly,
                    "Skipped undecodable regions"
                );
            }
            debug!(
                worker = self.index,
                board = board.id(),
                blocks,
                records = decoded.records,
                occurrences = decoded.occurrences.len(),
                "Decoded batch"
            );

            self.batch.extend(decoded.occurrences);
            worked = true;
            if self.batch.len() > self.context.processing.min_insert_size {
                self.flush();
            }
        }
        worked
    }

    /// Hand the accumulated batch to the sink, applying the error policy.
    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let retries = match self.context.processing.sink_error_policy {
            SinkErrorPolicy::Drop => 0,
            SinkErrorPolicy::Retry(n) => n,
        };
        let counters = &self.context.counters;
        let mut batch = std::mem::take(&mut self.batch);
        let mut attempt = 0;
        loop {
            match self.context.sink.insert_batch(self.handle, batch) {
                Ok(()) => {
                    PipelineCounters::add(&counters.batches_flushed, 1);
                    return;
                }
                Err(InsertError { source, batch: returned }) => {
                    if attempt >= retries {
                        error!(
                            worker = self.index,
                            occurrences = returned.len(),
                            attempts = attempt + 1,
                            error = %source,
                            "Dropping batch"
                        );
                        PipelineCounters::add(&counters.dropped_batches, 1);
                        PipelineCounters::add(&counters.dropped_occurrences, returned.len() as u64);
                        counters.raise(ErrorKind::Sink);
                        return;
                    }
                    attempt += 1;
                    PipelineCounters::add(&counters.sink_retries, 1);
                    warn!(worker = self.index, attempt, error = %source, "Insert failed, retrying");
                    thread::sleep(RETRY_BACKOFF * attempt);
                    batch = returned;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_board::{ScriptedBus, V1724};
    use daq_core::{BoardConfig, FileSinkConfig, ProcessingMode, ReadoutConfig, SinkConfig};
    use daq_decoder::synth::LegacyEvent;

    fn board(id: u32) -> (Arc<BoardInterface>, ScriptedBus) {
        let bus = ScriptedBus::new();
        let config = BoardConfig::digitizer(id);
        let iface = BoardInterface::new(
            id,
            Box::new(V1724::new(&config, Box::new(bus.clone()))),
            &ReadoutConfig::default(),
        );
        (Arc::new(iface), bus)
    }

    fn context(boards: Vec<Arc<BoardInterface>>, sink: Sink, processing: ProcessingConfig) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            boards: Arc::from(boards),
            sink: Arc::new(sink),
            processing,
            readout_done: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(PipelineCounters::default()),
        })
    }

    #[test]
    fn test_workers_drain_everything_after_readout() {
        let (a, bus_a) = board(1);
        let (b, bus_b) = board(2);
        for i in 0..4u32 {
            bus_a.push_words(&LegacyEvent::uniform(0xFF, i, i * 10, 4).encode());
            bus_b.push_words(&LegacyEvent::uniform(0x0F, i, i * 10, 4).encode());
            a.read_cycle().unwrap();
            b.read_cycle().unwrap();
        }
        let sink = Sink::from_config(&SinkConfig::None);
        let processing = ProcessingConfig {
            workers: 3,
            idle_grace: Duration::from_millis(20),
            ..ProcessingConfig::default()
        };
        let ctx = context(vec![a, b], sink, processing);
        WorkerPool::spawn(Arc::clone(&ctx)).unwrap().join();

        assert_eq!(PipelineCounters::get(&ctx.counters.events), 8);
        assert_eq!(PipelineCounters::get(&ctx.counters.occurrences), 4 * 8 + 4 * 4);
        assert_eq!(ctx.sink.stats().occurrences, 48);
        assert!(ctx.counters.worker_error().is_none());
    }

    #[test]
    fn test_retry_then_drop_records_sink_error() {
        let (a, bus) = board(1);
        bus.push_words(&LegacyEvent::uniform(0x1, 0, 0, 4).encode());
        a.read_cycle().unwrap();

        // Writing into a path occupied by a file fails every time.
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let sink = Sink::from_config(&SinkConfig::File(FileSinkConfig {
            directory: blocked.join("sub"),
            prefix: "x".into(),
            max_file_bytes: 1 << 20,
        }));
        let processing = ProcessingConfig {
            workers: 1,
            mode: ProcessingMode::BlockSplit,
            sink_error_policy: SinkErrorPolicy::Retry(2),
            idle_grace: Duration::from_millis(10),
            ..ProcessingConfig::default()
        };
        let ctx = context(vec![a], sink, processing);
        WorkerPool::spawn(Arc::clone(&ctx)).unwrap().join();

        assert_eq!(PipelineCounters::get(&ctx.counters.sink_retries), 2);
        assert_eq!(PipelineCounters::get(&ctx.counters.dropped_batches), 1);
        assert_eq!(ctx.counters.worker_error(), Some(ErrorKind::Sink));
        assert_eq!(ctx.sink.stats().failed_batches, 3);
    }
}
