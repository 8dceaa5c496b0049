//! Per-board buffering between the read thread and the workers.
//!
//! The read thread moves whole transfers into the pending queue with
//! [`BoardInterface::read_cycle`]; a worker takes the entire queue at once with
//! [`BoardInterface::try_drain`]. The two sides share only the queue mutex, and
//! the bus transfer itself happens before that mutex is taken. Occupancy is
//! mirrored in atomics so readiness can be polled without locking.
//!
//! Per-channel clock state lives behind a second mutex, [`DecodeState`]. A
//! worker holds it from drain until its batch is decoded, which keeps batches
//! of one board in enqueue order even with several workers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use daq_core::{
    BoardConfig, ClockState, ClockStep, DaqError, DaqResult, ErrorKind, RawBlock, ReadoutConfig,
    ReadoutThreshold,
};
use daq_decoder::{header_times, CHANNELS};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::bus::BusError;
use crate::calibration::Calibration;
use crate::digitizer::Digitizer;

/// Smallest transfer that can hold a record: header plus two data words.
pub const MIN_BLOCK_BYTES: usize = 24;

/// Bad blocks tolerated before the board is flagged corrupt.
pub const BAD_BLOCK_CEILING: u64 = 10_000;

/// Malformed blocks are logged once per this many.
pub const BAD_BLOCK_LOG_INTERVAL: u64 = 1000;

/// How long arming waits for the board to report ready.
pub const ARM_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Pending data of one board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferOccupancy {
    /// Blocks enqueued since the last drain.
    pub pending_block_count: usize,
    /// Their total size in bytes.
    pub pending_byte_total: usize,
}

/// Whether the read loop keeps polling the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// Skipped by the read loop.
    Idle,
    /// Polled every round.
    Activated,
}

/// Everything pending on a board at the time of a drain.
#[derive(Debug)]
pub struct DrainedBatch {
    /// Board the blocks came from.
    pub board: u32,
    /// Blocks in enqueue order.
    pub blocks: Vec<RawBlock>,
    /// Board rollover count as of the first record of the batch.
    pub rollover_at_start: u32,
    /// Raw time of the first record of the batch.
    pub header_time: u32,
}

impl DrainedBatch {
    /// Board clock positioned at the first record of the batch.
    pub fn start_clock(&self) -> ClockState {
        ClockState::seeded(self.rollover_at_start, self.header_time)
    }
}

/// Per-channel clocks, owned by whichever worker is decoding the board.
#[derive(Debug, Default)]
pub struct DecodeState {
    channels: [ClockState; CHANNELS as usize],
}

impl DecodeState {
    /// Clock of `channel`, set to `seed` on its first use.
    ///
    /// Workers pass the board clock as of the batch start, see
    /// [`DrainedBatch::start_clock`].
    pub fn channel_clock(&mut self, channel: u8, seed: ClockState) -> &mut ClockState {
        let clock = &mut self.channels[usize::from(channel) % CHANNELS as usize];
        if !clock.has_observed() {
            *clock = seed;
        }
        clock
    }

    /// Forget every channel's history, for a new run.
    pub fn reset(&mut self) {
        self.channels = Default::default();
    }
}

/// Counters of one board since arming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardStats {
    /// Board id.
    pub board: u32,
    /// Read cycles that returned data.
    pub read_cycles: u64,
    /// Blocks enqueued.
    pub blocks: u64,
    /// Bytes enqueued.
    pub bytes: u64,
    /// Failed transfers.
    pub bus_errors: u64,
    /// Blocks rejected as too short.
    pub bad_blocks: u64,
    /// Pending data when the stats were taken.
    pub occupancy: BufferOccupancy,
}

struct BusSide {
    digitizer: Box<dyn Digitizer>,
    scratch: Vec<u8>,
}

#[derive(Default)]
struct PendingQueue {
    blocks: Vec<RawBlock>,
    clock: ClockState,
}

/// One digitizer as seen by the read loop and the workers.
pub struct BoardInterface {
    id: u32,
    readout: ReadoutConfig,
    bus: Mutex<BusSide>,
    queue: Mutex<PendingQueue>,
    decode: Mutex<DecodeState>,
    active: AtomicBool,
    fatal: AtomicBool,
    pending_blocks: AtomicUsize,
    pending_bytes: AtomicUsize,
    epoch: Instant,
    last_drain_us: AtomicU64,
    read_cycles: AtomicU64,
    blocks: AtomicU64,
    bytes: AtomicU64,
    bus_errors: AtomicU64,
    bad_blocks: AtomicU64,
}

impl BoardInterface {
    /// Idle interface with an empty queue and fresh clocks.
    pub fn new(id: u32, digitizer: Box<dyn Digitizer>, readout: &ReadoutConfig) -> Self {
        Self {
            id,
            readout: readout.clone(),
            bus: Mutex::new(BusSide {
                digitizer,
                scratch: vec![0; readout.blt_size],
            }),
            queue: Mutex::new(PendingQueue::default()),
            decode: Mutex::new(DecodeState::default()),
            active: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            pending_blocks: AtomicUsize::new(0),
            pending_bytes: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_drain_us: AtomicU64::new(0),
            read_cycles: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            bus_errors: AtomicU64::new(0),
            bad_blocks: AtomicU64::new(0),
        }
    }

    /// Board id.
    pub fn id(&self) -> u32 {
        self.id
    }

    fn bus_error(&self, err: BusError) -> DaqError {
        DaqError::TransientBus {
            board: self.id,
            message: err.to_string(),
        }
    }

    /// Reset and program the board, load its DC offsets and wait until it
    /// reports ready. Clears pending data, counters and clocks.
    pub fn arm(&self, config: &BoardConfig, calibration: Option<&Calibration>) -> DaqResult<()> {
        {
            let mut bus = self.bus.lock();
            let board = &mut bus.digitizer;
            board.reset().map_err(|e| self.bus_error(e))?;
            board.program(config).map_err(|e| self.bus_error(e))?;
            if let Some(cal) = calibration {
                board.set_dac_offsets(&cal.dac).map_err(|e| self.bus_error(e))?;
            }
            board
                .wait_ready(ARM_READY_TIMEOUT)
                .map_err(|e| self.bus_error(e))?;
        }

        self.queue.lock().blocks.clear();
        self.pending_blocks.store(0, Ordering::SeqCst);
        self.pending_bytes.store(0, Ordering::SeqCst);
        for counter in [
            &self.read_cycles,
            &self.blocks,
            &self.bytes,
            &self.bus_errors,
            &self.bad_blocks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.fatal.store(false, Ordering::SeqCst);
        self.reset_clocks();
        debug!(board = self.id, calibrated = calibration.is_some(), "Board armed");
        Ok(())
    }

    /// Forget all clock history, board and channels.
    pub fn reset_clocks(&self) {
        self.queue.lock().clock.reset();
        self.decode.lock().reset();
        self.stamp_drain();
    }

    /// Set the board's run bit.
    pub fn start_acquisition(&self) -> DaqResult<()> {
        self.bus
            .lock()
            .digitizer
            .start_acquisition()
            .map_err(|e| self.bus_error(e))
    }

    /// Clear the board's run bit.
    pub fn stop_acquisition(&self) -> DaqResult<()> {
        self.bus
            .lock()
            .digitizer
            .stop_acquisition()
            .map_err(|e| self.bus_error(e))
    }

    /// Include the board in the read loop.
    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Stop polling after the next read of this board.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether the read loop polls the board.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Activation as an [`InterfaceState`].
    pub fn state(&self) -> InterfaceState {
        if self.is_active() {
            InterfaceState::Activated
        } else {
            InterfaceState::Idle
        }
    }

    /// Read everything the board has, up to `max_blts` transfers, and queue it
    /// as one block.
    ///
    /// Returns the number of bytes queued. A bus failure discards the partial
    /// transfer; a transfer too short to hold a record is discarded and
    /// counted as a bad block.
    pub fn read_cycle(&self) -> DaqResult<usize> {
        self.read_cycles.fetch_add(1, Ordering::Relaxed);
        let transfer = {
            let mut guard = self.bus.lock();
            let bus = &mut *guard;
            let mut transfer = Vec::new();
            for _ in 0..self.readout.max_blts {
                match bus.digitizer.read_block(&mut bus.scratch) {
                    Ok(read) => {
                        let n = read.bytes.min(bus.scratch.len());
                        transfer.extend_from_slice(&bus.scratch[..n]);
                        if read.is_last() {
                            break;
                        }
                    }
                    Err(err) => {
                        self.bus_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            board = self.id,
                            discarded = transfer.len(),
                            error = %err,
                            "Bus read failed, discarding transfer"
                        );
                        return Err(self.bus_error(err));
                    }
                }
            }
            transfer
        };

        let bytes = transfer.len();
        if bytes == 0 {
            return Ok(0);
        }
        if bytes < MIN_BLOCK_BYTES {
            return Err(self.reject_block(bytes));
        }

        {
            let mut queue = self.queue.lock();
            queue.blocks.push(RawBlock::new(transfer));
            self.pending_blocks.fetch_add(1, Ordering::SeqCst);
            self.pending_bytes.fetch_add(bytes, Ordering::SeqCst);
        }
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        trace!(board = self.id, bytes, "Queued block");
        Ok(bytes)
    }

    fn reject_block(&self, bytes: usize) -> DaqError {
        let count = self.bad_blocks.fetch_add(1, Ordering::SeqCst) + 1;
        if count % BAD_BLOCK_LOG_INTERVAL == 1 {
            warn!(board = self.id, bytes, bad_blocks = count, "Discarding malformed block");
        }
        if count > BAD_BLOCK_CEILING {
            if !self.fatal.swap(true, Ordering::SeqCst) {
                error!(
                    board = self.id,
                    bad_blocks = count,
                    "Bad block ceiling exceeded, board data considered corrupt"
                );
            }
            return DaqError::FatalCorruption {
                board: self.id,
                count,
            };
        }
        DaqError::MalformedBlock {
            board: self.id,
            bytes,
        }
    }

    /// Occupancy without taking the queue mutex.
    pub fn occupancy(&self) -> BufferOccupancy {
        BufferOccupancy {
            pending_block_count: self.pending_blocks.load(Ordering::SeqCst),
            pending_byte_total: self.pending_bytes.load(Ordering::SeqCst),
        }
    }

    /// Any block waiting for a worker.
    pub fn has_pending(&self) -> bool {
        self.pending_blocks.load(Ordering::SeqCst) > 0
    }

    /// Time since the queue was last drained or reset.
    pub fn since_last_drain(&self) -> Duration {
        let now = self.epoch.elapsed().as_micros() as u64;
        Duration::from_micros(now.saturating_sub(self.last_drain_us.load(Ordering::SeqCst)))
    }

    fn stamp_drain(&self) {
        self.last_drain_us
            .store(self.epoch.elapsed().as_micros() as u64, Ordering::SeqCst);
    }

    /// Enough blocks are queued, or the board has waited long enough.
    pub fn is_ready(&self, threshold: &ReadoutThreshold) -> bool {
        self.pending_blocks.load(Ordering::SeqCst) > threshold.blocks
            || self.since_last_drain() > threshold.interval
    }

    /// Exclusive access to the per-channel clocks, if no other worker has it.
    pub fn try_lock_decode(&self) -> Option<MutexGuard<'_, DecodeState>> {
        self.decode.try_lock()
    }

    /// Take every pending block, if the queue is free and non-empty.
    ///
    /// Every record time of every block is fed through the board clock in
    /// order, and the clock state as of the batch's first record is returned
    /// with the blocks.
    pub fn try_drain(&self) -> Option<DrainedBatch> {
        let mut queue = self.queue.try_lock()?;
        if queue.blocks.is_empty() {
            return None;
        }
        let blocks = std::mem::take(&mut queue.blocks);
        self.pending_blocks.store(0, Ordering::SeqCst);
        self.pending_bytes.store(0, Ordering::SeqCst);
        self.stamp_drain();

        let mut start = None;
        for time in blocks.iter().flat_map(header_times) {
            match queue.clock.observe(time) {
                ClockStep::Rollover => debug!(
                    board = self.id,
                    rollovers = queue.clock.rollover_count(),
                    "Board clock rolled over"
                ),
                ClockStep::Backward { by } => warn!(
                    board = self.id,
                    by,
                    kind = %ErrorKind::ClockAnomaly,
                    "Board clock moved backwards"
                ),
                ClockStep::Forward => {}
            }
            if start.is_none() {
                start = Some((queue.clock.rollover_count(), time));
            }
        }
        let (rollover_at_start, header_time) =
            start.unwrap_or((queue.clock.rollover_count(), queue.clock.last_hw_time()));
        drop(queue);

        Some(DrainedBatch {
            board: self.id,
            blocks,
            rollover_at_start,
            header_time,
        })
    }

    /// `FatalCorruption` once the bad-block ceiling was crossed.
    pub fn fatal_error(&self) -> Option<ErrorKind> {
        self.fatal
            .load(Ordering::SeqCst)
            .then_some(ErrorKind::FatalCorruption)
    }

    /// Blocks rejected since arming.
    pub fn bad_block_count(&self) -> u64 {
        self.bad_blocks.load(Ordering::SeqCst)
    }

    /// Snapshot of the board counters.
    pub fn stats(&self) -> BoardStats {
        BoardStats {
            board: self.id,
            read_cycles: self.read_cycles.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            bus_errors: self.bus_errors.load(Ordering::Relaxed),
            bad_blocks: self.bad_block_count(),
            occupancy: self.occupancy(),
        }
    }
}
