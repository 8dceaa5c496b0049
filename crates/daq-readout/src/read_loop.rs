//! The single thread that polls every board.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use daq_board::BoardInterface;
use daq_core::{DaqError, DaqResult, ErrorKind};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::counters::{PipelineCounters, RateCounters};

/// Handle to the running read thread.
pub struct ReadLoop {
    handle: JoinHandle<()>,
}

impl ReadLoop {
    /// Start polling `boards` round-robin.
    ///
    /// Each board is read while active and exactly once more after it was
    /// deactivated. Once every board had its final read, `readout_done` is
    /// raised and the thread exits.
    pub fn spawn(
        boards: Arc<[Arc<BoardInterface>]>,
        inter_board_yield: Duration,
        rate: Arc<Mutex<RateCounters>>,
        counters: Arc<PipelineCounters>,
        readout_done: Arc<AtomicBool>,
    ) -> DaqResult<Self> {
        let handle = thread::Builder::new()
            .name("readout".into())
            .spawn(move || {
                run(&boards, inter_board_yield, &rate, &counters);
                readout_done.store(true, Ordering::SeqCst);
                info!("Read loop finished");
            })
            .map_err(DaqError::Io)?;
        Ok(Self { handle })
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread; a panic is logged.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("Read thread panicked");
        }
    }
}

fn run(
    boards: &[Arc<BoardInterface>],
    inter_board_yield: Duration,
    rate: &Mutex<RateCounters>,
    counters: &PipelineCounters,
) {
    let mut flushed = vec![false; boards.len()];
    debug!(boards = boards.len(), "Read loop started");
    while flushed.iter().any(|done| !done) {
        for (board, flushed) in boards.iter().zip(flushed.iter_mut()) {
            if *flushed {
                continue;
            }
            if !board.is_active() {
                *flushed = true;
                debug!(board = board.id(), "Final read of deactivated board");
            }
            read_once(board, rate, counters);
            thread::sleep(inter_board_yield);
        }
    }
}

fn read_once(board: &BoardInterface, rate: &Mutex<RateCounters>, counters: &PipelineCounters) {
    match board.read_cycle() {
        Ok(bytes) => rate.lock().record(bytes),
        Err(err) => {
            rate.lock().record(0);
            match err.kind() {
                ErrorKind::TransientBus => PipelineCounters::add(&counters.bus_errors, 1),
                ErrorKind::MalformedBlock | ErrorKind::FatalCorruption => {
                    PipelineCounters::add(&counters.malformed_blocks, 1)
                }
                _ => {}
            }
            trace!(board = board.id(), error = %err, "Read cycle failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_board::{ScriptedBus, V1724};
    use daq_core::{BoardConfig, ReadoutConfig};

    #[test]
    fn test_inactive_boards_get_one_final_read() {
        let bus = ScriptedBus::new();
        for _ in 0..3 {
            bus.push_block(100, 0);
        }
        let config = BoardConfig::digitizer(1);
        let board = Arc::new(BoardInterface::new(
            1,
            Box::new(V1724::new(&config, Box::new(bus.clone()))),
            &ReadoutConfig::default(),
        ));
        let boards: Arc<[Arc<BoardInterface>]> = Arc::from(vec![Arc::clone(&board)]);
        let rate = Arc::new(Mutex::new(RateCounters::default()));
        let done = Arc::new(AtomicBool::new(false));

        ReadLoop::spawn(
            boards,
            Duration::ZERO,
            Arc::clone(&rate),
            Arc::new(PipelineCounters::default()),
            Arc::clone(&done),
        )
        .unwrap()
        .join();

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(rate.lock().read_cycles, 1);
        assert_eq!(board.occupancy().pending_block_count, 1);
        assert_eq!(bus.pending_reads(), 2);
    }

    #[test]
    fn test_active_board_is_polled_until_deactivated() {
        let bus = ScriptedBus::new();
        let config = BoardConfig::digitizer(1);
        let board = Arc::new(BoardInterface::new(
            1,
            Box::new(V1724::new(&config, Box::new(bus.clone()))),
            &ReadoutConfig::default(),
        ));
        board.activate();
        let rate = Arc::new(Mutex::new(RateCounters::default()));
        let counters = Arc::new(PipelineCounters::default());
        let done = Arc::new(AtomicBool::new(false));
        let read_loop = ReadLoop::spawn(
            Arc::from(vec![Arc::clone(&board)]),
            Duration::from_micros(50),
            Arc::clone(&rate),
            Arc::clone(&counters),
            Arc::clone(&done),
        )
        .unwrap();

        bus.push_block(200, 1);
        bus.push_block(5, 1);
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        board.deactivate();
        read_loop.join();

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(rate.lock().bytes, 200);
        assert_eq!(PipelineCounters::get(&counters.malformed_blocks), 1);
        assert_eq!(board.bad_block_count(), 1);
    }
}
