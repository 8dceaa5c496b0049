//! Run orchestration.
//!
//! `BoardManager` owns the board interfaces, the sink and the pipeline
//! threads, and walks them through the run lifecycle:
//!
//! ```text
//! Uninitialized --initialize--> Initialized --arm--> Armed --start--> Running
//!       ^                            ^                                  |
//!       +----------close-------------+---------------stop---------------+
//! ```
//!
//! A stopped run returns to `Initialized`; every run is armed afresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use daq_board::{
    open_controller, open_digitizer, BoardInterface, BoardStats, BusFactory, Calibration,
    CrateController,
};
use daq_core::{BoardConfig, DaqError, DaqResult, ErrorKind, RunConfig, SinkConfig};
use daq_recorder::{Recorder, Sink, SinkError, SinkStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::command::{Command, CommandResponse};
use crate::counters::{PipelineCounters, Rate, RateCounters, RateMeter};
use crate::read_loop::ReadLoop;
use crate::worker::{WorkerContext, WorkerPool};

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// No boards open.
    Uninitialized,
    /// Boards and sink open.
    Initialized,
    /// Boards programmed and ready.
    Armed,
    /// Acquisition and pipeline running.
    Running,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Uninitialized => write!(f, "uninitialized"),
            RunState::Initialized => write!(f, "initialized"),
            RunState::Armed => write!(f, "armed"),
            RunState::Running => write!(f, "running"),
        }
    }
}

/// Snapshot of the current or last run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    /// Manager state when the snapshot was taken.
    pub state: RunState,
    /// Bytes read.
    pub bytes: u64,
    /// Read cycles that returned data.
    pub read_cycles: u64,
    /// Trigger records decoded.
    pub events: u64,
    /// Occurrences produced.
    pub occurrences: u64,
    /// Regions skipped by the decoders.
    pub decode_anomalies: u64,
    /// Backward time steps.
    pub clock_anomalies: u64,
    /// Batches recorded.
    pub batches_flushed: u64,
    /// Retried inserts.
    pub sink_retries: u64,
    /// Batches given up on.
    pub dropped_batches: u64,
    /// Occurrences in those batches.
    pub dropped_occurrences: u64,
    /// Failed transfers.
    pub bus_errors: u64,
    /// Blocks rejected as too short.
    pub malformed_blocks: u64,
    /// Per-board counters.
    pub boards: Vec<BoardStats>,
    /// Sink counters, if a sink is open.
    pub sink: Option<SinkStats>,
}

/// Boards and sink opened by `initialize`.
struct Session {
    config: RunConfig,
    boards: Arc<[Arc<BoardInterface>]>,
    controller: Option<Box<dyn CrateController>>,
    sink: Arc<Sink>,
}

/// Threads of a running acquisition.
struct ActiveRun {
    read_loop: ReadLoop,
    workers: WorkerPool,
}

/// Drives boards, pipeline and sink through a run.
pub struct BoardManager {
    factory: Arc<dyn BusFactory>,
    state: RunState,
    session: Option<Session>,
    active: Option<ActiveRun>,
    rate: Arc<Mutex<RateCounters>>,
    meter: RateMeter,
    counters: Arc<PipelineCounters>,
    readout_done: Arc<AtomicBool>,
}

fn state_error(action: &str, state: RunState) -> DaqError {
    DaqError::State(format!("cannot {}: manager is {}", action, state))
}

fn sink_error(err: SinkError) -> DaqError {
    DaqError::Sink(err.to_string())
}

impl BoardManager {
    /// `factory` is used when an `Arm` command arrives before `initialize`.
    pub fn new(factory: Arc<dyn BusFactory>) -> Self {
        Self {
            factory,
            state: RunState::Uninitialized,
            session: None,
            active: None,
            rate: Arc::new(Mutex::new(RateCounters::default())),
            meter: RateMeter::default(),
            counters: Arc::new(PipelineCounters::default()),
            readout_done: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Board interfaces in configuration order. Empty until initialized.
    pub fn boards(&self) -> &[Arc<BoardInterface>] {
        match &self.session {
            Some(session) => &session.boards[..],
            None => &[],
        }
    }

    /// The open sink, if initialized.
    pub fn sink(&self) -> Option<&Arc<Sink>> {
        self.session.as_ref().map(|s| &s.sink)
    }

    /// Open every board and the sink.
    ///
    /// Fails without side effects if any bus handle cannot be opened or the
    /// sink cannot be prepared.
    pub fn initialize(&mut self, config: &RunConfig, factory: &dyn BusFactory) -> DaqResult<()> {
        if self.state != RunState::Uninitialized {
            return Err(state_error("initialize", self.state));
        }
        config.validate()?;

        let mut boards = Vec::new();
        for board in config.digitizers() {
            let digitizer = open_digitizer(board, factory).map_err(|e| DaqError::TransientBus {
                board: board.id,
                message: e.to_string(),
            })?;
            boards.push(Arc::new(BoardInterface::new(board.id, digitizer, &config.readout)));
        }
        let controller = match config.controller() {
            Some(board) => Some(open_controller(board, factory).map_err(|e| {
                DaqError::TransientBus {
                    board: board.id,
                    message: e.to_string(),
                }
            })?),
            None => None,
        };

        let sink = Sink::from_config(&config.sink);
        sink.initialize().map_err(sink_error)?;

        info!(
            run = %config.run_name,
            boards = boards.len(),
            controller = controller.is_some(),
            sink = sink.kind(),
            "Manager initialized"
        );
        self.session = Some(Session {
            config: config.clone(),
            boards: Arc::from(boards),
            controller,
            sink: Arc::new(sink),
        });
        self.state = RunState::Initialized;
        Ok(())
    }

    /// Program every board, load calibrations and configure the controller.
    ///
    /// The set of digitizers must match the one given to `initialize`. A
    /// changed sink section replaces the sink.
    pub fn arm(&mut self, config: &RunConfig) -> DaqResult<()> {
        if !matches!(self.state, RunState::Initialized | RunState::Armed) {
            return Err(state_error("arm", self.state));
        }
        config.validate()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| state_error("arm", RunState::Uninitialized))?;

        let wanted: Vec<u32> = config.digitizers().map(|b| b.id).collect();
        let opened: Vec<u32> = session.boards.iter().map(|b| b.id()).collect();
        if wanted != opened {
            return Err(DaqError::Configuration(format!(
                "board set changed from {:?} to {:?}; sleep before re-arming",
                opened, wanted
            )));
        }

        for (iface, board) in session.boards.iter().zip(config.digitizers()) {
            let calibration = load_calibration(board)?;
            iface.arm(board, calibration.as_ref())?;
        }
        if let (Some(controller), Some(board)) = (session.controller.as_mut(), config.controller()) {
            controller.configure(board).map_err(|e| DaqError::TransientBus {
                board: board.id,
                message: e.to_string(),
            })?;
        }

        if config.sink != session.config.sink {
            if let Err(err) = session.sink.shutdown() {
                warn!(error = %err, "Old sink did not shut down cleanly");
            }
            let sink = Sink::from_config(&config.sink);
            sink.initialize().map_err(sink_error)?;
            info!(sink = sink.kind(), "Sink replaced");
            session.sink = Arc::new(sink);
        }

        session.config = config.clone();
        self.state = RunState::Armed;
        info!(run = %config.run_name, boards = wanted.len(), "Boards armed");
        Ok(())
    }

    /// Start the pipeline threads, then acquisition.
    pub fn start(&mut self) -> DaqResult<()> {
        if self.state != RunState::Armed {
            return Err(state_error("start", self.state));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(state_error("start", RunState::Uninitialized));
        };

        self.counters.reset();
        *self.rate.lock() = RateCounters::default();
        self.meter = RateMeter::default();
        self.readout_done.store(false, Ordering::SeqCst);
        for board in session.boards.iter() {
            board.reset_clocks();
            board.activate();
        }
        session.sink.initialize().map_err(sink_error)?;

        let read_loop = ReadLoop::spawn(
            Arc::clone(&session.boards),
            session.config.readout.inter_board_yield,
            Arc::clone(&self.rate),
            Arc::clone(&self.counters),
            Arc::clone(&self.readout_done),
        )?;
        let workers = WorkerPool::spawn(Arc::new(WorkerContext {
            boards: Arc::clone(&session.boards),
            sink: Arc::clone(&session.sink),
            processing: session.config.processing.clone(),
            readout_done: Arc::clone(&self.readout_done),
            counters: Arc::clone(&self.counters),
        }));
        let workers = match workers {
            Ok(workers) => workers,
            Err(err) => {
                for board in session.boards.iter() {
                    board.deactivate();
                }
                read_loop.join();
                return Err(err);
            }
        };
        let started = start_acquisition(session);
        let run_name = session.config.run_name.clone();
        self.active = Some(ActiveRun { read_loop, workers });
        if let Err(err) = started {
            error!(error = %err, "Acquisition did not start, tearing down");
            self.drain_pipeline();
            return Err(err);
        }

        self.state = RunState::Running;
        info!(run = %run_name, "Run started");
        Ok(())
    }

    /// Stop acquisition and drain everything already read.
    ///
    /// Blocks until the read loop had its final read, every worker flushed,
    /// and the sink shut down.
    pub fn stop(&mut self) -> DaqResult<()> {
        if self.state != RunState::Running {
            return Err(state_error("stop", self.state));
        }
        let result = match self.session.as_mut() {
            Some(session) => stop_acquisition(session),
            None => Ok(()),
        };
        if let Err(err) = &result {
            warn!(error = %err, "Stopping acquisition failed, draining anyway");
        }
        self.drain_pipeline();
        self.state = RunState::Initialized;

        let stats = self.stats();
        info!(
            events = stats.events,
            occurrences = stats.occurrences,
            bytes = stats.bytes,
            dropped_batches = stats.dropped_batches,
            "Run stopped"
        );
        result
    }

    /// Deactivate boards, join the pipeline and shut the sink down.
    fn drain_pipeline(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        for board in session.boards.iter() {
            board.deactivate();
        }
        if let Some(active) = self.active.take() {
            active.read_loop.join();
            debug!("Read loop joined");
            active.workers.join();
            debug!("Workers joined");
        }
        if let Err(err) = session.sink.shutdown() {
            error!(error = %err, "Sink shutdown failed");
            self.counters.raise(ErrorKind::Sink);
        }
    }

    /// Release bus handles and the sink.
    pub fn close(&mut self) -> DaqResult<()> {
        if self.state == RunState::Running {
            return Err(state_error("close", self.state));
        }
        if let Some(session) = self.session.take() {
            if let Err(err) = session.sink.shutdown() {
                warn!(error = %err, "Sink shutdown on close failed");
            }
            info!(boards = session.boards.len(), "Boards released");
        }
        self.state = RunState::Uninitialized;
        Ok(())
    }

    /// Throughput since the previous call.
    pub fn rate(&mut self) -> Rate {
        let bytes = self.rate.lock().bytes;
        let events = PipelineCounters::get(&self.counters.events);
        self.meter.sample(bytes, events)
    }

    /// First error that should concern the operator: a board flagged fatal
    /// corruption, otherwise whatever a worker raised, otherwise a decode
    /// anomaly seen during the run.
    pub fn run_error(&self) -> Option<ErrorKind> {
        self.boards()
            .iter()
            .find_map(|b| b.fatal_error())
            .or_else(|| self.counters.worker_error())
            .or_else(|| self.counters.anomaly())
    }

    /// Counters of the current or last run.
    pub fn stats(&self) -> RunStats {
        let rate = *self.rate.lock();
        let c = &self.counters;
        RunStats {
            state: self.state,
            bytes: rate.bytes,
            read_cycles: rate.read_cycles,
            events: PipelineCounters::get(&c.events),
            occurrences: PipelineCounters::get(&c.occurrences),
            decode_anomalies: PipelineCounters::get(&c.decode_anomalies),
            clock_anomalies: PipelineCounters::get(&c.clock_anomalies),
            batches_flushed: PipelineCounters::get(&c.batches_flushed),
            sink_retries: PipelineCounters::get(&c.sink_retries),
            dropped_batches: PipelineCounters::get(&c.dropped_batches),
            dropped_occurrences: PipelineCounters::get(&c.dropped_occurrences),
            bus_errors: PipelineCounters::get(&c.bus_errors),
            malformed_blocks: PipelineCounters::get(&c.malformed_blocks),
            boards: self.boards().iter().map(|b| b.stats()).collect(),
            sink: self.sink().map(|s| s.stats()),
        }
    }

    /// Point the sink at a new target; takes effect on the next insert.
    pub fn update_sink_target(&mut self, config: &SinkConfig) -> DaqResult<()> {
        let state = self.state;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| state_error("update sink target", state))?;
        session.sink.update_target(config).map_err(sink_error)?;
        session.config.sink = config.clone();
        Ok(())
    }

    /// Apply one control command.
    pub fn handle(&mut self, command: Command) -> CommandResponse {
        let name = command.name();
        let result = match command {
            Command::Arm(config) => self.handle_arm(&config),
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Sleep => self.handle_sleep(),
            Command::UpdateSinkTarget(config) => self.update_sink_target(&config),
        };
        match result {
            Ok(()) => {
                debug!(command = name, state = %self.state, "Command accepted");
                CommandResponse::ok(self.state, format!("{} ok", name))
            }
            Err(err) => {
                warn!(command = name, state = %self.state, error = %err, "Command rejected");
                CommandResponse::rejected(self.state, err.kind(), err.to_string())
            }
        }
    }

    fn handle_arm(&mut self, config: &RunConfig) -> DaqResult<()> {
        if self.state == RunState::Uninitialized {
            let factory = Arc::clone(&self.factory);
            self.initialize(config, factory.as_ref())?;
        }
        self.arm(config)
    }

    fn handle_sleep(&mut self) -> DaqResult<()> {
        let stopped = if self.state == RunState::Running {
            self.stop()
        } else {
            Ok(())
        };
        self.close()?;
        stopped
    }
}

impl Drop for BoardManager {
    fn drop(&mut self) {
        if self.state == RunState::Running {
            warn!("Manager dropped while running, stopping");
            if let Err(err) = self.stop() {
                error!(error = %err, "Stop on drop failed");
            }
        }
    }
}

fn load_calibration(board: &BoardConfig) -> DaqResult<Option<Calibration>> {
    let Some(path) = &board.calibration_file else {
        return Ok(None);
    };
    let calibration = Calibration::load(path).map_err(|e| {
        DaqError::Configuration(format!(
            "board {}: calibration file {}: {}",
            board.id,
            path.display(),
            e
        ))
    })?;
    debug!(board = board.id, stamp = calibration.stamp, "Loaded calibration");
    Ok(Some(calibration))
}

fn start_acquisition(session: &mut Session) -> DaqResult<()> {
    match session.controller.as_mut() {
        Some(controller) => controller.start_run().map_err(|e| DaqError::TransientBus {
            board: controller.id(),
            message: e.to_string(),
        }),
        None => {
            for board in session.boards.iter() {
                board.start_acquisition()?;
            }
            Ok(())
        }
    }
}

/// Stop every board even if one fails; report the first failure.
fn stop_acquisition(session: &mut Session) -> DaqResult<()> {
    match session.controller.as_mut() {
        Some(controller) => controller.stop_run().map_err(|e| DaqError::TransientBus {
            board: controller.id(),
            message: e.to_string(),
        }),
        None => {
            let mut first = None;
            for board in session.boards.iter() {
                if let Err(err) = board.stop_acquisition() {
                    first.get_or_insert(err);
                }
            }
            first.map_or(Ok(()), Err)
        }
    }
}
