//! Error types shared by every crate of the readout stack.
//!
//! `DaqError` is the primary error type. Each variant maps onto one
//! [`ErrorKind`], the coarse taxonomy the run orchestrator reasons about:
//!
//! - **`TransientBus`**: a bus read returned a hard failure. The read cycle is
//!   aborted, the board stays active and is retried on the next cycle.
//! - **`MalformedBlock`**: a non-empty block shorter than the minimum sane size.
//!   The block is discarded and counted.
//! - **`FatalCorruption`**: the bad-block counter of a board crossed its ceiling.
//!   A board-level flag is raised; acting on it is up to the orchestrator.
//! - **`DecodeAnomaly`**: a channel region that cannot be decoded. The region is
//!   dumped, skipped, and decoding of the block continues.
//! - **`Sink`**: the recorder refused a batch.
//! - **`ClockAnomaly`**: informational, never halts anything.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error taxonomy surfaced by boards, workers and the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A transfer failed; the board is read again next round.
    TransientBus,
    /// A block too short to hold a header.
    MalformedBlock,
    /// Too many malformed blocks from one board.
    FatalCorruption,
    /// A region of a record could not be decoded.
    DecodeAnomaly,
    /// The recorder rejected a batch.
    Sink,
    /// A backward time step that was not a rollover.
    ClockAnomaly,
    /// Invalid settings.
    Configuration,
    /// Command not valid in the current run state.
    State,
}

impl ErrorKind {
    /// Whether the run can keep going after an error of this kind.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorKind::FatalCorruption | ErrorKind::Configuration)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::TransientBus => "transient_bus",
            ErrorKind::MalformedBlock => "malformed_block",
            ErrorKind::FatalCorruption => "fatal_corruption",
            ErrorKind::DecodeAnomaly => "decode_anomaly",
            ErrorKind::Sink => "sink",
            ErrorKind::ClockAnomaly => "clock_anomaly",
            ErrorKind::Configuration => "configuration",
            ErrorKind::State => "state",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the stack-wide error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Primary error type of the readout stack.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure (calibration files, file sink).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bus block transfer or register access failed.
    #[error("Board {board}: bus error: {message}")]
    TransientBus { board: u32, message: String },

    /// A block below the minimum sane size was discarded.
    #[error("Board {board}: malformed block of {bytes} bytes")]
    MalformedBlock { board: u32, bytes: usize },

    /// Bad-block counter crossed the fatal ceiling.
    #[error("Board {board}: {count} bad blocks, data stream considered corrupt")]
    FatalCorruption { board: u32, count: u64 },

    /// A channel region could not be decoded.
    #[error("Decode anomaly at word {word_offset}: {reason}")]
    DecodeAnomaly { word_offset: usize, reason: String },

    /// Recorder failure.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Operation not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    State(String),
}

impl DaqError {
    /// Map this error onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) => ErrorKind::Configuration,
            DaqError::Io(_) | DaqError::TransientBus { .. } => ErrorKind::TransientBus,
            DaqError::MalformedBlock { .. } => ErrorKind::MalformedBlock,
            DaqError::FatalCorruption { .. } => ErrorKind::FatalCorruption,
            DaqError::DecodeAnomaly { .. } => ErrorKind::DecodeAnomaly,
            DaqError::Sink(_) => ErrorKind::Sink,
            DaqError::State(_) => ErrorKind::State,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
