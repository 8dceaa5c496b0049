//! `daq-core`
//!
//! Shared building blocks of the digitizer readout stack: the data model that
//! flows from the bus to the recorder, the per-stream clock reconstruction, the
//! run configuration and the error taxonomy.
//!
//! ## Key Types
//!
//! - [`RawBlock`]: one bus-read cycle of one board, moved by value
//! - [`Occurrence`]: one decoded, time-stamped record handed to the recorder
//! - [`ClockState`]: 31-bit rollover tracking for a board or channel
//! - [`RunConfig`]: everything the pipeline reads from the run configuration
//! - [`DaqError`] / [`ErrorKind`]: errors and their coarse classification

pub mod block;
pub mod clock;
pub mod config;
pub mod error;

pub use block::{total_bytes, Occurrence, RawBlock, WORD_BYTES};
pub use clock::{ClockState, ClockStep, HALF_RANGE, HW_TIME_MASK};
pub use config::{
    BoardConfig, BoardKind, DatabaseSinkConfig, FileSinkConfig, ProcessingConfig, ProcessingMode,
    ReadoutConfig, ReadoutThreshold, RegisterSetting, RunConfig, SinkConfig, SinkErrorPolicy,
};
pub use error::{DaqError, DaqResult, ErrorKind};
