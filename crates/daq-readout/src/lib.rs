//! `daq-readout`
//!
//! The live half of the readout stack: one read thread polling every board,
//! a pool of decode workers feeding the recorder, and the [`BoardManager`]
//! that runs them through arm, start and stop.
//!
//! ## Threads
//!
//! - `readout`: round-robins [`BoardInterface::read_cycle`](daq_board::BoardInterface::read_cycle)
//!   over active boards, one final read per deactivated board
//! - `worker-N`: drains ready boards, decodes per processing mode, batches
//!   occurrences into the sink
//! - the caller's thread: drives the [`BoardManager`], directly or through
//!   [`Command`]s

pub mod command;
pub mod counters;
pub mod decode;
pub mod manager;
pub mod read_loop;
pub mod worker;

pub use command::{Command, CommandResponse};
pub use counters::{PipelineCounters, Rate, RateCounters, RateMeter};
pub use decode::{decode_batch, payload_bytes, DecodedBatch};
pub use manager::{BoardManager, RunState, RunStats};
pub use read_loop::ReadLoop;
pub use worker::{WorkerContext, WorkerPool};
