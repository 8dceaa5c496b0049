//! `daq-recorder`
//!
//! Storage for decoded occurrences. Workers register once, then hand over
//! batches by value; a refused batch comes back in the [`InsertError`] so the
//! worker can apply its retry policy.
//!
//! The sink is picked once per run from [`daq_core::SinkConfig`]:
//!
//! - [`NullSink`]: counts and discards
//! - [`FileSink`]: rotating per-worker bincode files, see [`read_file`]
//! - [`DatabaseSink`]: PostgreSQL, one connection per worker

pub mod database;
pub mod error;
pub mod file;
pub mod null;
pub mod sink;

pub use database::DatabaseSink;
pub use error::{InsertError, SinkError};
pub use file::{list_files, read_file, FileSink};
pub use null::NullSink;
pub use sink::{Recorder, Sink, SinkStats, WorkerHandle};
