//! The recorder contract and the closed set of sinks implementing it.

use daq_core::{Occurrence, SinkConfig};
use parking_lot::Mutex;

use crate::database::DatabaseSink;
use crate::error::{InsertError, SinkError};
use crate::file::FileSink;
use crate::null::NullSink;

/// Identifies one worker's writer inside a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle(pub(crate) usize);

impl WorkerHandle {
    /// Registration order of the worker.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Totals since the sink was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Batches stored.
    pub batches: u64,
    /// Occurrences stored.
    pub occurrences: u64,
    /// Inserts that failed.
    pub failed_batches: u64,
}

/// What workers need from storage.
///
/// All methods take `&self`; sinks are shared between worker threads and
/// keep per-worker writers behind their own locks.
pub trait Recorder: Send + Sync {
    /// Prepare the target and accept inserts, also after a `shutdown`.
    fn initialize(&self) -> Result<(), SinkError>;

    /// Allocate a writer for one worker thread.
    fn register_worker(&self) -> WorkerHandle;

    /// Store a batch. On failure the batch is returned inside the error.
    fn insert_batch(&self, worker: WorkerHandle, batch: Vec<Occurrence>) -> Result<(), InsertError>;

    /// Point subsequent writes at a new target of the same kind.
    fn update_target(&self, config: &SinkConfig) -> Result<(), SinkError>;

    /// Flush and release every writer. Inserts fail until `initialize`.
    fn shutdown(&self) -> Result<(), SinkError>;

    /// Message of the most recent failure.
    fn last_error(&self) -> Option<String>;

    /// Totals since creation.
    fn stats(&self) -> SinkStats;
}

/// The configured sink.
pub enum Sink {
    /// Discards everything.
    None(NullSink),
    /// Per-worker record files.
    File(FileSink),
    /// PostgreSQL table.
    Database(DatabaseSink),
}

impl Sink {
    /// Build the sink selected by `config`. Nothing is touched until
    /// [`Recorder::initialize`].
    pub fn from_config(config: &SinkConfig) -> Self {
        match config {
            SinkConfig::None => Sink::None(NullSink::new()),
            SinkConfig::File(file) => Sink::File(FileSink::new(file.clone())),
            SinkConfig::Database(db) => Sink::Database(DatabaseSink::new(db.clone())),
        }
    }

    /// Name of the variant, as used in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Sink::None(_) => "none",
            Sink::File(_) => "file",
            Sink::Database(_) => "database",
        }
    }

    fn inner(&self) -> &dyn Recorder {
        match self {
            Sink::None(s) => s,
            Sink::File(s) => s,
            Sink::Database(s) => s,
        }
    }
}

pub(crate) fn config_kind(config: &SinkConfig) -> &'static str {
    match config {
        SinkConfig::None => "none",
        SinkConfig::File(_) => "file",
        SinkConfig::Database(_) => "database",
    }
}

impl Recorder for Sink {
    fn initialize(&self) -> Result<(), SinkError> {
        self.inner().initialize()
    }

    fn register_worker(&self) -> WorkerHandle {
        self.inner().register_worker()
    }

    fn insert_batch(&self, worker: WorkerHandle, batch: Vec<Occurrence>) -> Result<(), InsertError> {
        self.inner().insert_batch(worker, batch)
    }

    fn update_target(&self, config: &SinkConfig) -> Result<(), SinkError> {
        self.inner().update_target(config)
    }

    fn shutdown(&self) -> Result<(), SinkError> {
        self.inner().shutdown()
    }

    fn last_error(&self) -> Option<String> {
        self.inner().last_error()
    }

    fn stats(&self) -> SinkStats {
        self.inner().stats()
    }
}

/// Last-error slot shared by the sink implementations.
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot(Mutex<Option<String>>);

impl ErrorSlot {
    pub(crate) fn record(&self, err: &impl std::fmt::Display) {
        *self.0.lock() = Some(err.to_string());
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }
}
