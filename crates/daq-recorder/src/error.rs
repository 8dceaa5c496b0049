use daq_core::Occurrence;
use thiserror::Error;

/// Failures inside a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing or reading back a frame failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),

    /// PostgreSQL failure, formatted with its SQLSTATE.
    #[error("Database error: {0}")]
    Database(String),

    /// Handle from another sink or a previous run.
    #[error("Worker handle {0} was not registered with this sink")]
    UnknownWorker(usize),

    /// Insert after `shutdown` and before `initialize`.
    #[error("Sink is shut down")]
    ShutDown,

    /// Retarget with a configuration of another sink kind.
    #[error("Cannot retarget a {current} sink with a {requested} configuration")]
    TargetMismatch {
        current: &'static str,
        requested: &'static str,
    },

    /// Table name that is not a plain identifier.
    #[error("Invalid table name '{0}'")]
    InvalidTable(String),

    /// Truncated or garbled record file.
    #[error("Corrupt record file: {0}")]
    Corrupt(String),
}

impl From<postgres::Error> for SinkError {
    fn from(err: postgres::Error) -> Self {
        SinkError::Database(format_postgres_error(&err))
    }
}

/// Short, single-line rendering of a driver error.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        e.to_string()
    }
}

/// A refused insert. The batch is handed back so the caller can retry it.
#[derive(Error, Debug)]
#[error("Insert of {} occurrences failed: {source}", .batch.len())]
pub struct InsertError {
    /// What went wrong.
    #[source]
    pub source: SinkError,
    /// The batch that was not stored.
    pub batch: Vec<Occurrence>,
}

impl InsertError {
    /// Pair a failure with the batch it refused.
    pub fn new(source: SinkError, batch: Vec<Occurrence>) -> Self {
        Self { source, batch }
    }

    /// Take the batch back for a retry.
    pub fn into_batch(self) -> Vec<Occurrence> {
        self.batch
    }
}
