//! PostgreSQL sink.
//!
//! Every worker owns its own connection, opened lazily on first insert. A
//! batch is written in one transaction. Retargeting bumps a generation
//! counter; each worker notices on its next insert and reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use daq_core::{DatabaseSinkConfig, Occurrence, SinkConfig};
use parking_lot::{Mutex, RwLock};
use postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::error::{InsertError, SinkError};
use crate::sink::{config_kind, ErrorSlot, Recorder, SinkStats, WorkerHandle};

#[derive(Default)]
struct WorkerConnection {
    client: Option<Client>,
    generation: u64,
}

/// Inserts occurrences into a PostgreSQL table.
pub struct DatabaseSink {
    target: RwLock<DatabaseSinkConfig>,
    generation: AtomicU64,
    workers: RwLock<Vec<Arc<Mutex<WorkerConnection>>>>,
    shut_down: AtomicBool,
    batches: AtomicU64,
    occurrences: AtomicU64,
    failed: AtomicU64,
    last_error: ErrorSlot,
}

/// Accept plain SQL identifiers only; the name is spliced into statements.
pub fn validate_table_name(name: &str) -> Result<(), SinkError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;
    if valid {
        Ok(())
    } else {
        Err(SinkError::InvalidTable(name.to_string()))
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id BIGSERIAL PRIMARY KEY,
            module_id BIGINT NOT NULL,
            channel SMALLINT,
            corrected_time BIGINT NOT NULL,
            event_counter BIGINT,
            integral BIGINT,
            compressed BOOLEAN NOT NULL,
            payload BYTEA NOT NULL
        )"
    )
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} \
         (module_id, channel, corrected_time, event_counter, integral, compressed, payload) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)"
    )
}

impl DatabaseSink {
    /// Sink for `config`; the connection is made by `initialize`.
    pub fn new(config: DatabaseSinkConfig) -> Self {
        Self {
            target: RwLock::new(config),
            generation: AtomicU64::new(0),
            workers: RwLock::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            batches: AtomicU64::new(0),
            occurrences: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: ErrorSlot::default(),
        }
    }

    fn write(&self, worker: WorkerHandle, batch: &[Occurrence]) -> Result<(), SinkError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SinkError::ShutDown);
        }
        let slot = self
            .workers
            .read()
            .get(worker.0)
            .cloned()
            .ok_or(SinkError::UnknownWorker(worker.0))?;
        let mut conn = slot.lock();
        let generation = self.generation.load(Ordering::SeqCst);
        let target = self.target.read().clone();

        if conn.client.is_none() || conn.generation != generation {
            conn.client = None;
            debug!(worker = worker.0, generation, "Connecting worker to database");
            conn.client = Some(Client::connect(&target.url, NoTls)?);
            conn.generation = generation;
        }
        let Some(client) = conn.client.as_mut() else {
            return Err(SinkError::Database("no connection".into()));
        };

        let result = insert_all(client, &target.table, batch);
        if result.is_err() {
            // Force a fresh connection next time.
            conn.client = None;
        }
        result
    }
}

fn insert_all(client: &mut Client, table: &str, batch: &[Occurrence]) -> Result<(), SinkError> {
    let mut tx = client.transaction()?;
    let statement = tx.prepare(&insert_sql(table))?;
    for occ in batch {
        let module_id = i64::from(occ.module_id);
        let channel = occ.channel.map(i16::from);
        let time = occ.corrected_time as i64;
        let counter = occ.event_counter.map(i64::from);
        let payload: &[u8] = &occ.payload;
        tx.execute(
            &statement,
            &[
                &module_id,
                &channel,
                &time,
                &counter,
                &occ.integral,
                &occ.compressed,
                &payload,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

impl Recorder for DatabaseSink {
    fn initialize(&self) -> Result<(), SinkError> {
        let target = self.target.read().clone();
        validate_table_name(&target.table)?;
        let mut client = Client::connect(&target.url, NoTls).map_err(|e| {
            let err = SinkError::from(e);
            self.last_error.record(&err);
            err
        })?;
        client.batch_execute(&create_table_sql(&target.table))?;
        self.shut_down.store(false, Ordering::SeqCst);
        info!(table = %target.table, "Database sink ready");
        Ok(())
    }

    fn register_worker(&self) -> WorkerHandle {
        let mut workers = self.workers.write();
        workers.push(Arc::new(Mutex::new(WorkerConnection::default())));
        WorkerHandle(workers.len() - 1)
    }

    fn insert_batch(&self, worker: WorkerHandle, batch: Vec<Occurrence>) -> Result<(), InsertError> {
        match self.write(worker, &batch) {
            Ok(()) => {
                self.batches.fetch_add(1, Ordering::Relaxed);
                self.occurrences
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                warn!(worker = worker.0, error = %err, "Database insert failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.last_error.record(&err);
                Err(InsertError::new(err, batch))
            }
        }
    }

    fn update_target(&self, config: &SinkConfig) -> Result<(), SinkError> {
        let SinkConfig::Database(db) = config else {
            return Err(SinkError::TargetMismatch {
                current: "database",
                requested: config_kind(config),
            });
        };
        validate_table_name(&db.table)?;
        *self.target.write() = db.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(table = %db.table, "Database sink retargeted");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), SinkError> {
        self.shut_down.store(true, Ordering::SeqCst);
        let workers = std::mem::take(&mut *self.workers.write());
        for slot in workers {
            if let Some(client) = slot.lock().client.take() {
                if let Err(err) = client.close() {
                    self.last_error.record(&SinkError::from(err));
                }
            }
        }
        Ok(())
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.get()
    }

    fn stats(&self) -> SinkStats {
        SinkStats {
            batches: self.batches.load(Ordering::Relaxed),
            occurrences: self.occurrences.load(Ordering::Relaxed),
            failed_batches: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn unreachable() -> DatabaseSinkConfig {
        DatabaseSinkConfig {
            url: "host=127.0.0.1 port=1 user=daq connect_timeout=1".into(),
            table: "occurrences".into(),
        }
    }

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("occurrences").is_ok());
        assert!(validate_table_name("_run_0042").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1abc").is_err());
        assert!(validate_table_name("x; DROP TABLE y").is_err());
    }

    #[test]
    fn test_statements_name_table() {
        assert!(create_table_sql("runs").starts_with("CREATE TABLE IF NOT EXISTS runs"));
        assert!(insert_sql("runs").contains("INSERT INTO runs"));
    }

    #[test]
    fn test_failed_connect_hands_batch_back() {
        let sink = DatabaseSink::new(unreachable());
        let w = sink.register_worker();
        let batch = vec![Occurrence::whole(1, 2, Bytes::from_static(b"data"))];
        let err = sink.insert_batch(w, batch).unwrap_err();
        assert!(matches!(err.source, SinkError::Database(_)));
        assert_eq!(err.batch.len(), 1);
        assert_eq!(sink.stats().failed_batches, 1);
        assert!(sink.last_error().is_some());
    }

    #[test]
    fn test_retarget_requires_database_config() {
        let sink = DatabaseSink::new(unreachable());
        assert!(sink.update_target(&SinkConfig::None).is_err());
        let mut next = unreachable();
        next.table = "bad name".into();
        assert!(matches!(
            sink.update_target(&SinkConfig::Database(next)),
            Err(SinkError::InvalidTable(_))
        ));
        assert!(sink.update_target(&SinkConfig::Database(unreachable())).is_ok());
    }
}
