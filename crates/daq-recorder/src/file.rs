//! Per-worker binary record files.
//!
//! Each worker appends to its own file, so writers never contend. A file is a
//! sequence of frames, one per inserted batch:
//!
//! ```text
//! [u32 LE frame length][bincode Vec<Occurrence>]
//! ```
//!
//! Once a file has grown past `max_file_bytes` the next batch starts a new one.
//! Files are named `{prefix}_w{worker:02}_{sequence:05}.bin`. Existing files
//! are never reopened; the sequence skips past names already on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use daq_core::{FileSinkConfig, Occurrence, SinkConfig};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{InsertError, SinkError};
use crate::sink::{config_kind, ErrorSlot, Recorder, SinkStats, WorkerHandle};

const FRAME_HEADER_BYTES: usize = 4;

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
    generation: u64,
}

#[derive(Default)]
struct WorkerFile {
    file: Option<OpenFile>,
    sequence: u32,
}

/// Writes occurrences to rotating per-worker files.
pub struct FileSink {
    target: RwLock<FileSinkConfig>,
    generation: AtomicU64,
    workers: RwLock<Vec<Arc<Mutex<WorkerFile>>>>,
    shut_down: AtomicBool,
    batches: AtomicU64,
    occurrences: AtomicU64,
    failed: AtomicU64,
    last_error: ErrorSlot,
}

impl FileSink {
    /// Sink writing below `config.directory`.
    pub fn new(config: FileSinkConfig) -> Self {
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

    /// Current target directory.
    pub fn directory(&self) -> PathBuf {
        self.target.read().directory.clone()
    }

    fn slot(&self, worker: WorkerHandle) -> Option<Arc<Mutex<WorkerFile>>> {
        self.workers.read().get(worker.0).cloned()
    }

    fn write(&self, worker: WorkerHandle, batch: &[Occurrence]) -> Result<(), SinkError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SinkError::ShutDown);
        }
        let slot = self.slot(worker).ok_or(SinkError::UnknownWorker(worker.0))?;
        let mut slot = slot.lock();
        let generation = self.generation.load(Ordering::SeqCst);
        let target = self.target.read().clone();

        let rotate = match &slot.file {
            None => true,
            Some(open) => open.generation != generation || open.written >= target.max_file_bytes,
        };
        if rotate {
            if let Some(mut old) = slot.file.take() {
                old.writer.flush()?;
                debug!(worker = worker.0, path = %old.path.display(), bytes = old.written, "Closed record file");
            }
            fs::create_dir_all(&target.directory)?;
            let (path, file) = loop {
                let path = target.directory.join(format!(
                    "{}_w{:02}_{:05}.bin",
                    target.prefix, worker.0, slot.sequence
                ));
                slot.sequence += 1;
                match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(file) => break (path, file),
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(err) => return Err(err.into()),
                }
            };
            debug!(worker = worker.0, path = %path.display(), "Opened record file");
            slot.file = Some(OpenFile {
                path,
                writer: BufWriter::new(file),
                written: 0,
                generation,
            });
        }

        let payload = bincode::serialize(batch)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| SinkError::Corrupt(format!("frame of {} bytes", payload.len())))?;
        if let Some(open) = slot.file.as_mut() {
            open.writer.write_all(&len.to_le_bytes())?;
            open.writer.write_all(&payload)?;
            open.writer.flush()?;
            open.written += (FRAME_HEADER_BYTES + payload.len()) as u64;
        }
        Ok(())
    }
}

impl Recorder for FileSink {
    fn initialize(&self) -> Result<(), SinkError> {
        let dir = self.directory();
        fs::create_dir_all(&dir)?;
        self.shut_down.store(false, Ordering::SeqCst);
        info!(directory = %dir.display(), "File sink ready");
        Ok(())
    }

    fn register_worker(&self) -> WorkerHandle {
        let mut workers = self.workers.write();
        workers.push(Arc::new(Mutex::new(WorkerFile::default())));
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
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.last_error.record(&err);
                Err(InsertError::new(err, batch))
            }
        }
    }

    fn update_target(&self, config: &SinkConfig) -> Result<(), SinkError> {
        let SinkConfig::File(file) = config else {
            return Err(SinkError::TargetMismatch {
                current: "file",
                requested: config_kind(config),
            });
        };
        *self.target.write() = file.clone();
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(directory = %file.directory.display(), prefix = %file.prefix, "File sink retargeted");
        Ok(())
    }

    fn shutdown(&self) -> Result<(), SinkError> {
        self.shut_down.store(true, Ordering::SeqCst);
        let workers = std::mem::take(&mut *self.workers.write());
        let mut result = Ok(());
        for slot in workers {
            if let Some(mut open) = slot.lock().file.take() {
                if let Err(err) = open.writer.flush() {
                    warn!(path = %open.path.display(), error = %err, "Flush failed on shutdown");
                    self.last_error.record(&err);
                    result = Err(err.into());
                }
            }
        }
        result
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

/// Read every occurrence back from one record file.
pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<Occurrence>, SinkError> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header = data
            .get(pos..pos + FRAME_HEADER_BYTES)
            .ok_or_else(|| SinkError::Corrupt(format!("truncated frame header at {}", pos)))?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        pos += FRAME_HEADER_BYTES;
        let frame = data
            .get(pos..pos + len)
            .ok_or_else(|| SinkError::Corrupt(format!("truncated frame at {}", pos)))?;
        let batch: Vec<Occurrence> = bincode::deserialize(frame)?;
        out.extend(batch);
        pos += len;
    }
    Ok(out)
}

/// Record files in `dir` written with `prefix`, sorted by name.
pub fn list_files(dir: impl AsRef<Path>, prefix: &str) -> Result<Vec<PathBuf>, SinkError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".bin"))
        })
        .collect();
    files.sort();
    Ok(files)
}
