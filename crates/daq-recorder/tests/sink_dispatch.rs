//! The `Sink` enum driven the way the worker pool drives it.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use daq_core::{FileSinkConfig, Occurrence, SinkConfig};
use daq_recorder::{list_files, read_file, Recorder, Sink};

#[test]
fn concurrent_workers_write_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = SinkConfig::File(FileSinkConfig {
        directory: dir.path().join("run"),
        prefix: "digi".into(),
        max_file_bytes: 4096,
    });
    let sink = Arc::new(Sink::from_config(&config));
    assert_eq!(sink.kind(), "file");
    sink.initialize().unwrap();

    let handles: Vec<_> = (0..4u32)
        .map(|w| {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                let handle = sink.register_worker();
                for batch in 0..10u64 {
                    let occurrences = (0..20u64)
                        .map(|i| {
                            Occurrence::whole(w, batch * 100 + i, Bytes::from(vec![w as u8; 32]))
                        })
                        .collect();
                    sink.insert_batch(handle, occurrences).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    sink.shutdown().unwrap();

    let files = list_files(dir.path().join("run"), "digi").unwrap();
    assert!(files.len() > 4, "expected rotation, got {} files", files.len());
    let total: usize = files.iter().map(|f| read_file(f).unwrap().len()).sum();
    assert_eq!(total, 4 * 10 * 20);
    assert_eq!(sink.stats().occurrences, 800);
}

#[test]
fn none_sink_from_default_config() {
    let sink = Sink::from_config(&SinkConfig::default());
    assert_eq!(sink.kind(), "none");
    sink.initialize().unwrap();
    let w = sink.register_worker();
    sink.insert_batch(w, vec![Occurrence::whole(1, 1, Bytes::new())])
        .unwrap();
    assert_eq!(sink.stats().batches, 1);
    assert!(sink.last_error().is_none());
}
