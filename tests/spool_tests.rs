//! Spool durability tests
//!
//! Batches rejected by the store land on disk verbatim and are replayed
//! once the store is back.

use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use trace_ingestor::model::StorageSpan;
use trace_ingestor::storage::{MemoryStore, Recovery, SpanWriter, Spool};

fn span(trace_id: &str, span_id: &str) -> StorageSpan {
    let mut span = StorageSpan {
        trace_id: trace_id.into(),
        span_id: span_id.into(),
        service_name: "payments".into(),
        operation_name: "charge".into(),
        kind: "SERVER".into(),
        status_code: "OK".into(),
        start_time_us: 1_700_000_000_000_000,
        duration_us: 1500,
        ..Default::default()
    };
    span.attributes.insert("http.method".into(), "POST".into());
    span
}

fn setup(dir: &TempDir) -> (Arc<MemoryStore>, Arc<Spool>, Arc<SpanWriter>) {
    let store = Arc::new(MemoryStore::new());
    let spool = Arc::new(Spool::open(dir.path()).unwrap());
    let writer = Arc::new(SpanWriter::new(store.clone(), spool.clone()));
    (store, spool, writer)
}

#[test]
fn test_failed_batch_spooled_verbatim() {
    let dir = TempDir::new().unwrap();
    let (store, spool, writer) = setup(&dir);
    let batch = vec![span("t1", "a"), span("t1", "b"), span("t2", "c")];

    store.set_available(false);
    writer.persist(&batch);

    let files = spool.pending().unwrap();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("spans-") && name.ends_with(".jsonl"), "{}", name);

    let contents = fs::read_to_string(&files[0]).unwrap();
    let decoded: Vec<StorageSpan> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(decoded, batch);
}

#[test]
fn test_recovery_replays_and_deletes() {
    let dir = TempDir::new().unwrap();
    let (store, spool, writer) = setup(&dir);
    let batch = vec![span("t1", "a"), span("t1", "b")];

    store.set_available(false);
    writer.persist(&batch);
    store.set_available(true);

    let report = Recovery::new(writer, 100).recover_once();
    assert_eq!(report.files_recovered, 1);
    assert_eq!(report.rows_recovered, 2);
    assert_eq!(store.rows(), batch);
    assert!(spool.pending().unwrap().is_empty());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_recovery_skips_corrupt_lines() {
    let dir = TempDir::new().unwrap();
    let (store, spool, writer) = setup(&dir);

    let path = dir.path().join("spans-20240101-000000.000-000001.jsonl");
    let mut file = fs::File::create(&path).unwrap();
    writeln!(file, "{}", serde_json::to_string(&span("t1", "a")).unwrap()).unwrap();
    writeln!(file, "{{\"trace_id\": truncated").unwrap();
    writeln!(file, "{}", serde_json::to_string(&span("t1", "b")).unwrap()).unwrap();
    drop(file);

    let report = Recovery::new(writer, 100).recover_once();
    assert_eq!(report.rows_recovered, 2);
    assert_eq!(report.lines_skipped, 1);
    assert_eq!(store.len(), 2);
    assert!(!path.exists());
    assert!(spool.pending().unwrap().is_empty());
}

#[test]
fn test_failed_recovery_leaves_file_for_next_pass() {
    let dir = TempDir::new().unwrap();
    let (store, spool, writer) = setup(&dir);

    store.set_available(false);
    writer.persist(&[span("t1", "a")]);

    let recovery = Recovery::new(writer, 100);
    let report = recovery.recover_once();
    assert!(report.interrupted);
    let pending = spool.pending().unwrap();
    assert_eq!(pending.len(), 1);

    store.set_available(true);
    assert_eq!(recovery.recover_once().files_recovered, 1);
    assert!(!pending[0].exists());
}

#[test]
fn test_two_recoveries_never_share_a_file() {
    let dir = TempDir::new().unwrap();
    let (store, _spool, writer) = setup(&dir);

    store.set_available(false);
    for i in 0..20 {
        writer.persist(&[span(&format!("t{}", i), "a")]);
    }
    store.set_available(true);

    let a = Recovery::new(writer.clone(), 100);
    let b = Recovery::new(writer, 100);
    let ha = std::thread::spawn(move || a.recover_once());
    let hb = std::thread::spawn(move || b.recover_once());
    let total = ha.join().unwrap().rows_recovered + hb.join().unwrap().rows_recovered;

    assert_eq!(total, 20);
    assert_eq!(store.len(), 20);
}

#[test]
fn test_recovery_during_spool_write_loses_nothing() {
    const SPANS: usize = 100_000;
    let dir = TempDir::new().unwrap();
    let (store, spool, writer) = setup(&dir);
    let batch: Vec<_> = (0..SPANS).map(|i| span("big", &i.to_string())).collect();

    let done = Arc::new(AtomicBool::new(false));
    let recovery = Recovery::new(writer.clone(), 10_000);
    let replayer = {
        let done = done.clone();
        std::thread::spawn(move || {
            let mut rows = 0;
            while !done.load(Ordering::SeqCst) {
                rows += recovery.recover_once().rows_recovered;
            }
            rows + recovery.recover_once().rows_recovered
        })
    };

    writer.write_in_file(&batch).unwrap().unwrap();
    done.store(true, Ordering::SeqCst);
    let recovered = replayer.join().unwrap();

    assert_eq!(recovered, SPANS);
    assert_eq!(store.len(), SPANS);
    assert!(spool.pending().unwrap().is_empty());
}
