use crossbeam::channel::{select, tick};
use std::io::ErrorKind;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::metrics;
use crate::shutdown::Shutdown;
use crate::storage::spool::ClaimedFile;
use crate::storage::writer::SpanWriter;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub files_recovered: usize,
    pub rows_recovered: usize,
    pub lines_skipped: usize,
    /// A replay failed and the pass stopped early
    pub interrupted: bool,
}

/// Replays spool files into the store
pub struct Recovery {
    writer: Arc<SpanWriter>,
    chunk_size: usize,
}

impl Recovery {
    pub fn new(writer: Arc<SpanWriter>, chunk_size: usize) -> Self {
        Self {
            writer,
            chunk_size: chunk_size.max(1),
        }
    }

    /// One pass over the pending files, oldest first. The pass stops at the
    /// first file whose replay fails, the store is most likely still down.
    pub fn recover_once(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let spool = self.writer.spool();

        let files = match spool.pending() {
            Ok(files) => files,
            Err(e) => {
                warn!("listing spool failed: {}", e);
                return report;
            }
        };

        for path in files {
            let claimed = match spool.claim(&path) {
                Ok(claimed) => claimed,
                Err(IngestError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    debug!(file = %path.display(), "spool file claimed elsewhere");
                    continue;
                }
                Err(e) => {
                    warn!(file = %path.display(), "claiming spool file failed: {}", e);
                    continue;
                }
            };

            match self.replay(&claimed) {
                Ok((rows, skipped)) => {
                    if let Err(e) = claimed.complete() {
                        warn!("removing recovered spool file failed: {}", e);
                    }
                    report.files_recovered += 1;
                    report.rows_recovered += rows;
                    report.lines_skipped += skipped;
                    metrics::SPOOL_FILES_RECOVERED.inc();
                    metrics::SPOOL_LINES_SKIPPED.inc_by(skipped as u64);
                    info!(file = %path.display(), rows, skipped, "spool file recovered");
                }
                Err(e) => {
                    warn!(file = %path.display(), "spool replay failed: {}", e);
                    if let Err(e) = claimed.release() {
                        warn!(file = %path.display(), "releasing spool file failed: {}", e);
                    }
                    report.interrupted = true;
                    break;
                }
            }
        }

        report
    }

    /// Returns (rows inserted, lines skipped). Chunks inserted before a
    /// failure are replayed again on the next pass.
    fn replay(&self, claimed: &ClaimedFile) -> Result<(usize, usize)> {
        let mut reader = claimed.reader(self.chunk_size)?;
        let mut rows = 0;
        while let Some(chunk) = reader.next_chunk()? {
            rows += self.writer.write_in_database(&chunk)?;
        }
        Ok((rows, reader.skipped()))
    }

    /// Run a pass every `interval` until shutdown
    pub fn start(self, interval: Duration, shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("spool-recovery".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                info!(interval_secs = interval.as_secs(), "spool recovery started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let report = self.recover_once();
                            if report.files_recovered > 0 || report.interrupted {
                                debug!(?report, "recovery pass finished");
                            }
                        }
                        recv(shutdown.receiver()) -> _ => break,
                    }
                }
                info!("spool recovery stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StorageSpan;
    use crate::storage::spool::Spool;
    use crate::storage::store::MemoryStore;
    use tempfile::TempDir;

    fn spans(n: usize) -> Vec<StorageSpan> {
        (0..n)
            .map(|i| StorageSpan {
                trace_id: "t".into(),
                span_id: i.to_string(),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn test_recovery_stops_on_failure_and_keeps_files() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let spool = Arc::new(Spool::open(dir.path()).unwrap());
        spool.write(&spans(2)).unwrap();
        spool.write(&spans(3)).unwrap();

        let recovery = Recovery::new(Arc::new(SpanWriter::new(store.clone(), spool.clone())), 10);
        store.set_available(false);
        let report = recovery.recover_once();
        assert!(report.interrupted);
        assert_eq!(report.files_recovered, 0);
        assert_eq!(spool.pending().unwrap().len(), 2);

        store.set_available(true);
        let report = recovery.recover_once();
        assert_eq!(report.files_recovered, 2);
        assert_eq!(report.rows_recovered, 5);
        assert!(spool.pending().unwrap().is_empty());
    }

    #[test]
    fn test_recovery_inserts_in_chunks() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let spool = Arc::new(Spool::open(dir.path()).unwrap());
        spool.write(&spans(5)).unwrap();

        let recovery = Recovery::new(Arc::new(SpanWriter::new(store.clone(), spool)), 2);
        assert_eq!(recovery.recover_once().rows_recovered, 5);
        assert_eq!(store.insert_count(), 3);
    }
}
