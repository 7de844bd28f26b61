use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::metrics;
use crate::model::StorageSpan;
use crate::storage::spool::Spool;
use crate::storage::store::SpanStore;

/// Final write path shared by the writer pool and spool recovery
pub struct SpanWriter {
    store: Arc<dyn SpanStore>,
    spool: Arc<Spool>,
}

impl SpanWriter {
    pub fn new(store: Arc<dyn SpanStore>, spool: Arc<Spool>) -> Self {
        Self { store, spool }
    }

    pub fn spool(&self) -> &Arc<Spool> {
        &self.spool
    }

    /// One insert request for the whole batch. Never spools.
    pub fn write_in_database(&self, spans: &[StorageSpan]) -> Result<usize> {
        if spans.is_empty() {
            return Ok(0);
        }
        let rows = self.store.insert(spans)?;
        metrics::SPANS_WRITTEN.inc_by(rows as u64);
        debug!(rows, "batch inserted");
        Ok(rows)
    }

    pub fn write_in_file(&self, spans: &[StorageSpan]) -> Result<Option<PathBuf>> {
        let path = self.spool.write(spans)?;
        if let Some(path) = &path {
            metrics::SPANS_SPOOLED.inc_by(spans.len() as u64);
            warn!(spans = spans.len(), file = %path.display(), "batch spooled");
        }
        Ok(path)
    }

    /// Insert, falling back to the spool. The batch is lost only if both fail.
    pub fn persist(&self, spans: &[StorageSpan]) {
        let Err(e) = self.write_in_database(spans) else {
            return;
        };
        warn!(spans = spans.len(), "insert failed, spooling batch: {}", e);

        if let Err(e) = self.write_in_file(spans) {
            error!(spans = spans.len(), "spool write failed, batch lost: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;
    use tempfile::TempDir;

    fn writer(dir: &TempDir) -> (SpanWriter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let spool = Arc::new(Spool::open(dir.path()).unwrap());
        (SpanWriter::new(store.clone(), spool), store)
    }

    #[test]
    fn test_persist_prefers_store() {
        let dir = TempDir::new().unwrap();
        let (writer, store) = writer(&dir);
        writer.persist(&[StorageSpan::default(), StorageSpan::default()]);
        assert_eq!(store.len(), 2);
        assert!(writer.spool().pending().unwrap().is_empty());
    }

    #[test]
    fn test_persist_spools_when_store_down() {
        let dir = TempDir::new().unwrap();
        let (writer, store) = writer(&dir);
        store.set_available(false);
        writer.persist(&[StorageSpan::default()]);
        assert!(store.is_empty());
        assert_eq!(writer.spool().pending().unwrap().len(), 1);
    }

    #[test]
    fn test_write_in_database_does_not_spool() {
        let dir = TempDir::new().unwrap();
        let (writer, store) = writer(&dir);
        store.set_available(false);
        assert!(writer.write_in_database(&[StorageSpan::default()]).is_err());
        assert!(writer.spool().pending().unwrap().is_empty());
    }
}
