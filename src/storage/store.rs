use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{IngestError, Result};
use crate::model::StorageSpan;

/// Analytical store the ingestor writes into. Implementations must be safe
/// to call from several writer threads at once.
pub trait SpanStore: Send + Sync {
    /// Insert one batch as a single request, returns the rows sent.
    /// Rows that cannot be encoded are logged and skipped.
    fn insert(&self, spans: &[StorageSpan]) -> Result<usize>;

    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process store that can be switched offline to simulate outages
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<StorageSpan>>,
    offline: AtomicBool,
    inserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<StorageSpan> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful insert requests so far
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

impl SpanStore for MemoryStore {
    fn insert(&self, spans: &[StorageSpan]) -> Result<usize> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IngestError::Store("store unavailable".into()));
        }
        self.rows.lock().extend_from_slice(spans);
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(spans.len())
    }

    fn ping(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(IngestError::Store("store unavailable".into()));
        }
        Ok(())
    }
}
