//! In-process record store for `--ephemeral` runs and tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ev_core::CpRecord;

use crate::application::repository::{Repository, RepositoryError};

#[derive(Default)]
pub struct MemoryRepository {
    records: Mutex<Vec<CpRecord>>,
    saves: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded store, as if `records` had been saved by an earlier run.
    pub fn with_records(records: Vec<CpRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Currently stored records.
    pub fn records(&self) -> Vec<CpRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of successful saves since creation.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl Repository for MemoryRepository {
    fn load(&self) -> Result<Vec<CpRecord>, RepositoryError> {
        Ok(self.records())
    }

    fn save(&self, records: &[CpRecord]) -> Result<(), RepositoryError> {
        let mut stored = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *stored = records.to_vec();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
