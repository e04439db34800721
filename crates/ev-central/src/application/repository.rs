//! Storage boundary for charging-point records.
//!
//! The coordinator only needs two operations: load every record at start-up
//! and replace the stored set after a change.  Implementations live in
//! `infrastructure::storage`.

use std::path::PathBuf;

use ev_core::CpRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("I/O error on record store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record store: {0}")]
    Format(#[from] serde_json::Error),
}

/// Persistent store of charging-point records.
///
/// Calls are blocking; the coordinator runs them on tokio's blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait Repository: Send + Sync {
    fn load(&self) -> Result<Vec<CpRecord>, RepositoryError>;

    /// Replaces the stored set with `records`.
    fn save(&self, records: &[CpRecord]) -> Result<(), RepositoryError>;
}
