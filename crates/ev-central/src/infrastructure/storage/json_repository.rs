//! Charging-point records in a single JSON document.
//!
//! ```json
//! {"charging_points":[{"id":"ALC1","location":"Calle Mayor 1","price_per_kwh":0.35,"max_power":11.0}]}
//! ```
//!
//! Saves write a sibling `*.tmp` file and rename it over the document, so a
//! crash mid-write leaves the previous version intact.

use std::path::{Path, PathBuf};

use ev_core::CpRecord;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::repository::{Repository, RepositoryError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    charging_points: Vec<CpRecord>,
}

pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_error(path: &Path, source: std::io::Error) -> RepositoryError {
    RepositoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Repository for JsonFileRepository {
    /// A missing file is an empty store.
    fn load(&self) -> Result<Vec<CpRecord>, RepositoryError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let document: Document = serde_json::from_str(&content)?;
        Ok(document.charging_points)
    }

    fn save(&self, records: &[CpRecord]) -> Result<(), RepositoryError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }

        let document = Document {
            charging_points: records.to_vec(),
        };
        let content = serde_json::to_string_pretty(&document)?;

        let tmp = self.path.with_extension("json.tmp");
        debug!("saving {} record(s) to {}", records.len(), self.path.display());
        std::fs::write(&tmp, content).map_err(|e| io_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))
    }
}
