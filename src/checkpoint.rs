use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::batch::RunStats;
use crate::errors::{AppError, AppResult};
use crate::model::Dataset;

/// Snapshot of a run: the dataset with every slot written so far, plus the
/// cursor it was taken at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub dataset: Dataset,
    pub cursor: usize,
    pub total: usize,
    pub stats: RunStats,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn processed_count(&self) -> usize {
        self.cursor
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.total
    }

    pub fn write_json(&self, path: &Path) -> AppResult<()> {
        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let mut writer = BufWriter::new(NamedTempFile::new_in(parent)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        let temp = writer.into_inner().map_err(|err| AppError::Persistence {
            what: "checkpoint",
            reason: err.error().to_string(),
        })?;
        temp.persist(path).map_err(|err| AppError::Persistence {
            what: "checkpoint",
            reason: err.error.to_string(),
        })?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> AppResult<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Holds only the most recent checkpoint; shared with exporters.
#[derive(Default)]
pub struct CheckpointStore {
    latest: Mutex<Option<Arc<Checkpoint>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint(
        &self,
        dataset: &Dataset,
        cursor: usize,
        total: usize,
        stats: RunStats,
    ) -> Arc<Checkpoint> {
        let snapshot = Arc::new(Checkpoint {
            dataset: dataset.clone(),
            cursor,
            total,
            stats,
            created_at: Utc::now(),
        });
        *self.latest.lock() = Some(Arc::clone(&snapshot));
        debug!(cursor, total, "checkpoint stored");
        snapshot
    }

    pub fn latest(&self) -> Option<Arc<Checkpoint>> {
        self.latest.lock().clone()
    }

    pub fn clear(&self) {
        self.latest.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddressRecord, GeocodeResult};
    use tempfile::tempdir;

    fn dataset(rows: usize) -> Dataset {
        Dataset::new(
            vec!["endereco_completo".into()],
            (0..rows)
                .map(|i| AddressRecord::new(Some(format!("Rua {i}")), Vec::new()))
                .collect(),
        )
    }

    #[test]
    fn keeps_only_latest_snapshot() {
        let store = CheckpointStore::new();
        assert!(store.latest().is_none());
        let mut data = dataset(3);
        store.checkpoint(&data, 1, 3, RunStats::default());
        data.set_result(1, GeocodeResult::error());
        store.checkpoint(&data, 2, 3, RunStats::default());

        let latest = store.latest().unwrap();
        assert_eq!(latest.cursor, 2);
        assert!(latest.dataset.result(1).is_some());
        assert!(!latest.is_complete());
        store.clear();
        assert!(store.latest().is_none());
    }

    #[test]
    fn snapshot_is_detached_from_live_dataset() {
        let store = CheckpointStore::new();
        let mut data = dataset(2);
        store.checkpoint(&data, 0, 2, RunStats::default());
        data.set_result(0, GeocodeResult::error());
        assert!(store.latest().unwrap().dataset.result(0).is_none());
    }

    #[test]
    fn round_trips_through_json_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut data = dataset(2);
        data.set_result(0, GeocodeResult::error());
        let store = CheckpointStore::new();
        let checkpoint = store.checkpoint(&data, 1, 2, RunStats::default());
        checkpoint.write_json(&path).unwrap();

        let restored = Checkpoint::read_json(&path).unwrap();
        assert_eq!(restored.cursor, 1);
        assert_eq!(restored.dataset.fingerprint(), data.fingerprint());
        assert_eq!(restored.dataset.result(0), data.result(0));
    }
}
