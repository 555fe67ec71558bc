use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::model::Coordinate;

const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub lat: f64,
    pub lon: f64,
    pub provider: String,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(coordinate: Coordinate, provider: impl Into<String>) -> Self {
        Self {
            lat: coordinate.lat,
            lon: coordinate.lon,
            provider: provider.into(),
            stored_at: Utc::now(),
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

/// Query → coordinate cache shared across runs. Entries never expire.
pub struct GeocodeCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl GeocodeCache {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            path: None,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn lookup(&self, query: &str) -> Option<CacheEntry> {
        self.entries.lock().get(&cache_key(query)).cloned()
    }

    pub fn store(&self, query: &str, entry: CacheEntry) {
        self.entries.lock().insert(cache_key(query), entry);
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Replaces the in-memory entries with the file contents. A missing file
    /// leaves the cache empty; an unreadable or corrupt one is logged and
    /// ignored.
    pub fn load_from_disk(&self) -> usize {
        let Some(path) = &self.path else {
            return 0;
        };
        match read_cache_file(path) {
            Ok(Some(entries)) => {
                let count = entries.len();
                *self.entries.lock() = entries;
                self.dirty.store(false, Ordering::SeqCst);
                info!(target: "geocode_cache", path = %path.display(), count, "cache loaded");
                count
            }
            Ok(None) => {
                debug!(target: "geocode_cache", path = %path.display(), "no cache file yet");
                0
            }
            Err(err) => {
                warn!(
                    target: "geocode_cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read cache file; starting with an empty cache"
                );
                self.entries.lock().clear();
                0
            }
        }
    }

    /// Writes a snapshot of the current entries. The snapshot is taken under
    /// the lock and written after releasing it, through a temp file renamed
    /// over the target so an interrupted write never truncates the cache.
    pub fn persist_to_disk(&self) -> AppResult<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }
        let snapshot = self.entries.lock().clone();
        let count = snapshot.len();
        if let Err(err) = write_cache_file(path, snapshot) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }
        info!(target: "geocode_cache", path = %path.display(), count, "cache saved");
        Ok(count)
    }
}

/// MD5 hex digest of the trimmed, lower-cased query.
pub fn cache_key(query: &str) -> String {
    let normalized = query.trim().to_lowercase();
    format!("{:x}", md5::compute(normalized.as_bytes()))
}

fn read_cache_file(path: &Path) -> AppResult<Option<HashMap<String, CacheEntry>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(AppError::Io(err)),
    };
    let parsed: CacheFile = serde_json::from_reader(BufReader::new(file))?;
    if parsed.version != CACHE_FORMAT_VERSION {
        return Err(AppError::Persistence {
            what: "geocode cache",
            reason: format!("unsupported cache version {}", parsed.version),
        });
    }
    Ok(Some(parsed.entries))
}

fn write_cache_file(path: &Path, entries: HashMap<String, CacheEntry>) -> AppResult<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let temp = NamedTempFile::new_in(parent)?;
    let mut writer = BufWriter::new(temp);
    serde_json::to_writer(
        &mut writer,
        &CacheFile {
            version: CACHE_FORMAT_VERSION,
            entries,
        },
    )?;
    writer.flush()?;
    let temp = writer.into_inner().map_err(|err| AppError::Persistence {
        what: "geocode cache",
        reason: err.error().to_string(),
    })?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| AppError::Persistence {
        what: "geocode cache",
        reason: err.error.to_string(),
    })?;
    Ok(())
}
