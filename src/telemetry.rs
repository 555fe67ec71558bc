use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use std::io;

use crate::config::GeocoderConfig;
#[cfg(test)]
use crate::errors::AppError;
use crate::errors::AppResult;

const RECENT_EVENT_CAPACITY: usize = 100;
const JOURNAL_FILE_NAME: &str = "geocoder-events.jsonl";
const MAX_QUEUED_EVENTS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    pub detail: String,
}

impl RunEvent {
    fn new(level: EventLevel, message: String, detail: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message,
            detail,
        }
    }
}

/// Structured run events: mirrored to `tracing`, kept in a bounded ring for
/// live display, and optionally journaled to a rotating JSONL file.
#[derive(Clone)]
pub struct EventLog {
    enabled: Arc<AtomicBool>,
    recent: Arc<Mutex<VecDeque<RunEvent>>>,
    journal: Option<Arc<Journal>>,
}

struct Journal {
    queue: Mutex<Vec<RunEvent>>,
    path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
    #[cfg(test)]
    fail_next_write: AtomicBool,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl EventLog {
    pub fn in_memory() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_EVENT_CAPACITY))),
            journal: None,
        }
    }

    pub fn with_journal<P: AsRef<Path>>(data_dir: P, config: &GeocoderConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;

        let log = Self::in_memory();
        log.enabled
            .store(config.event_log_enabled, Ordering::SeqCst);
        Ok(Self {
            journal: Some(Arc::new(Journal {
                queue: Mutex::new(Vec::new()),
                path,
                batch_size: config.event_log_batch_size.max(1),
                max_file_bytes: config.event_log_max_bytes,
                max_file_count: config.event_log_max_files.max(1),
                #[cfg(test)]
                fail_next_write: AtomicBool::new(false),
            })),
            ..log
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_deref().map(|journal| journal.path.as_path())
    }

    pub fn record(&self, level: EventLevel, message: impl Into<String>, detail: impl Into<String>) {
        let event = RunEvent::new(level, message.into(), detail.into());
        match level {
            EventLevel::Debug => debug!(target: "run_events", detail = %event.detail, "{}", event.message),
            EventLevel::Info | EventLevel::Success => {
                info!(target: "run_events", detail = %event.detail, "{}", event.message)
            }
            EventLevel::Warning => warn!(target: "run_events", detail = %event.detail, "{}", event.message),
            EventLevel::Error => error!(target: "run_events", detail = %event.detail, "{}", event.message),
        }
        if !self.enabled.load(Ordering::Relaxed) || level == EventLevel::Debug {
            return;
        }

        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_EVENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        if let Some(journal) = &self.journal {
            if let Err(err) = journal.push(event) {
                warn!(target: "run_events", ?err, "failed to write event journal");
            }
        }
    }

    pub fn info(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.record(EventLevel::Info, message, detail);
    }

    pub fn success(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.record(EventLevel::Success, message, detail);
    }

    pub fn warning(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.record(EventLevel::Warning, message, detail);
    }

    pub fn error(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.record(EventLevel::Error, message, detail);
    }

    pub fn debug(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.record(EventLevel::Debug, message, detail);
    }

    pub fn recent(&self) -> Vec<RunEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.recent.lock().clear();
    }

    pub fn queue_depth(&self) -> usize {
        self.journal
            .as_ref()
            .map(|journal| journal.queue.lock().len())
            .unwrap_or(0)
    }

    pub fn flush(&self) -> AppResult<()> {
        match &self.journal {
            Some(journal) => journal.flush(),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    fn fail_next_write(&self) {
        if let Some(journal) = &self.journal {
            journal.fail_next_write.store(true, Ordering::SeqCst);
        }
    }
}

impl Journal {
    fn push(&self, event: RunEvent) -> AppResult<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_QUEUED_EVENTS {
            let excess = queue.len() + 1 - MAX_QUEUED_EVENTS;
            queue.drain(..excess);
            debug!(dropped = excess, "event journal backlog full; dropping oldest events");
        }
        queue.push(event);
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    fn persist_locked(&self, queue: &mut Vec<RunEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::new();
        for event in queue.iter() {
            serde_json::to_writer(&mut encoded, event)?;
            encoded.push(b'\n');
        }
        self.rotate_if_needed(encoded.len() as u64)?;

        #[cfg(test)]
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&encoded)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_size == 0 || current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count <= 1 {
            fs::write(&self.path, b"")?;
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let mut sequence = 0u32;
        let rotated = loop {
            let candidate = self
                .path
                .with_file_name(format!("{}-{}-{:03}.jsonl", self.stem(), stamp, sequence));
            if !candidate.exists() {
                break candidate;
            }
            sequence += 1;
        };
        fs::rename(&self.path, &rotated)?;
        self.prune_rotations()
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}-", self.stem());
        let mut rotations = fs::read_dir(parent)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
            })
            .collect::<Vec<_>>();

        // Timestamped names sort chronologically.
        rotations.sort();
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for path in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "geocoder-events".into())
    }
}
