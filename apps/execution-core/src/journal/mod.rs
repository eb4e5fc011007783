//! Append-only transaction journal.
//!
//! One event per JSON line, UTF-8, newline-terminated. The journal is the
//! idempotency substrate: replaying `ORDER_SUBMIT` records at startup seeds
//! the engine's already-submitted set, so duplicate-order prevention
//! survives process restarts.
//!
//! Durability contract: `append` returns only after the line has been
//! written, flushed, and fsynced. A single writer is assumed; concurrent
//! appenders serialize through the internal lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::models::Event;

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Filesystem failure.
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record failed to serialize.
    #[error("journal encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A newline-terminated record failed to parse. The file is damaged
    /// and replay cannot be trusted.
    #[error("journal corrupt at line {line}: {detail}")]
    Corrupt {
        /// 1-based line number of the bad record.
        line: usize,
        /// Parse failure detail.
        detail: String,
    },

    /// Operation on a closed journal.
    #[error("journal is closed")]
    Closed,
}

/// Append-only durable event journal.
pub trait TransactionLog: Send + Sync {
    /// Append one event. Atomic and durable before returning.
    fn append(&self, event: &Event) -> Result<(), JournalError>;

    /// Replay events in append order, keeping those matching `filter`.
    fn replay(&self, filter: &dyn Fn(&Event) -> bool) -> Result<Vec<Event>, JournalError>;

    /// Flush and release the underlying handle. Idempotent.
    fn close(&self) -> Result<(), JournalError>;
}

/// File-backed journal (JSON lines).
pub struct FileJournal {
    path: PathBuf,
    // None after close()
    handle: Mutex<Option<File>>,
}

impl FileJournal {
    /// Open (or create) a journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            handle: Mutex::new(Some(file)),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TransactionLog for FileJournal {
    fn append(&self, event: &Event) -> Result<(), JournalError> {
        let line = serde_json::to_string(event)?;
        let mut guard = self.handle.lock().map_err(|_| JournalError::Closed)?;
        let file = guard.as_mut().ok_or(JournalError::Closed)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn replay(&self, filter: &dyn Fn(&Event) -> bool) -> Result<Vec<Event>, JournalError> {
        // Hold the lock so replay sees a consistent file.
        let _guard = self.handle.lock().map_err(|_| JournalError::Closed)?;

        let mut content = String::new();
        File::open(&self.path)?.read_to_string(&mut content)?;

        let complete = match content.rfind('\n') {
            Some(last_newline) => {
                let tail = &content[last_newline + 1..];
                if !tail.is_empty() {
                    warn!(
                        path = %self.path.display(),
                        bytes = tail.len(),
                        "discarding truncated final journal record"
                    );
                }
                &content[..=last_newline]
            }
            None => {
                if !content.is_empty() {
                    warn!(
                        path = %self.path.display(),
                        "discarding truncated sole journal record"
                    );
                }
                ""
            }
        };

        let mut events = Vec::new();
        for (index, line) in complete.lines().enumerate() {
            let event: Event =
                serde_json::from_str(line).map_err(|e| JournalError::Corrupt {
                    line: index + 1,
                    detail: e.to_string(),
                })?;
            if filter(&event) {
                events.push(event);
            }
        }
        debug!(
            path = %self.path.display(),
            events = events.len(),
            "journal replay complete"
        );
        Ok(events)
    }

    fn close(&self) -> Result<(), JournalError> {
        let mut guard = self.handle.lock().map_err(|_| JournalError::Closed)?;
        if let Some(mut file) = guard.take() {
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }
}

/// In-memory journal for tests and dry runs.
#[derive(Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<Event>>,
    closed: Mutex<bool>,
}

impl MemoryJournal {
    /// Create an empty in-memory journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true if no events have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionLog for MemoryJournal {
    fn append(&self, event: &Event) -> Result<(), JournalError> {
        if *self.closed.lock().map_err(|_| JournalError::Closed)? {
            return Err(JournalError::Closed);
        }
        self.events
            .lock()
            .map_err(|_| JournalError::Closed)?
            .push(event.clone());
        Ok(())
    }

    fn replay(&self, filter: &dyn Fn(&Event) -> bool) -> Result<Vec<Event>, JournalError> {
        Ok(self
            .events
            .lock()
            .map_err(|_| JournalError::Closed)?
            .iter()
            .filter(|e| filter(e))
            .cloned()
            .collect())
    }

    fn close(&self) -> Result<(), JournalError> {
        *self.closed.lock().map_err(|_| JournalError::Closed)? = true;
        Ok(())
    }
}
