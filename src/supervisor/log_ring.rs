//! Bounded per-job log kept in the job record.
//!
//! Appends are read-modify-write against the store, serialized per job so
//! that two drain tasks of the same job never lose each other's lines.
//! Overflow drops the oldest characters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::LogSource;
use crate::store::{JobId, JobStore, StoreError};
use crate::utils::clock_stamp;

/// Prefix of a tail read that dropped older content.
pub const TRUNCATION_MARKER: &str = "...\n";

pub struct LogRing {
    store: Arc<JobStore>,
    cap: usize,
    locks: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
}

impl LogRing {
    pub fn new(store: Arc<JobStore>, cap: usize) -> Self {
        Self {
            store,
            cap,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    fn lock_for(&self, id: JobId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id).or_default().clone()
    }

    /// Append raw text, then cut the head down to the cap.
    pub async fn append(&self, id: JobId, text: &str) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut buffer = self.store.log_buffer(id)?;
        buffer.push_str(text);
        let kept = tail_chars(&buffer, self.cap);
        if kept.len() != buffer.len() {
            let start = buffer.len() - kept.len();
            buffer.drain(..start);
        }
        self.store.set_log_buffer(id, &buffer)
    }

    /// Append one timestamped line.
    pub async fn append_line(
        &self,
        id: JobId,
        source: LogSource,
        message: &str,
    ) -> Result<(), StoreError> {
        self.append(id, &format_line(source, message)).await
    }

    /// Last `max_chars` characters, prefixed with [`TRUNCATION_MARKER`] when
    /// older content exists.
    pub async fn read(&self, id: JobId, max_chars: usize) -> Result<String, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let buffer = self.store.log_buffer(id)?;
        let tail = tail_chars(&buffer, max_chars);
        if tail.len() < buffer.len() {
            Ok(format!("{}{}", TRUNCATION_MARKER, tail))
        } else {
            Ok(buffer)
        }
    }

    /// Drop the lock entry of a deleted job.
    pub fn forget(&self, id: JobId) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(&id);
    }
}

/// `[HH:MM:SS] STDOUT: message`; supervisor messages carry no source label.
pub fn format_line(source: LogSource, message: &str) -> String {
    match source {
        LogSource::System => format!("[{}] {}\n", clock_stamp(), message),
        other => format!("[{}] {}: {}\n", clock_stamp(), other.label(), message),
    }
}

/// The last `max_chars` characters of `text`.
fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((start, _)) => &text[start..],
        None => "",
    }
}
