//! Persistence sinks for audit events.
//!
//! The async logger is agnostic to where events end up; it talks to an
//! [`AuditSink`]. Built-in sinks write JSON lines to a file, emit tracing
//! records, keep events in memory, or discard them.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{AuditError, AuditResult};

use super::event::AuditEvent;

/// A destination for persisted audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist a single event.
    async fn save(&self, event: &AuditEvent) -> AuditResult<()>;

    /// Persist several events in order.
    ///
    /// The default saves them one by one and is not atomic; sinks that
    /// override it with an all-or-nothing write should also report
    /// [`AuditSink::supports_batch`].
    async fn save_batch(&self, events: &[AuditEvent]) -> AuditResult<()> {
        for event in events {
            self.save(event).await?;
        }
        Ok(())
    }

    /// Whether `save_batch` writes a batch all-or-nothing.
    fn supports_batch(&self) -> bool {
        false
    }
}

/// Sink appending one JSON object per line to a file.
///
/// File I/O runs on the blocking thread pool; each write is synced for
/// durability. A failed write is cut back to the previous end of file, so a
/// batch lands whole or not at all.
pub struct JsonLinesSink {
    /// Shared with the blocking writer tasks.
    file: Arc<Mutex<File>>,
    /// Path to the log file.
    path: PathBuf,
}

impl JsonLinesSink {
    /// Open (or create) the file at `path` in append mode.
    ///
    /// Creates the parent directory if it doesn't exist.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the audit log file
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be opened for appending.
    pub fn open(path: &Path) -> AuditResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!(path = %parent.display(), "Creating audit log directory");
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        debug!(path = %path.display(), "JSON lines audit sink opened");

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Get the path to the audit log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_lines(&self, buffer: Vec<u8>) -> AuditResult<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || -> AuditResult<()> {
            let mut file = file.lock().map_err(|e| AuditError::Persistence {
                message: format!("Failed to acquire audit log lock: {}", e),
            })?;
            append_all(&mut *file, &buffer)?;
            if let Err(e) = file.sync_data() {
                warn!(error = %e, "Failed to sync audit log");
            }
            Ok(())
        })
        .await
        .map_err(|e| AuditError::Persistence {
            message: format!("Audit log writer task failed: {}", e),
        })?
    }
}

/// Append target that can be cut back to an earlier length.
trait AppendTarget: Write {
    fn end_offset(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, offset: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn end_offset(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, offset: u64) -> io::Result<()> {
        self.set_len(offset)
    }
}

/// Write `buffer` completely or restore the previous end of the target.
fn append_all<T: AppendTarget>(target: &mut T, buffer: &[u8]) -> io::Result<()> {
    let start = target.end_offset()?;
    if let Err(e) = target.write_all(buffer).and_then(|()| target.flush()) {
        if let Err(rollback) = target.truncate_to(start) {
            warn!(error = %rollback, offset = start, "Failed to roll back partial audit write");
        }
        return Err(e);
    }
    Ok(())
}

fn encode_line(buffer: &mut Vec<u8>, event: &AuditEvent) -> AuditResult<()> {
    serde_json::to_writer(&mut *buffer, event)?;
    buffer.push(b'\n');
    Ok(())
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    async fn save(&self, event: &AuditEvent) -> AuditResult<()> {
        let mut buffer = Vec::new();
        encode_line(&mut buffer, event)?;
        self.write_lines(buffer).await
    }

    async fn save_batch(&self, events: &[AuditEvent]) -> AuditResult<()> {
        let mut buffer = Vec::new();
        for event in events {
            encode_line(&mut buffer, event)?;
        }
        self.write_lines(buffer).await
    }

    fn supports_batch(&self) -> bool {
        true
    }
}

/// Sink emitting each event as a structured tracing record on the `audit`
/// target.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingSink {
    async fn save(&self, event: &AuditEvent) -> AuditResult<()> {
        let json = serde_json::to_string(event)?;
        info!(
            target: "audit",
            request_id = %event.request_id(),
            action = %event.action(),
            resource_type = %event.resource_type(),
            event = %json,
            "Audit event"
        );
        Ok(())
    }
}

/// Bounded in-memory sink; the oldest events are evicted first.
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max_events.max(1),
        }
    }

    /// Snapshot of the stored events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn save(&self, event: &AuditEvent) -> AuditResult<()> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}

/// A sink that discards every event.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl NullAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn save(&self, _event: &AuditEvent) -> AuditResult<()> {
        Ok(())
    }

    async fn save_batch(&self, _events: &[AuditEvent]) -> AuditResult<()> {
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        true
    }
}
