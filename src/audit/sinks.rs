//! Rejection sink implementations.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::RejectionRecord;
use crate::error::CollaboratorError;

/// Destination for rejection records.
///
/// Implementations must return quickly and never block on I/O.
pub trait RejectionSink: Send + Sync {
    /// Record a rejection.
    fn record(&self, record: &RejectionRecord) -> Result<(), CollaboratorError>;
}

/// Logs each rejection as a structured warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl RejectionSink for TracingSink {
    fn record(&self, record: &RejectionRecord) -> Result<(), CollaboratorError> {
        warn!(
            tier = %record.tier,
            key = %record.key,
            method = %record.method,
            path = %record.path,
            "Request rejected"
        );
        Ok(())
    }
}

/// Bounded in-memory history of the most recent rejections.
#[derive(Debug)]
pub struct RecentRejections {
    capacity: usize,
    records: Mutex<VecDeque<RejectionRecord>>,
}

impl RecentRejections {
    /// Keep at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Records from newest to oldest.
    pub fn snapshot(&self) -> Vec<RejectionRecord> {
        self.records.lock().iter().rev().cloned().collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RejectionSink for RecentRejections {
    fn record(&self, record: &RejectionRecord) -> Result<(), CollaboratorError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }
}

/// Appends rejections as JSON lines to a file.
///
/// Records are handed to a background writer through a bounded channel; a
/// full or closed channel is reported as an error instead of waiting.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    sender: mpsc::Sender<RejectionRecord>,
}

impl JsonLinesSink {
    /// Open `path` for appending and start the writer task.
    ///
    /// The writer finishes once every clone of the sink has been dropped.
    pub async fn spawn(path: impl AsRef<Path>, buffer: usize) -> std::io::Result<(Self, JoinHandle<()>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (sender, mut receiver) = mpsc::channel::<RejectionRecord>(buffer.max(1));

        let handle = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode rejection record");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!(error = %e, path = %path.display(), "Failed to write audit log");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    warn!(error = %e, path = %path.display(), "Failed to flush audit log");
                }
            }
            debug!(path = %path.display(), "Audit log writer stopped");
        });

        Ok((Self { sender }, handle))
    }
}

impl RejectionSink for JsonLinesSink {
    fn record(&self, record: &RejectionRecord) -> Result<(), CollaboratorError> {
        self.sender.try_send(record.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CollaboratorError::Unavailable("audit log buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                CollaboratorError::Unavailable("audit log writer stopped".to_string())
            }
        })
    }
}

/// Fans a record out to every configured sink, swallowing failures.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn RejectionSink>>,
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSet").field("sinks", &self.sinks.len()).finish()
    }
}

impl SinkSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn RejectionSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Hand a record to every sink.
    ///
    /// A sink that errors or panics is skipped; the rest still see the record.
    pub fn emit(&self, record: &RejectionRecord) {
        for sink in &self.sinks {
            match catch_unwind(AssertUnwindSafe(|| sink.record(record))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, tier = %record.tier, "Rejection sink failed"),
                Err(_) => warn!(tier = %record.tier, "Rejection sink panicked"),
            }
        }
    }
}
