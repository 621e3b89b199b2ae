//! Where delivery attempt records end up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::DeliveryAttemptRecord;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write delivery attempt: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode delivery attempt: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery attempt rejected: {0}")]
    Rejected(String),
}

/// Persists delivery attempt records. Write failures must be returned, not swallowed.
#[async_trait]
pub trait AttemptSink: Send + Sync {
    async fn append(&self, record: &DeliveryAttemptRecord) -> Result<(), SinkError>;
}

/// Appends records as JSON lines to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AttemptSink for JsonLinesSink {
    async fn append(&self, record: &DeliveryAttemptRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory. Can be switched to refuse writes.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<DeliveryAttemptRecord>>>,
    refusal: Arc<Mutex<Option<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DeliveryAttemptRecord> {
        self.records.lock().await.clone()
    }

    /// Makes every following append fail with `reason`, or succeed again with `None`.
    pub async fn refuse_writes(&self, reason: Option<String>) {
        *self.refusal.lock().await = reason;
    }
}

#[async_trait]
impl AttemptSink for MemorySink {
    async fn append(&self, record: &DeliveryAttemptRecord) -> Result<(), SinkError> {
        if let Some(reason) = self.refusal.lock().await.clone() {
            return Err(SinkError::Rejected(reason));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MailJob;

    #[tokio::test]
    async fn json_lines_sink_appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("attempts.jsonl"));
        let job = MailJob::new("a@x.com", "S", "B", false);

        sink.append(&DeliveryAttemptRecord::sent(&job)).await.unwrap();
        sink.append(&DeliveryAttemptRecord::failed(&job, "SMTP auth error"))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let records: Vec<DeliveryAttemptRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert!(records[0].sent_successfully);
        assert_eq!(records[1].error_message.as_deref(), Some("SMTP auth error"));
    }

    #[tokio::test]
    async fn json_lines_sink_surfaces_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("missing").join("attempts.jsonl"));
        let job = MailJob::new("a@x.com", "S", "B", false);

        let err = sink.append(&DeliveryAttemptRecord::sent(&job)).await.unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
    }

    #[tokio::test]
    async fn memory_sink_can_refuse() {
        let sink = MemorySink::new();
        let job = MailJob::new("a@x.com", "S", "B", false);

        sink.refuse_writes(Some("db down".into())).await;
        assert!(sink.append(&DeliveryAttemptRecord::sent(&job)).await.is_err());
        sink.refuse_writes(None).await;
        sink.append(&DeliveryAttemptRecord::sent(&job)).await.unwrap();

        assert_eq!(sink.records().await.len(), 1);
    }
}
