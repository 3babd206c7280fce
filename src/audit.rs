//! Append-only audit trail for privileged actions.
//!
//! [`AuditLogger::record`] is awaited before the response to a privileged
//! request is released, so a recorded action survives a crash that happens
//! right after it. Records are numbered under one lock that also covers the
//! write, which makes storage order and sequence order identical. Across
//! concurrent admins only that order is guaranteed, not the order in which
//! the actions started.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::metrics;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("audit log {path} is corrupt at line {line}")]
    Corrupt { path: PathBuf, line: usize },
}

/// Result of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Rejected by an admission gate.
    Denied,
    Failure,
}

impl AuditOutcome {
    /// Outcome implied by a response status.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            200..=399 => AuditOutcome::Success,
            401 | 403 | 429 => AuditOutcome::Denied,
            _ => AuditOutcome::Failure,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Failure => "failure",
        }
    }
}

/// An action to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub actor: String,
    pub action: String,
    pub target: String,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub request_id: Option<String>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            outcome,
            detail: None,
            request_id: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// A persisted audit record, keyed by `(timestamp, seq)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Durable destination for audit records.
///
/// Writes are serialized by [`AuditLogger`]; a sink only has to persist
/// what it is given, in the order given.
#[async_trait]
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Persist one record. Must not return before the record is durable.
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Sequence number of the last persisted record, if any.
    async fn last_seq(&self) -> Result<Option<u64>, AuditError>;

    /// Up to `limit` records, newest first, skipping the `offset` newest.
    async fn recent(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError>;
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn last_seq(&self) -> Result<Option<u64>, AuditError> {
        Ok(self.records.lock().await.last().map(|r| r.seq))
    }

    async fn recent(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().skip(offset).take(limit).cloned().collect())
    }
}

/// Sink appending one JSON object per line, synced after every record.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    /// Open (or create) the log at `path` for appending.
    ///
    /// A trailing fragment without a newline is a write that never completed
    /// and is cut off.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;

        let contents = tokio::fs::read(&path).await?;
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            let keep = contents.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
            warn!(
                path = %path.display(),
                dropped_bytes = contents.len() - keep,
                "Dropping incomplete trailing audit record"
            );
            file.set_len(keep as u64).await?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_line(&self, index: usize, line: &str) -> Result<AuditRecord, AuditError> {
        serde_json::from_str(line).map_err(|_| AuditError::Corrupt {
            path: self.path.clone(),
            line: index + 1,
        })
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        append_line(&mut *file, &line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn last_seq(&self) -> Result<Option<u64>, AuditError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let last = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .last();

        match last {
            None => Ok(None),
            Some((index, line)) => self.parse_line(index, line).map(|record| Some(record.seq)),
        }
    }

    async fn recent(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
        // Append lock held: no record is mid-write.
        let _file = self.file.lock().await;
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let lines: Vec<(usize, &str)> = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();

        lines
            .into_iter()
            .rev()
            .skip(offset)
            .take(limit)
            .map(|(index, line)| self.parse_line(index, line))
            .collect()
    }
}

/// Byte target that can be cut back to an earlier length.
#[async_trait]
trait AppendTarget: AsyncWrite + Unpin + Send {
    async fn current_len(&mut self) -> std::io::Result<u64>;

    async fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

#[async_trait]
impl AppendTarget for File {
    async fn current_len(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len).await
    }
}

/// Append one newline-terminated record. A write that fails partway is cut
/// back so the fragment cannot prefix the next record.
async fn append_line<T: AppendTarget>(target: &mut T, line: &[u8]) -> Result<(), AuditError> {
    let len = target.current_len().await?;

    let written = async {
        target.write_all(line).await?;
        target.flush().await
    }
    .await;

    if let Err(e) = written {
        if let Err(cut) = target.truncate(len).await {
            error!(error = %cut, "Failed to remove partial audit record");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Records privileged actions.
#[derive(Debug)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    /// Next sequence number. Held across the sink write.
    next_seq: Mutex<u64>,
    clock: SharedClock,
}

impl AuditLogger {
    /// Create a logger continuing the sink's existing sequence.
    pub async fn open(sink: Arc<dyn AuditSink>, clock: SharedClock) -> Result<Self, AuditError> {
        let next_seq = sink.last_seq().await?.map_or(1, |seq| seq.saturating_add(1));
        info!(next_seq, "Audit trail opened");
        Ok(Self {
            sink,
            next_seq: Mutex::new(next_seq),
            clock,
        })
    }

    /// Most recent records, newest first.
    pub async fn recent(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
        self.sink.recent(limit, offset).await
    }

    /// Persist one record for `entry`.
    ///
    /// A failed write consumes no sequence number.
    pub async fn record(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut next_seq = self.next_seq.lock().await;

        let record = AuditRecord {
            seq: *next_seq,
            timestamp: self.clock.now(),
            actor: entry.actor,
            action: entry.action,
            target: entry.target,
            outcome: entry.outcome,
            detail: entry.detail,
            request_id: entry.request_id,
        };

        match self.sink.write(&record).await {
            Ok(()) => {
                *next_seq = next_seq.saturating_add(1);
                drop(next_seq);
                metrics::record_audit_record(record.outcome.as_str());
                info!(
                    seq = record.seq,
                    actor = %record.actor,
                    action = %record.action,
                    target = %record.target,
                    outcome = record.outcome.as_str(),
                    "Audit record written"
                );
                Ok(record)
            }
            Err(e) => {
                drop(next_seq);
                metrics::record_audit_failure();
                error!(
                    error = %e,
                    actor = %record.actor,
                    action = %record.action,
                    "Failed to write audit record"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;

    fn entry(actor: &str) -> AuditEntry {
        AuditEntry::new(actor, "POST /admin/posts", "/admin/posts", AuditOutcome::Success)
    }

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(AuditOutcome::from_status(StatusCode::OK), AuditOutcome::Success);
        assert_eq!(AuditOutcome::from_status(StatusCode::FORBIDDEN), AuditOutcome::Denied);
        assert_eq!(AuditOutcome::from_status(StatusCode::TOO_MANY_REQUESTS), AuditOutcome::Denied);
        assert_eq!(
            AuditOutcome::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            AuditOutcome::Failure
        );
    }

    #[tokio::test]
    async fn test_concurrent_records_are_distinct_and_complete() {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = Arc::new(AuditLogger::open(sink.clone(), Arc::new(ManualClock::new())).await.unwrap());

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let logger = logger.clone();
                tokio::spawn(async move { logger.record(entry(&format!("admin{i}@example.com"))).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let records = sink.records().await;
        assert_eq!(records.len(), 50);

        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<_>>());

        let actors: HashSet<&str> = records.iter().map(|r| r.actor.as_str()).collect();
        assert_eq!(actors.len(), 50);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_and_resumes_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let clock: SharedClock = Arc::new(ManualClock::new());

        {
            let sink = Arc::new(JsonlAuditSink::open(&path).await.unwrap());
            let logger = AuditLogger::open(sink, clock.clone()).await.unwrap();
            logger.record(entry("a@example.com")).await.unwrap();
            logger
                .record(entry("b@example.com").with_detail("secret rotated"))
                .await
                .unwrap();
        }

        let sink = Arc::new(JsonlAuditSink::open(&path).await.unwrap());
        let logger = AuditLogger::open(sink, clock).await.unwrap();
        let third = logger.record(entry("c@example.com")).await.unwrap();
        assert_eq!(third.seq, 3);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<AuditRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].detail.as_deref(), Some("secret rotated"));
        assert_eq!(records[2].actor, "c@example.com");

        let page = logger.recent(2, 0).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 2]);
        assert_eq!(logger.recent(10, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink_pages_newest_first() {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::open(sink, Arc::new(ManualClock::new())).await.unwrap();
        for i in 0..5 {
            logger.record(entry(&format!("admin{i}@example.com"))).await.unwrap();
        }

        let page = logger.recent(2, 1).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![4, 3]);
        assert!(logger.recent(10, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_log_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        tokio::fs::write(&path, "not json\n").await.unwrap();

        let sink = Arc::new(JsonlAuditSink::open(&path).await.unwrap());
        let result = AuditLogger::open(sink, Arc::new(ManualClock::new())).await;
        assert!(matches!(result, Err(AuditError::Corrupt { line: 1, .. })));
    }

    /// Accepts bytes until `capacity`, then fails like a full disk.
    struct ShortWriter {
        data: Vec<u8>,
        capacity: usize,
    }

    impl AsyncWrite for ShortWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            let room = this.capacity.saturating_sub(this.data.len());
            if room == 0 {
                return std::task::Poll::Ready(Err(std::io::Error::other("no space left on device")));
            }
            let n = room.min(buf.len());
            this.data.extend(buf.iter().take(n));
            std::task::Poll::Ready(Ok(n))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl AppendTarget for ShortWriter {
        async fn current_len(&mut self) -> std::io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_partial_write_is_cut_back() {
        let mut target = ShortWriter {
            data: b"{\"seq\":1}\n".to_vec(),
            capacity: 16,
        };

        let result = append_line(&mut target, b"{\"seq\":2,\"actor\":\"a@example.com\"}\n").await;
        assert!(matches!(result, Err(AuditError::Io(_))));
        assert_eq!(target.data, b"{\"seq\":1}\n");

        target.capacity = usize::MAX;
        append_line(&mut target, b"{\"seq\":2}\n").await.unwrap();
        assert_eq!(target.data, b"{\"seq\":1}\n{\"seq\":2}\n");
    }

    #[tokio::test]
    async fn test_torn_tail_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let clock: SharedClock = Arc::new(ManualClock::new());

        {
            let sink = Arc::new(JsonlAuditSink::open(&path).await.unwrap());
            let logger = AuditLogger::open(sink, clock.clone()).await.unwrap();
            logger.record(entry("a@example.com")).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"{\"seq\":2,\"actor\":\"b@exa").await.unwrap();
        file.sync_data().await.unwrap();
        drop(file);

        let sink = Arc::new(JsonlAuditSink::open(&path).await.unwrap());
        let logger = AuditLogger::open(sink, clock).await.unwrap();
        let next = logger.record(entry("c@example.com")).await.unwrap();
        assert_eq!(next.seq, 2);

        let actors: Vec<String> = logger.recent(10, 0).await.unwrap().into_iter().map(|r| r.actor).collect();
        assert_eq!(actors, vec!["c@example.com", "a@example.com"]);
    }

    #[derive(Debug)]
    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn write(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Io(std::io::Error::other("disk full")))
        }

        async fn last_seq(&self) -> Result<Option<u64>, AuditError> {
            Ok(None)
        }

        async fn recent(&self, _limit: usize, _offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_error() {
        let logger = AuditLogger::open(Arc::new(FailingSink), Arc::new(ManualClock::new()))
            .await
            .unwrap();
        assert!(matches!(logger.record(entry("a@example.com")).await, Err(AuditError::Io(_))));
    }
}
