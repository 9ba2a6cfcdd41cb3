//! Call and broadcast history recorders.
//!
//! Every job that reaches a terminal state leaves exactly one record. Records
//! are kept in an in-memory index for queries and, when a path is configured,
//! appended as JSON lines by a background writer so the engine never waits on
//! disk I/O. Finished broadcasts are journaled the same way; only the most
//! recent ones stay in memory.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::core::broadcast::BroadcastRecord;
use crate::core::lifecycle::{CallState, FailureReason, StateTransition};
use crate::core::model::{Attempt, BroadcastId, CorrelationId, JobId};
use crate::errors::{CallError, CallResult};

/// Default page size for `recent`
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Finished broadcasts kept in memory; older ones live only in the journal
pub const FINISHED_BROADCASTS_RETAINED: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHistoryRecord {
    pub job_id: JobId,
    pub attempt: Attempt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<BroadcastId>,
    pub destination: String,
    pub caller_id: String,
    pub correlation_ids: Vec<CorrelationId>,
    pub transitions: Vec<StateTransition>,
    pub final_state: CallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Seconds from answer to end; absent for calls never answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

impl CallHistoryRecord {
    pub fn root_job_id(&self) -> JobId {
        match self.attempt {
            Attempt::Original => self.job_id,
            Attempt::Retry { original_job_id } => original_job_id,
        }
    }
}

#[derive(Debug, Default)]
struct HistoryIndex {
    records: Vec<CallHistoryRecord>,
    by_job: HashMap<JobId, usize>,
    by_root: HashMap<JobId, Vec<usize>>,
}

impl HistoryIndex {
    fn insert(&mut self, record: CallHistoryRecord) -> bool {
        if self.by_job.contains_key(&record.job_id) {
            return false;
        }
        let position = self.records.len();
        self.by_job.insert(record.job_id, position);
        self.by_root
            .entry(record.root_job_id())
            .or_default()
            .push(position);
        self.records.push(record);
        true
    }
}

enum WriterMessage {
    Append(String),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSON lines file fed by a background writer.
struct Journal {
    writer: mpsc::UnboundedSender<WriterMessage>,
}

impl Journal {
    /// Replay the readable lines of `path`, then open it for appending.
    async fn open<T: DeserializeOwned>(path: &Path) -> CallResult<(Vec<T>, Self)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut entries = Vec::new();
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                for (line_no, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<T>(line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => warn!(
                            "Skipping malformed line {} of {}: {}",
                            line_no + 1,
                            path.display(),
                            e
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.to_path_buf(), file, rx));

        Ok((entries, Self { writer: tx }))
    }

    fn append(&self, line: String) -> bool {
        self.writer.send(WriterMessage::Append(line)).is_ok()
    }

    async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct HistoryInner {
    index: RwLock<HistoryIndex>,
    journal: Option<Journal>,
}

#[derive(Clone)]
pub struct CallHistory {
    inner: Arc<HistoryInner>,
}

impl CallHistory {
    /// History that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                index: RwLock::new(HistoryIndex::default()),
                journal: None,
            }),
        }
    }

    /// Replay an existing history file and append new records to it.
    pub async fn open(path: impl AsRef<Path>) -> CallResult<Self> {
        let path = path.as_ref();
        let (records, journal) = Journal::open::<CallHistoryRecord>(path).await?;

        let mut index = HistoryIndex::default();
        for record in records {
            let job_id = record.job_id;
            if !index.insert(record) {
                warn!(job_id = %job_id, "Duplicate history record");
            }
        }
        info!(
            records = index.records.len(),
            "Opened call history at {}",
            path.display()
        );

        Ok(Self {
            inner: Arc::new(HistoryInner {
                index: RwLock::new(index),
                journal: Some(journal),
            }),
        })
    }

    /// Append a terminal record. A second record for the same job is refused.
    pub fn record(&self, record: CallHistoryRecord) -> CallResult<()> {
        let line = serde_json::to_string(&record)?;
        let job_id = record.job_id;

        if !self.inner.index.write().insert(record) {
            return Err(CallError::InvalidRequest(format!(
                "history record for job {job_id} already exists"
            )));
        }
        if let Some(journal) = &self.inner.journal {
            if !journal.append(line) {
                error!(job_id = %job_id, "History writer stopped, record kept in memory only");
            }
        }
        debug!(job_id = %job_id, "Recorded call history");
        Ok(())
    }

    pub fn get(&self, job_id: JobId) -> Option<CallHistoryRecord> {
        let index = self.inner.index.read();
        index
            .by_job
            .get(&job_id)
            .map(|&position| index.records[position].clone())
    }

    /// Last recorded attempt of the logical call started by `root`.
    pub fn latest_attempt(&self, root: JobId) -> Option<CallHistoryRecord> {
        let index = self.inner.index.read();
        index
            .by_root
            .get(&root)
            .and_then(|positions| positions.last())
            .map(|&position| index.records[position].clone())
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.inner.index.read().by_job.contains_key(&job_id)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<CallHistoryRecord> {
        let index = self.inner.index.read();
        index.records.iter().rev().take(limit).cloned().collect()
    }

    pub fn for_broadcast(&self, broadcast_id: BroadcastId) -> Vec<CallHistoryRecord> {
        let index = self.inner.index.read();
        index
            .records
            .iter()
            .filter(|r| r.broadcast_id == Some(broadcast_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.index.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until everything recorded so far is on disk.
    pub async fn flush(&self) {
        if let Some(journal) = &self.inner.journal {
            journal.flush().await;
        }
    }
}

struct BroadcastHistoryInner {
    finished: RwLock<VecDeque<BroadcastRecord>>,
    journal: Option<Journal>,
}

/// Finished broadcasts, newest last. Bounded in memory by
/// [`FINISHED_BROADCASTS_RETAINED`]; the journal keeps everything.
#[derive(Clone)]
pub struct BroadcastHistory {
    inner: Arc<BroadcastHistoryInner>,
}

impl BroadcastHistory {
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(BroadcastHistoryInner {
                finished: RwLock::new(VecDeque::new()),
                journal: None,
            }),
        }
    }

    pub async fn open(path: impl AsRef<Path>) -> CallResult<Self> {
        let path = path.as_ref();
        let (records, journal) = Journal::open::<BroadcastRecord>(path).await?;
        let skip = records.len().saturating_sub(FINISHED_BROADCASTS_RETAINED);
        let finished: VecDeque<BroadcastRecord> = records.into_iter().skip(skip).collect();
        info!(
            broadcasts = finished.len(),
            "Opened broadcast history at {}",
            path.display()
        );

        Ok(Self {
            inner: Arc::new(BroadcastHistoryInner {
                finished: RwLock::new(finished),
                journal: Some(journal),
            }),
        })
    }

    pub fn record(&self, record: BroadcastRecord) -> CallResult<()> {
        let line = serde_json::to_string(&record)?;
        let broadcast_id = record.broadcast_id;
        {
            let mut finished = self.inner.finished.write();
            finished.push_back(record);
            while finished.len() > FINISHED_BROADCASTS_RETAINED {
                finished.pop_front();
            }
        }
        if let Some(journal) = &self.inner.journal {
            if !journal.append(line) {
                error!(broadcast_id = %broadcast_id, "Broadcast journal stopped, record kept in memory only");
            }
        }
        Ok(())
    }

    pub fn get(&self, broadcast_id: BroadcastId) -> Option<BroadcastRecord> {
        self.inner
            .finished
            .read()
            .iter()
            .rev()
            .find(|r| r.broadcast_id == broadcast_id)
            .cloned()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<BroadcastRecord> {
        self.inner
            .finished
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.finished.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn flush(&self) {
        if let Some(journal) = &self.inner.journal {
            journal.flush().await;
        }
    }
}

async fn run_writer(
    path: PathBuf,
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Append(mut line) => {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!("Failed to append to {}: {}", path.display(), e);
                }
            }
            WriterMessage::Flush(done) => {
                if let Err(e) = file.flush().await {
                    error!("Failed to flush {}: {}", path.display(), e);
                }
                let _ = done.send(());
            }
        }
    }
    let _ = file.flush().await;
    debug!("History writer stopped");
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn record(state: CallState) -> CallHistoryRecord {
        let now = Utc::now();
        CallHistoryRecord {
            job_id: JobId::new(),
            attempt: Attempt::Original,
            broadcast_id: None,
            destination: "+15550100".to_string(),
            caller_id: "Home Assistant".to_string(),
            correlation_ids: vec![CorrelationId::new()],
            transitions: vec![StateTransition { state, at: now }],
            final_state: state,
            failure: None,
            started_at: now,
            ended_at: now,
            duration_secs: None,
        }
    }

    #[test]
    fn test_duplicate_job_is_rejected() {
        let history = CallHistory::in_memory();
        let first = record(CallState::Completed);
        history.record(first.clone()).unwrap();

        assert!(history.record(first).is_err());
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let history = CallHistory::in_memory();
        let records: Vec<_> = (0..5).map(|_| record(CallState::Completed)).collect();
        for r in &records {
            history.record(r.clone()).unwrap();
        }

        let recent = history.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].job_id, records[4].job_id);
        assert_eq!(recent[2].job_id, records[2].job_id);
    }

    #[test]
    fn test_latest_attempt_follows_retry() {
        let history = CallHistory::in_memory();
        let original = record(CallState::Failed);
        let mut retry = record(CallState::Completed);
        retry.attempt = Attempt::Retry {
            original_job_id: original.job_id,
        };
        history.record(original.clone()).unwrap();
        history.record(retry.clone()).unwrap();

        let latest = history.latest_attempt(original.job_id).unwrap();
        assert_eq!(latest.job_id, retry.job_id);
        assert_eq!(latest.final_state, CallState::Completed);
    }

    #[test]
    fn test_for_broadcast_filters() {
        let history = CallHistory::in_memory();
        let broadcast_id = BroadcastId::new();
        let mut a = record(CallState::Completed);
        a.broadcast_id = Some(broadcast_id);
        let b = record(CallState::Completed);
        history.record(a.clone()).unwrap();
        history.record(b).unwrap();

        let found = history.for_broadcast(broadcast_id);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].job_id, a.job_id);
    }

    #[tokio::test]
    async fn test_file_is_replayed_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let saved = record(CallState::Failed);

        {
            let history = CallHistory::open(&path).await.unwrap();
            history.record(saved.clone()).unwrap();
            history.flush().await;
        }

        let reopened = CallHistory::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(saved.job_id), Some(saved.clone()));
        assert!(reopened.record(saved).is_err());
    }

    fn finished_broadcast(name: &str) -> BroadcastRecord {
        use crate::core::broadcast::{AggregateStatus, BroadcastStatus};

        let now = Utc::now();
        BroadcastRecord {
            broadcast_id: BroadcastId::new(),
            name: name.to_string(),
            status: BroadcastStatus::Done,
            aggregate: Some(AggregateStatus::Partial),
            total: 2,
            completed: 1,
            failed: 1,
            cancelled: 0,
            in_progress: 0,
            job_ids: vec![JobId::new(), JobId::new()],
            created_at: now,
            completed_at: Some(now),
        }
    }

    #[test]
    fn test_finished_broadcasts_are_capped() {
        let history = BroadcastHistory::in_memory();
        let first = finished_broadcast("first");
        history.record(first.clone()).unwrap();
        for i in 0..FINISHED_BROADCASTS_RETAINED {
            history.record(finished_broadcast(&format!("b{i}"))).unwrap();
        }

        assert_eq!(history.len(), FINISHED_BROADCASTS_RETAINED);
        assert!(history.get(first.broadcast_id).is_none());
        let recent = history.recent(2);
        assert_eq!(recent[0].name, format!("b{}", FINISHED_BROADCASTS_RETAINED - 1));
        assert_eq!(recent[1].name, format!("b{}", FINISHED_BROADCASTS_RETAINED - 2));
    }

    #[tokio::test]
    async fn test_broadcast_journal_is_replayed_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broadcasts.jsonl");
        let saved = finished_broadcast("dinner");

        {
            let history = BroadcastHistory::open(&path).await.unwrap();
            history.record(saved.clone()).unwrap();
            history.flush().await;
        }

        let reopened = BroadcastHistory::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(saved.broadcast_id), Some(saved));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let good = record(CallState::Completed);
        let contents = format!("not json\n{}\n\n", serde_json::to_string(&good).unwrap());
        tokio::fs::write(&path, contents).await.unwrap();

        let history = CallHistory::open(&path).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history.contains(good.job_id));
    }
}
