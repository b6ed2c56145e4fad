//! Per-task result records and the inbound fragment channels behind them.
//!
//! Workers push into an entry through [`TaskResultStore::push`]; the response
//! stream that owns the task takes the receiving half once with
//! [`TaskResultStore::take_stream`]. Dropping the [`TaskStream`] removes the entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use tabrelay_core::{Error, Result};

/// End-of-stream marker sent by workers as a chunk.
pub const END_MARKER: &str = "[DONE]";

/// One item on a task's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Fragment(String),
    /// Explicit end-of-stream marker.
    End,
    /// Producer-side error or disconnect.
    Error(String),
    /// The job went to a worker again; fragments received so far are void.
    Restart,
}

impl Inbound {
    /// Interpret a worker-reported chunk.
    pub fn from_chunk(chunk: &Value) -> Self {
        match chunk {
            Value::String(s) if s == END_MARKER => Inbound::End,
            Value::String(s) => Inbound::Fragment(s.clone()),
            Value::Array(parts) => Inbound::Fragment(
                parts
                    .iter()
                    .map(|p| match p {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            Value::Object(map) if map.contains_key("error") => {
                Inbound::Error(match &map["error"] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            }
            Value::Null => Inbound::Fragment(String::new()),
            other => Inbound::Fragment(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct TaskEntry {
    record: TaskRecord,
    /// Dropped by [`TaskResultStore::close`] once no producer is left.
    tx: Option<mpsc::UnboundedSender<Inbound>>,
    rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    pickup_tx: Option<oneshot::Sender<()>>,
    pickup_rx: Option<oneshot::Receiver<()>>,
}

impl TaskEntry {
    fn fire_pickup(&mut self) -> bool {
        match self.pickup_tx.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Concurrent map of in-flight tasks, keyed by task id.
#[derive(Clone, Default)]
pub struct TaskResultStore {
    entries: Arc<DashMap<String, TaskEntry>>,
}

impl TaskResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a new task. Task ids are unique.
    pub fn create(&self, task_id: &str) -> Result<()> {
        if self.entries.contains_key(task_id) {
            return Err(Error::Internal(format!("task {} already exists", task_id)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (pickup_tx, pickup_rx) = oneshot::channel();
        self.entries.insert(
            task_id.to_string(),
            TaskEntry {
                record: TaskRecord {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Pending,
                    finish_reason: None,
                    error: None,
                    created_at: Utc::now(),
                },
                tx: Some(tx),
                rx: Some(rx),
                pickup_tx: Some(pickup_tx),
                pickup_rx: Some(pickup_rx),
            },
        );
        Ok(())
    }

    /// Append an item to the task's inbound queue.
    pub fn push(&self, task_id: &str, item: Inbound) -> Result<()> {
        let mut entry = self
            .entries
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        let tx = entry
            .tx
            .clone()
            .ok_or_else(|| Error::NotFound(format!("task {} is closed", task_id)))?;
        entry.fire_pickup();
        if entry.record.status == TaskStatus::Pending {
            entry.record.status = TaskStatus::Streaming;
        }
        tx.send(item)
            .map_err(|_| Error::NotFound(format!("task {} is no longer read", task_id)))
    }

    /// Tell the reader that the job was handed out again.
    ///
    /// Unlike [`push`](Self::push) this is not a sign of worker progress, so
    /// the pickup signal is left alone.
    pub fn restart(&self, task_id: &str) -> bool {
        let Some(entry) = self.entries.get(task_id) else {
            return false;
        };
        match &entry.tx {
            Some(tx) => tx.send(Inbound::Restart).is_ok(),
            None => false,
        }
    }

    /// Drop the producing half. The reader sees end-of-channel after draining
    /// what was already queued; later pushes are rejected.
    pub fn close(&self, task_id: &str) -> bool {
        match self.entries.get_mut(task_id) {
            Some(mut entry) => entry.tx.take().is_some(),
            None => false,
        }
    }

    /// Signal that a worker fetched the job (pull mode).
    pub fn mark_picked_up(&self, task_id: &str) -> bool {
        self.entries
            .get_mut(task_id)
            .map(|mut e| e.fire_pickup())
            .unwrap_or(false)
    }

    /// Take the receiving half. Only the first call succeeds.
    pub fn take_stream(&self, task_id: &str) -> Result<TaskStream> {
        let mut entry = self
            .entries
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        let rx = entry
            .rx
            .take()
            .ok_or_else(|| Error::NotFound(format!("task {} already drained", task_id)))?;
        let pickup = entry.pickup_rx.take();
        Ok(TaskStream {
            task_id: task_id.to_string(),
            rx,
            pickup,
            store: self.clone(),
        })
    }

    pub fn status(&self, task_id: &str) -> Option<TaskRecord> {
        self.entries.get(task_id).map(|e| e.record.clone())
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> bool {
        match self.entries.get_mut(task_id) {
            Some(mut entry) => {
                entry.record.status = status;
                true
            }
            None => false,
        }
    }

    /// Record how a task ended.
    pub fn record_outcome(
        &self,
        task_id: &str,
        status: TaskStatus,
        finish_reason: Option<String>,
        error: Option<String>,
    ) {
        if let Some(mut entry) = self.entries.get_mut(task_id) {
            entry.record.status = status;
            entry.record.finish_reason = finish_reason;
            entry.record.error = error;
        }
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskRecord> {
        self.entries.remove(task_id).map(|(_, e)| {
            let record = e.record;
            match (&record.finish_reason, &record.error) {
                (_, Some(error)) => info!(task_id, status = ?record.status, error = %error, "Task released"),
                (Some(reason), None) => {
                    info!(task_id, status = ?record.status, finish_reason = %reason, "Task released")
                }
                (None, None) => debug!(task_id, status = ?record.status, "Task released"),
            }
            record
        })
    }

    /// Records of every in-flight task, oldest first.
    pub fn records(&self) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self.entries.iter().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receiving side of one task's inbound queue. Releases the entry on drop.
pub struct TaskStream {
    task_id: String,
    rx: mpsc::UnboundedReceiver<Inbound>,
    pickup: Option<oneshot::Receiver<()>>,
    store: TaskResultStore,
}

impl TaskStream {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next inbound item, or `None` once every producer handle is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Wait for the pickup signal. Returns false on timeout.
    pub async fn wait_pickup(&mut self, timeout: Duration) -> bool {
        let Some(pickup) = self.pickup.take() else {
            return true;
        };
        matches!(tokio::time::timeout(timeout, pickup).await, Ok(Ok(())))
    }

    pub fn record_outcome(
        &self,
        status: TaskStatus,
        finish_reason: Option<String>,
        error: Option<String>,
    ) {
        self.store
            .record_outcome(&self.task_id, status, finish_reason, error);
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        self.store.remove(&self.task_id);
    }
}
