//! Jobs, worker events and status views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work awaiting or undergoing execution by a worker.
///
/// A requeued job keeps its id and payload; only `redeliveries` moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub task_id: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Times the job was taken back from a dead worker.
    #[serde(default)]
    pub redeliveries: u32,
}

impl Job {
    pub fn new(task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
            enqueued_at: Utc::now(),
            redeliveries: 0,
        }
    }

    /// Allocate a fresh task id.
    pub fn new_task_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Side-channel instructions for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerCommand {
    /// Reload the chat page (e.g. after an anti-automation interstitial).
    Refresh,
}

/// Event pushed onto a session's outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    NewJob(Job),
    Command(WorkerCommand),
    /// No-op keep-alive.
    Ping,
}

/// Session status, derived from whether a job is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Busy,
}

/// Outcome of `Dispatcher::submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Handed to the named session immediately.
    Assigned { session_id: String },
    /// Appended to the pending queue.
    Queued { position: usize },
}

/// What one heartbeat tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub zombies: Vec<String>,
    pub requeued: Vec<String>,
    /// Jobs dropped because they outlived too many workers.
    pub abandoned: Vec<String>,
    /// (task_id, session_id) assigned during the tick.
    pub assigned: Option<(String, String)>,
}

/// Read-only view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub jobs_completed: u64,
}

/// Read-only view of the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub sessions: Vec<SessionSnapshot>,
    pub queued: usize,
    pub queued_task_ids: Vec<String>,
}
