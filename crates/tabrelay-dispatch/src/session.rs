//! One connected automation worker (a browser tab).

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::types::{Job, SessionSnapshot, SessionStatus, WorkerEvent};

/// Why an event could not be pushed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Closed,
    Full,
}

pub struct WorkerSession {
    id: String,
    /// Held job; the session is busy exactly while this is set.
    current_job: Option<Job>,
    /// Set once the job payload has been handed out through pull mode.
    job_taken: bool,
    last_seen: DateTime<Utc>,
    connected_at: DateTime<Utc>,
    jobs_completed: u64,
    outbound: mpsc::Sender<WorkerEvent>,
}

impl WorkerSession {
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<WorkerEvent>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            current_job: None,
            job_taken: false,
            last_seen: now,
            connected_at: now,
            jobs_completed: 0,
            outbound,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        if self.current_job.is_some() {
            SessionStatus::Busy
        } else {
            SessionStatus::Idle
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current_job.is_none()
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.current_job.as_ref()
    }

    pub fn holds(&self, task_id: &str) -> bool {
        self.current_job
            .as_ref()
            .is_some_and(|job| job.task_id == task_id)
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Swap in a fresh outbound channel, keeping identity and any held job.
    pub fn replace_outbound(&mut self, outbound: mpsc::Sender<WorkerEvent>) {
        self.outbound = outbound;
        self.connected_at = Utc::now();
        self.touch();
    }

    /// Non-blocking push onto the outbound channel.
    pub fn try_send(&self, event: WorkerEvent) -> Result<(), SendFailure> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
        })
    }

    /// Take the job and deliver it. On failure the job is handed back.
    pub fn assign(&mut self, job: Job) -> Result<(), (Job, SendFailure)> {
        if let Err(failure) = self.try_send(WorkerEvent::NewJob(job.clone())) {
            return Err((job, failure));
        }
        self.current_job = Some(job);
        self.job_taken = false;
        Ok(())
    }

    /// Drop the held job, returning it. Used for completion and zombie cleanup.
    pub fn release(&mut self) -> Option<Job> {
        self.job_taken = false;
        self.current_job.take()
    }

    pub fn finish(&mut self) {
        if self.release().is_some() {
            self.jobs_completed += 1;
        }
    }

    /// Hand out the held job once per assignment (pull mode).
    pub fn take_payload(&mut self) -> Option<Job> {
        if self.job_taken {
            return None;
        }
        let job = self.current_job.clone()?;
        self.job_taken = true;
        Some(job)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            status: self.status(),
            task_id: self.current_job.as_ref().map(|j| j.task_id.clone()),
            last_seen: self.last_seen,
            connected_at: self.connected_at,
            jobs_completed: self.jobs_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_follows_job() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut session = WorkerSession::new("tab-1", tx);
        assert_eq!(session.status(), SessionStatus::Idle);

        session.assign(Job::new("t1", json!({}))).unwrap();
        assert_eq!(session.status(), SessionStatus::Busy);
        assert!(session.holds("t1"));
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::NewJob(j)) if j.task_id == "t1"));

        session.finish();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.snapshot().jobs_completed, 1);
    }

    #[test]
    fn test_assign_to_closed_channel_returns_job() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut session = WorkerSession::new("tab-1", tx);
        let (job, failure) = session.assign(Job::new("t1", json!({}))).unwrap_err();
        assert_eq!(job.task_id, "t1");
        assert_eq!(failure, SendFailure::Closed);
        assert!(session.is_idle());
    }

    #[test]
    fn test_take_payload_once() {
        let (tx, _rx) = mpsc::channel(4);
        let mut session = WorkerSession::new("tab-1", tx);
        assert!(session.take_payload().is_none());
        session.assign(Job::new("t1", json!({"x": 1}))).unwrap();
        assert_eq!(session.take_payload().unwrap().task_id, "t1");
        assert!(session.take_payload().is_none());
    }
}
