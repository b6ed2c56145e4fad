//! Dispatcher: matches pending jobs to idle worker sessions and reaps dead ones.
//!
//! The session table and the job queue live behind a single mutex; every public
//! operation takes it once, so assignment and queueing are atomic with respect
//! to each other.
//!
//! When a result store is attached, a job handed out again gets a
//! [`Inbound::Restart`](crate::results::Inbound::Restart) on its task channel
//! before the next worker can see it, and a job past its redelivery limit has
//! its channel closed.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tabrelay_core::{Error, Result};

use crate::queue::JobQueue;
use crate::results::TaskResultStore;
use crate::session::WorkerSession;
use crate::types::*;

/// Times a job may be taken back from a dead worker before it is abandoned.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;

#[derive(Default)]
struct DispatchState {
    sessions: HashMap<String, WorkerSession>,
    queue: JobQueue,
}

impl DispatchState {
    /// Hand the front of the queue to some idle session.
    ///
    /// Sessions whose channel rejects the job are removed as zombies and the job
    /// goes back to the front before the next idle session is tried.
    fn assign_one(&mut self) -> Option<(String, String)> {
        loop {
            if self.queue.is_empty() {
                return None;
            }
            let session_id = self
                .sessions
                .values()
                .find(|s| s.is_idle())
                .map(|s| s.id().to_string())?;
            let job = self.queue.pop_front()?;
            let task_id = job.task_id.clone();

            let session = self.sessions.get_mut(&session_id)?;
            match session.assign(job) {
                Ok(()) => {
                    info!(task_id = %task_id, session_id = %session_id, "Job assigned");
                    return Some((task_id, session_id));
                }
                Err((job, failure)) => {
                    warn!(
                        session_id = %session_id,
                        ?failure,
                        "Outbound rejected job, dropping zombie session"
                    );
                    self.sessions.remove(&session_id);
                    self.queue.push_front(job);
                }
            }
        }
    }

    fn owner_of(&self, task_id: &str) -> Option<&WorkerSession> {
        self.sessions.values().find(|s| s.holds(task_id))
    }
}

pub struct Dispatcher {
    state: Mutex<DispatchState>,
    outbound_capacity: usize,
    results: Option<TaskResultStore>,
    max_redeliveries: u32,
}

impl Dispatcher {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            state: Mutex::new(DispatchState::default()),
            outbound_capacity: outbound_capacity.max(1),
            results: None,
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }

    /// Attach the task channels that redeliveries and abandonments are reported on.
    pub fn with_results(mut self, results: TaskResultStore, max_redeliveries: u32) -> Self {
        self.results = Some(results);
        self.max_redeliveries = max_redeliveries;
        self
    }

    /// Void what the task's reader has buffered; called before the job is
    /// visible to another worker.
    fn restart_task(&self, task_id: &str) {
        if let Some(results) = &self.results {
            if results.restart(task_id) {
                debug!(task_id, "Task reader told to restart");
            }
        }
    }

    fn abandon_task(&self, task_id: &str) {
        if let Some(results) = &self.results {
            results.close(task_id);
        }
    }

    // ---------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------

    /// Register a worker, or hand a reconnecting one a fresh outbound channel.
    ///
    /// The caller must drain the returned receiver into the worker transport.
    /// A reconnecting busy session gets its current job re-sent.
    pub fn register_or_touch(&self, session_id: &str) -> mpsc::Receiver<WorkerEvent> {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.sessions.get_mut(session_id) {
            Some(session) => {
                session.replace_outbound(tx);
                if let Some(job) = session.release() {
                    let task_id = job.task_id.clone();
                    // The worker starts the job over on its new connection.
                    self.restart_task(&task_id);
                    match session.assign(job) {
                        Ok(()) => {
                            info!(session_id, task_id = %task_id, "Session reconnected, job re-sent")
                        }
                        Err((job, _)) => state.queue.push_front(job),
                    }
                } else {
                    info!(session_id, "Session reconnected");
                }
            }
            None => {
                state
                    .sessions
                    .insert(session_id.to_string(), WorkerSession::new(session_id, tx));
                info!(
                    session_id,
                    sessions = state.sessions.len(),
                    "Worker session registered"
                );
            }
        }

        state.assign_one();
        rx
    }

    /// Liveness touch. Returns false for unknown sessions.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.state.lock().sessions.get_mut(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn has_sessions(&self) -> bool {
        !self.state.lock().sessions.is_empty()
    }

    // ---------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------

    /// Assign the job to an idle session, or queue it behind earlier jobs.
    pub fn submit(&self, job: Job) -> Submission {
        let task_id = job.task_id.clone();
        let mut state = self.state.lock();
        state.queue.push_back(job);

        while state.queue.contains(&task_id) {
            if state.assign_one().is_none() {
                break;
            }
        }

        if let Some(owner) = state.owner_of(&task_id) {
            return Submission::Assigned {
                session_id: owner.id().to_string(),
            };
        }

        let position = state
            .queue
            .task_ids()
            .iter()
            .position(|id| *id == task_id)
            .map(|i| i + 1)
            .unwrap_or(state.queue.len());
        debug!(task_id = %task_id, position, "No idle worker, job queued");
        Submission::Queued { position }
    }

    /// Free a session after it reports a finished task, then try one assignment.
    pub fn complete(&self, task_id: &str, session_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(session_id) else {
            warn!(task_id, session_id, "Completion from unknown session");
            return Err(Error::SessionInconsistency {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
            });
        };

        if !session.holds(task_id) {
            warn!(
                task_id,
                session_id,
                held = session.current_job().map(|j| j.task_id.as_str()).unwrap_or("<none>"),
                "Completion for a task the session does not hold"
            );
            return Err(Error::SessionInconsistency {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
            });
        }

        session.finish();
        session.touch();
        info!(task_id, session_id, "Job completed, session idle");
        state.assign_one();
        Ok(())
    }

    /// Pull-mode fetch of the session's current job, once per assignment.
    pub fn take_job_payload(&self, session_id: &str) -> Option<Job> {
        let mut state = self.state.lock();
        let session = state.sessions.get_mut(session_id)?;
        session.touch();
        session.take_payload()
    }

    /// Withdraw a job that is still waiting in the queue.
    pub fn cancel(&self, task_id: &str) -> bool {
        let removed = self.state.lock().queue.remove(task_id).is_some();
        if removed {
            info!(task_id, "Queued job withdrawn");
        }
        removed
    }

    /// Run `deliver` if `session_id` may still produce output for `task_id`.
    ///
    /// A session may not once the task is queued again or held by another
    /// session. `deliver` runs under the dispatcher lock, so no redelivery can
    /// slip in between the check and the delivery.
    pub fn with_producer<R>(
        &self,
        task_id: &str,
        session_id: &str,
        deliver: impl FnOnce() -> R,
    ) -> Result<R> {
        let state = self.state.lock();
        let allowed = match state.owner_of(task_id) {
            Some(owner) => owner.id() == session_id,
            None => !state.queue.contains(task_id),
        };
        if !allowed {
            debug!(task_id, session_id, "Output from a session that no longer owns the task");
            return Err(Error::SessionInconsistency {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        Ok(deliver())
    }

    /// Send a side-channel event to whichever session holds the task.
    pub fn notify_owner(&self, task_id: &str, event: WorkerEvent) -> bool {
        let state = self.state.lock();
        match state.owner_of(task_id) {
            Some(session) => match session.try_send(event) {
                Ok(()) => true,
                Err(failure) => {
                    warn!(task_id, session_id = session.id(), ?failure, "Could not notify session");
                    false
                }
            },
            None => false,
        }
    }

    // ---------------------------------------------------------------
    // Liveness
    // ---------------------------------------------------------------

    /// Ping every session, reap the ones that cannot take it, requeue their jobs.
    pub fn heartbeat_tick(&self) -> TickReport {
        let mut state = self.state.lock();
        let mut report = TickReport::default();

        let dead: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.try_send(WorkerEvent::Ping).is_err())
            .map(|s| s.id().to_string())
            .collect();

        for session_id in dead {
            let Some(mut session) = state.sessions.remove(&session_id) else {
                continue;
            };
            match session.release() {
                Some(job) if job.redeliveries >= self.max_redeliveries => {
                    warn!(
                        session_id = %session_id,
                        task_id = %job.task_id,
                        redeliveries = job.redeliveries,
                        "Zombie session removed, job abandoned"
                    );
                    self.abandon_task(&job.task_id);
                    report.abandoned.push(job.task_id);
                }
                Some(mut job) => {
                    warn!(
                        session_id = %session_id,
                        task_id = %job.task_id,
                        "Zombie session removed, job requeued"
                    );
                    job.redeliveries += 1;
                    self.restart_task(&job.task_id);
                    report.requeued.push(job.task_id.clone());
                    state.queue.push_front(job);
                }
                None => warn!(session_id = %session_id, "Zombie session removed"),
            }
            report.zombies.push(session_id);
        }

        report.assigned = state.assign_one();
        report
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let state = self.state.lock();
        let mut sessions: Vec<SessionSnapshot> =
            state.sessions.values().map(|s| s.snapshot()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        DispatcherSnapshot {
            sessions,
            queued: state.queue.len(),
            queued_task_ids: state.queue.task_ids(),
        }
    }
}
