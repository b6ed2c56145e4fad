//! Pending jobs awaiting a worker.

use std::collections::VecDeque;

use crate::types::Job;

/// FIFO of pending jobs. Requeued jobs go to the front.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job, returning its 1-based position.
    pub fn push_back(&mut self, job: Job) -> usize {
        self.jobs.push_back(job);
        self.jobs.len()
    }

    pub fn push_front(&mut self, job: Job) {
        self.jobs.push_front(job);
    }

    pub fn pop_front(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Withdraw a queued job by task id.
    pub fn remove(&mut self, task_id: &str) -> Option<Job> {
        let index = self.jobs.iter().position(|j| j.task_id == task_id)?;
        self.jobs.remove(index)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.jobs.iter().any(|j| j.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.task_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: &str) -> Job {
        Job::new(id, json!(null))
    }

    #[test]
    fn test_fifo_with_front_requeue() {
        let mut queue = JobQueue::new();
        assert_eq!(queue.push_back(job("a")), 1);
        assert_eq!(queue.push_back(job("b")), 2);
        queue.push_front(job("z"));
        assert_eq!(queue.task_ids(), vec!["z", "a", "b"]);
        assert_eq!(queue.pop_front().unwrap().task_id, "z");
    }

    #[test]
    fn test_remove() {
        let mut queue = JobQueue::new();
        queue.push_back(job("a"));
        queue.push_back(job("b"));
        assert!(queue.remove("a").is_some());
        assert!(queue.remove("a").is_none());
        assert!(!queue.contains("a"));
        assert_eq!(queue.len(), 1);
    }
}
