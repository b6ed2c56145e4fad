//! Periodic liveness check.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::dispatcher::Dispatcher;

/// Run `heartbeat_tick` on a fixed interval until the handle is aborted.
pub fn spawn_heartbeat(dispatcher: Arc<Dispatcher>, every: Duration) -> tokio::task::JoinHandle<()> {
    info!(interval_ms = every.as_millis() as u64, "Heartbeat started");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = dispatcher.heartbeat_tick();
            if !report.zombies.is_empty() || report.assigned.is_some() {
                debug!(
                    zombies = report.zombies.len(),
                    requeued = report.requeued.len(),
                    abandoned = report.abandoned.len(),
                    assigned = report.assigned.is_some(),
                    "Heartbeat tick"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Job, WorkerEvent};

    #[tokio::test]
    async fn test_heartbeat_reaps_and_reassigns() {
        let dispatcher = Arc::new(Dispatcher::new(8));
        let dead = dispatcher.register_or_touch("a-dead");
        dispatcher.submit(Job::new("t1", serde_json::json!({})));
        let mut live = dispatcher.register_or_touch("b-live");
        drop(dead);

        let handle = spawn_heartbeat(dispatcher.clone(), Duration::from_millis(20));
        let job = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match live.recv().await {
                    Some(WorkerEvent::NewJob(job)) => return Some(job),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .unwrap()
        .unwrap();
        handle.abort();

        assert_eq!(job.task_id, "t1");
        assert_eq!(dispatcher.snapshot().sessions.len(), 1);
    }
}
