//! Async driver: drains a task's inbound queue through a [`StreamDecoder`].

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use tokio::time::Instant;
use tracing::{error, info, warn};

use tabrelay_core::BridgeConfig;
use tabrelay_dispatch::{TaskStatus, TaskStream};

use crate::decoder::{DecodeEvent, StreamDecoder, StreamEnd};

/// Boxed stream of decoder events.
pub type EventStream = Pin<Box<dyn Stream<Item = DecodeEvent> + Send>>;

#[derive(Debug, Clone, Copy)]
pub struct DriverTimeouts {
    /// Bounded wait for a worker to pick up the job. Never longer than
    /// `inactivity`, which also covers the wait.
    pub pickup: Duration,
    /// Inactivity window, counted from submission and then from each item.
    pub inactivity: Duration,
    /// Inactivity window once a finish signal has been seen.
    pub finish_grace: Duration,
}

impl From<&BridgeConfig> for DriverTimeouts {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            pickup: config.pickup_timeout(),
            inactivity: config.stream_timeout(),
            finish_grace: config.finish_grace(),
        }
    }
}

/// Decode a task until it terminates, recording the outcome on its record.
///
/// Dropping the returned stream drops the [`TaskStream`], which releases the
/// task entry.
pub fn decode_stream(mut task: TaskStream, timeouts: DriverTimeouts) -> EventStream {
    Box::pin(async_stream::stream! {
        let task_id = task.task_id().to_string();
        let mut last_activity = Instant::now();

        let pickup_wait = timeouts.pickup.min(timeouts.inactivity);
        if task.wait_pickup(pickup_wait).await {
            last_activity = Instant::now();
        } else {
            warn!(
                task_id = %task_id,
                waited_secs = pickup_wait.as_secs(),
                "No worker picked up the job in time, waiting for data anyway"
            );
        }

        let mut decoder = StreamDecoder::new();
        while !decoder.is_finished() {
            let window = if decoder.finish_reason().is_some() {
                timeouts.finish_grace
            } else {
                timeouts.inactivity
            };
            let remaining = window.saturating_sub(last_activity.elapsed());

            let events = match tokio::time::timeout(remaining, task.recv()).await {
                Ok(Some(item)) => {
                    last_activity = Instant::now();
                    decoder.feed(item)
                }
                Ok(None) => decoder.close(),
                Err(_) => decoder.expire(window),
            };

            for event in events {
                if let DecodeEvent::Done(end) = &event {
                    match end {
                        StreamEnd::Finished { finish_reason } => {
                            info!(task_id = %task_id, finish_reason = %finish_reason, "Stream finished");
                            task.record_outcome(TaskStatus::Completed, Some(finish_reason.clone()), None);
                        }
                        StreamEnd::Failed(failure) => {
                            error!(task_id = %task_id, ?failure, "Stream failed");
                            task.record_outcome(TaskStatus::Failed, None, Some(failure.message()));
                        }
                    }
                }
                yield event;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecodeFailure;
    use tabrelay_dispatch::{Dispatcher, Inbound, Job, TaskResultStore, WorkerEvent};
    use tokio_stream::StreamExt;

    fn timeouts(ms: u64) -> DriverTimeouts {
        DriverTimeouts {
            pickup: Duration::from_millis(ms),
            inactivity: Duration::from_millis(ms),
            finish_grace: Duration::from_millis(ms / 2),
        }
    }

    #[tokio::test]
    async fn test_drives_to_completion_and_releases() {
        let store = TaskResultStore::new();
        store.create("t1").unwrap();
        let stream = decode_stream(store.take_stream("t1").unwrap(), timeouts(500));

        store.push("t1", Inbound::Fragment("a0:\"Hi\"".into())).unwrap();
        store.push("t1", Inbound::End).unwrap();

        let events: Vec<DecodeEvent> = stream.collect().await;
        assert_eq!(events[0], DecodeEvent::Delta("Hi".into()));
        assert!(matches!(events[1], DecodeEvent::Done(StreamEnd::Finished { .. })));
        assert!(!store.contains("t1"));
    }

    #[tokio::test]
    async fn test_inactivity_timeout() {
        let store = TaskResultStore::new();
        store.create("t1").unwrap();
        store.mark_picked_up("t1");
        let stream = decode_stream(store.take_stream("t1").unwrap(), timeouts(50));

        let events: Vec<DecodeEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Timeout(
                Duration::from_millis(50)
            )))]
        );
    }

    #[tokio::test]
    async fn test_finish_grace_ends_successfully() {
        let store = TaskResultStore::new();
        store.create("t1").unwrap();
        let stream = decode_stream(store.take_stream("t1").unwrap(), timeouts(2000));
        store
            .push(
                "t1",
                Inbound::Fragment("a0:\"ok\"\nad:{\"finishReason\":\"stop\"}".into()),
            )
            .unwrap();

        let events: Vec<DecodeEvent> =
            tokio::time::timeout(Duration::from_secs(5), stream.collect())
                .await
                .unwrap();
        assert_eq!(
            events.last(),
            Some(&DecodeEvent::Done(StreamEnd::Finished {
                finish_reason: "stop".into()
            }))
        );
    }

    #[tokio::test]
    async fn test_pickup_wait_counts_toward_inactivity() {
        let store = TaskResultStore::new();
        store.create("t1").unwrap();
        let timeouts = DriverTimeouts {
            pickup: Duration::from_millis(400),
            inactivity: Duration::from_millis(500),
            finish_grace: Duration::from_millis(100),
        };
        let stream = decode_stream(store.take_stream("t1").unwrap(), timeouts);

        let started = std::time::Instant::now();
        let events: Vec<DecodeEvent> = stream.collect().await;
        assert!(started.elapsed() < Duration::from_millis(800));
        assert_eq!(
            events,
            vec![DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Timeout(
                Duration::from_millis(500)
            )))]
        );
    }

    #[tokio::test]
    async fn test_requeued_job_streams_cleanly_from_new_worker() {
        let store = TaskResultStore::new();
        let dispatcher = Dispatcher::new(8).with_results(store.clone(), 3);
        store.create("t1").unwrap();
        let stream = decode_stream(store.take_stream("t1").unwrap(), timeouts(2000));

        let dead = dispatcher.register_or_touch("a-dead");
        dispatcher.submit(Job::new("t1", serde_json::json!({})));
        store.push("t1", Inbound::Fragment("a0:\"Hel".into())).unwrap();
        drop(dead);
        let mut live = dispatcher.register_or_touch("b-live");

        let report = dispatcher.heartbeat_tick();
        assert_eq!(report.assigned, Some(("t1".into(), "b-live".into())));
        assert!(std::iter::from_fn(|| live.try_recv().ok())
            .any(|e| matches!(e, WorkerEvent::NewJob(job) if job.task_id == "t1")));

        store.push("t1", Inbound::Fragment("a0:\"Hello\"".into())).unwrap();
        store.push("t1", Inbound::End).unwrap();

        let events: Vec<DecodeEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                DecodeEvent::Delta("Hello".into()),
                DecodeEvent::Done(StreamEnd::Finished {
                    finish_reason: "stop".into()
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_abandoned_job_ends_as_disconnect() {
        let store = TaskResultStore::new();
        let dispatcher = Dispatcher::new(8).with_results(store.clone(), 0);
        store.create("t1").unwrap();
        let stream = decode_stream(store.take_stream("t1").unwrap(), timeouts(2000));

        let dead = dispatcher.register_or_touch("tab-1");
        dispatcher.submit(Job::new("t1", serde_json::json!({})));
        store.push("t1", Inbound::Fragment("a0:\"partial\"".into())).unwrap();
        drop(dead);
        assert_eq!(dispatcher.heartbeat_tick().abandoned, vec!["t1".to_string()]);

        let events: Vec<DecodeEvent> = stream.collect().await;
        assert_eq!(
            events,
            vec![
                DecodeEvent::Delta("partial".into()),
                DecodeEvent::Done(StreamEnd::Failed(DecodeFailure::Disconnected)),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_entry() {
        let store = TaskResultStore::new();
        store.create("t1").unwrap();
        let mut stream = decode_stream(store.take_stream("t1").unwrap(), timeouts(2000));
        store.push("t1", Inbound::Fragment("a0:\"x\"".into())).unwrap();
        assert_eq!(stream.next().await, Some(DecodeEvent::Delta("x".into())));

        drop(stream);
        assert!(!store.contains("t1"));
        assert!(store.push("t1", Inbound::End).is_err());
    }
}
