//! Non-blocking traffic log producer

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::{LOG_JOB_NAME, LogDraft};
use crate::queue::JobQueue;

/// Handle on a background submission.
///
/// Dropping it does not cancel the submission; awaiting it is optional.
#[derive(Debug)]
pub struct EnqueueHandle(Option<JoinHandle<bool>>);

impl EnqueueHandle {
    /// Wait for the submission and report whether the queue accepted it
    pub async fn submitted(self) -> bool {
        match self.0 {
            Some(handle) => handle.await.unwrap_or(false),
            None => false,
        }
    }
}

/// Submits log drafts to the durable queue without blocking the caller
#[derive(Clone)]
pub struct LogProducer {
    queue: Arc<dyn JobQueue>,
    enabled: bool,
    submit_timeout: Duration,
}

impl LogProducer {
    /// Create a producer writing to `queue`
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, enabled: bool, submit_timeout: Duration) -> Self {
        Self {
            queue,
            enabled,
            submit_timeout,
        }
    }

    /// Submit `draft` in the background.
    ///
    /// Returns immediately. Encoding, queue and timeout failures are logged
    /// here and never reach the caller.
    pub fn enqueue(&self, draft: LogDraft) -> EnqueueHandle {
        if !self.enabled {
            return EnqueueHandle(None);
        }

        let queue = Arc::clone(&self.queue);
        let submit_timeout = self.submit_timeout;
        EnqueueHandle(Some(tokio::spawn(async move {
            let payload = match serde_json::to_string(&draft) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(path = %draft.path, error = %e, "Failed to encode log draft");
                    return false;
                }
            };

            match tokio::time::timeout(submit_timeout, queue.submit(LOG_JOB_NAME, payload)).await {
                Ok(Ok(id)) => {
                    trace!(job = %id, method = %draft.method, path = %draft.path, "Log enqueued");
                    true
                }
                Ok(Err(e)) => {
                    warn!(path = %draft.path, error = %e, "Failed to enqueue log");
                    false
                }
                Err(_) => {
                    warn!(
                        path = %draft.path,
                        timeout_ms = submit_timeout.as_millis(),
                        "Timed out enqueueing log"
                    );
                    false
                }
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryQueue;
    use crate::queue::{FailedJob, Job, QueueCounts};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use chrono::Utc;

    fn draft() -> LogDraft {
        LogDraft {
            method: "GET".to_string(),
            path: "/x".to_string(),
            status: 200,
            latency_ms: 1,
            client_id: "c1".to_string(),
            route_id: None,
            ip: None,
            user_agent: None,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_submits_job() {
        let queue = Arc::new(MemoryQueue::new("test"));
        let producer = LogProducer::new(queue.clone(), true, Duration::from_secs(1));

        assert!(producer.enqueue(draft()).submitted().await);

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.name, LOG_JOB_NAME);
        let decoded: LogDraft = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(decoded.path, "/x");
    }

    #[tokio::test]
    async fn test_disabled_producer_submits_nothing() {
        let queue = Arc::new(MemoryQueue::new("test"));
        let producer = LogProducer::new(queue.clone(), false, Duration::from_secs(1));
        assert!(!producer.enqueue(draft()).submitted().await);
        assert_eq!(queue.counts().await.unwrap().waiting, 0);
    }

    /// Queue whose submissions never complete
    struct StuckQueue;

    #[async_trait]
    impl JobQueue for StuckQueue {
        async fn submit(&self, _name: &str, _payload: String) -> Result<String> {
            futures::future::pending().await
        }
        async fn reserve(&self, _wait: Duration) -> Result<Option<Job>> {
            Ok(None)
        }
        async fn ack(&self, _job: &Job) -> Result<()> {
            Ok(())
        }
        async fn retry(&self, _job: &Job, _delay: Duration) -> Result<()> {
            Ok(())
        }
        async fn fail(&self, _job: &Job, _reason: &str) -> Result<()> {
            Ok(())
        }
        async fn prune(&self, _retention: Duration) -> Result<u64> {
            Ok(0)
        }
        async fn counts(&self) -> Result<QueueCounts> {
            Err(Error::Queue("stuck".to_string()))
        }
        async fn failed(&self, _limit: usize) -> Result<Vec<FailedJob>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_stuck_queue_does_not_block_caller() {
        let producer = LogProducer::new(Arc::new(StuckQueue), true, Duration::from_millis(20));
        let started = std::time::Instant::now();
        let handle = producer.enqueue(draft());
        assert!(started.elapsed() < Duration::from_millis(20));
        assert!(!handle.submitted().await);
    }
}
