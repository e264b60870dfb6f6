//! Process-local queue
//!
//! Jobs survive consumer failures but not a process restart. Suitable for a
//! single gateway instance with an embedded worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{FailedJob, Job, JobQueue, QueueCounts};
use crate::{Error, Result};

struct Entry {
    name: String,
    payload: String,
    attempts: u32,
    reason: Option<String>,
    failed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    jobs: HashMap<String, Entry>,
    waiting: VecDeque<String>,
    delayed: Vec<(Instant, String)>,
    active: HashSet<String>,
    /// Oldest failure first
    failed: VecDeque<String>,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = Vec::new();
        self.delayed.retain(|(at, id)| {
            if *at <= now {
                due.push((*at, id.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        self.waiting.extend(due.into_iter().map(|(_, id)| id));
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn settle(&mut self, id: &str) -> Result<()> {
        if self.active.remove(id) {
            Ok(())
        } else {
            Err(Error::Queue(format!("job {id} is not active")))
        }
    }
}

/// In-memory [`JobQueue`]
pub struct MemoryQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Queue name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(&self, name: &str, payload: String) -> Result<String> {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id.to_string();
            state.jobs.insert(
                id.clone(),
                Entry {
                    name: name.to_string(),
                    payload,
                    attempts: 0,
                    reason: None,
                    failed_at: None,
                },
            );
            state.waiting.push_back(id.clone());
            id
        };
        self.notify.notify_one();
        Ok(id)
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let next_due = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());
                while let Some(id) = state.waiting.pop_front() {
                    let Some(entry) = state.jobs.get(&id) else {
                        continue;
                    };
                    let job = Job {
                        id: id.clone(),
                        name: entry.name.clone(),
                        payload: entry.payload.clone(),
                        attempts: entry.attempts,
                    };
                    state.active.insert(id);
                    return Ok(Some(job));
                }
                state.next_due()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let until = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock();
        state.settle(&job.id)?;
        state.jobs.remove(&job.id);
        Ok(())
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.settle(&job.id)?;
            if let Some(entry) = state.jobs.get_mut(&job.id) {
                entry.attempts += 1;
            }
            state.delayed.push((Instant::now() + delay, job.id.clone()));
        }
        // Wake a waiting consumer so it re-arms its timer on the new due time
        self.notify.notify_one();
        Ok(())
    }

    async fn fail(&self, job: &Job, reason: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.settle(&job.id)?;
        if let Some(entry) = state.jobs.get_mut(&job.id) {
            entry.attempts += 1;
            entry.reason = Some(reason.to_string());
            entry.failed_at = Some(Utc::now());
        }
        state.failed.push_back(job.id.clone());
        Ok(())
    }

    async fn prune(&self, retention: Duration) -> Result<u64> {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let mut state = self.state.lock();
        let mut pruned = 0;
        while let Some(id) = state.failed.front().cloned() {
            let expired = state
                .jobs
                .get(&id)
                .and_then(|e| e.failed_at)
                .is_none_or(|at| at <= cutoff);
            if !expired {
                break;
            }
            state.failed.pop_front();
            state.jobs.remove(&id);
            pruned += 1;
        }
        Ok(pruned)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock();
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.active.len() as u64,
            failed: state.failed.len() as u64,
        })
    }

    async fn failed(&self, limit: usize) -> Result<Vec<FailedJob>> {
        let state = self.state.lock();
        Ok(state
            .failed
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| {
                let entry = state.jobs.get(id)?;
                Some(FailedJob {
                    id: id.clone(),
                    attempts: entry.attempts,
                    reason: entry.reason.clone().unwrap_or_default(),
                    failed_at: entry.failed_at.unwrap_or_else(Utc::now),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_submit_reserve_ack() {
        let queue = MemoryQueue::new("test");
        let id = queue.submit("log", "{}".to_string()).await.unwrap();

        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.name, "log");
        assert_eq!(job.attempts, 0);
        assert_eq!(queue.counts().await.unwrap().active, 1);

        queue.ack(&job).await.unwrap();
        assert_eq!(queue.counts().await.unwrap(), QueueCounts::default());
    }

    #[tokio::test]
    async fn test_reserve_times_out_when_empty() {
        let queue = MemoryQueue::new("test");
        assert!(queue.reserve(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_submit() {
        let queue = Arc::new(MemoryQueue::new("test"));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.reserve(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.submit("log", "x".to_string()).await.unwrap();
        let job = consumer.await.unwrap().unwrap();
        assert_eq!(job.map(|j| j.payload), Some("x".to_string()));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new("test");
        queue.submit("log", "1".to_string()).await.unwrap();
        queue.submit("log", "2".to_string()).await.unwrap();
        let first = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.payload, "1");
        assert_eq!(second.payload, "2");
    }

    #[tokio::test]
    async fn test_retry_delays_and_counts_attempts() {
        let queue = MemoryQueue::new("test");
        queue.submit("log", "x".to_string()).await.unwrap();
        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();

        queue.retry(&job, Duration::from_millis(30)).await.unwrap();
        assert_eq!(queue.counts().await.unwrap().delayed, 1);
        assert!(queue.reserve(Duration::ZERO).await.unwrap().is_none());

        let again = queue.reserve(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_fail_retains_job() {
        let queue = MemoryQueue::new("test");
        queue.submit("log", "x".to_string()).await.unwrap();
        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        queue.fail(&job, "disk full").await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active, 0);

        let failed = queue.failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, "disk full");
        assert_eq!(failed[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_prune_respects_retention() {
        let queue = MemoryQueue::new("test");
        queue.submit("log", "x".to_string()).await.unwrap();
        let job = queue.reserve(Duration::ZERO).await.unwrap().unwrap();
        queue.fail(&job, "boom").await.unwrap();

        assert_eq!(queue.prune(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.prune(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.counts().await.unwrap().failed, 0);
    }

    #[tokio::test]
    async fn test_settling_unknown_job_is_an_error() {
        let queue = MemoryQueue::new("test");
        let job = Job {
            id: "42".to_string(),
            name: "log".to_string(),
            payload: String::new(),
            attempts: 0,
        };
        assert!(queue.ack(&job).await.is_err());
    }
}
