//! Durable job queue contract
//!
//! A job moves through `waiting → active → (acked | delayed → waiting | failed)`.
//! Producers only call [`JobQueue::submit`]; consumers call
//! [`reserve`](JobQueue::reserve) and then exactly one of
//! [`ack`](JobQueue::ack), [`retry`](JobQueue::retry) or
//! [`fail`](JobQueue::fail) for every job they receive.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;

/// A reserved job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Queue-assigned id
    pub id: String,
    /// Job kind
    pub name: String,
    /// Opaque payload (JSON)
    pub payload: String,
    /// Attempts already made before this one
    pub attempts: u32,
}

/// A job retained in the failed set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    /// Queue-assigned id
    pub id: String,
    /// Total attempts made
    pub attempts: u32,
    /// Last error
    pub reason: String,
    /// When the job was moved to the failed set
    pub failed_at: DateTime<Utc>,
}

/// Queue depth by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Ready to be reserved
    pub waiting: u64,
    /// Scheduled for a later retry
    pub delayed: u64,
    /// Reserved and not yet settled
    pub active: u64,
    /// Exhausted their attempts
    pub failed: u64,
}

/// Durable work queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job, returning its id
    async fn submit(&self, name: &str, payload: String) -> Result<String>;

    /// Take the next ready job, waiting up to `wait` for one to arrive
    async fn reserve(&self, wait: Duration) -> Result<Option<Job>>;

    /// Settle a job as done; it is removed
    async fn ack(&self, job: &Job) -> Result<()>;

    /// Count the attempt and make the job ready again after `delay`
    async fn retry(&self, job: &Job, delay: Duration) -> Result<()>;

    /// Count the attempt and retain the job in the failed set
    async fn fail(&self, job: &Job, reason: &str) -> Result<()>;

    /// Drop failed jobs older than `retention`, returning how many
    async fn prune(&self, retention: Duration) -> Result<u64>;

    /// Current depth by state
    async fn counts(&self) -> Result<QueueCounts>;

    /// Most recently failed jobs, newest first
    async fn failed(&self, limit: usize) -> Result<Vec<FailedJob>>;
}
