//! Asynchronous traffic logging
//!
//! The request path hands a [`LogDraft`] to the [`LogProducer`], which
//! submits it to the durable queue in the background. A [`LogWorker`]
//! consumes the queue, validates each draft into a [`LogRecord`] and
//! persists it through the configured log store.

pub mod producer;
pub mod record;
pub mod worker;

pub use producer::{EnqueueHandle, LogProducer};
pub use record::{LogDraft, LogRecord};
pub use worker::{JobOutcome, LogWorker, WorkerStats};

/// Job name used for traffic log entries
pub const LOG_JOB_NAME: &str = "request-log";
