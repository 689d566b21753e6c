//! Worker loops.
//!
//! A worker owns one queue and a handler. Each of its tasks promotes due
//! delayed jobs, pops the next pending envelope, and runs the handler.
//! Failures are rescheduled per the envelope's policy; permanent failures
//! and exhausted budgets take the final-attempt branch, which gives the
//! handler a chance to fire its fallback before the job is recorded failed.

use crate::{JobEnvelope, JobQueue, QueueError, ShutdownSignal};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How long an idle worker task sleeps before polling again.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Handler outcome for a failed delivery. `retryable: false` short-circuits
/// straight to the final-attempt branch (the 4xx-other-than-429 case).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &JobEnvelope) -> Result<Value, JobFailure>;

    /// Called exactly once when a job's budget is exhausted or its failure
    /// was permanent, before the job is recorded failed.
    async fn on_exhausted(&self, _job: &JobEnvelope, _error: &JobFailure) {}
}

/// What the worker does with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Retry(Duration),
    Fail,
}

/// Pure retry decision: the envelope's attempt counter has already been
/// incremented for the attempt that just failed.
pub fn next_step(envelope: &JobEnvelope, failure: &JobFailure) -> Step {
    if !failure.retryable {
        return Step::Fail;
    }
    match envelope.policy.delay_after(envelope.attempt) {
        Some(delay) => Step::Retry(delay),
        None => Step::Fail,
    }
}

pub struct Worker<H> {
    queue: JobQueue,
    handler: Arc<H>,
    concurrency: usize,
}

impl<H: JobHandler> Worker<H> {
    pub fn new(queue: JobQueue, handler: Arc<H>, concurrency: usize) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    /// Spawns the worker tasks; they run until the shutdown signal fires.
    pub fn spawn(self, shutdown: ShutdownSignal) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.concurrency)
            .map(|index| {
                let queue = self.queue.clone();
                let handler = Arc::clone(&self.handler);
                let mut signal = shutdown.receiver();
                tokio::spawn(async move {
                    tracing::debug!(queue = queue.name(), index, "worker task started");
                    loop {
                        if *signal.borrow() {
                            break;
                        }
                        match run_once(&queue, handler.as_ref()).await {
                            Ok(true) => {}
                            Ok(false) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(IDLE_POLL) => {}
                                    _ = signal.changed() => {}
                                }
                            }
                            Err(err) => {
                                tracing::warn!(queue = queue.name(), error = %err, "queue poll failed");
                                tokio::select! {
                                    _ = tokio::time::sleep(IDLE_POLL) => {}
                                    _ = signal.changed() => {}
                                }
                            }
                        }
                    }
                    tracing::debug!(queue = queue.name(), index, "worker task stopped");
                })
            })
            .collect()
    }
}

/// Processes at most one job. Returns whether a job was processed.
async fn run_once<H: JobHandler>(queue: &JobQueue, handler: &H) -> Result<bool, QueueError> {
    queue.promote_due().await?;
    let Some(mut envelope) = queue.pop().await? else {
        return Ok(false);
    };
    envelope.attempt += 1;

    match handler.handle(&envelope).await {
        Ok(result) => {
            queue.record_completed(&envelope, &result).await?;
            tracing::debug!(queue = queue.name(), job = %envelope.id, attempt = envelope.attempt, "job completed");
        }
        Err(failure) => match next_step(&envelope, &failure) {
            Step::Retry(delay) => {
                tracing::debug!(
                    queue = queue.name(),
                    job = %envelope.id,
                    attempt = envelope.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "job rescheduled"
                );
                queue.reschedule(&envelope, delay).await?;
            }
            Step::Fail => {
                handler.on_exhausted(&envelope, &failure).await;
                queue.record_failed(&envelope, &failure.message).await?;
                tracing::warn!(
                    queue = queue.name(),
                    job = %envelope.id,
                    attempt = envelope.attempt,
                    error = %failure.message,
                    "job failed permanently"
                );
            }
        },
    }
    Ok(true)
}
