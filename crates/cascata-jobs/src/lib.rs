//! Durable job queues over a Redis-compatible store.
//!
//! # Purpose
//! At-least-once delivery for background fan-out. Each named queue is a
//! Redis list (FIFO) plus a sorted-set bucket holding jobs scheduled for a
//! later attempt. Workers pop, invoke a handler, and either record the
//! result or reschedule with backoff. Completed and failed records are
//! retained in bounded, time-limited lists for inspection.
//!
//! The engine is payload-agnostic; queue semantics (signing, SSRF guards,
//! provider calls) live with the handlers.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

mod policy;
mod worker;

pub use policy::{Backoff, RetryPolicy};
pub use worker::{JobFailure, JobHandler, Step, Worker, next_step};

pub const COMPLETED_KEEP_LAST: isize = 1_000;
pub const FAILED_KEEP_LAST: isize = 5_000;
pub const COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed job envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// One unit of work. `attempt` counts deliveries; zero until first picked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub payload: Value,
    pub policy: RetryPolicy,
    pub attempt: u32,
    pub enqueued_at_ms: u64,
}

/// Redis key of a queue's pending list; the delayed/completed/failed keys
/// are suffixes of it.
pub fn pending_key(name: &str) -> String {
    format!("cascata:queue:{name}")
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A named FIFO queue. Cheap to clone; all clones share the connection
/// manager.
#[derive(Clone)]
pub struct JobQueue {
    name: String,
    redis: ConnectionManager,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, redis: ConnectionManager) -> Self {
        Self {
            name: name.into(),
            redis,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pending_key(&self) -> String {
        pending_key(&self.name)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", pending_key(&self.name))
    }

    fn completed_key(&self) -> String {
        format!("{}:completed", pending_key(&self.name))
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", pending_key(&self.name))
    }

    /// Appends a job to the queue and returns its id.
    pub async fn enqueue(&self, payload: Value, policy: RetryPolicy) -> Result<String, QueueError> {
        let envelope = JobEnvelope {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            policy,
            attempt: 0,
            enqueued_at_ms: now_ms(),
        };
        let id = envelope.id.clone();
        let encoded = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();
        let _: () = conn.rpush(self.pending_key(), encoded).await?;
        Ok(id)
    }

    /// Schedules an existing envelope for redelivery after `delay`.
    pub(crate) async fn reschedule(
        &self,
        envelope: &JobEnvelope,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let run_at = now_ms() + delay.as_millis() as u64;
        let encoded = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();
        let _: () = conn.zadd(self.delayed_key(), encoded, run_at).await?;
        Ok(())
    }

    /// Moves due delayed jobs back onto the pending list. The `ZREM` guard
    /// keeps concurrent workers from promoting the same job twice.
    pub(crate) async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.delayed_key(), 0f64, now_ms() as f64, 0, 64)
            .await?;
        for encoded in due {
            let removed: i64 = conn.zrem(self.delayed_key(), &encoded).await?;
            if removed == 1 {
                let _: () = conn.rpush(self.pending_key(), encoded).await?;
            }
        }
        Ok(())
    }

    /// Pops the next pending job, if any.
    pub(crate) async fn pop(&self) -> Result<Option<JobEnvelope>, QueueError> {
        let mut conn = self.redis.clone();
        let encoded: Option<String> = conn.lpop(self.pending_key(), None).await?;
        match encoded {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    pub async fn pending_depth(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(self.pending_key()).await?)
    }

    /// Removes a job from the pending list before it becomes active. This is
    /// the only supported form of cancellation.
    pub async fn remove_pending(&self, id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(self.pending_key(), 0, -1).await?;
        for encoded in entries {
            if let Ok(envelope) = serde_json::from_str::<JobEnvelope>(&encoded) {
                if envelope.id == id {
                    let _: i64 = conn.lrem(self.pending_key(), 1, &encoded).await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub(crate) async fn record_completed(
        &self,
        envelope: &JobEnvelope,
        result: &Value,
    ) -> Result<(), QueueError> {
        self.record(
            self.completed_key(),
            envelope,
            result,
            COMPLETED_KEEP_LAST,
            COMPLETED_RETENTION,
        )
        .await
    }

    pub(crate) async fn record_failed(
        &self,
        envelope: &JobEnvelope,
        error: &str,
    ) -> Result<(), QueueError> {
        self.record(
            self.failed_key(),
            envelope,
            &Value::String(error.to_string()),
            FAILED_KEEP_LAST,
            FAILED_RETENTION,
        )
        .await
    }

    async fn record(
        &self,
        key: String,
        envelope: &JobEnvelope,
        outcome: &Value,
        keep_last: isize,
        retention: Duration,
    ) -> Result<(), QueueError> {
        let record = serde_json::json!({
            "id": envelope.id,
            "attempt": envelope.attempt,
            "outcome": outcome,
            "finished_at_ms": now_ms(),
        });
        let mut conn = self.redis.clone();
        let _: () = conn.lpush(&key, record.to_string()).await?;
        let _: () = conn.ltrim(&key, 0, keep_last - 1).await?;
        self.prune_tail(&key, retention).await?;
        Ok(())
    }

    /// Drops records older than the retention window from the tail of a
    /// history list. Bounded per call so a busy queue never stalls here.
    async fn prune_tail(&self, key: &str, retention: Duration) -> Result<(), QueueError> {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let mut conn = self.redis.clone();
        for _ in 0..32 {
            let tail: Option<String> = conn.lindex(key, -1).await?;
            let Some(tail) = tail else { break };
            let expired = serde_json::from_str::<Value>(&tail)
                .ok()
                .and_then(|record| record.get("finished_at_ms").and_then(Value::as_u64))
                .is_some_and(|finished| finished < cutoff);
            if !expired {
                break;
            }
            let _: Option<String> = conn.rpop(key, None).await?;
        }
        Ok(())
    }
}

/// Shutdown signal shared by all workers of a process.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, ShutdownSignal { receiver })
    }

    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn receiver(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let envelope = JobEnvelope {
            id: "j1".to_string(),
            payload: serde_json::json!({"target_url": "https://example.com"}),
            policy: RetryPolicy::standard(),
            attempt: 2,
            enqueued_at_ms: 123,
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: JobEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, "j1");
        assert_eq!(decoded.attempt, 2);
        assert_eq!(decoded.policy, RetryPolicy::standard());
    }

    #[test]
    fn queue_keys_are_namespaced() {
        assert_eq!(pending_key("webhooks"), "cascata:queue:webhooks");
        assert_eq!(pending_key("push"), "cascata:queue:push");
    }

    #[test]
    fn shutdown_signal_observes_trigger() {
        let (handle, signal) = ShutdownHandle::new();
        assert!(!signal.is_triggered());
        handle.trigger();
        assert!(signal.is_triggered());
    }
}
