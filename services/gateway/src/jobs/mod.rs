//! Job engine wiring.
//!
//! # Purpose
//! The two durable queues (`webhooks`, concurrency 1; `push`, concurrency
//! 50) and the glue that builds them from the shared Redis connection and
//! spawns their workers.

pub mod fcm;
pub mod push;
pub mod ssrf;
pub mod webhook;

pub use push::{DbSelector, PushHandler, PushJobPayload, PushNotification};
pub use webhook::{WebhookHandler, WebhookJobPayload};

use crate::store::ControlStore;
use cascata_jobs::{JobQueue, ShutdownSignal, Worker};
use cascata_pool::PoolRegistry;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

pub const WEBHOOK_QUEUE: &str = "webhooks";
pub const PUSH_QUEUE: &str = "push";
pub const WEBHOOK_CONCURRENCY: usize = 1;
pub const PUSH_CONCURRENCY: usize = 50;

/// Outbound FCM calls are bounded by the client-wide timeout.
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct QueueSet {
    pub webhooks: JobQueue,
    pub push: JobQueue,
}

impl QueueSet {
    pub fn new(redis: ConnectionManager) -> Arc<Self> {
        Arc::new(Self {
            webhooks: JobQueue::new(WEBHOOK_QUEUE, redis.clone()),
            push: JobQueue::new(PUSH_QUEUE, redis),
        })
    }
}

/// HTTP client shared by both workers; per-request timeouts are tightened
/// further by the webhook handler.
pub fn outbound_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(OUTBOUND_TIMEOUT)
        .build()
        .expect("build outbound http client")
}

/// Spawns both workers; they drain until the shutdown signal fires.
pub fn spawn_workers(
    queues: &QueueSet,
    registry: Arc<PoolRegistry>,
    store: Arc<dyn ControlStore>,
    shutdown: ShutdownSignal,
) -> Vec<tokio::task::JoinHandle<()>> {
    let client = outbound_client();
    let mut handles = Worker::new(
        queues.webhooks.clone(),
        Arc::new(WebhookHandler::new(client.clone())),
        WEBHOOK_CONCURRENCY,
    )
    .spawn(shutdown.clone());
    handles.extend(
        Worker::new(
            queues.push.clone(),
            Arc::new(PushHandler::new(registry, store, client)),
            PUSH_CONCURRENCY,
        )
        .spawn(shutdown),
    );
    handles
}
