//! Queue service orchestration
//!
//! `QueueService` ties producer-side enqueue to consumer-side execution:
//! it persists the job record, publishes through the circuit breaker,
//! drives consumer delivery loops, and exposes the stats/admin operations
//! the rest of the application consumes. Constructed with injected
//! dependencies and an explicit `start()`/`close()` lifecycle; there is no
//! process-global instance.

use crate::breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::broker::{ConnectionStatus, MessageBroker, PublishOptions};
use crate::config::QueueConfig;
use crate::dlq::{DeadLetterEntry, DeadLetterManager, DeadLetterStats};
use crate::error::QueueResult;
use crate::metrics;
use crate::store::{JobStatus, JobStore, NewJob, QueueStats};
use crate::broker::BrokerDelivery;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Handler invoked for each delivered job payload.
///
/// Returning an error marks the job record `failed` and dead-letters the
/// message; the consumer loop itself keeps running.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> QueueResult<()>;

    /// Handler name for logging.
    fn name(&self) -> &'static str {
        "job-handler"
    }
}

/// Options accepted by [`QueueService::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Overrides the configured default `max_attempts` for the new record.
    pub max_attempts: Option<i32>,

    /// Overrides the configured default message priority.
    pub priority: Option<u8>,

    /// Skip the record insert; used when re-publishing an existing record.
    pub skip_db_insert: bool,

    /// Record id to embed in the wire message when `skip_db_insert` is set.
    pub job_id: Option<i64>,

    /// Extra message headers.
    pub headers: Vec<(String, String)>,
}

impl EnqueueOptions {
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Re-publish an already-persisted record without inserting a new one.
    pub fn for_existing(job_id: i64) -> Self {
        Self {
            skip_db_insert: true,
            job_id: Some(job_id),
            ..Default::default()
        }
    }
}

/// Options accepted by [`QueueService::consume`].
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Consumer tag; generated from the queue name when absent.
    pub consumer_tag: Option<String>,
}

/// Combined health snapshot: broker connection plus circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub connection: ConnectionStatus,
    pub circuit_breaker: CircuitBreakerStatus,
}

/// The job queue orchestrator.
pub struct QueueService {
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn JobStore>,
    breaker: CircuitBreaker,
    dead_letters: DeadLetterManager,
    config: QueueConfig,
    consumers: StdMutex<Vec<JoinHandle<()>>>,
}

impl QueueService {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn JobStore>,
        config: QueueConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        let dead_letters = DeadLetterManager::new(
            Arc::clone(&broker),
            config.dead_letter.clone(),
            config.dlq_peek_timeout,
        );

        Self {
            broker,
            store,
            breaker,
            dead_letters,
            config,
            consumers: StdMutex::new(Vec::new()),
        }
    }

    /// Connect the broker and declare topology. Returns `false` when the
    /// broker is unreachable; the service stays usable in degraded mode and
    /// the broker keeps reconnecting on its own.
    pub async fn start(&self) -> bool {
        let connected = self.broker.connect().await;
        metrics::gauge_breaker(self.breaker.state());
        connected
    }

    /// Persist a `pending` record and publish it.
    ///
    /// Returns `false` when the record insert fails (surfaced), when the
    /// circuit breaker is open, or when the publish fails; in the latter two
    /// cases the record is marked `failed` with a descriptive error. Never
    /// panics into the caller.
    #[instrument(skip(self, payload, options), fields(queue = %queue))]
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> bool {
        let job_id = if options.skip_db_insert {
            options.job_id
        } else {
            let max_attempts = options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts);
            let new_job = NewJob {
                queue: queue.to_string(),
                payload: payload.clone(),
                max_attempts,
            };
            match self.store.insert(new_job).await {
                Ok(record) => Some(record.id),
                Err(err) => {
                    error!(error = %err, "Failed to persist job record; enqueue rejected");
                    return false;
                }
            }
        };

        let message = wire_message(&payload, job_id);
        let bytes = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(job_id = ?job_id, error = %err, "Failed to serialize wire message");
                if let Some(id) = job_id {
                    update_status_logged(
                        &self.store,
                        id,
                        JobStatus::Failed,
                        Some(format!("Serialization failed: {err}")),
                    )
                    .await;
                }
                return false;
            }
        };

        let publish_options = PublishOptions {
            priority: options.priority.unwrap_or(self.config.default_priority),
            headers: options.headers.clone(),
        };

        let outcome = self
            .breaker
            .execute(|| self.broker.publish(queue, &bytes, &publish_options))
            .await;
        metrics::gauge_breaker(self.breaker.state());

        match outcome {
            Ok(()) => {
                metrics::record_enqueued(queue);
                debug!(job_id = ?job_id, "Job published");
                true
            }
            Err(err) => {
                let (cause, reason) = if err.is_circuit_open() {
                    ("circuit_open", err.to_string())
                } else {
                    ("publish_error", format!("Publish failed: {err}"))
                };
                metrics::record_publish_failure(queue, cause);
                warn!(job_id = ?job_id, error = %err, "Publish failed; job marked failed");

                if let Some(id) = job_id {
                    update_status_logged(&self.store, id, JobStatus::Failed, Some(reason)).await;
                }
                false
            }
        }
    }

    /// Register a handler for a queue and start its delivery loop.
    ///
    /// Each delivery is parsed, correlated to its record via `job_id`,
    /// marked `processing`, handed to the handler, then acked on success or
    /// nacked without requeue on failure (the broker dead-letters it). A
    /// single message's failure — or panic — never stops the loop.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumeOptions,
    ) -> bool {
        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("{}-{}", queue, uuid::Uuid::new_v4()));

        let mut stream = match self.broker.consume(queue, &consumer_tag).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(queue = %queue, error = %err, "Failed to register consumer");
                return false;
            }
        };

        let store = Arc::clone(&self.store);
        let queue_name = queue.to_string();
        let task = tokio::spawn(async move {
            info!(queue = %queue_name, handler = handler.name(), "Consumer started");
            while let Some(delivery) = stream.next().await {
                process_delivery(&store, &queue_name, handler.as_ref(), delivery).await;
            }
            warn!(queue = %queue_name, "Delivery stream ended; consumer stopped");
        });

        self.consumers.lock().unwrap().push(task);
        true
    }

    /// Idempotent status write for a job record. Store failures are logged,
    /// never propagated: observability must not break job flow.
    pub async fn update_job_status(&self, job_id: i64, status: JobStatus, error: Option<String>) {
        update_status_logged(&self.store, job_id, status, error).await;
    }

    /// Re-queue up to `limit` failed records that are still under their
    /// `max_attempts`, oldest first. Each retried record has `attempts`
    /// incremented by exactly one; a failed re-publish leaves it `failed`
    /// with the publish error. Returns the count successfully re-queued.
    #[instrument(skip(self))]
    pub async fn retry_failed_jobs(&self, limit: i64) -> usize {
        let candidates = match self.store.select_retryable(limit).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "Failed to select retryable jobs");
                return 0;
            }
        };

        let mut requeued = 0;
        for job in candidates {
            if let Err(err) = self.store.mark_retry(job.id).await {
                warn!(job_id = job.id, error = %err, "Failed to mark job for retry; skipping");
                continue;
            }

            // A failed re-publish marks the record failed again inside enqueue
            if self
                .enqueue(
                    &job.queue,
                    job.payload.clone(),
                    EnqueueOptions::for_existing(job.id),
                )
                .await
            {
                metrics::record_retry(&job.queue);
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!(count = requeued, "Re-queued failed jobs");
        }
        requeued
    }

    /// Aggregate job counts by status, sourced from the store.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let counts = self.store.counts_by_status().await?;
        Ok(QueueStats::from_counts(&counts))
    }

    /// Broker connection health plus circuit breaker status. Side-effect
    /// free.
    pub fn connection_status(&self) -> ServiceStatus {
        ServiceStatus {
            connection: self.broker.status(),
            circuit_breaker: self.breaker.status(),
        }
    }

    /// Dead-letter queue depth.
    pub async fn dead_letter_stats(&self) -> QueueResult<DeadLetterStats> {
        self.dead_letters.stats().await
    }

    /// Non-destructive DLQ inspection, bounded by the configured timeout.
    pub async fn dlq_messages(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        self.dead_letters.peek(limit).await
    }

    /// Administrative override: force the circuit breaker closed.
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
        metrics::gauge_breaker(self.breaker.state());
    }

    /// Graceful shutdown: stop consumer loops, then release the broker
    /// channel and connection.
    pub async fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = self.consumers.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        if let Err(err) = self.broker.close().await {
            warn!(error = %err, "Broker close failed during shutdown");
        }
        info!("Queue service stopped");
    }
}

/// Build the wire message: the payload object with `job_id` merged in.
fn wire_message(payload: &serde_json::Value, job_id: Option<i64>) -> serde_json::Value {
    match (payload, job_id) {
        (serde_json::Value::Object(map), Some(id)) => {
            let mut map = map.clone();
            map.insert("job_id".to_string(), serde_json::Value::from(id));
            serde_json::Value::Object(map)
        }
        // Non-object payloads are wrapped so the id still travels
        (other, Some(id)) => serde_json::json!({ "payload": other, "job_id": id }),
        (other, None) => other.clone(),
    }
}

/// Status bookkeeping never interrupts job flow: failures are logged and
/// swallowed. The initial insert in `enqueue` is the one store write whose
/// failure surfaces to the caller.
async fn update_status_logged(
    store: &Arc<dyn JobStore>,
    job_id: i64,
    status: JobStatus,
    error: Option<String>,
) {
    if let Err(err) = store.update_status(job_id, status, error).await {
        warn!(job_id, status = %status, error = %err, "Failed to update job status");
    }
}

async fn process_delivery(
    store: &Arc<dyn JobStore>,
    queue: &str,
    handler: &dyn JobHandler,
    delivery: BrokerDelivery,
) {
    let payload: serde_json::Value = match serde_json::from_slice(&delivery.payload) {
        Ok(value) => value,
        Err(err) => {
            // Not JSON at all: poison, quarantine via the dead-letter path
            warn!(queue = %queue, error = %err, "Unparseable message body; dead-lettering");
            metrics::record_processed(queue, "poison");
            if let Err(nack_err) = delivery.nack(false).await {
                error!(queue = %queue, error = %nack_err, "Failed to nack poison message");
            }
            return;
        }
    };

    let job_id = payload.get("job_id").and_then(|v| v.as_i64());
    match job_id {
        Some(id) => update_status_logged(store, id, JobStatus::Processing, None).await,
        None => debug!(queue = %queue, "Message has no job_id; status tracking skipped"),
    }

    let start = std::time::Instant::now();
    let outcome = AssertUnwindSafe(handler.handle(payload.clone()))
        .catch_unwind()
        .await;
    metrics::record_handler_duration(queue, start.elapsed());

    match outcome {
        Ok(Ok(())) => {
            if let Some(id) = job_id {
                update_status_logged(store, id, JobStatus::Completed, None).await;
            }
            metrics::record_processed(queue, "completed");
            if let Err(err) = delivery.ack().await {
                error!(queue = %queue, error = %err, "Failed to ack message");
            }
        }
        Ok(Err(err)) => {
            fail_delivery(store, queue, job_id, delivery, err.to_string()).await;
        }
        Err(_) => {
            fail_delivery(store, queue, job_id, delivery, "Handler panicked".to_string()).await;
        }
    }
}

async fn fail_delivery(
    store: &Arc<dyn JobStore>,
    queue: &str,
    job_id: Option<i64>,
    delivery: BrokerDelivery,
    reason: String,
) {
    warn!(queue = %queue, job_id = ?job_id, error = %reason, "Job failed; dead-lettering message");

    if let Some(id) = job_id {
        update_status_logged(store, id, JobStatus::Failed, Some(reason)).await;
    }
    metrics::record_processed(queue, "failed");

    // No requeue: the broker routes the message to the dead-letter exchange
    if let Err(err) = delivery.nack(false).await {
        error!(queue = %queue, error = %err, "Failed to nack message");
    }
}
