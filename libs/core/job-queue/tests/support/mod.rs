//! In-memory fakes for exercising the orchestrator without a broker or a
//! database: `MemoryBroker` implements the messaging seam (including
//! dead-letter routing on nack-without-requeue) and `MemoryJobStore` the
//! record store.

use async_trait::async_trait;
use chrono::Utc;
use job_queue::{
    BrokerDelivery, ConnectionStatus, DeliveryAck, DeliveryStream, JobRecord, JobStatus,
    JobStore, MessageBroker, NewJob, PublishOptions, QueueDepth, QueueError, QueueResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Broker fake
// ---------------------------------------------------------------------------

struct MemoryBrokerInner {
    connected: AtomicBool,
    fail_publish: AtomicBool,
    publish_count: AtomicUsize,
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    dlq_name: String,
}

impl MemoryBrokerInner {
    /// Route a message to a queue: straight to a live consumer when one is
    /// registered, otherwise into the queue buffer.
    fn route(&self, queue: &str, payload: Vec<u8>) {
        if let Some(sender) = self.consumers.lock().unwrap().get(queue) {
            if sender.send(payload.clone()).is_ok() {
                return;
            }
        }
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

impl MemoryBroker {
    pub fn new(dlq_name: &str) -> Self {
        Self {
            inner: Arc::new(MemoryBrokerInner {
                connected: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
                publish_count: AtomicUsize::new(0),
                queues: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                dlq_name: dlq_name.to_string(),
            }),
        }
    }

    /// Make every subsequent publish fail.
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Number of publish attempts that reached the broker (failed or not).
    pub fn publish_count(&self) -> usize {
        self.inner.publish_count.load(Ordering::SeqCst)
    }

    /// Buffered depth of a queue (messages not yet handed to a consumer).
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Peek at the buffered messages of a queue.
    pub fn buffered(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Feed a raw message to a queue, bypassing publish bookkeeping.
    pub fn push_raw(&self, queue: &str, payload: Vec<u8>) {
        self.inner.route(queue, payload);
    }
}

struct MemoryAcker {
    inner: Arc<MemoryBrokerInner>,
    queue: String,
    payload: Vec<u8>,
}

#[async_trait]
impl DeliveryAck for MemoryAcker {
    async fn ack(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> QueueResult<()> {
        if requeue {
            self.inner.route(&self.queue, self.payload.clone());
        } else {
            let dlq = self.inner.dlq_name.clone();
            self.inner.route(&dlq, self.payload.clone());
        }
        Ok(())
    }
}

struct MemoryDeliveryStream {
    inner: Arc<MemoryBrokerInner>,
    queue: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<BrokerDelivery> {
        let payload = self.rx.recv().await?;
        Some(BrokerDelivery::new(
            payload.clone(),
            false,
            self.queue.clone(),
            None,
            Box::new(MemoryAcker {
                inner: Arc::clone(&self.inner),
                queue: self.queue.clone(),
                payload,
            }),
        ))
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn connect(&self) -> bool {
        self.inner.connected.store(true, Ordering::SeqCst);
        true
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        _options: &PublishOptions,
    ) -> QueueResult<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(QueueError::NotConnected);
        }

        self.inner.publish_count.fetch_add(1, Ordering::SeqCst);

        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::Internal("publish failed (injected)".to_string()));
        }

        self.inner.route(queue, payload.to_vec());
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> QueueResult<Box<dyn DeliveryStream>> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Drain anything buffered before the consumer arrived
        let backlog: Vec<Vec<u8>> = self
            .inner
            .queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .drain(..)
            .collect();
        for payload in backlog {
            let _ = tx.send(payload);
        }

        self.inner
            .consumers
            .lock()
            .unwrap()
            .insert(queue.to_string(), tx);

        Ok(Box::new(MemoryDeliveryStream {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            rx,
        }))
    }

    async fn fetch(&self, queue: &str) -> QueueResult<Option<BrokerDelivery>> {
        let payload = self
            .inner
            .queues
            .lock()
            .unwrap()
            .get_mut(queue)
            .and_then(|q| q.pop_front());

        Ok(payload.map(|payload| {
            BrokerDelivery::new(
                payload.clone(),
                false,
                queue.to_string(),
                None,
                Box::new(MemoryAcker {
                    inner: Arc::clone(&self.inner),
                    queue: queue.to_string(),
                    payload,
                }),
            )
        }))
    }

    async fn queue_depth(&self, queue: &str) -> QueueResult<QueueDepth> {
        Ok(QueueDepth {
            messages: self.queue_len(queue) as u32,
            consumers: self
                .inner
                .consumers
                .lock()
                .unwrap()
                .contains_key(queue) as u32,
        })
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.inner.connected.load(Ordering::SeqCst),
            reconnect_attempt: 0,
            max_reconnect_attempts: 10,
            reconnecting: false,
        }
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.consumers.lock().unwrap().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store fake
// ---------------------------------------------------------------------------

struct MemoryJobStoreInner {
    jobs: Mutex<HashMap<i64, JobRecord>>,
    next_id: AtomicI64,
    fail_insert: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryJobStore {
    inner: Arc<MemoryJobStoreInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryJobStoreInner {
                jobs: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                fail_insert: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_fail_insert(&self, fail: bool) {
        self.inner.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn record(&self, id: i64) -> Option<JobRecord> {
        self.inner.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn status_of(&self, id: i64) -> Option<JobStatus> {
        self.record(id).map(|r| r.status)
    }

    /// Insert a record directly in a given state (test setup).
    pub fn seed(&self, queue: &str, payload: serde_json::Value, status: JobStatus, attempts: i32, max_attempts: i32) -> i64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let record = JobRecord {
            id,
            queue: queue.to_string(),
            payload,
            status,
            attempts,
            max_attempts,
            error: match status {
                JobStatus::Failed => Some("seeded failure".to_string()),
                _ => None,
            },
            available_at: now,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.jobs.lock().unwrap().insert(id, record);
        id
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob) -> QueueResult<JobRecord> {
        if self.inner.fail_insert.load(Ordering::SeqCst) {
            return Err(QueueError::Internal("insert failed (injected)".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let record = JobRecord {
            id,
            queue: job.queue,
            payload: job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            error: None,
            available_at: now,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .jobs
            .lock()
            .unwrap()
            .insert(id, record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<String>,
    ) -> QueueResult<()> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        if let Some(record) = jobs.get_mut(&id) {
            record.status = status;
            let now = Utc::now();
            match status {
                JobStatus::Processing => {
                    record.started_at = Some(now);
                    record.attempts += 1;
                }
                JobStatus::Completed => record.completed_at = Some(now),
                JobStatus::Failed => record.error = error,
                JobStatus::Pending => {}
            }
            record.updated_at = now;
        }
        Ok(())
    }

    async fn select_retryable(&self, limit: i64) -> QueueResult<Vec<JobRecord>> {
        let jobs = self.inner.jobs.lock().unwrap();
        let mut retryable: Vec<JobRecord> = jobs
            .values()
            .filter(|r| r.status == JobStatus::Failed && r.attempts < r.max_attempts)
            .cloned()
            .collect();
        retryable.sort_by_key(|r| (r.created_at, r.id));
        retryable.truncate(limit as usize);
        Ok(retryable)
    }

    async fn mark_retry(&self, id: i64) -> QueueResult<()> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        if let Some(record) = jobs.get_mut(&id) {
            record.attempts += 1;
            record.status = JobStatus::Pending;
            record.error = None;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn counts_by_status(&self) -> QueueResult<Vec<(JobStatus, i64)>> {
        let jobs = self.inner.jobs.lock().unwrap();
        let mut counts: HashMap<JobStatus, i64> = HashMap::new();
        for record in jobs.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn get(&self, id: i64) -> QueueResult<Option<JobRecord>> {
        Ok(self.record(id))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll the store until the record reaches the expected status.
pub async fn wait_for_status(store: &MemoryJobStore, id: i64, status: JobStatus) -> bool {
    for _ in 0..200 {
        if store.status_of(id) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Poll until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
