//! Messaging abstraction layer
//!
//! Trait-based seam over the broker so the orchestrator can be exercised
//! against an in-memory implementation in tests while production uses the
//! AMQP-backed [`crate::AmqpBroker`].

use crate::error::QueueResult;
use async_trait::async_trait;
use serde::Serialize;

/// Options applied to a single publish.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Message priority hint (0-9, honored when the queue declares
    /// `x-max-priority`).
    pub priority: u8,

    /// Application headers attached to the message.
    pub headers: Vec<(String, String)>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            headers: Vec::new(),
        }
    }
}

impl PublishOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Acknowledgment handle for one delivery.
///
/// `nack(requeue = false)` routes the message to the dead-letter exchange on
/// brokers configured with one; `nack(requeue = true)` puts it back on the
/// source queue.
#[async_trait]
pub trait DeliveryAck: Send + Sync {
    async fn ack(&self) -> QueueResult<()>;
    async fn nack(&self, requeue: bool) -> QueueResult<()>;
}

/// A message delivered from the broker, with its acknowledgment handle.
pub struct BrokerDelivery {
    /// Raw message body.
    pub payload: Vec<u8>,

    /// Whether the broker flagged this delivery as a redelivery.
    pub redelivered: bool,

    /// Routing key the message was published with.
    pub routing_key: String,

    /// Dead-letter cycle count, when the broker reports one (`x-death`).
    pub death_count: Option<i64>,

    acker: Box<dyn DeliveryAck>,
}

impl BrokerDelivery {
    pub fn new(
        payload: Vec<u8>,
        redelivered: bool,
        routing_key: String,
        death_count: Option<i64>,
        acker: Box<dyn DeliveryAck>,
    ) -> Self {
        Self {
            payload,
            redelivered,
            routing_key,
            death_count,
            acker,
        }
    }

    /// Positively acknowledge; the broker removes the message.
    pub async fn ack(self) -> QueueResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge. Without requeue the broker dead-letters the
    /// message; with requeue it returns to the source queue.
    pub async fn nack(self, requeue: bool) -> QueueResult<()> {
        self.acker.nack(requeue).await
    }
}

/// Stream of incoming deliveries for one consumer registration.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Receive the next delivery. `None` means the consumer ended (channel
    /// closed or connection lost) and the loop should stop.
    async fn next(&mut self) -> Option<BrokerDelivery>;
}

/// Queue depth as reported by the broker.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepth {
    pub messages: u32,
    pub consumers: u32,
}

/// Snapshot of broker connection health.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Whether a connection and channel are currently established.
    pub connected: bool,

    /// Reconnect attempts since the last successful connect (0 when healthy).
    pub reconnect_attempt: u32,

    /// Attempt ceiling after which reconnection is abandoned.
    pub max_reconnect_attempts: u32,

    /// Whether a reconnect sequence is currently in flight.
    pub reconnecting: bool,
}

/// Abstract message broker interface.
///
/// Implementations:
/// - [`crate::AmqpBroker`] over lapin (production)
/// - in-memory (integration tests)
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Establish the connection and declare topology. Returns `false` on
    /// failure instead of erroring; callers observe health via [`Self::status`].
    async fn connect(&self) -> bool;

    /// Publish a message onto the named queue.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> QueueResult<()>;

    /// Register a consumer and return its delivery stream.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> QueueResult<Box<dyn DeliveryStream>>;

    /// Pull a single message without waiting (basic.get semantics). Used for
    /// DLQ inspection.
    async fn fetch(&self, queue: &str) -> QueueResult<Option<BrokerDelivery>>;

    /// Report the depth of a queue.
    async fn queue_depth(&self, queue: &str) -> QueueResult<QueueDepth>;

    /// Connection health snapshot; side-effect free.
    fn status(&self) -> ConnectionStatus;

    /// Graceful shutdown: cancel pending reconnects, release channel then
    /// connection. Idempotent.
    async fn close(&self) -> QueueResult<()>;
}

/// Alert severity for the external alerting collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// An operational alert raised by the queue subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// The affected service ("amqp", "job-queue").
    pub service: String,
    pub message: String,
}

impl Alert {
    pub fn warning(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Warning,
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn critical(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            service: service.into(),
            message: message.into(),
        }
    }
}

/// External alerting collaborator notified on connection errors and
/// reconnect exhaustion.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: Alert);
}

/// Default sink: structured log records, nothing else.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Warning => {
                tracing::warn!(service = %alert.service, "{}", alert.message);
            }
            AlertSeverity::Critical => {
                tracing::error!(service = %alert.service, "{}", alert.message);
            }
        }
    }
}
