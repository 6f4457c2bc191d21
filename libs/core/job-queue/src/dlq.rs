//! Dead Letter Queue management
//!
//! Messages nacked without requeue are routed by the broker to the
//! dead-letter exchange and land on the DLQ, where they sit until the
//! 24h TTL expires or an operator intervenes. This module exposes the
//! inspection surface used by the admin UI.

use crate::broker::{BrokerDelivery, MessageBroker};
use crate::config::DeadLetterConfig;
use crate::error::{QueueError, QueueResult};
use crate::metrics;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Dead Letter Queue manager.
pub struct DeadLetterManager {
    broker: Arc<dyn MessageBroker>,
    config: DeadLetterConfig,
    peek_timeout: Duration,
}

/// DLQ statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub queue: String,
    pub exchange: String,
    pub messages: u32,
    pub consumers: u32,
}

/// One inspected DLQ entry.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// Message body, decoded as JSON when possible.
    pub payload: serde_json::Value,

    /// Correlated job record id, when the wire message carried one.
    pub job_id: Option<i64>,

    /// Routing key the message was dead-lettered with.
    pub routing_key: String,

    /// Dead-letter cycle count reported by the broker (`x-death`).
    pub death_count: Option<i64>,

    pub redelivered: bool,
}

impl DeadLetterManager {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        config: DeadLetterConfig,
        peek_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            config,
            peek_timeout,
        }
    }

    /// The DLQ queue name.
    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Current DLQ depth.
    pub async fn stats(&self) -> QueueResult<DeadLetterStats> {
        let depth = self.broker.queue_depth(&self.config.queue).await?;
        metrics::gauge_dlq_depth(&self.config.queue, depth.messages);

        Ok(DeadLetterStats {
            queue: self.config.queue.clone(),
            exchange: self.config.exchange.clone(),
            messages: depth.messages,
            consumers: depth.consumers,
        })
    }

    /// Inspect up to `limit` DLQ messages without consuming them.
    ///
    /// Messages are fetched, decoded, then returned to the queue via
    /// negative-ack-with-requeue, so inspection is non-destructive (the
    /// relative order of inspected messages may change). The whole operation
    /// is bounded by the configured wall-clock budget; whatever was collected
    /// by the deadline is returned.
    pub async fn peek(&self, limit: usize) -> QueueResult<Vec<DeadLetterEntry>> {
        let deadline = Instant::now() + self.peek_timeout;
        let mut fetched: Vec<BrokerDelivery> = Vec::new();
        let mut fetch_error: Option<QueueError> = None;

        while fetched.len() < limit {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(collected = fetched.len(), "DLQ peek hit its time budget");
                break;
            }

            match tokio::time::timeout(remaining, self.broker.fetch(&self.config.queue)).await {
                Ok(Ok(Some(delivery))) => fetched.push(delivery),
                Ok(Ok(None)) => break, // queue drained
                Ok(Err(err)) => {
                    fetch_error = Some(err);
                    break;
                }
                Err(_) => {
                    debug!(collected = fetched.len(), "DLQ peek hit its time budget");
                    break;
                }
            }
        }

        let entries = fetched.iter().map(decode_entry).collect();

        // Put everything back before reporting anything
        for delivery in fetched {
            if let Err(err) = delivery.nack(true).await {
                warn!(error = %err, "Failed to requeue DLQ message after inspection");
            }
        }

        match fetch_error {
            Some(err) => Err(err),
            None => Ok(entries),
        }
    }
}

fn decode_entry(delivery: &BrokerDelivery) -> DeadLetterEntry {
    let payload = serde_json::from_slice::<serde_json::Value>(&delivery.payload)
        .unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&delivery.payload).into_owned())
        });
    let job_id = payload.get("job_id").and_then(|v| v.as_i64());

    DeadLetterEntry {
        payload,
        job_id,
        routing_key: delivery.routing_key.clone(),
        death_count: delivery.death_count,
        redelivered: delivery.redelivered,
    }
}
