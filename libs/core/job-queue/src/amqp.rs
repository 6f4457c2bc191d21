//! AMQP implementation of the MessageBroker trait
//!
//! Owns the physical connection and channel, declares the dead-letter
//! topology idempotently, and rebuilds everything wholesale after a failure:
//! reconnects follow the configured backoff table and are abandoned once the
//! attempt ceiling is reached (the connection then stays down until an
//! operator intervenes).
//!
//! The source of truth for liveness is the `connected` flag plus the lapin
//! error callback; callback events are forwarded onto a channel and handled
//! by a monitor task, so no broker I/O happens inside the callback itself.
//! Reentrancy guards (`connecting`, `reconnecting`) are atomics because the
//! runtime is multi-threaded.

use crate::broker::{
    Alert, AlertSink, BrokerDelivery, ConnectionStatus, DeliveryAck, DeliveryStream,
    MessageBroker, PublishOptions, QueueDepth,
};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// AMQP-based message broker implementation.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<Inner>,
}

struct AmqpHandle {
    connection: Connection,
    channel: Channel,
}

enum ConnectionEvent {
    Error(String),
}

struct Inner {
    config: QueueConfig,
    alerts: Arc<dyn AlertSink>,
    handle: RwLock<Option<AmqpHandle>>,
    connected: AtomicBool,
    connecting: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    reconnect_attempt: AtomicU32,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
    monitor_task: StdMutex<Option<JoinHandle<()>>>,
}

impl AmqpBroker {
    /// Create the broker handle. Must be called from within a tokio runtime;
    /// the connection itself is established by [`MessageBroker::connect`].
    pub fn new(config: &QueueConfig, alerts: Arc<dyn AlertSink>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config: config.clone(),
            alerts,
            handle: RwLock::new(None),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnect_attempt: AtomicU32::new(0),
            events_tx,
            reconnect_task: StdMutex::new(None),
            monitor_task: StdMutex::new(None),
        });

        let monitor = tokio::spawn(monitor_events(Arc::downgrade(&inner), events_rx));
        *inner.monitor_task.lock().unwrap() = Some(monitor);

        Self { inner }
    }
}

/// Receives lapin error-callback events and drives disconnection handling
/// outside the callback context.
async fn monitor_events(
    inner: Weak<Inner>,
    mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            ConnectionEvent::Error(message) => {
                handle_connection_error(&inner, message).await;
            }
        }
    }
}

/// Marks the broker disconnected, notifies the alerting collaborator, and
/// schedules the reconnect sequence unless one is already in flight or the
/// attempt ceiling was reached.
async fn handle_connection_error(inner: &Arc<Inner>, message: String) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }

    let was_connected = inner.connected.swap(false, Ordering::SeqCst);
    if was_connected {
        metrics::gauge_connection(false);
        warn!(error = %message, "Broker connection lost");
    }

    inner
        .alerts
        .notify(Alert::warning(
            "amqp",
            format!("Broker connection error: {message}"),
        ))
        .await;

    schedule_reconnect(inner);
}

/// Start the reconnect loop, debounced: at most one sequence in flight, and
/// never after the attempt ceiling was exhausted or the broker was closed.
fn schedule_reconnect(inner: &Arc<Inner>) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }

    if inner.reconnect_attempt.load(Ordering::SeqCst)
        >= inner.config.broker.max_reconnect_attempts
    {
        debug!("Reconnect attempts already exhausted; waiting for operator");
        return;
    }

    if inner
        .reconnecting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("Reconnect already in progress");
        return;
    }

    let task_inner = Arc::clone(inner);
    let task = tokio::spawn(async move {
        reconnect_loop(&task_inner).await;
        task_inner.reconnecting.store(false, Ordering::SeqCst);
    });
    *inner.reconnect_task.lock().unwrap() = Some(task);
}

/// One backoff-delayed connect per attempt until success, closure, or the
/// attempt ceiling.
async fn reconnect_loop(inner: &Arc<Inner>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let attempt = inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > inner.config.broker.max_reconnect_attempts {
            error!(
                attempts = attempt - 1,
                "Reconnect attempts exhausted; broker stays down until restarted"
            );
            inner
                .alerts
                .notify(Alert::critical(
                    "amqp",
                    format!(
                        "Broker reconnection abandoned after {} attempts",
                        attempt - 1
                    ),
                ))
                .await;
            return;
        }

        let delay = inner.config.broker.reconnect_delay(attempt);
        info!(
            attempt,
            max_attempts = inner.config.broker.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling broker reconnection"
        );
        tokio::time::sleep(delay).await;

        if connect_once(inner).await {
            return;
        }
    }
}

/// Single connect attempt guarded against concurrent invocation. Returns
/// `false` on failure instead of erroring.
async fn connect_once(inner: &Arc<Inner>) -> bool {
    if inner.closed.load(Ordering::SeqCst) {
        return false;
    }

    if inner
        .connecting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("Connect already in progress");
        return false;
    }

    let result = try_connect(inner).await;
    inner.connecting.store(false, Ordering::SeqCst);

    match result {
        Ok(()) => {
            inner.reconnect_attempt.store(0, Ordering::SeqCst);
            inner.connected.store(true, Ordering::SeqCst);
            metrics::gauge_connection(true);
            info!(
                host = %inner.config.broker.host,
                port = inner.config.broker.port,
                queues = inner.config.queues.len(),
                "Connected to broker, topology declared"
            );
            true
        }
        Err(err) => {
            inner.connected.store(false, Ordering::SeqCst);
            warn!(error = %err, "Broker connection failed");
            inner
                .alerts
                .notify(Alert::warning(
                    "amqp",
                    format!("Broker connection failed: {err}"),
                ))
                .await;
            // A failed connect feeds the same recovery path as a dropped
            // connection; debounced, so this is a no-op inside the loop
            schedule_reconnect(inner);
            false
        }
    }
}

async fn try_connect(inner: &Arc<Inner>) -> QueueResult<()> {
    let url = inner.config.broker.amqp_url();
    let connection = Connection::connect(&url, ConnectionProperties::default()).await?;

    // Forward error-callback events to the monitor task; the callback itself
    // must not block or touch broker state.
    let events_tx = inner.events_tx.clone();
    connection.on_error(move |err| {
        let _ = events_tx.send(ConnectionEvent::Error(err.to_string()));
    });

    let channel = connection.create_channel().await?;
    channel
        .basic_qos(inner.config.broker.prefetch, BasicQosOptions::default())
        .await?;

    declare_topology(&channel, &inner.config).await?;

    *inner.handle.write().await = Some(AmqpHandle {
        connection,
        channel,
    });

    Ok(())
}

/// Declare the dead-letter exchange/queue and every application queue.
/// All declarations are idempotent for matching arguments.
async fn declare_topology(channel: &Channel, config: &QueueConfig) -> QueueResult<()> {
    let dl = &config.dead_letter;

    channel
        .exchange_declare(
            &dl.exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    // Poison messages expire out of the DLQ after the configured TTL
    let mut dlq_args = FieldTable::default();
    dlq_args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(dl.message_ttl.as_millis() as i64),
    );
    channel
        .queue_declare(
            &dl.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            dlq_args,
        )
        .await?;
    channel
        .queue_bind(
            &dl.queue,
            &dl.exchange,
            &dl.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    for queue in &config.queues {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dl.exchange.as_str().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dl.routing_key.as_str().into()),
        );
        args.insert(
            "x-max-priority".into(),
            AMQPValue::LongInt(config.max_priority as i32),
        );
        // Application-level retry hint; consumers read it from the record
        args.insert(
            "x-max-retries".into(),
            AMQPValue::LongInt(config.default_max_attempts),
        );
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
    }

    Ok(())
}

/// Extract the dead-letter cycle count from the `x-death` header, if any.
fn death_count(properties: &BasicProperties) -> Option<i64> {
    let headers = properties.headers().as_ref()?;
    let death = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-death")
        .map(|(_, value)| value)?;

    let AMQPValue::FieldArray(entries) = death else {
        return None;
    };
    let AMQPValue::FieldTable(first) = entries.as_slice().first()? else {
        return None;
    };
    first
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "count")
        .and_then(|(_, value)| match value {
            AMQPValue::LongLongInt(count) => Some(*count),
            AMQPValue::LongInt(count) => Some(*count as i64),
            _ => None,
        })
}

fn map_delivery(delivery: Delivery) -> BrokerDelivery {
    let Delivery {
        data,
        redelivered,
        routing_key,
        properties,
        acker,
        ..
    } = delivery;

    let death = death_count(&properties);
    BrokerDelivery::new(
        data,
        redelivered,
        routing_key.to_string(),
        death,
        Box::new(LapinAcker { acker }),
    )
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryAck for LapinAcker {
    async fn ack(&self) -> QueueResult<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> QueueResult<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

struct AmqpDeliveryStream {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<BrokerDelivery> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Some(map_delivery(delivery)),
            Some(Err(err)) => {
                warn!(error = %err, "Consumer stream error; stopping consumer");
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn connect(&self) -> bool {
        connect_once(&self.inner).await
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> QueueResult<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(QueueError::NotConnected);
        }

        let guard = self.inner.handle.read().await;
        let handle = guard.as_ref().ok_or(QueueError::NotConnected)?;

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_priority(options.priority);

        if !options.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (key, value) in &options.headers {
                headers.insert(
                    key.as_str().into(),
                    AMQPValue::LongString(value.as_str().into()),
                );
            }
            properties = properties.with_headers(headers);
        }

        handle
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> QueueResult<Box<dyn DeliveryStream>> {
        let guard = self.inner.handle.read().await;
        let handle = guard.as_ref().ok_or(QueueError::NotConnected)?;

        let consumer = handle
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue, consumer_tag = %consumer_tag, "Registered consumer");
        Ok(Box::new(AmqpDeliveryStream { consumer }))
    }

    async fn fetch(&self, queue: &str) -> QueueResult<Option<BrokerDelivery>> {
        let guard = self.inner.handle.read().await;
        let handle = guard.as_ref().ok_or(QueueError::NotConnected)?;

        let message = handle
            .channel
            .basic_get(queue, BasicGetOptions::default())
            .await?;

        Ok(message.map(|m| map_delivery(m.delivery)))
    }

    async fn queue_depth(&self, queue: &str) -> QueueResult<QueueDepth> {
        let guard = self.inner.handle.read().await;
        let handle = guard.as_ref().ok_or(QueueError::NotConnected)?;

        // Passive declare: errors if the queue is missing, mutates nothing
        let queue_info = handle
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(QueueDepth {
            messages: queue_info.message_count(),
            consumers: queue_info.consumer_count(),
        })
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.inner.connected.load(Ordering::SeqCst),
            reconnect_attempt: self.inner.reconnect_attempt.load(Ordering::SeqCst),
            max_reconnect_attempts: self.inner.config.broker.max_reconnect_attempts,
            reconnecting: self.inner.reconnecting.load(Ordering::SeqCst),
        }
    }

    async fn close(&self) -> QueueResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);

        if let Some(task) = self.inner.reconnect_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.inner.monitor_task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.reconnecting.store(false, Ordering::SeqCst);

        let handle = self.inner.handle.write().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.channel.close(200, "shutdown").await {
                debug!(error = %err, "Channel close failed during shutdown");
            }
            if let Err(err) = handle.connection.close(200, "shutdown").await {
                debug!(error = %err, "Connection close failed during shutdown");
            }
        }

        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            metrics::gauge_connection(false);
        }
        info!("Broker connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::TracingAlertSink;

    #[tokio::test]
    async fn test_status_before_connect() {
        let config = QueueConfig::default();
        let broker = AmqpBroker::new(&config, Arc::new(TracingAlertSink));

        let status = broker.status();
        assert!(!status.connected);
        assert_eq!(status.reconnect_attempt, 0);
        assert_eq!(status.max_reconnect_attempts, 10);
        assert!(!status.reconnecting);
    }

    #[tokio::test]
    async fn test_publish_without_connection_fails_fast() {
        let config = QueueConfig::default();
        let broker = AmqpBroker::new(&config, Arc::new(TracingAlertSink));

        let result = broker
            .publish("default", b"{}", &PublishOptions::default())
            .await;
        assert!(matches!(result, Err(QueueError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let config = QueueConfig::default();
        let broker = AmqpBroker::new(&config, Arc::new(TracingAlertSink));

        assert!(broker.close().await.is_ok());
        assert!(broker.close().await.is_ok());
        assert!(!broker.status().connected);
    }

    #[test]
    fn test_death_count_absent_without_headers() {
        let properties = BasicProperties::default();
        assert_eq!(death_count(&properties), None);
    }

    #[test]
    fn test_death_count_parses_x_death_header() {
        let mut death_entry = FieldTable::default();
        death_entry.insert("count".into(), AMQPValue::LongLongInt(3));

        let mut headers = FieldTable::default();
        headers.insert(
            "x-death".into(),
            AMQPValue::FieldArray(vec![AMQPValue::FieldTable(death_entry)].into()),
        );

        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(death_count(&properties), Some(3));
    }
}
