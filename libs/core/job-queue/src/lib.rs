//! Durable Job Queue
//!
//! The asynchronous work subsystem of the admin panel: producers persist a
//! job record and publish it to an AMQP broker; workers consume deliveries,
//! run the registered handler, and synchronize the record's lifecycle
//! (`pending` → `processing` → `completed`/`failed`). Unprocessable messages
//! are dead-lettered; broker unavailability is contained by a circuit
//! breaker and bounded reconnection.
//!
//! ## Features
//!
//! - **Broker lifecycle**: connection + channel management with idempotent
//!   topology declaration and backoff-table reconnection
//! - **Circuit breaker**: fail-fast protection for publish operations
//! - **Dead Letter Queue**: poison messages quarantined with a 24h TTL,
//!   non-destructive inspection for the admin UI
//! - **Job persistence**: Postgres-backed record store with manual retry
//! - **Prometheus metrics** and an axum admin/health router
//!
//! ## Example
//!
//! ```ignore
//! use job_queue::{AmqpBroker, PgJobStore, QueueConfig, QueueService, TracingAlertSink};
//!
//! let config = QueueConfig::from_env()?;
//! let broker = AmqpBroker::new(&config, Arc::new(TracingAlertSink));
//! let store = PgJobStore::new(pool);
//! let service = Arc::new(QueueService::new(Arc::new(broker), Arc::new(store), config));
//!
//! service.start().await;
//! service.consume("emails", handler, ConsumeOptions::default()).await;
//! service.enqueue("emails", payload, EnqueueOptions::default()).await;
//! ```

mod amqp;
mod breaker;
mod broker;
mod config;
mod dlq;
mod error;
pub mod metrics;
mod service;
mod store;

pub mod admin;

// Re-export main types
pub use amqp::AmqpBroker;
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
pub use broker::{
    Alert, AlertSeverity, AlertSink, BrokerDelivery, ConnectionStatus, DeliveryAck,
    DeliveryStream, MessageBroker, PublishOptions, QueueDepth, TracingAlertSink,
};
pub use config::{BrokerConfig, DeadLetterConfig, QueueConfig};
pub use dlq::{DeadLetterEntry, DeadLetterManager, DeadLetterStats};
pub use error::{QueueError, QueueResult};
pub use service::{ConsumeOptions, EnqueueOptions, JobHandler, QueueService, ServiceStatus};
pub use store::{
    JOBS_SCHEMA, JobRecord, JobStatus, JobStore, NewJob, PgJobStore, QueueStats, ensure_schema,
};
