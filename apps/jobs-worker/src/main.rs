//! Jobs Worker Service - Entry Point
//!
//! Background worker that consumes job queues from the broker.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    jobs_worker::run().await
}
