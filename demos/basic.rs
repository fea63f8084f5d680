//! Basic example showing how to use sea-orm-apm.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectionTrait, Database};
use sea_orm_apm::prelude::*;
use sea_orm_apm::Transaction;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sea_orm_apm=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/test".into());

    tracing::info!("Connecting to database...");

    let mut db = Database::connect(&database_url).await?.with_hooks();

    // Segments are reported for "test" at localhost:5432 as a Postgres datastore.
    // Disable parameter recording when bound values may carry secrets.
    let tracer = ApmTracer::with_config(
        DatastoreConfig::new("test", "localhost:5432", "Postgres").with_parameter_recording(false),
    );
    db.use_plugin(&tracer)?;

    // One APM transaction per unit of work, e.g. an HTTP request.
    let txn = Arc::new(
        TracingTransaction::new("demo").with_slow_segment_threshold(Duration::from_millis(100)),
    );
    let request_db = db.with_context(RequestContext::background().with_transaction(txn.clone()));

    // Reported as a `raw` segment.
    request_db
        .execute_unprepared("CREATE TABLE IF NOT EXISTS demo (id SERIAL PRIMARY KEY)")
        .await?;

    // Statements without a transaction on the context are not reported.
    db.execute_unprepared("SELECT 1").await?;

    tracing::info!(segments = txn.segment_count(), "demo finished");
    txn.end();

    Ok(())
}
