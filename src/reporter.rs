//! A [`Transaction`] that reports datastore segments through `tracing`.
//!
//! Useful when no vendor agent is linked: every closed segment becomes an
//! `INFO` event carrying OpenTelemetry-style `db.*` fields, and exporters
//! configured on the subscriber take it from there.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::apm::{DatastoreSegment, SegmentStartTime, Transaction};

/// Tracing-backed APM transaction.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use sea_orm_apm::{RequestContext, TracingTransaction};
///
/// let txn = Arc::new(TracingTransaction::new("GET /orders"));
/// let ctx = RequestContext::background().with_transaction(txn.clone());
/// assert!(ctx.transaction().is_some());
/// ```
#[derive(Debug)]
pub struct TracingTransaction {
    name: String,
    slow_segment_threshold: Option<Duration>,
    segments: AtomicU64,
    ended: AtomicBool,
}

impl TracingTransaction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slow_segment_threshold: None,
            segments: AtomicU64::new(0),
            ended: AtomicBool::new(false),
        }
    }

    /// Log segments slower than `threshold` at WARN level.
    pub fn with_slow_segment_threshold(mut self, threshold: Duration) -> Self {
        self.slow_segment_threshold = Some(threshold);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of segments closed so far.
    pub fn segment_count(&self) -> u64 {
        self.segments.load(Ordering::Relaxed)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

impl Transaction for TracingTransaction {
    fn start_segment_now(&self) -> SegmentStartTime {
        SegmentStartTime::now()
    }

    fn end_segment(&self, segment: DatastoreSegment) {
        let elapsed = segment.start_time.elapsed();
        let duration_ms = elapsed.as_millis() as i64;
        self.segments.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            target: "sea_orm_apm",
            transaction = %self.name,
            db.system = %segment.product,
            db.operation = %segment.operation,
            db.sql.table = %segment.collection,
            db.statement = %segment.parameterized_query,
            db.query.parameters = ?segment.query_parameters,
            db.name = %segment.database_name,
            server.address = %segment.host,
            db.duration_ms = duration_ms,
            "datastore segment"
        );

        if let Some(threshold) = self.slow_segment_threshold {
            if elapsed > threshold {
                tracing::warn!(
                    target: "sea_orm_apm",
                    transaction = %self.name,
                    db.operation = %segment.operation,
                    duration_ms = duration_ms,
                    threshold_ms = threshold.as_millis() as i64,
                    "Slow datastore segment"
                );
            }
        }
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                target: "sea_orm_apm",
                transaction = %self.name,
                "transaction already ended"
            );
            return;
        }
        tracing::info!(
            target: "sea_orm_apm",
            transaction = %self.name,
            segments = self.segment_count(),
            "transaction ended"
        );
    }
}
