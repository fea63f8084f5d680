//! The APM agent capability consumed by the adapter.
//!
//! The adapter never talks to a monitoring backend itself. It asks a
//! [`Transaction`] carried on the [`RequestContext`] to start segments, hands
//! finished [`DatastoreSegment`]s back to it, and ends it when a write
//! operation's transaction bracket closes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DatastoreProduct;

/// A request-scoped unit of APM work.
///
/// Implementations must tolerate concurrent segment creation: statements from
/// different tasks of the same request may report into one transaction.
pub trait Transaction: Send + Sync + fmt::Debug {
    /// Begin a timed segment now and return its start marker.
    fn start_segment_now(&self) -> SegmentStartTime;

    /// Close a datastore segment that was started by this transaction.
    fn end_segment(&self, segment: DatastoreSegment);

    /// Finish the transaction.
    fn end(&self);
}

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque marker returned when a segment begins; required to close it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStartTime {
    id: u64,
    started_at: Instant,
}

impl SegmentStartTime {
    /// Capture a new marker at the current instant.
    pub fn now() -> Self {
        Self {
            id: NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed),
            started_at: Instant::now(),
        }
    }

    /// Process-unique identifier of the segment.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Descriptor of one finished datastore operation.
#[derive(Debug, Clone, PartialEq)]
pub struct DatastoreSegment {
    pub start_time: SegmentStartTime,
    pub product: DatastoreProduct,
    /// Lowercase operation label, e.g. `insert` or `transaction`.
    pub operation: String,
    /// Target table of the statement.
    pub collection: String,
    pub parameterized_query: String,
    /// 1-based parameter position mapped to the value's textual form.
    pub query_parameters: BTreeMap<String, String>,
    pub database_name: String,
    pub host: String,
}

/// Request-scoped context that may carry an APM transaction.
///
/// Cloning is cheap; clones share the same transaction.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    transaction: Option<Arc<dyn Transaction>>,
}

impl RequestContext {
    /// A context without a transaction. Hooks are no-ops under it.
    pub fn background() -> Self {
        Self::default()
    }

    /// Attach a transaction, replacing any existing one.
    pub fn with_transaction(mut self, transaction: Arc<dyn Transaction>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// The active transaction, if any.
    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }
}
