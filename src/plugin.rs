//! The APM telemetry plugin.
//!
//! [`ApmTracer`] registers a before/after callback pair on every processor
//! and brackets create, update and delete with an extra `TRANSACTION` pair.
//! The before callback starts a segment on the request's APM transaction and
//! stores its start marker on the statement; the after callback takes the
//! marker back, builds a [`DatastoreSegment`] and closes it. When the
//! `TRANSACTION` pair closes, the APM transaction itself is ended.
//!
//! Without a transaction on the [`RequestContext`](crate::RequestContext)
//! every callback is a no-op. Nothing here can fail a database call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sea_orm::Value;

use crate::apm::{DatastoreSegment, SegmentStartTime};
use crate::config::{DatastoreConfig, DatastoreProduct};
use crate::error::HookError;
use crate::hooks::{
    CallbackKind, Callbacks, HookStatement, Plugin, BEGIN_TRANSACTION,
    COMMIT_OR_ROLLBACK_TRANSACTION,
};

/// Name the plugin registers under.
pub const PLUGIN_NAME: &str = "apm-telemetry-plugin";

/// Operation labels reported on segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Select,
    Row,
    Raw,
    Update,
    Delete,
    Transaction,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Select => "SELECT",
            Operation::Row => "ROW",
            Operation::Raw => "RAW",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Transaction => "TRANSACTION",
        }
    }

    /// Label as sent in [`DatastoreSegment::operation`].
    pub fn segment_label(&self) -> String {
        self.as_str().to_lowercase()
    }

    /// Scratch key holding this operation's start marker.
    pub fn start_key(&self) -> String {
        format!("apmStartTime:{}", self.as_str())
    }

    /// The label for statements executed by a processor.
    pub fn for_kind(kind: CallbackKind) -> Self {
        match kind {
            CallbackKind::Create => Operation::Insert,
            CallbackKind::Query => Operation::Select,
            CallbackKind::Row => Operation::Row,
            CallbackKind::Raw => Operation::Raw,
            CallbackKind::Update => Operation::Update,
            CallbackKind::Delete => Operation::Delete,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map bound parameters to their 1-based position.
///
/// Values are rendered with `Display` and sent as is: no truncation, no
/// redaction.
///
/// ```rust
/// use sea_orm_apm::query_parameters;
///
/// let params = query_parameters(["a", "b", "c"]);
/// assert_eq!(params["1"], "a");
/// assert_eq!(params["3"], "c");
/// ```
pub fn query_parameters<I>(values: I) -> BTreeMap<String, String>
where
    I: IntoIterator,
    I::Item: fmt::Display,
{
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| ((i + 1).to_string(), v.to_string()))
        .collect()
}

/// `Display` for a bound SeaORM value: the inner value, or `NULL`.
///
/// Covers every value type enabled through this crate's `with-*` features.
/// Bytes render as a list of numbers and arrays as space-separated elements.
pub struct DisplayValue<'a>(pub &'a Value);

impl fmt::Display for DisplayValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Bool(Some(v)) => write!(f, "{v}"),
            Value::TinyInt(Some(v)) => write!(f, "{v}"),
            Value::SmallInt(Some(v)) => write!(f, "{v}"),
            Value::Int(Some(v)) => write!(f, "{v}"),
            Value::BigInt(Some(v)) => write!(f, "{v}"),
            Value::TinyUnsigned(Some(v)) => write!(f, "{v}"),
            Value::SmallUnsigned(Some(v)) => write!(f, "{v}"),
            Value::Unsigned(Some(v)) => write!(f, "{v}"),
            Value::BigUnsigned(Some(v)) => write!(f, "{v}"),
            Value::Float(Some(v)) => write!(f, "{v}"),
            Value::Double(Some(v)) => write!(f, "{v}"),
            Value::String(Some(v)) => write!(f, "{v}"),
            Value::Char(Some(v)) => write!(f, "{v}"),
            Value::Bytes(Some(v)) => write!(f, "{:?}", v.as_slice()),
            #[cfg(feature = "with-json")]
            Value::Json(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-chrono")]
            Value::ChronoDate(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-chrono")]
            Value::ChronoTime(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-chrono")]
            Value::ChronoDateTime(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-chrono")]
            Value::ChronoDateTimeUtc(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-chrono")]
            Value::ChronoDateTimeLocal(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-chrono")]
            Value::ChronoDateTimeWithTimeZone(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-time")]
            Value::TimeDate(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-time")]
            Value::TimeTime(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-time")]
            Value::TimeDateTime(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-time")]
            Value::TimeDateTimeWithTimeZone(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-uuid")]
            Value::Uuid(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-rust_decimal")]
            Value::Decimal(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "with-bigdecimal")]
            Value::BigDecimal(Some(v)) => write!(f, "{v}"),
            #[cfg(feature = "postgres-array")]
            Value::Array(_, Some(values)) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", DisplayValue(v))?;
                }
                f.write_str("]")
            }
            Value::Bool(None)
            | Value::TinyInt(None)
            | Value::SmallInt(None)
            | Value::Int(None)
            | Value::BigInt(None)
            | Value::TinyUnsigned(None)
            | Value::SmallUnsigned(None)
            | Value::Unsigned(None)
            | Value::BigUnsigned(None)
            | Value::Float(None)
            | Value::Double(None)
            | Value::String(None)
            | Value::Char(None)
            | Value::Bytes(None) => f.write_str("NULL"),
            #[cfg(feature = "with-json")]
            Value::Json(None) => f.write_str("NULL"),
            #[cfg(feature = "with-chrono")]
            Value::ChronoDate(None)
            | Value::ChronoTime(None)
            | Value::ChronoDateTime(None)
            | Value::ChronoDateTimeUtc(None)
            | Value::ChronoDateTimeLocal(None)
            | Value::ChronoDateTimeWithTimeZone(None) => f.write_str("NULL"),
            #[cfg(feature = "with-time")]
            Value::TimeDate(None)
            | Value::TimeTime(None)
            | Value::TimeDateTime(None)
            | Value::TimeDateTimeWithTimeZone(None) => f.write_str("NULL"),
            #[cfg(feature = "with-uuid")]
            Value::Uuid(None) => f.write_str("NULL"),
            #[cfg(feature = "with-rust_decimal")]
            Value::Decimal(None) => f.write_str("NULL"),
            #[cfg(feature = "with-bigdecimal")]
            Value::BigDecimal(None) => f.write_str("NULL"),
            #[cfg(feature = "postgres-array")]
            Value::Array(_, None) => f.write_str("NULL"),
            // variants enabled on sea-orm by another crate in the build
            #[allow(unreachable_patterns)]
            other => write!(f, "{other:?}"),
        }
    }
}

/// Before/after behavior of the plugin.
///
/// The default methods implement the standard segment lifecycle. Override
/// any of them to observe or alter it; call [`start_segment`],
/// [`build_segment`] or [`finish_operation`] to keep the standard behavior.
pub trait Instrumentation: Send + Sync {
    /// Runs before the statement of `operation` executes.
    fn before(&self, operation: Operation, statement: &mut HookStatement) {
        start_segment(operation, statement);
    }

    /// Runs after the statement of `operation` executed.
    fn after(&self, operation: Operation, config: &DatastoreConfig, statement: &mut HookStatement) {
        let segment = self.create_segment(operation, config, statement);
        finish_operation(operation, segment, statement);
    }

    /// Build the segment to close, `None` when no segment was started.
    fn create_segment(
        &self,
        operation: Operation,
        config: &DatastoreConfig,
        statement: &mut HookStatement,
    ) -> Option<DatastoreSegment> {
        build_segment(operation, config, statement)
    }
}

/// The standard [`Instrumentation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInstrumentation;

impl Instrumentation for DefaultInstrumentation {}

/// Start a segment on the context's transaction and remember its marker.
///
/// Does nothing when the context carries no transaction.
pub fn start_segment(operation: Operation, statement: &mut HookStatement) {
    let Some(transaction) = statement.context().transaction() else {
        return;
    };
    let start = transaction.start_segment_now();
    statement.set(operation.start_key(), start);
}

/// Take the operation's start marker and describe the finished statement.
pub fn build_segment(
    operation: Operation,
    config: &DatastoreConfig,
    statement: &mut HookStatement,
) -> Option<DatastoreSegment> {
    let start_time = statement.take::<SegmentStartTime>(&operation.start_key())?;

    let parameters = if config.record_parameters {
        query_parameters(statement.values().iter().map(DisplayValue))
    } else {
        BTreeMap::new()
    };

    Some(DatastoreSegment {
        start_time,
        product: config.product.clone(),
        operation: operation.segment_label(),
        collection: statement.table().to_string(),
        parameterized_query: statement.sql().to_string(),
        query_parameters: parameters,
        database_name: config.database_name.clone(),
        host: config.address.clone(),
    })
}

/// Close `segment` and, for [`Operation::Transaction`], end the APM
/// transaction as well.
///
/// Without a segment nothing happens: no segment means no transaction was
/// on the context when the operation started.
pub fn finish_operation(
    operation: Operation,
    segment: Option<DatastoreSegment>,
    statement: &HookStatement,
) {
    let Some(segment) = segment else {
        return;
    };
    let Some(transaction) = statement.context().transaction() else {
        return;
    };
    transaction.end_segment(segment);
    if operation == Operation::Transaction {
        transaction.end();
    }
}

/// Plugin that reports every statement as an APM datastore segment.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm_apm::{ApmTracer, HookedConnection};
///
/// let mut db = HookedConnection::new(Database::connect(url).await?);
/// db.use_plugin(&ApmTracer::new("orders", "db.internal:5432", "Postgres"))?;
/// ```
#[derive(Clone)]
pub struct ApmTracer {
    config: Arc<DatastoreConfig>,
    instrumentation: Arc<dyn Instrumentation>,
}

impl ApmTracer {
    pub fn new(
        database_name: impl Into<String>,
        database_address: impl Into<String>,
        product: impl Into<DatastoreProduct>,
    ) -> Self {
        Self::with_config(DatastoreConfig::new(database_name, database_address, product))
    }

    pub fn with_config(config: DatastoreConfig) -> Self {
        Self {
            config: Arc::new(config),
            instrumentation: Arc::new(DefaultInstrumentation),
        }
    }

    /// Replace the before/after behavior.
    pub fn with_instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    fn register_telemetry(&self, callbacks: &mut Callbacks, kind: CallbackKind) {
        let operation = Operation::for_kind(kind);
        let step = kind.execution_step();

        self.register(
            callbacks,
            kind,
            Anchor::Before(step),
            format!("apm:before_{kind}"),
            Hook::Before(operation),
        );
        self.register(
            callbacks,
            kind,
            Anchor::After(step),
            format!("apm:after_{kind}"),
            Hook::After(operation),
        );

        if kind.is_write() {
            self.register(
                callbacks,
                kind,
                Anchor::Before(BEGIN_TRANSACTION),
                format!("apm:before_transaction_{kind}"),
                Hook::Before(Operation::Transaction),
            );
            self.register(
                callbacks,
                kind,
                Anchor::After(COMMIT_OR_ROLLBACK_TRANSACTION),
                format!("apm:after_transaction_{kind}"),
                Hook::After(Operation::Transaction),
            );
        }
    }

    fn register(
        &self,
        callbacks: &mut Callbacks,
        kind: CallbackKind,
        anchor: Anchor,
        name: String,
        hook: Hook,
    ) {
        let instrumentation = Arc::clone(&self.instrumentation);
        let processor = callbacks.processor_mut(kind);
        let registration = match anchor {
            Anchor::Before(step) => processor.before(step),
            Anchor::After(step) => processor.after(step),
        };

        let result = match hook {
            Hook::Before(operation) => registration.register(name, move |stmt: &mut HookStatement| {
                instrumentation.before(operation, stmt)
            }),
            Hook::After(operation) => {
                let config = Arc::clone(&self.config);
                registration.register(name, move |stmt: &mut HookStatement| {
                    instrumentation.after(operation, &config, stmt)
                })
            }
        };

        if let Err(err) = result {
            tracing::debug!(target: "sea_orm_apm", error = %err, "skipping callback registration");
        }
    }
}

impl fmt::Debug for ApmTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApmTracer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Anchor {
    Before(&'static str),
    After(&'static str),
}

enum Hook {
    Before(Operation),
    After(Operation),
}

impl Plugin for ApmTracer {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    /// Register segment callbacks on every processor. Always succeeds.
    fn initialize(&self, callbacks: &mut Callbacks) -> Result<(), HookError> {
        for kind in CallbackKind::ALL {
            self.register_telemetry(callbacks, kind);
        }
        Ok(())
    }
}
