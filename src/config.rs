//! Configuration for the telemetry target and the hooked connection.

use std::borrow::Cow;
use std::fmt;

use sea_orm::DbBackend;

/// Datastore product label used by the APM backend to classify segments.
///
/// # Example
///
/// ```rust
/// use sea_orm_apm::DatastoreProduct;
///
/// assert_eq!(DatastoreProduct::POSTGRES.as_str(), "Postgres");
/// assert_eq!(DatastoreProduct::from("Redis").as_str(), "Redis");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatastoreProduct(Cow<'static, str>);

impl DatastoreProduct {
    pub const SQLITE: Self = Self(Cow::Borrowed("SQLite"));
    pub const POSTGRES: Self = Self(Cow::Borrowed("Postgres"));
    pub const MYSQL: Self = Self(Cow::Borrowed("MySQL"));

    /// Returns the label sent to the APM backend.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Picks the label matching a SeaORM backend.
    pub fn from_backend(backend: DbBackend) -> Self {
        match backend {
            DbBackend::Postgres => Self::POSTGRES,
            DbBackend::MySql => Self::MYSQL,
            DbBackend::Sqlite => Self::SQLITE,
        }
    }
}

impl fmt::Display for DatastoreProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for DatastoreProduct {
    fn from(label: &'static str) -> Self {
        Self(Cow::Borrowed(label))
    }
}

impl From<String> for DatastoreProduct {
    fn from(label: String) -> Self {
        Self(Cow::Owned(label))
    }
}

/// The telemetry target every datastore segment is attributed to.
///
/// Immutable once handed to [`ApmTracer`](crate::ApmTracer); every registered
/// callback shares the same instance.
///
/// # Example
///
/// ```rust
/// use sea_orm_apm::{DatastoreConfig, DatastoreProduct};
///
/// let config = DatastoreConfig::new("orders", "db.internal:5432", DatastoreProduct::POSTGRES)
///     .with_parameter_recording(false);
/// assert!(!config.record_parameters);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreConfig {
    /// Logical database name.
    pub database_name: String,

    /// Network address of the database, reported as the segment host.
    pub address: String,

    /// Product label, e.g. "SQLite" or "Postgres".
    pub product: DatastoreProduct,

    /// Whether bound parameter values are attached to segments.
    /// Default: `true`
    ///
    /// **Security Warning**: values are sent verbatim. Parameters routinely
    /// carry user input, credentials and personal data.
    pub record_parameters: bool,
}

impl DatastoreConfig {
    /// Create a target with parameter recording enabled.
    pub fn new(
        database_name: impl Into<String>,
        address: impl Into<String>,
        product: impl Into<DatastoreProduct>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            address: address.into(),
            product: product.into(),
            record_parameters: true,
        }
    }

    /// Enable or disable sending bound parameter values.
    pub fn with_parameter_recording(mut self, enabled: bool) -> Self {
        self.record_parameters = enabled;
        self
    }
}

/// Options for [`HookedConnection`](crate::HookedConnection).
///
/// # Example
///
/// ```rust
/// use sea_orm_apm::HookConfig;
///
/// let config = HookConfig::default().with_skip_default_transaction(true);
/// assert!(config.skip_default_transaction);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    /// Run create/update/delete statements without wrapping them in a
    /// database transaction. The transaction callbacks still fire.
    /// Default: `false`
    pub skip_default_transaction: bool,
}

impl HookConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the per-statement write transaction.
    pub fn with_skip_default_transaction(mut self, skip: bool) -> Self {
        self.skip_default_transaction = skip;
        self
    }
}
