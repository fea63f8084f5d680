//! # sea-orm-apm
//!
//! APM datastore segments for SeaORM, driven by named callback hooks.
//!
//! [`HookedConnection`] wraps a SeaORM `DatabaseConnection` and runs every
//! statement through an ordered chain of named callbacks, one chain per
//! statement kind (create, query, row, raw, update, delete). The
//! [`ApmTracer`] plugin hooks into those chains: it starts a segment on the
//! request's APM [`Transaction`] before each statement and closes it with the
//! statement's table, SQL and parameters afterwards. Create, update and
//! delete are additionally bracketed by a `transaction` segment, and the APM
//! transaction is ended when that bracket closes.
//!
//! Telemetry is best effort. Without a transaction on the
//! [`RequestContext`] the callbacks do nothing, and no callback can fail a
//! statement.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sea_orm::Database;
//! use sea_orm_apm::prelude::*;
//!
//! let db = Database::connect("postgres://localhost/mydb").await?;
//! let mut db = HookedConnection::from(db);
//! db.use_plugin(&ApmTracer::new("mydb", "localhost:5432", "Postgres"))?;
//!
//! // per request
//! let txn = Arc::new(TracingTransaction::new("GET /users"));
//! let request_db = db.with_context(RequestContext::background().with_transaction(txn));
//! let users = Users::find().all(&request_db).await?;
//! ```
//!
//! ## Segment fields
//!
//! | Field | Value |
//! |-------|-------|
//! | `operation` | `insert`, `select`, `row`, `raw`, `update`, `delete` or `transaction` |
//! | `collection` | Target table (when detectable) |
//! | `parameterized_query` | SQL text with placeholders |
//! | `query_parameters` | `"1"`, `"2"`, ... mapped to each bound value |
//! | `database_name`, `host` | From [`DatastoreConfig`] |
//! | `product` | [`DatastoreProduct`] label |
//!
//! Bound values are sent verbatim. Disable them with
//! [`DatastoreConfig::with_parameter_recording`] when they may carry secrets.

mod apm;
mod config;
mod connection;
mod error;
pub mod hooks;
mod parser;
mod plugin;
mod reporter;

pub use apm::{DatastoreSegment, RequestContext, SegmentStartTime, Transaction};
pub use config::{DatastoreConfig, DatastoreProduct, HookConfig};
pub use connection::{HookedConnection, HooksExt};
pub use error::HookError;
pub use hooks::{CallbackKind, Callbacks, HookStatement, Plugin};
pub use plugin::{
    build_segment, finish_operation, query_parameters, start_segment, ApmTracer,
    DefaultInstrumentation, DisplayValue, Instrumentation, Operation, PLUGIN_NAME,
};
pub use reporter::TracingTransaction;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ApmTracer, DatastoreConfig, HookedConnection, HooksExt, Plugin, RequestContext,
        TracingTransaction,
    };
}
