//! Named, ordered callback chains around SeaORM statements.
//!
//! Every statement a [`HookedConnection`](crate::HookedConnection) runs is
//! classified into a [`CallbackKind`] and driven through that kind's
//! [`Processor`]: an ordered list of named steps. Built-in steps open the
//! write transaction, execute the statement and commit or roll back; plugin
//! callbacks are inserted relative to them by name.
//!
//! ```rust
//! use sea_orm_apm::hooks::{CallbackKind, Callbacks};
//!
//! let mut callbacks = Callbacks::new();
//! callbacks
//!     .query()
//!     .before("sea_orm:query")
//!     .register("audit:before_query", |stmt| {
//!         stmt.set("audit:seen", true);
//!     })
//!     .unwrap();
//!
//! assert_eq!(
//!     callbacks.processor(CallbackKind::Query).names(),
//!     vec!["audit:before_query", "sea_orm:query"]
//! );
//! ```

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use sea_orm::Value;

use crate::apm::RequestContext;
use crate::error::HookError;

/// Name of the built-in step that opens the write transaction.
pub const BEGIN_TRANSACTION: &str = "sea_orm:begin_transaction";

/// Name of the built-in step that commits, or rolls back on error.
pub const COMMIT_OR_ROLLBACK_TRANSACTION: &str = "sea_orm:commit_or_rollback_transaction";

/// Statement kinds with their own callback processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallbackKind {
    Create,
    Query,
    Row,
    Raw,
    Update,
    Delete,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 6] = [
        CallbackKind::Create,
        CallbackKind::Query,
        CallbackKind::Row,
        CallbackKind::Raw,
        CallbackKind::Update,
        CallbackKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Create => "create",
            CallbackKind::Query => "query",
            CallbackKind::Row => "row",
            CallbackKind::Raw => "raw",
            CallbackKind::Update => "update",
            CallbackKind::Delete => "delete",
        }
    }

    /// Name of the built-in step that executes the statement.
    pub fn execution_step(&self) -> &'static str {
        match self {
            CallbackKind::Create => "sea_orm:create",
            CallbackKind::Query => "sea_orm:query",
            CallbackKind::Row => "sea_orm:row",
            CallbackKind::Raw => "sea_orm:raw",
            CallbackKind::Update => "sea_orm:update",
            CallbackKind::Delete => "sea_orm:delete",
        }
    }

    /// Write kinds run inside a transaction bracket.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            CallbackKind::Create | CallbackKind::Update | CallbackKind::Delete
        )
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered callback.
pub type CallbackFn = Arc<dyn Fn(&mut HookStatement) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Step {
    Callback(CallbackFn),
    BeginTransaction,
    Execute,
    CommitOrRollback,
}

#[derive(Clone)]
pub(crate) struct Entry {
    pub(crate) name: String,
    pub(crate) step: Step,
}

impl Entry {
    fn builtin(name: &str, step: Step) -> Self {
        Self {
            name: name.to_string(),
            step,
        }
    }
}

enum Position {
    Before(String),
    After(String),
    End,
}

/// The ordered callback chain of one [`CallbackKind`].
#[derive(Clone)]
pub struct Processor {
    kind: CallbackKind,
    entries: Vec<Entry>,
}

impl Processor {
    fn new(kind: CallbackKind) -> Self {
        let execute = Entry::builtin(kind.execution_step(), Step::Execute);
        let entries = if kind.is_write() {
            vec![
                Entry::builtin(BEGIN_TRANSACTION, Step::BeginTransaction),
                execute,
                Entry::builtin(COMMIT_OR_ROLLBACK_TRANSACTION, Step::CommitOrRollback),
            ]
        } else {
            vec![execute]
        };
        Self { kind, entries }
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    /// Step names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position_of(name).is_some()
    }

    /// Place the next registration immediately before `anchor`.
    ///
    /// When `anchor` does not exist the callback is appended.
    pub fn before(&mut self, anchor: impl Into<String>) -> Registration<'_> {
        Registration {
            processor: self,
            position: Position::Before(anchor.into()),
        }
    }

    /// Place the next registration immediately after `anchor`.
    ///
    /// When `anchor` does not exist the callback is appended.
    pub fn after(&mut self, anchor: impl Into<String>) -> Registration<'_> {
        Registration {
            processor: self,
            position: Position::After(anchor.into()),
        }
    }

    /// Append a callback to the end of the chain.
    pub fn register<F>(&mut self, name: impl Into<String>, callback: F) -> Result<(), HookError>
    where
        F: Fn(&mut HookStatement) + Send + Sync + 'static,
    {
        self.insert(Position::End, name.into(), Arc::new(callback))
    }

    /// Remove a step by name. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.position_of(name) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Run only the registered callbacks, in order, skipping built-in steps.
    pub fn run_callbacks(&self, statement: &mut HookStatement) {
        for entry in &self.entries {
            if let Step::Callback(callback) = &entry.step {
                callback(statement);
            }
        }
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    fn position_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn insert(
        &mut self,
        position: Position,
        name: String,
        callback: CallbackFn,
    ) -> Result<(), HookError> {
        if self.contains(&name) {
            return Err(HookError::DuplicateCallback {
                kind: self.kind,
                name,
            });
        }

        let index = match &position {
            Position::Before(anchor) => self.position_of(anchor),
            Position::After(anchor) => self.position_of(anchor).map(|i| i + 1),
            Position::End => None,
        };
        let entry = Entry {
            name,
            step: Step::Callback(callback),
        };

        match index {
            Some(index) => self.entries.insert(index, entry),
            None => {
                if let Position::Before(anchor) | Position::After(anchor) = &position {
                    tracing::debug!(
                        target: "sea_orm_apm",
                        processor = %self.kind,
                        callback = %entry.name,
                        anchor = %anchor,
                        "anchor not found, appending callback"
                    );
                }
                self.entries.push(entry);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("kind", &self.kind)
            .field("steps", &self.names())
            .finish()
    }
}

/// A pending positional registration, see [`Processor::before`].
pub struct Registration<'a> {
    processor: &'a mut Processor,
    position: Position,
}

impl Registration<'_> {
    pub fn register<F>(self, name: impl Into<String>, callback: F) -> Result<(), HookError>
    where
        F: Fn(&mut HookStatement) + Send + Sync + 'static,
    {
        self.processor
            .insert(self.position, name.into(), Arc::new(callback))
    }
}

/// The callback registry: one [`Processor`] per [`CallbackKind`] plus the
/// names of installed plugins.
///
/// Cloning is cheap, callbacks are shared.
#[derive(Debug, Clone)]
pub struct Callbacks {
    create: Processor,
    query: Processor,
    row: Processor,
    raw: Processor,
    update: Processor,
    delete: Processor,
    plugins: BTreeSet<String>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl Callbacks {
    /// A registry holding only the built-in steps.
    pub fn new() -> Self {
        Self {
            create: Processor::new(CallbackKind::Create),
            query: Processor::new(CallbackKind::Query),
            row: Processor::new(CallbackKind::Row),
            raw: Processor::new(CallbackKind::Raw),
            update: Processor::new(CallbackKind::Update),
            delete: Processor::new(CallbackKind::Delete),
            plugins: BTreeSet::new(),
        }
    }

    pub fn create(&mut self) -> &mut Processor {
        &mut self.create
    }

    pub fn query(&mut self) -> &mut Processor {
        &mut self.query
    }

    pub fn row(&mut self) -> &mut Processor {
        &mut self.row
    }

    pub fn raw(&mut self) -> &mut Processor {
        &mut self.raw
    }

    pub fn update(&mut self) -> &mut Processor {
        &mut self.update
    }

    pub fn delete(&mut self) -> &mut Processor {
        &mut self.delete
    }

    pub fn processor(&self, kind: CallbackKind) -> &Processor {
        match kind {
            CallbackKind::Create => &self.create,
            CallbackKind::Query => &self.query,
            CallbackKind::Row => &self.row,
            CallbackKind::Raw => &self.raw,
            CallbackKind::Update => &self.update,
            CallbackKind::Delete => &self.delete,
        }
    }

    pub fn processor_mut(&mut self, kind: CallbackKind) -> &mut Processor {
        match kind {
            CallbackKind::Create => &mut self.create,
            CallbackKind::Query => &mut self.query,
            CallbackKind::Row => &mut self.row,
            CallbackKind::Raw => &mut self.raw,
            CallbackKind::Update => &mut self.update,
            CallbackKind::Delete => &mut self.delete,
        }
    }

    /// Install a plugin once per registry.
    pub fn install<P: Plugin + ?Sized>(&mut self, plugin: &P) -> Result<(), HookError> {
        let name = plugin.name().to_string();
        if self.plugins.contains(&name) {
            return Err(HookError::PluginRegistered(name));
        }
        plugin.initialize(self)?;
        tracing::debug!(target: "sea_orm_apm", plugin = %name, "plugin installed");
        self.plugins.insert(name);
        Ok(())
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.contains(name)
    }
}

/// An extension installed on a callback registry.
pub trait Plugin {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Register the plugin's callbacks.
    fn initialize(&self, callbacks: &mut Callbacks) -> Result<(), HookError>;
}

/// Per-statement key-value scratch store.
///
/// Callbacks of one statement share it; nothing outlives the statement.
pub trait Scratch: Send {
    fn insert(&mut self, key: String, value: Box<dyn Any + Send>);

    fn get(&self, key: &str) -> Option<&(dyn Any + Send)>;

    fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send>>;
}

/// [`Scratch`] backed by a `HashMap`.
#[derive(Default)]
pub struct ScratchMap(HashMap<String, Box<dyn Any + Send>>);

impl Scratch for ScratchMap {
    fn insert(&mut self, key: String, value: Box<dyn Any + Send>) {
        self.0.insert(key, value);
    }

    fn get(&self, key: &str) -> Option<&(dyn Any + Send)> {
        self.0.get(key).map(|v| &**v)
    }

    fn remove(&mut self, key: &str) -> Option<Box<dyn Any + Send>> {
        self.0.remove(key)
    }
}

impl fmt::Debug for ScratchMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// The statement a callback chain runs for.
pub struct HookStatement {
    context: RequestContext,
    kind: CallbackKind,
    table: String,
    sql: String,
    values: Vec<Value>,
    error: Option<String>,
    scratch: Box<dyn Scratch>,
}

impl HookStatement {
    pub fn new(kind: CallbackKind, context: RequestContext) -> Self {
        Self {
            context,
            kind,
            table: String::new(),
            sql: String::new(),
            values: Vec::new(),
            error: None,
            scratch: Box::new(ScratchMap::default()),
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>, values: Vec<Value>) -> Self {
        self.sql = sql.into();
        self.values = values;
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Swap the default [`ScratchMap`] for another store.
    pub fn with_scratch(mut self, scratch: Box<dyn Scratch>) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    /// Target table, empty when it could not be resolved.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Error of the execution step, once it has run and failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn set_error(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
    }

    pub fn set<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.scratch.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.scratch.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Remove and return the value under `key` if it has type `T`.
    ///
    /// A value of another type is left in place.
    pub fn take<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        let value = self.scratch.remove(key)?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.scratch.insert(key.to_string(), other);
                None
            }
        }
    }
}

impl fmt::Debug for HookStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookStatement")
            .field("kind", &self.kind)
            .field("table", &self.table)
            .field("sql", &self.sql)
            .field("values", &self.values)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_builtin_steps() {
        let callbacks = Callbacks::new();
        assert_eq!(
            callbacks.processor(CallbackKind::Create).names(),
            vec![
                BEGIN_TRANSACTION,
                "sea_orm:create",
                COMMIT_OR_ROLLBACK_TRANSACTION
            ]
        );
        assert_eq!(
            callbacks.processor(CallbackKind::Row).names(),
            vec!["sea_orm:row"]
        );
    }

    #[test]
    fn test_positional_registration() {
        let mut callbacks = Callbacks::new();
        let update = callbacks.update();
        update
            .before("sea_orm:update")
            .register("t:before", |_| {})
            .unwrap();
        update
            .after("sea_orm:update")
            .register("t:after", |_| {})
            .unwrap();
        update
            .before(BEGIN_TRANSACTION)
            .register("t:before_txn", |_| {})
            .unwrap();
        update
            .after(COMMIT_OR_ROLLBACK_TRANSACTION)
            .register("t:after_txn", |_| {})
            .unwrap();

        assert_eq!(
            update.names(),
            vec![
                "t:before_txn",
                BEGIN_TRANSACTION,
                "t:before",
                "sea_orm:update",
                "t:after",
                COMMIT_OR_ROLLBACK_TRANSACTION,
                "t:after_txn",
            ]
        );
    }

    #[test]
    fn test_missing_anchor_appends() {
        let mut callbacks = Callbacks::new();
        callbacks
            .raw()
            .before("sea_orm:nope")
            .register("t:orphan", |_| {})
            .unwrap();
        assert_eq!(
            callbacks.processor(CallbackKind::Raw).names(),
            vec!["sea_orm:raw", "t:orphan"]
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut callbacks = Callbacks::new();
        callbacks.delete().register("t:once", |_| {}).unwrap();
        let err = callbacks.delete().register("t:once", |_| {}).unwrap_err();
        assert_eq!(
            err,
            HookError::DuplicateCallback {
                kind: CallbackKind::Delete,
                name: "t:once".to_string()
            }
        );

        // names are scoped per processor
        assert!(callbacks.create().register("t:once", |_| {}).is_ok());
    }

    #[test]
    fn test_remove_callback() {
        let mut callbacks = Callbacks::new();
        callbacks.query().register("t:gone", |_| {}).unwrap();
        assert!(callbacks.query().remove("t:gone"));
        assert!(!callbacks.query().remove("t:gone"));
        assert!(!callbacks.processor(CallbackKind::Query).contains("t:gone"));
    }

    #[test]
    fn test_run_callbacks_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks = Callbacks::new();
        for name in ["a", "b"] {
            let seen = seen.clone();
            callbacks
                .query()
                .after("sea_orm:query")
                .register(name, move |_| seen.lock().unwrap().push(name))
                .unwrap();
        }
        let first = seen.clone();
        callbacks
            .query()
            .before("sea_orm:query")
            .register("first", move |_| first.lock().unwrap().push("first"))
            .unwrap();

        let mut stmt = HookStatement::new(CallbackKind::Query, RequestContext::background());
        callbacks.processor(CallbackKind::Query).run_callbacks(&mut stmt);

        // later `after` registrations land closer to the anchor
        assert_eq!(*seen.lock().unwrap(), vec!["first", "b", "a"]);
    }

    #[test]
    fn test_plugin_installed_once() {
        struct Marker;

        impl Plugin for Marker {
            fn name(&self) -> &str {
                "marker"
            }

            fn initialize(&self, callbacks: &mut Callbacks) -> Result<(), HookError> {
                callbacks.row().register("marker:row", |_| {})
            }
        }

        let mut callbacks = Callbacks::new();
        callbacks.install(&Marker).unwrap();
        assert!(callbacks.has_plugin("marker"));
        assert_eq!(
            callbacks.install(&Marker).unwrap_err(),
            HookError::PluginRegistered("marker".to_string())
        );
    }

    #[test]
    fn test_scratch_typed_access() {
        let mut stmt = HookStatement::new(CallbackKind::Raw, RequestContext::background())
            .with_sql("DELETE FROM users", Vec::new())
            .with_table("users");
        stmt.set("count", 3_u32);

        assert_eq!(stmt.get::<u32>("count"), Some(&3));
        assert_eq!(stmt.get::<String>("count"), None);
        assert_eq!(stmt.take::<String>("count"), None);
        assert_eq!(stmt.take::<u32>("count"), Some(3));
        assert_eq!(stmt.take::<u32>("count"), None);
        assert_eq!(stmt.table(), "users");
        assert_eq!(stmt.sql(), "DELETE FROM users");
    }
}
