//! Database connection wrapper that runs statements through callback chains.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, StreamTrait, TransactionError,
    TransactionTrait,
};

use crate::apm::RequestContext;
use crate::config::HookConfig;
use crate::error::HookError;
use crate::hooks::{CallbackKind, Callbacks, HookStatement, Plugin, Step};
use crate::parser::{Dispatch, ParsedSql};

/// A SeaORM `DatabaseConnection` with named before/after callbacks.
///
/// This wrapper implements `ConnectionTrait`, `StreamTrait`, and
/// `TransactionTrait`, making it a drop-in replacement for
/// `DatabaseConnection`. Each statement is classified into a
/// [`CallbackKind`] and run through that kind's processor. Create, update and
/// delete statements are wrapped in their own database transaction unless
/// [`HookConfig::skip_default_transaction`] is set.
///
/// Statements issued on a `DatabaseTransaction` obtained from
/// [`TransactionTrait`] bypass the callbacks.
///
/// Routing follows the SQL verb, not the method. An `INSERT`, `UPDATE` or
/// `DELETE` sent through `execute` runs on the create, update or delete
/// processor, inside the write transaction. Only `execute_unprepared`
/// always reaches the raw processor.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use sea_orm::Database;
/// use sea_orm_apm::{ApmTracer, HookedConnection, RequestContext, TracingTransaction};
///
/// let mut db = HookedConnection::new(Database::connect("postgres://localhost/mydb").await?);
/// db.use_plugin(&ApmTracer::new("mydb", "localhost:5432", "Postgres"))?;
///
/// let txn = Arc::new(TracingTransaction::new("GET /users"));
/// let request_db = db.with_context(RequestContext::background().with_transaction(txn));
/// let users = Users::find().all(&request_db).await?;
/// ```
#[derive(Debug, Clone)]
pub struct HookedConnection {
    inner: Arc<DatabaseConnection>,
    callbacks: Arc<Callbacks>,
    config: Arc<HookConfig>,
    context: RequestContext,
}

impl HookedConnection {
    /// Wrap a connection with only the built-in steps registered.
    pub fn new(connection: DatabaseConnection) -> Self {
        Self::with_config(connection, HookConfig::default())
    }

    pub fn with_config(connection: DatabaseConnection, config: HookConfig) -> Self {
        Self {
            inner: Arc::new(connection),
            callbacks: Arc::new(Callbacks::new()),
            config: Arc::new(config),
            context: RequestContext::background(),
        }
    }

    /// Install a plugin on this connection.
    ///
    /// Clones made earlier keep the callbacks they were made with.
    pub fn use_plugin<P: Plugin + ?Sized>(&mut self, plugin: &P) -> Result<(), HookError> {
        Arc::make_mut(&mut self.callbacks).install(plugin)
    }

    /// Mutable access to the callback registry.
    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        Arc::make_mut(&mut self.callbacks)
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// A handle whose statements run under `context`.
    pub fn with_context(&self, context: RequestContext) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`.
    ///
    /// Fails with the wrapper itself while handles made by
    /// [`with_context`](Self::with_context) still share the connection.
    pub fn into_inner(self) -> Result<DatabaseConnection, Self> {
        let Self {
            inner,
            callbacks,
            config,
            context,
        } = self;
        Arc::try_unwrap(inner).map_err(|inner| Self {
            inner,
            callbacks,
            config,
            context,
        })
    }

    fn statement(&self, sql: &str, values: Vec<sea_orm::Value>, dispatch: Dispatch) -> HookStatement {
        let parsed = ParsedSql::parse(sql);
        let kind = parsed.callback_kind(dispatch);
        tracing::trace!(
            target: "sea_orm_apm",
            processor = %kind,
            db.operation = %parsed.operation,
            "dispatching statement"
        );

        HookStatement::new(kind, self.context.clone())
            .with_sql(sql, values)
            .with_table(parsed.table.unwrap_or_default())
    }

    /// Walk the processor of `statement`, executing `call` at its step.
    async fn run(&self, mut statement: HookStatement, call: Call) -> Result<Outcome, DbErr> {
        let processor = self.callbacks.processor(statement.kind());
        let kind = statement.kind();
        let mut call = Some(call);
        let mut transaction: Option<DatabaseTransaction> = None;
        let mut result: Option<Result<Outcome, DbErr>> = None;

        for entry in processor.entries() {
            match &entry.step {
                Step::Callback(callback) => callback(&mut statement),
                Step::BeginTransaction => {
                    if self.config.skip_default_transaction {
                        continue;
                    }
                    match self.inner.begin().await {
                        Ok(txn) => transaction = Some(txn),
                        Err(err) => {
                            // later callbacks still run, the statement does not
                            statement.set_error(&err);
                            call = None;
                            result = Some(Err(err));
                        }
                    }
                }
                Step::Execute => {
                    let Some(call) = call.take() else {
                        continue;
                    };
                    let outcome = match &transaction {
                        Some(txn) => call.dispatch(txn).await,
                        None => call.dispatch(&*self.inner).await,
                    };
                    if let Err(err) = &outcome {
                        statement.set_error(err);
                    }
                    result = Some(outcome);
                }
                Step::CommitOrRollback => {
                    let Some(txn) = transaction.take() else {
                        continue;
                    };
                    let finished = if statement.error().is_none() {
                        txn.commit().await
                    } else {
                        txn.rollback().await
                    };
                    if let Err(err) = finished {
                        tracing::warn!(
                            target: "sea_orm_apm",
                            processor = %kind,
                            error = %err,
                            "failed to finish write transaction"
                        );
                        statement.set_error(&err);
                        if matches!(result, Some(Ok(_))) {
                            result = Some(Err(err));
                        }
                    }
                }
            }
        }

        // Dropping an unfinished transaction rolls it back.
        drop(transaction);

        result.unwrap_or_else(|| {
            Err(DbErr::Custom(format!(
                "the {kind} processor has no execution step"
            )))
        })
    }
}

/// A deferred call on the inner connection or the write transaction.
enum Call {
    Execute(Statement),
    ExecuteUnprepared(String),
    QueryOne(Statement),
    QueryAll(Statement),
}

enum Outcome {
    Exec(ExecResult),
    One(Option<QueryResult>),
    All(Vec<QueryResult>),
}

impl Call {
    async fn dispatch<C: ConnectionTrait>(self, conn: &C) -> Result<Outcome, DbErr> {
        match self {
            Call::Execute(stmt) => conn.execute(stmt).await.map(Outcome::Exec),
            Call::ExecuteUnprepared(sql) => conn.execute_unprepared(&sql).await.map(Outcome::Exec),
            Call::QueryOne(stmt) => conn.query_one(stmt).await.map(Outcome::One),
            Call::QueryAll(stmt) => conn.query_all(stmt).await.map(Outcome::All),
        }
    }
}

fn mismatch(expected: &str) -> DbErr {
    DbErr::Custom(format!("callback chain returned a non-{expected} result"))
}

fn values_of(stmt: &Statement) -> Vec<sea_orm::Value> {
    stmt.values
        .as_ref()
        .map(|values| values.0.clone())
        .unwrap_or_default()
}

impl From<DatabaseConnection> for HookedConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::new(connection)
    }
}

impl AsRef<DatabaseConnection> for HookedConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

#[async_trait]
impl ConnectionTrait for HookedConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let statement = self.statement(&stmt.sql, values_of(&stmt), Dispatch::Execute);
        match self.run(statement, Call::Execute(stmt)).await? {
            Outcome::Exec(result) => Ok(result),
            _ => Err(mismatch("exec")),
        }
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        let statement = self.statement(sql, Vec::new(), Dispatch::Unprepared);
        match self
            .run(statement, Call::ExecuteUnprepared(sql.to_string()))
            .await?
        {
            Outcome::Exec(result) => Ok(result),
            _ => Err(mismatch("exec")),
        }
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let statement = self.statement(&stmt.sql, values_of(&stmt), Dispatch::Query);
        match self.run(statement, Call::QueryOne(stmt)).await? {
            Outcome::One(row) => Ok(row),
            _ => Err(mismatch("single row")),
        }
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let statement = self.statement(&stmt.sql, values_of(&stmt), Dispatch::Query);
        match self.run(statement, Call::QueryAll(stmt)).await? {
            Outcome::All(rows) => Ok(rows),
            _ => Err(mismatch("multi row")),
        }
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl StreamTrait for HookedConnection {
    type Stream<'a> = <DatabaseConnection as StreamTrait>::Stream<'a>;

    /// Streams run through the row processor. The after callbacks fire once
    /// the stream is open, not when it is drained.
    fn stream<'a>(
        &'a self,
        stmt: Statement,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream<'a>, DbErr>> + 'a + Send>> {
        let mut statement = self.statement(&stmt.sql, values_of(&stmt), Dispatch::Stream);

        Box::pin(async move {
            let processor = self.callbacks.processor(CallbackKind::Row);
            let mut stmt = Some(stmt);
            let mut result = None;

            for entry in processor.entries() {
                match &entry.step {
                    Step::Callback(callback) => callback(&mut statement),
                    Step::Execute => {
                        if let Some(stmt) = stmt.take() {
                            let opened = self.inner.stream(stmt).await;
                            if let Err(err) = &opened {
                                statement.set_error(err);
                            }
                            result = Some(opened);
                        }
                    }
                    Step::BeginTransaction | Step::CommitOrRollback => {}
                }
            }

            result.unwrap_or_else(|| {
                Err(DbErr::Custom(
                    "the row processor has no execution step".into(),
                ))
            })
        })
    }
}

#[async_trait]
impl TransactionTrait for HookedConnection {
    async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        self.inner.begin().await
    }

    async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        self.inner
            .begin_with_config(isolation_level, access_mode)
            .await
    }

    async fn transaction<F, T, E>(&self, callback: F) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        self.inner.transaction(callback).await
    }

    async fn transaction_with_config<F, T, E>(
        &self,
        callback: F,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        self.inner
            .transaction_with_config(callback, isolation_level, access_mode)
            .await
    }
}

/// Extension trait for easy wrapping of database connections.
pub trait HooksExt {
    /// Wrap this connection with an empty callback registry.
    fn with_hooks(self) -> HookedConnection;

    /// Wrap this connection with custom options.
    fn with_hooks_config(self, config: HookConfig) -> HookedConnection;
}

impl HooksExt for DatabaseConnection {
    fn with_hooks(self) -> HookedConnection {
        HookedConnection::new(self)
    }

    fn with_hooks_config(self, config: HookConfig) -> HookedConnection {
        HookedConnection::with_config(self, config)
    }
}
