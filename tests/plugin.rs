//! End-to-end behavior of the APM plugin on a hooked SeaORM connection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ConnectionTrait, DatabaseBackend, DbErr, MockDatabase, MockExecResult,
    Statement, StreamTrait, Value,
};
use sea_orm_apm::{
    build_segment, start_segment, ApmTracer, DatastoreConfig, DatastoreSegment, HookStatement,
    HookedConnection, Instrumentation, Operation, Plugin, RequestContext, SegmentStartTime,
    Transaction,
};

mod teste {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "teste")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i32,
        pub name: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

const DATABASE_NAME: &str = "testdb";
const DATABASE_ADDRESS: &str = "local";

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Started(u64),
    Segment(DatastoreSegment),
    Ended,
}

#[derive(Debug, Default)]
struct RecordingTransaction {
    events: Mutex<Vec<Event>>,
}

impl RecordingTransaction {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn segments(&self) -> Vec<DatastoreSegment> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Segment(segment) => Some(segment),
                _ => None,
            })
            .collect()
    }

    fn ended(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Ended))
            .count()
    }
}

impl Transaction for RecordingTransaction {
    fn start_segment_now(&self) -> SegmentStartTime {
        let start = SegmentStartTime::now();
        self.events.lock().unwrap().push(Event::Started(start.id()));
        start
    }

    fn end_segment(&self, segment: DatastoreSegment) {
        self.events.lock().unwrap().push(Event::Segment(segment));
    }

    fn end(&self) {
        self.events.lock().unwrap().push(Event::Ended);
    }
}

/// Keeps the standard behavior and records which hooks ran.
#[derive(Debug, Default)]
struct Spy {
    before: Mutex<Vec<Operation>>,
    after: Mutex<Vec<Operation>>,
    built: Mutex<Vec<(Operation, bool)>>,
}

impl Instrumentation for Spy {
    fn before(&self, operation: Operation, statement: &mut HookStatement) {
        start_segment(operation, statement);
        self.before.lock().unwrap().push(operation);
    }

    fn after(&self, operation: Operation, config: &DatastoreConfig, statement: &mut HookStatement) {
        let segment = self.create_segment(operation, config, statement);
        sea_orm_apm::finish_operation(operation, segment, statement);
        self.after.lock().unwrap().push(operation);
    }

    fn create_segment(
        &self,
        operation: Operation,
        config: &DatastoreConfig,
        statement: &mut HookStatement,
    ) -> Option<DatastoreSegment> {
        let segment = build_segment(operation, config, statement);
        self.built.lock().unwrap().push((operation, segment.is_some()));
        segment
    }
}

impl Spy {
    fn assert_calls(&self, expected: &[Operation], built: bool) {
        assert_eq!(sorted(&self.before.lock().unwrap()), sorted(expected));
        assert_eq!(sorted(&self.after.lock().unwrap()), sorted(expected));
        let calls = self.built.lock().unwrap();
        assert_eq!(calls.len(), expected.len());
        assert!(calls.iter().all(|(_, b)| *b == built), "{calls:?}");
    }
}

fn sorted(ops: &[Operation]) -> Vec<&'static str> {
    let mut labels: Vec<_> = ops.iter().map(Operation::as_str).collect();
    labels.sort_unstable();
    labels
}

struct Harness {
    db: HookedConnection,
    txn: Arc<RecordingTransaction>,
    spy: Arc<Spy>,
}

fn harness(mock: MockDatabase, with_transaction: bool) -> Harness {
    let spy = Arc::new(Spy::default());
    let txn = Arc::new(RecordingTransaction::default());

    let mut db = HookedConnection::new(mock.into_connection());
    let tracer = ApmTracer::new(DATABASE_NAME, DATABASE_ADDRESS, "Postgres")
        .with_instrumentation(spy.clone());
    db.use_plugin(&tracer).unwrap();

    let ctx = if with_transaction {
        RequestContext::background().with_transaction(txn.clone())
    } else {
        RequestContext::background()
    };

    Harness {
        db: db.with_context(ctx),
        txn,
        spy,
    }
}

fn postgres() -> MockDatabase {
    MockDatabase::new(DatabaseBackend::Postgres)
}

fn model() -> teste::Model {
    teste::Model {
        id: 1,
        name: "test".to_string(),
    }
}

fn exec_ok() -> MockExecResult {
    MockExecResult {
        last_insert_id: 0,
        rows_affected: 1,
    }
}

fn assert_segment(segment: &DatastoreSegment, operation: &str) {
    assert_eq!(segment.operation, operation);
    assert_eq!(segment.collection, "teste");
    assert_eq!(segment.product.as_str(), "Postgres");
    assert_eq!(segment.database_name, DATABASE_NAME);
    assert_eq!(segment.host, DATABASE_ADDRESS);
}

#[tokio::test]
async fn select_without_transaction_is_silent() {
    let h = harness(postgres().append_query_results([vec![model()]]), false);

    let found = teste::Entity::find_by_id(1).one(&h.db).await.unwrap();

    assert_eq!(found, Some(model()));
    h.spy.assert_calls(&[Operation::Select], false);
    assert!(h.txn.events().is_empty());
}

#[tokio::test]
async fn create_without_transaction_still_writes() {
    let h = harness(postgres().append_query_results([vec![model()]]), false);

    let inserted = teste::ActiveModel {
        name: Set("test".to_string()),
        ..Default::default()
    }
    .insert(&h.db)
    .await
    .unwrap();

    assert_eq!(inserted, model());
    h.spy
        .assert_calls(&[Operation::Transaction, Operation::Insert], false);
    assert!(h.txn.events().is_empty());
}

#[tokio::test]
async fn other_operations_without_transaction_are_silent() {
    let cases: [(Operation, &[Operation]); 4] = [
        (Operation::Row, &[Operation::Row]),
        (Operation::Raw, &[Operation::Raw]),
        (Operation::Update, &[Operation::Transaction, Operation::Update]),
        (Operation::Delete, &[Operation::Transaction, Operation::Delete]),
    ];

    for (operation, expected) in cases {
        let mock = match operation {
            Operation::Row => postgres().append_query_results([vec![model()]]),
            _ => postgres().append_exec_results([exec_ok()]),
        };
        let h = harness(mock, false);

        match operation {
            Operation::Row => {
                let stmt = Statement::from_string(
                    DatabaseBackend::Postgres,
                    r#"SELECT "name" FROM "teste""#,
                );
                drop(h.db.stream(stmt).await.unwrap());
            }
            Operation::Raw => {
                h.db.execute_unprepared("DELETE FROM teste").await.unwrap();
            }
            Operation::Update => {
                teste::Entity::update_many()
                    .col_expr(teste::Column::Name, Expr::value("updated name"))
                    .filter(teste::Column::Id.eq(1))
                    .exec(&h.db)
                    .await
                    .unwrap();
            }
            Operation::Delete => {
                teste::Entity::delete_by_id(1).exec(&h.db).await.unwrap();
            }
            _ => unreachable!(),
        }

        h.spy.assert_calls(expected, false);
        assert!(h.txn.events().is_empty(), "{operation}: {:?}", h.txn.events());
    }
}

#[tokio::test]
async fn tracks_complete_create_operation() {
    let h = harness(postgres().append_query_results([vec![model()]]), true);

    teste::ActiveModel {
        name: Set("test".to_string()),
        ..Default::default()
    }
    .insert(&h.db)
    .await
    .unwrap();

    h.spy
        .assert_calls(&[Operation::Transaction, Operation::Insert], true);

    let events = h.txn.events();
    assert_eq!(events.len(), 5, "{events:?}");
    let (Event::Started(txn_start), Event::Started(insert_start)) = (&events[0], &events[1])
    else {
        panic!("segments should open first: {events:?}");
    };
    let (Event::Segment(insert), Event::Segment(transaction)) = (&events[2], &events[3]) else {
        panic!("segments should close before the transaction ends: {events:?}");
    };
    assert_eq!(events[4], Event::Ended);

    assert_eq!(transaction.start_time.id(), *txn_start);
    assert_eq!(insert.start_time.id(), *insert_start);
    assert_segment(insert, "insert");
    assert_segment(transaction, "transaction");
    assert!(insert.parameterized_query.starts_with(r#"INSERT INTO "teste""#));
    assert_eq!(
        insert.query_parameters,
        BTreeMap::from([("1".to_string(), "test".to_string())])
    );
}

#[tokio::test]
async fn tracks_complete_find_operation() {
    let h = harness(postgres().append_query_results([vec![model()]]), true);

    let all = teste::Entity::find().all(&h.db).await.unwrap();

    assert_eq!(all, vec![model()]);
    h.spy.assert_calls(&[Operation::Select], true);
    let segments = h.txn.segments();
    assert_eq!(segments.len(), 1);
    assert_segment(&segments[0], "select");
    assert_eq!(h.txn.ended(), 0);
}

#[tokio::test]
async fn tracks_complete_row_operation() {
    let h = harness(postgres().append_query_results([vec![model()]]), true);

    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        r#"SELECT "name" FROM "teste" WHERE "name" = $1"#,
        [Value::from("test")],
    );
    let stream = h.db.stream(stmt).await.unwrap();
    drop(stream);

    h.spy.assert_calls(&[Operation::Row], true);
    let segments = h.txn.segments();
    assert_eq!(segments.len(), 1);
    assert_segment(&segments[0], "row");
    assert_eq!(segments[0].query_parameters["1"], "test");
}

#[tokio::test]
async fn tracks_complete_raw_operation() {
    let h = harness(postgres().append_exec_results([exec_ok()]), true);

    h.db.execute_unprepared("DELETE FROM teste").await.unwrap();

    h.spy.assert_calls(&[Operation::Raw], true);
    let segments = h.txn.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].operation, "raw");
    assert_eq!(segments[0].parameterized_query, "DELETE FROM teste");
    assert!(segments[0].query_parameters.is_empty());
    assert_eq!(h.txn.ended(), 0);
}

#[tokio::test]
async fn tracks_complete_update_operation() {
    let h = harness(postgres().append_exec_results([exec_ok()]), true);

    teste::Entity::update_many()
        .col_expr(teste::Column::Name, Expr::value("updated name"))
        .filter(teste::Column::Id.eq(1))
        .exec(&h.db)
        .await
        .unwrap();

    h.spy
        .assert_calls(&[Operation::Transaction, Operation::Update], true);
    let segments = h.txn.segments();
    assert_eq!(segments.len(), 2);
    assert_segment(&segments[0], "update");
    assert_segment(&segments[1], "transaction");
    assert_eq!(segments[0].query_parameters["1"], "updated name");
    assert_eq!(segments[0].query_parameters["2"], "1");
    assert_eq!(h.txn.ended(), 1);
    assert_eq!(h.txn.events().last(), Some(&Event::Ended));
}

#[tokio::test]
async fn tracks_complete_delete_operation() {
    let h = harness(postgres().append_exec_results([exec_ok()]), true);

    teste::Entity::delete_by_id(1).exec(&h.db).await.unwrap();

    h.spy
        .assert_calls(&[Operation::Transaction, Operation::Delete], true);
    let segments = h.txn.segments();
    assert_eq!(segments.len(), 2);
    assert_segment(&segments[0], "delete");
    assert_segment(&segments[1], "transaction");
    assert_eq!(h.txn.ended(), 1);
}

#[tokio::test]
async fn failed_statement_still_closes_segments() {
    let h = harness(
        postgres().append_exec_errors([DbErr::Custom("constraint failed".to_string())]),
        true,
    );

    let err = teste::Entity::delete_by_id(1).exec(&h.db).await.unwrap_err();

    assert!(err.to_string().contains("constraint failed"));
    assert_eq!(h.txn.segments().len(), 2);
    assert_eq!(h.txn.ended(), 1);
}

#[tokio::test]
async fn plugin_installs_once_per_connection() {
    let mut db = HookedConnection::new(postgres().into_connection());
    let tracer = ApmTracer::new(DATABASE_NAME, DATABASE_ADDRESS, "Postgres");

    assert_eq!(tracer.name(), "apm-telemetry-plugin");
    assert!(db.use_plugin(&tracer).is_ok());
    assert!(db.use_plugin(&tracer).is_err());
    assert!(db.callbacks().has_plugin("apm-telemetry-plugin"));
}
