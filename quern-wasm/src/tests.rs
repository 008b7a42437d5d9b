//! End-to-end tests: plans compiled to Wasm, executed in the engine, and
//! read back through the result-set reader.

use std::sync::{Arc, Mutex};

use quern_plan::{
    pack_date, Catalog, CmpOp, DataType, Operator, PhysicalPlan, Predicate, ProjExpr, Schema,
    SchemaEntry, Table, Tuple, Value,
};

use crate::config::{BackendOptions, WASM_PAGE_SIZE};
use crate::context::registry;
use crate::engine::EngineDriver;
use crate::result::ResultSink;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn print_sink() -> (ResultSink, SharedBuf) {
    let buf = SharedBuf::default();
    (ResultSink::print_to(buf.clone()), buf)
}

fn driver() -> EngineDriver {
    let _ = env_logger::builder().is_test(true).try_init();
    EngineDriver::new(BackendOptions {
        arena_size: 64 * WASM_PAGE_SIZE,
        ..BackendOptions::default()
    })
    .unwrap()
}

fn people_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    let schema = Schema::new(vec![
        SchemaEntry::new("id", DataType::I32),
        SchemaEntry::new("name", DataType::Char(8)),
    ]);
    let store = catalog.create_store(Table::new("t", schema));
    for (id, name) in [(1, "a"), (2, "b")] {
        store
            .append(&Tuple::from(vec![
                Some(Value::I32(id)),
                Some(Value::Str(name.into())),
            ]))
            .unwrap();
    }
    catalog
}

fn scan(catalog: &Catalog, table: &str) -> Operator {
    Operator::scan(table, catalog.store(table).unwrap().schema().clone())
}

fn select_columns(catalog: &Catalog, table: &str, columns: &[&str]) -> Operator {
    Operator::projection(
        columns
            .iter()
            .map(|c| (c.to_string(), ProjExpr::Column(c.to_string())))
            .collect(),
        scan(catalog, table),
    )
}

#[test]
fn constant_only_query_emits_count_identical_rows() {
    let _serial = crate::context::test_serial();
    let mut catalog = Catalog::new();
    let schema = Schema::new(vec![SchemaEntry::new("id", DataType::I32)]);
    let store = catalog.create_store(Table::new("u", schema));
    for id in 1..=3 {
        store.append(&Tuple::from(vec![Some(Value::I32(id))])).unwrap();
    }
    let plan = PhysicalPlan::new(Operator::print(Operator::projection(
        vec![
            ("one".into(), ProjExpr::Constant(Some(Value::I32(1)))),
            ("x".into(), ProjExpr::Constant(Some(Value::Str("x".into())))),
            ("n".into(), ProjExpr::Constant(None)),
        ],
        scan(&catalog, "u"),
    )));
    let (sink, buf) = print_sink();
    let rows = driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(rows, 3);
    assert_eq!(
        buf.text(),
        "1,\"x\",NULL\n1,\"x\",NULL\n1,\"x\",NULL\n3 rows\n"
    );
}

#[test]
fn scan_and_print() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::print(select_columns(&catalog, "t", &["id", "name"])));
    let (sink, buf) = print_sink();
    let rows = driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(rows, 2);
    assert_eq!(buf.text(), "1,\"a\"\n2,\"b\"\n2 rows\n");
}

#[test]
fn duplicated_select_list_reuses_one_payload_column() {
    let _serial = crate::context::test_serial();
    let mut catalog = Catalog::new();
    let schema = Schema::new(vec![SchemaEntry::new("id", DataType::I32)]);
    catalog
        .create_store(Table::new("v", schema))
        .append(&Tuple::from(vec![Some(Value::I32(7))]))
        .unwrap();
    let plan = PhysicalPlan::new(Operator::print(Operator::projection(
        vec![
            ("id".into(), ProjExpr::Column("id".into())),
            ("id".into(), ProjExpr::Column("id".into())),
        ],
        scan(&catalog, "v"),
    )));
    let (sink, buf) = print_sink();
    let rows = driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(rows, 1);
    assert_eq!(buf.text(), "7,7\n1 rows\n");
}

#[test]
fn date_columns_render_padded_and_signed() {
    let _serial = crate::context::test_serial();
    let mut catalog = Catalog::new();
    let schema = Schema::new(vec![SchemaEntry::new("born", DataType::Date)]);
    let store = catalog.create_store(Table::new("d", schema));
    for raw in [pack_date(2024, 1, 31), pack_date(-5, 3, 15)] {
        store.append(&Tuple::from(vec![Some(Value::Date(raw))])).unwrap();
    }
    let plan = PhysicalPlan::new(Operator::print(select_columns(&catalog, "d", &["born"])));
    let (sink, buf) = print_sink();
    driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(buf.text(), "2024-01-31\n-0005-03-15\n2 rows\n");
}

#[test]
fn string_equality_filter() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::print(Operator::projection(
        vec![("id".into(), ProjExpr::Column("id".into()))],
        Operator::filter(
            vec![Predicate::new("name", CmpOp::Eq, Value::Str("b".into()))],
            scan(&catalog, "t"),
        ),
    )));
    let (sink, buf) = print_sink();
    let rows = driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(rows, 1);
    assert_eq!(buf.text(), "2\n1 rows\n");
}

#[test]
fn disjunctive_filter_unions_its_arms() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::print(Operator::projection(
        vec![("id".into(), ProjExpr::Column("id".into()))],
        Operator::disjunctive_filter(
            vec![
                vec![Predicate::new("id", CmpOp::Eq, Value::I32(1))],
                vec![Predicate::new("name", CmpOp::Eq, Value::Str("b".into()))],
            ],
            scan(&catalog, "t"),
        ),
    )));
    let (sink, buf) = print_sink();
    let rows = driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(rows, 2);
    assert_eq!(buf.text(), "1\n2\n2 rows\n");
}

#[test]
fn limit_cuts_the_scan_short() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::print(Operator::limit(
        1,
        select_columns(&catalog, "t", &["id"]),
    )));
    let (sink, buf) = print_sink();
    let rows = driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(rows, 1);
    assert_eq!(buf.text(), "1\n1 rows\n");
}

#[test]
fn null_slots_print_as_null() {
    let _serial = crate::context::test_serial();
    let mut catalog = Catalog::new();
    let schema = Schema::new(vec![
        SchemaEntry::new("id", DataType::I32),
        SchemaEntry::new("name", DataType::Char(8)),
    ]);
    let store = catalog.create_store(Table::new("n", schema));
    store
        .append(&Tuple::from(vec![Some(Value::I32(1)), None]))
        .unwrap();
    let plan = PhysicalPlan::new(Operator::print(select_columns(&catalog, "n", &["id", "name"])));
    let (sink, buf) = print_sink();
    driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(buf.text(), "1,NULL\n1 rows\n");
}

#[test]
fn wide_row_types_survive_the_round_trip() {
    let _serial = crate::context::test_serial();
    let mut catalog = Catalog::new();
    let schema = Schema::new(vec![
        SchemaEntry::new("ok", DataType::Bool),
        SchemaEntry::new("big", DataType::I64),
        SchemaEntry::new("ratio", DataType::F64),
        SchemaEntry::new("seen", DataType::DateTime),
    ]);
    let store = catalog.create_store(Table::new("w", schema));
    store
        .append(&Tuple::from(vec![
            Some(Value::Bool(true)),
            Some(Value::I64(1 << 40)),
            Some(Value::F64(0.25)),
            Some(Value::DateTime(0)),
        ]))
        .unwrap();
    let plan = PhysicalPlan::new(Operator::print(select_columns(
        &catalog,
        "w",
        &["ok", "big", "ratio", "seen"],
    )));
    let (sink, buf) = print_sink();
    driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(
        buf.text(),
        "TRUE,1099511627776,0.25,1970-01-01 00:00:00\n1 rows\n"
    );
}

#[test]
fn callback_sink_receives_typed_tuples() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::callback(select_columns(
        &catalog,
        "t",
        &["id", "name"],
    )));
    let seen: Arc<Mutex<Vec<(usize, Option<Value>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_rows = seen.clone();
    let sink = ResultSink::callback(move |schema, tuple| {
        sink_rows
            .lock()
            .unwrap()
            .push((schema.len(), tuple.get(1).cloned()));
    });
    let rows = driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(rows, 2);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (2, Some(Value::Str("a".into()))));
    assert_eq!(seen[1], (2, Some(Value::Str("b".into()))));
}

#[test]
fn quiet_print_output_has_one_line_per_returned_row() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::print(select_columns(&catalog, "t", &["id"])));
    let quiet = EngineDriver::new(BackendOptions {
        arena_size: 64 * WASM_PAGE_SIZE,
        quiet: true,
        ..BackendOptions::default()
    })
    .unwrap();
    let (sink, buf) = print_sink();
    let rows = quiet.execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(buf.text().matches('\n').count() as u32, rows);
}

#[test]
fn registry_returns_to_its_pre_query_size() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let before = registry::len();
    let plan = PhysicalPlan::new(Operator::print(select_columns(&catalog, "t", &["id"])));
    let (sink, _buf) = print_sink();
    driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(registry::len(), before);
}

#[test]
fn failed_queries_still_dispose_their_context() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let before = registry::len();
    // A scan of a table the catalog does not know fails before execution.
    let missing = Operator::scan(
        "ghost",
        Schema::new(vec![SchemaEntry::new("id", DataType::I32)]),
    );
    let plan = PhysicalPlan::new(Operator::print(Operator::projection(
        vec![("id".into(), ProjExpr::Column("id".into()))],
        missing,
    )));
    let (sink, _buf) = print_sink();
    assert!(driver().execute(&catalog, Arc::new(plan), sink).is_err());
    assert_eq!(registry::len(), before);
}

#[test]
fn noop_sinks_swallow_rows_but_count_them() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::noop(select_columns(&catalog, "t", &["id"])));
    let rows = driver()
        .execute(&catalog, Arc::new(plan), ResultSink::noop())
        .unwrap();
    assert_eq!(rows, 2);
}

#[test]
fn numeric_range_filter() {
    let _serial = crate::context::test_serial();
    let catalog = people_catalog();
    let plan = PhysicalPlan::new(Operator::print(Operator::projection(
        vec![("name".into(), ProjExpr::Column("name".into()))],
        Operator::filter(
            vec![Predicate::new("id", CmpOp::Gt, Value::I32(1))],
            scan(&catalog, "t"),
        ),
    )));
    let (sink, buf) = print_sink();
    driver().execute(&catalog, Arc::new(plan), sink).unwrap();
    assert_eq!(buf.text(), "\"b\"\n1 rows\n");
}
