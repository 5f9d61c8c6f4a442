use aggview::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const VIEW: &str = r#"{
    "name": "by_sensor",
    "sources": ["readings"],
    "group_by": [{"name": "sensor"}],
    "aggregates": [
        {"name": "total", "kind": "sum", "expr": "value"},
        {"name": "low", "kind": "min", "expr": "value"},
        {"name": "high", "kind": "max", "expr": "value"}
    ]
}"#;

fn reading(sensor: i64, value: i64) -> Row {
    let mut row = HashMap::new();
    row.insert("sensor".to_string(), ColumnValue::Int64(sensor));
    row.insert("value".to_string(), ColumnValue::Int64(value));
    row
}

fn readings_table() -> Rc<RefCell<Table>> {
    Table::shared(
        "readings",
        Schema::new(vec![
            ("sensor".to_string(), ColumnType::Int64, false),
            ("value".to_string(), ColumnType::Int64, false),
        ]),
    )
}

/// Readings table with `rows` rows spread over `groups` sensors, plus an
/// installed view over it.
fn setup(rows: i64, groups: i64) -> (Rc<RefCell<Table>>, Rc<RefCell<ViewHandler>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let readings = readings_table();
    let mut txn = Transaction::begin();
    for i in 0..rows {
        txn.insert(&readings, reading(i % groups, (i * 7919) % 1000)).unwrap();
    }
    txn.commit().unwrap();

    let mut tables = HashMap::new();
    tables.insert("readings".to_string(), Rc::clone(&readings));
    let definition = ScanPlanner::compile(&ViewSpec::from_json(VIEW).unwrap(), &tables).unwrap();
    let target = ScanPlanner::target_table(&definition, &tables).unwrap();
    let view = ViewHandler::install(target, definition, &tables).unwrap();
    (readings, view)
}

fn bench_insert_maintenance(c: &mut Criterion) {
    let mut group = c.benchmark_group("view_insert_notify");

    for batch in [10i64, 100, 1000].iter() {
        let (readings, _view) = setup(1000, 10);
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |b, &batch| {
            b.iter(|| {
                let mut txn = Transaction::begin();
                for i in 0..batch {
                    txn.insert(&readings, reading(i % 10, black_box(i))).unwrap();
                }
                // Rolled back so every iteration starts from the same state.
                txn.rollback().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_extremum_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("view_extremum_delete_commit");

    for rows in [1000i64, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, &rows| {
            b.iter_batched(
                || setup(rows, 10),
                |(readings, view)| {
                    // Delete the row holding the top value of its group: forces a fallback.
                    let position = {
                        let t = readings.borrow();
                        (0..t.len())
                            .max_by_key(|&i| t.get_value(i, "value").unwrap())
                            .unwrap()
                    };
                    let mut txn = Transaction::begin();
                    txn.delete(&readings, position).unwrap();
                    txn.commit().unwrap();
                    black_box(view.borrow().stats().fallback_executions)
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_full_refresh(c: &mut Criterion) {
    let mut group = c.benchmark_group("view_full_refresh");

    for rows in [1000i64, 10000].iter() {
        let (_readings, view) = setup(*rows, 100);
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, _| {
            b.iter(|| {
                let mut txn = Transaction::begin();
                txn.refresh_view(&view).unwrap();
                txn.rollback().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_group_state(c: &mut Criterion) {
    let specs = ViewDefinition::builder("bench")
        .source("readings")
        .aggregate("total", AggregateKind::Sum, "value")
        .aggregate("n", AggregateKind::Count, "*")
        .aggregate("high", AggregateKind::Max, "value")
        .aggregate_specs()
        .to_vec();

    c.bench_function("group_state_insert_delete", |b| {
        b.iter(|| {
            let mut state = GroupState::empty(&specs);
            for v in 0..1000i64 {
                let args = vec![ColumnValue::Int64(v), ColumnValue::Int64(1), ColumnValue::Int64(v)];
                state.apply_insert(&specs, black_box(&args)).unwrap();
            }
            for v in 0..999i64 {
                let args = vec![ColumnValue::Int64(v), ColumnValue::Int64(1), ColumnValue::Int64(v)];
                state.apply_delete(&specs, black_box(&args)).unwrap();
            }
            state
        });
    });
}

criterion_group!(
    benches,
    bench_insert_maintenance,
    bench_extremum_delete,
    bench_full_refresh,
    bench_group_state
);
criterion_main!(benches);
