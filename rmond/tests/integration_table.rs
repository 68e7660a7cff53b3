//! Integration tests for the table engine as the protocol layer drives it.
//!
//! These tests go through the catalog tables and their handlers only, the
//! way a management session would: get, get-next walks and SET exchanges.

use std::sync::Arc;

use rmond::catalog::{Tables, metrix, sinx, ves};
use rmond::error::Status;
use rmond::table::Key;
use rmond::transaction::{Exchange, Phase, Request, RowStatus, TableHandler, Trivial};
use rmond::value::{Oid, Value};

fn sink_key(host: &str, port: i32) -> Key {
    Key::new(vec![Value::from(host), Value::Integer(port)])
}

fn create(handler: &TableHandler, key: &Key, status: RowStatus, acks: i32) -> Status {
    let mut exchange = Exchange::new(vec![
        Request::set(key.clone(), sinx::ROW_STATUS, status),
        Request::set(key.clone(), sinx::ACKS, acks),
        Request::set(key.clone(), sinx::PERIOD, 10),
    ]);
    handler.apply(&mut exchange)
}

#[test]
fn test_subscription_lifecycle() {
    let tables = Tables::new().unwrap();
    let handler = TableHandler::mutable(&tables.sinx, Arc::new(Trivial));
    let key = sink_key("10.0.0.1", 162);

    assert_eq!(create(&handler, &key, RowStatus::CreateAndWait, 3), Status::NoError);
    let row = tables.sinx.find(&key).unwrap();
    assert_eq!(row.get(sinx::ROW_STATUS), Some(RowStatus::NotReady.into()));
    assert_eq!(row.get(sinx::ACKS), Some(Value::Integer(3)));
    assert_eq!(row.get(sinx::HOST), Some(Value::from("10.0.0.1")));

    // Creating it again collides.
    assert_eq!(
        create(&handler, &key, RowStatus::CreateAndGo, 1),
        Status::InconsistentValue
    );
    assert_eq!(row.get(sinx::ACKS), Some(Value::Integer(3)));

    // Modify, then destroy.
    let mut exchange = Exchange::new(vec![Request::set(key.clone(), sinx::LIMIT, 25)]);
    assert_eq!(handler.apply(&mut exchange), Status::NoError);
    assert_eq!(row.get(sinx::LIMIT), Some(Value::Integer(25)));

    let mut exchange = Exchange::new(vec![Request::set(
        key.clone(),
        sinx::ROW_STATUS,
        RowStatus::Destroy,
    )]);
    assert_eq!(handler.apply(&mut exchange), Status::NoError);
    assert!(tables.sinx.is_empty());
}

#[test]
fn test_multi_row_exchange_rolls_back_atomically() {
    let tables = Tables::new().unwrap();
    let handler = TableHandler::mutable(&tables.sinx, Arc::new(Trivial));
    let existing = sink_key("a", 1);
    assert_eq!(create(&handler, &existing, RowStatus::CreateAndGo, 5), Status::NoError);

    // Two creations plus a write to an existing row, then a bad binding.
    let mut exchange = Exchange::new(vec![
        Request::set(sink_key("b", 2), sinx::ROW_STATUS, RowStatus::CreateAndGo),
        Request::set(sink_key("c", 3), sinx::ROW_STATUS, RowStatus::CreateAndWait),
        Request::set(existing.clone(), sinx::ACKS, 99),
        Request::set(sink_key("b", 2), sinx::HOST, "x"),
    ]);
    assert_eq!(handler.apply(&mut exchange), Status::NoSuchObject);
    assert_eq!(exchange.pending(), 0);

    assert_eq!(tables.sinx.len(), 1);
    let row = tables.sinx.find(&existing).unwrap();
    assert_eq!(row.get(sinx::ACKS), Some(Value::Integer(5)));
}

#[test]
fn test_phases_driven_one_by_one() {
    let tables = Tables::new().unwrap();
    let handler = TableHandler::mutable(&tables.sinx, Arc::new(Trivial));
    let key = sink_key("h", 7);
    let mut exchange = Exchange::new(vec![
        Request::set(key.clone(), sinx::ROW_STATUS, RowStatus::CreateAndGo),
        Request::set(key.clone(), sinx::TICKET, "abc"),
    ]);

    assert_eq!(handler.process(Phase::Reserve1.code(), &mut exchange), Status::NoError);
    assert_eq!(handler.process(Phase::Reserve2.code(), &mut exchange), Status::NoError);
    assert_eq!(handler.process(Phase::Action.code(), &mut exchange), Status::NoError);
    // The protocol layer aborts after action: undo then free.
    assert_eq!(handler.process(Phase::Undo.code(), &mut exchange), Status::NoError);
    assert_eq!(handler.process(Phase::Free.code(), &mut exchange), Status::NoError);
    assert!(tables.sinx.is_empty());
    assert_eq!(handler.process(999, &mut exchange), Status::GenErr);
}

#[test]
fn test_get_next_walks_column_major() {
    let tables = Tables::new().unwrap();
    for id in ["101", "102"] {
        let row = tables.ves.new_row(Key::new(vec![Value::from(id)])).unwrap();
        row.put(ves::NAME, Value::from(format!("ct{id}"))).unwrap();
        tables.ves.insert(row).unwrap();
    }
    let handler = TableHandler::read_only(&tables.ves);

    let mut walked = Vec::new();
    let mut cursor = Request::get_next(Key::empty(), 0);
    loop {
        let mut exchange = Exchange::new(vec![cursor.clone()]);
        if handler.process(Phase::GetNext.code(), &mut exchange).is_error() {
            break;
        }
        cursor = exchange.into_requests().remove(0);
        walked.push((cursor.column, cursor.key.clone(), cursor.value.clone().unwrap()));
    }

    let columns = tables.ves.schema().columns().len();
    assert_eq!(walked.len(), columns * 2);
    assert_eq!(walked[0].0, ves::VEID);
    assert_eq!(walked[1].0, ves::VEID);
    assert_eq!(walked[2], (ves::NAME, Key::new(vec![Value::from("101")]), Value::from("ct101")));
}

#[test]
fn test_read_only_tables_refuse_sets() {
    let tables = Tables::new().unwrap();
    let handler = TableHandler::read_only(&tables.ves);
    let mut exchange = Exchange::new(vec![Request::set(
        Key::new(vec![Value::from("1")]),
        ves::NAME,
        "x",
    )]);
    assert_eq!(handler.apply(&mut exchange), Status::GenErr);
}

#[test]
fn test_metric_filter_rows_keyed_under_subscription() {
    let tables = Tables::new().unwrap();
    let handler = TableHandler::mutable(&tables.metrix, Arc::new(Trivial));
    let column = tables.ves.schema().metric_oid(ves::CPU_USER);
    let key = Key::new(vec![
        Value::from("10.0.0.1"),
        Value::Integer(162),
        Value::ObjectId(column.clone()),
    ]);
    let mut exchange = Exchange::new(vec![Request::set(
        key.clone(),
        metrix::ROW_STATUS,
        RowStatus::CreateAndGo,
    )]);
    assert_eq!(handler.apply(&mut exchange), Status::NoError);

    let rows = tables
        .metrix
        .find_by_prefix(sink_key("10.0.0.1", 162).values());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(metrix::METRIC), Some(Value::ObjectId(column)));

    let oid = tables.metrix.schema().instance_oid(metrix::ROW_STATUS, &key);
    assert!(oid.starts_with(&Oid::parse("1.3.6.1.4.1.26171.1.1.52.1.2").unwrap()));
}
