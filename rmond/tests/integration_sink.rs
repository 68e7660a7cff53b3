//! Integration tests for push subscriptions.
//!
//! Subscriptions are created through the agent's `sinx` and `metrix`
//! handlers, exactly as a management session would, and deliveries are
//! captured by a recording transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockCollector, RecordingTransport, wait_until};
use rmond::Agent;
use rmond::catalog::{metrix, sinx, ves};
use rmond::config::{AgentConfig, SinkConfig};
use rmond::error::Status;
use rmond::server::LinkState;
use rmond::table::Key;
use rmond::transaction::{Exchange, Request, RowStatus};
use rmond::value::Value;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    collector: Arc<MockCollector>,
    transport: Arc<RecordingTransport>,
    agent: Agent,
}

fn fixture() -> Fixture {
    let collector = MockCollector::new();
    collector.add_guest("101", "web");
    collector.add_guest("102", "db");
    let transport = RecordingTransport::new();
    let config = AgentConfig {
        connect_retry: Duration::from_millis(20),
        collect_period: Duration::from_millis(20),
        reaper_period: Duration::from_millis(20),
        sink: SinkConfig {
            period_unit: Duration::from_millis(10),
            ..SinkConfig::default()
        },
    };
    let agent = Agent::new(
        config,
        Arc::clone(&collector) as _,
        Arc::clone(&transport) as _,
    )
    .unwrap();
    agent.start().unwrap();
    assert!(wait_until(WAIT, || {
        agent.server().state() == LinkState::Attached
            && agent.tables().ves.len() == 2
            && agent
                .tables()
                .ves
                .rows()
                .iter()
                .all(|r| r.get(ves::NAME).is_some())
    }));
    Fixture {
        collector,
        transport,
        agent,
    }
}

fn key(port: i32) -> Key {
    Key::new(vec![Value::from("127.0.0.1"), Value::Integer(port)])
}

fn subscribe(agent: &Agent, key: &Key, settings: &[(u32, Value)]) -> Status {
    let mut requests = vec![Request::set(
        key.clone(),
        sinx::ROW_STATUS,
        RowStatus::CreateAndGo,
    )];
    requests.extend(
        settings
            .iter()
            .map(|(column, value)| Request::set(key.clone(), *column, value.clone())),
    );
    agent
        .handler("sinx")
        .unwrap()
        .apply(&mut Exchange::new(requests))
}

#[test]
fn test_pushes_until_acks_run_out_then_reaped() {
    let f = fixture();
    let key = key(9162);
    let status = subscribe(
        &f.agent,
        &key,
        &[(sinx::PERIOD, Value::Integer(1)), (sinx::ACKS, Value::Integer(3))],
    );
    assert_eq!(status, Status::NoError);

    assert!(wait_until(WAIT, || f.agent.tables().sinx.is_empty()));
    assert_eq!(f.transport.count(), 3);
    for (host, port, message) in f.transport.messages() {
        assert_eq!((host.as_str(), port), ("127.0.0.1", 9162));
        assert!(message.ticket.is_none());
        assert!(!message.values.is_empty());
    }
    assert!(f.agent.sink().reaper().is_empty());
    assert!(f.collector.is_subscribed());
}

#[test]
fn test_metric_filter_and_limit_shape_batches() {
    let f = fixture();
    let key = key(9163);
    let column = f.agent.tables().ves.schema().metric_oid(ves::NAME);
    let mut filter_key = key.values().to_vec();
    filter_key.push(Value::ObjectId(column));
    let mut exchange = Exchange::new(vec![Request::set(
        Key::new(filter_key),
        metrix::ROW_STATUS,
        RowStatus::CreateAndGo,
    )]);
    assert_eq!(
        f.agent.handler("metrix").unwrap().apply(&mut exchange),
        Status::NoError
    );

    let status = subscribe(
        &f.agent,
        &key,
        &[
            (sinx::ACKS, Value::Integer(1)),
            (sinx::LIMIT, Value::Integer(1)),
            (sinx::TICKET, Value::from("t-42")),
        ],
    );
    assert_eq!(status, Status::NoError);

    // Reaping also drops the subscription's filter rows.
    assert!(wait_until(WAIT, || {
        f.agent.tables().sinx.is_empty() && f.agent.tables().metrix.is_empty()
    }));
    let messages = f.transport.messages();
    assert_eq!(messages.len(), 2);
    let names: Vec<Value> = messages
        .iter()
        .map(|(_, _, m)| {
            assert_eq!(m.values.len(), 1);
            let ticket = m.ticket.as_ref().unwrap();
            assert_eq!(ticket.value, Value::from("t-42"));
            m.values[0].value.clone()
        })
        .collect();
    assert_eq!(names, vec![Value::from("web"), Value::from("db")]);
}

#[test]
fn test_destroyed_subscription_stops_pushing() {
    let f = fixture();
    let key = key(9164);
    let status = subscribe(
        &f.agent,
        &key,
        &[
            (sinx::PERIOD, Value::Integer(1)),
            (sinx::ACKS, Value::Integer(1000)),
        ],
    );
    assert_eq!(status, Status::NoError);
    assert!(wait_until(WAIT, || f.transport.count() >= 2));

    let mut exchange = Exchange::new(vec![Request::set(
        key.clone(),
        sinx::ROW_STATUS,
        RowStatus::Destroy,
    )]);
    assert_eq!(
        f.agent.handler("sinx").unwrap().apply(&mut exchange),
        Status::NoError
    );
    // A delivery already running may still finish.
    let sent = f.transport.count();
    std::thread::sleep(Duration::from_millis(100));
    assert!(f.transport.count() <= sent + 1);
    assert!(f.agent.tables().sinx.is_empty());
}

#[test]
fn test_invalid_subscriptions_are_refused() {
    let f = fixture();
    assert_eq!(subscribe(&f.agent, &key(0), &[]), Status::WrongValue);
    assert_eq!(subscribe(&f.agent, &key(70000), &[]), Status::WrongValue);
    assert_eq!(
        subscribe(&f.agent, &key(9165), &[(sinx::ACKS, Value::Integer(-1))]),
        Status::WrongValue
    );
    assert!(f.agent.tables().sinx.is_empty());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(f.transport.count(), 0);
}
