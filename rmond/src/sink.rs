//! Push subscriptions: periodic delivery, batching, ack budgets and reaping.
//!
//! A subscription is a `sinx` row keyed by destination host and port, created
//! through the row transaction like any other protocol-writable row. When a
//! creation commits, the [`Sink`] tracks the row in its [`Reaper`] and
//! schedules its first delivery. Each delivery snapshots the metrics the
//! subscription selects (its `metrix` rows, or everything when it has none),
//! sends them in batches of at most `limit` values, spends one ack and
//! reschedules itself. A subscription with no acks left is no longer
//! delivered and is erased by the next reaper sweep.
//!
//! Messages are protobuf-encoded [`proto::Notification`]s, one per datagram.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use prost::Message;
use tracing::{debug, info, warn};

use crate::catalog::{self, Tables};
use crate::config::SinkConfig;
use crate::entity::{MetricFilter, MetricValue};
use crate::error::{ProtocolError, TransportError};
use crate::scheduler::Scheduler;
use crate::server::Server;
use crate::table::{Key, Row, RowRef, Table};
use crate::transaction::{Request, RowActor, RowStatus};
use crate::value::{Oid, Value};

/// Wire types of push notifications.
///
/// Hand-written prost messages; no `.proto` compilation step is involved.
pub mod proto {
    /// One push: the notification OID followed by its bindings.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Notification {
        /// Dotted OID identifying the notification.
        #[prost(string, tag = "1")]
        pub trap: String,
        /// Values carried, ticket first when present.
        #[prost(message, repeated, tag = "2")]
        pub bindings: Vec<Binding>,
    }

    /// One named value.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Binding {
        /// Dotted instance OID.
        #[prost(string, tag = "1")]
        pub oid: String,
        /// The value.
        #[prost(oneof = "binding::Value", tags = "2, 3, 4, 5, 6")]
        pub value: Option<binding::Value>,
    }

    /// Nested types of [`Binding`].
    pub mod binding {
        /// A typed binding value.
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Value {
            /// Signed integer.
            #[prost(sint32, tag = "2")]
            Integer(i32),
            /// Octet string.
            #[prost(string, tag = "3")]
            OctetString(String),
            /// 64-bit counter.
            #[prost(uint64, tag = "4")]
            Counter64(u64),
            /// 32-bit gauge.
            #[prost(uint32, tag = "5")]
            Gauge32(u32),
            /// Dotted object identifier.
            #[prost(string, tag = "6")]
            ObjectId(String),
        }
    }
}

/// One batch of values bound for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    /// The subscription's correlation ticket, when it has one.
    pub ticket: Option<MetricValue>,
    /// The metric values of this batch.
    pub values: Vec<MetricValue>,
}

impl PushMessage {
    /// Returns every binding, ticket first.
    pub fn bindings(&self) -> impl Iterator<Item = &MetricValue> {
        self.ticket.iter().chain(&self.values)
    }

    /// Converts the message to its wire form.
    pub fn to_proto(&self) -> proto::Notification {
        proto::Notification {
            trap: Oid::new(catalog::TRAPS).to_string(),
            bindings: self
                .bindings()
                .map(|m| proto::Binding {
                    oid: m.oid.to_string(),
                    value: Some(wire_value(&m.value)),
                })
                .collect(),
        }
    }

    /// Encodes the message as protobuf bytes.
    pub fn encode(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }
}

fn wire_value(value: &Value) -> proto::binding::Value {
    use proto::binding::Value as Wire;
    match value {
        Value::Integer(v) => Wire::Integer(*v),
        Value::OctetString(v) => Wire::OctetString(v.clone()),
        Value::Counter64(v) => Wire::Counter64(*v),
        Value::Gauge32(v) => Wire::Gauge32(*v),
        Value::ObjectId(v) => Wire::ObjectId(v.to_string()),
    }
}

/// Splits `values` into batches of at most `limit` values.
///
/// A `limit` of zero or less puts everything in one batch. No batch is ever
/// empty, so an empty input yields no batches.
pub fn batches(values: Vec<MetricValue>, limit: i32) -> Vec<Vec<MetricValue>> {
    if values.is_empty() {
        return Vec::new();
    }
    let size = usize::try_from(limit).unwrap_or(0);
    if size == 0 {
        return vec![values];
    }
    let mut out = Vec::with_capacity(values.len().div_ceil(size));
    let mut iter = values.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/// An open route to one subscriber.
pub trait PushChannel: Send {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the message cannot be encoded or sent.
    fn send(&mut self, message: &PushMessage) -> Result<(), TransportError>;
}

/// Opens push channels.
pub trait Transport: Send + Sync {
    /// Opens a channel to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the destination cannot be resolved or
    /// no socket can be opened.
    fn open(&self, host: &str, port: u16) -> Result<Box<dyn PushChannel>, TransportError>;
}

/// Sends each message as one UDP datagram.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    send_timeout: Duration,
    max_datagram: usize,
}

impl UdpTransport {
    /// Creates a transport with the given limits.
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            send_timeout: config.send_timeout,
            max_datagram: config.max_datagram,
        }
    }
}

impl Transport for UdpTransport {
    fn open(&self, host: &str, port: u16) -> Result<Box<dyn PushChannel>, TransportError> {
        let resolve = || TransportError::Resolve {
            host: host.to_string(),
            port,
        };
        let destination = (host, port)
            .to_socket_addrs()
            .map_err(|_| resolve())?
            .next()
            .ok_or_else(resolve)?;
        let local = if destination.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).map_err(|source| TransportError::Socket { source })?;
        socket
            .set_write_timeout(Some(self.send_timeout))
            .and_then(|()| socket.connect(destination))
            .map_err(|source| TransportError::Socket { source })?;
        Ok(Box::new(UdpChannel {
            socket,
            destination,
            max_datagram: self.max_datagram,
        }))
    }
}

struct UdpChannel {
    socket: UdpSocket,
    destination: SocketAddr,
    max_datagram: usize,
}

impl PushChannel for UdpChannel {
    fn send(&mut self, message: &PushMessage) -> Result<(), TransportError> {
        let bytes = message.encode();
        if bytes.len() > self.max_datagram {
            return Err(TransportError::Encode {
                reason: format!(
                    "{} bytes exceed the {}-byte datagram limit",
                    bytes.len(),
                    self.max_datagram
                ),
            });
        }
        self.socket
            .send(&bytes)
            .map(|_| ())
            .map_err(|source| TransportError::Send {
                destination: self.destination.to_string(),
                source,
            })
    }
}

/// Where deliveries take their values from.
pub trait MetricSource: Send + Sync {
    /// Returns the current values passing `filter`.
    fn snapshot(&self, filter: &MetricFilter) -> Vec<MetricValue>;
}

impl MetricSource for Server {
    fn snapshot(&self, filter: &MetricFilter) -> Vec<MetricValue> {
        Server::snapshot(self, filter)
    }
}

/// A decoded `sinx` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// Push period, in period units.
    pub period: i32,
    /// Maximum values per push; zero or less means unlimited.
    pub limit: i32,
    /// Pushes left.
    pub acks: i32,
    /// Current row status.
    pub status: Option<RowStatus>,
    /// Correlation ticket; empty when unset.
    pub ticket: String,
}

impl Subscription {
    /// Reads a subscription out of a `sinx` row.
    ///
    /// Returns `None` if the row's key does not name a valid destination.
    pub fn from_row(row: &Row) -> Option<Self> {
        use catalog::sinx::*;
        let (host, port) = destination(row.key())?;
        let integer = |column| row.get(column).and_then(|v| v.as_integer()).unwrap_or(0);
        Some(Self {
            host,
            port,
            period: integer(PERIOD),
            limit: integer(LIMIT),
            acks: integer(ACKS),
            status: row.get(ROW_STATUS).as_ref().and_then(RowStatus::from_value),
            ticket: row
                .get(TICKET)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        })
    }
}

fn destination(key: &Key) -> Option<(String, u16)> {
    match key.values() {
        [host, port] => {
            let port = u16::try_from(port.as_integer()?).ok().filter(|p| *p != 0)?;
            Some((host.as_str()?.to_string(), port))
        }
        _ => None,
    }
}

/// Builds the filter of the subscription keyed `key` from its committed
/// `metrix` rows.
///
/// Rows still `notReady` after a createAndWait count too: a subscription
/// that asked for some metrics never widens to all of them. Reserved rows
/// (`notInService`) belong to an exchange in flight and are skipped.
pub fn filter_for(metrix: &Table, key: &Key) -> MetricFilter {
    metrix
        .find_by_prefix(key.values())
        .iter()
        .filter(|row| {
            matches!(
                row.get(catalog::metrix::ROW_STATUS)
                    .as_ref()
                    .and_then(RowStatus::from_value),
                Some(RowStatus::Active | RowStatus::NotReady)
            )
        })
        .filter_map(|row| row.get(catalog::metrix::METRIC)?.as_oid().cloned())
        .collect()
}

/// Tracks subscriptions and erases the exhausted ones.
#[derive(Debug, Default)]
pub struct Reaper {
    tracked: Mutex<Vec<Weak<Row>>>,
}

impl Reaper {
    /// Starts tracking `row`.
    pub fn track(&self, row: &RowRef) {
        self.lock().push(Arc::downgrade(row));
    }

    /// Returns the number of tracked rows.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no row is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Erases every tracked subscription with no acks left that is not in
    /// `busy`, along with its `metrix` rows. Rows that are gone or were
    /// replaced are dropped from tracking. Returns how many were erased.
    pub fn sweep(&self, sinx: &Table, metrix: &Table, busy: &BTreeSet<Key>) -> usize {
        let mut erased = 0;
        self.lock().retain(|weak| {
            let Some(row) = weak.upgrade() else {
                return false;
            };
            if !sinx.find(row.key()).is_some_and(|r| Arc::ptr_eq(&r, &row)) {
                return false;
            }
            let acks = row
                .get(catalog::sinx::ACKS)
                .and_then(|v| v.as_integer())
                .unwrap_or(0);
            if acks > 0 || busy.contains(row.key()) {
                return true;
            }
            sinx.erase_row(&row);
            let filters = metrix.erase_by_prefix(row.key().values());
            info!(key = %row.key(), filters, "subscription reaped");
            erased += 1;
            false
        });
        erased
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<Row>>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The subscription engine.
///
/// Acts as the row actor of the `sinx` table, so committed creations start
/// their delivery cycle.
pub struct Sink {
    this: Weak<Sink>,
    sinx: Arc<Table>,
    metrix: Arc<Table>,
    source: Arc<dyn MetricSource>,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    period_unit: Duration,
    reaper: Reaper,
    busy: Mutex<BTreeSet<Key>>,
}

impl Sink {
    /// Creates a sink serving the subscriptions in `tables`.
    pub fn new(
        tables: &Tables,
        source: Arc<dyn MetricSource>,
        transport: Arc<dyn Transport>,
        scheduler: Scheduler,
        config: &SinkConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            sinx: Arc::clone(&tables.sinx),
            metrix: Arc::clone(&tables.metrix),
            source,
            transport,
            scheduler,
            period_unit: config.period_unit,
            reaper: Reaper::default(),
            busy: Mutex::new(BTreeSet::new()),
        })
    }

    /// Returns the reaper.
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Returns the delay between two deliveries of `subscription`.
    pub fn period(&self, subscription: &Subscription) -> Duration {
        match u32::try_from(subscription.period) {
            Ok(units) if units > 0 => self.period_unit.saturating_mul(units),
            _ => self.period_unit,
        }
    }

    /// Runs one delivery of `row`, returning the number of messages sent.
    ///
    /// Does nothing, and returns `Ok(0)`, when the subscription has no acks
    /// left. Otherwise one ack is spent whether or not the sends succeed.
    ///
    /// # Errors
    ///
    /// Returns the first [`TransportError`]; the remaining batches of this
    /// delivery are skipped.
    pub fn deliver(&self, row: &RowRef) -> Result<usize, TransportError> {
        let Some(subscription) = Subscription::from_row(row) else {
            return Ok(0);
        };
        if subscription.acks <= 0 {
            return Ok(0);
        }
        let _busy = Busy::mark(&self.busy, row.key());
        let sent = self.push(row, &subscription);
        // A management SET of the acks may land during the push; it is the
        // value decremented.
        let spent = row.modify(catalog::sinx::ACKS, |acks| {
            Value::Integer(acks.as_integer().unwrap_or(0).saturating_sub(1).max(0))
        });
        match spent {
            Ok(left) => debug!(key = %row.key(), acks = %left, "delivery done"),
            Err(e) => warn!(key = %row.key(), "cannot spend an ack: {e}"),
        }
        sent
    }

    fn push(&self, row: &Row, subscription: &Subscription) -> Result<usize, TransportError> {
        let filter = filter_for(&self.metrix, row.key());
        let values = self.source.snapshot(&filter);
        let batches = batches(values, subscription.limit);
        if batches.is_empty() {
            return Ok(0);
        }
        let ticket = (!subscription.ticket.is_empty()).then(|| MetricValue {
            oid: row
                .schema()
                .instance_oid(catalog::sinx::TICKET, row.key()),
            value: Value::from(subscription.ticket.as_str()),
        });
        let mut channel = self.transport.open(&subscription.host, subscription.port)?;
        let mut sent = 0;
        for values in batches {
            channel.send(&PushMessage {
                ticket: ticket.clone(),
                values,
            })?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Runs one reaper sweep, returning the number of subscriptions erased.
    pub fn reap(&self) -> usize {
        let busy = self.lock_busy().clone();
        self.reaper.sweep(&self.sinx, &self.metrix, &busy)
    }

    /// Queues a reaper sweep every `period`.
    pub fn schedule_reaper(&self, period: Duration) {
        self.schedule_reaper_on(&self.scheduler, period);
    }

    fn schedule_reaper_on(&self, scheduler: &Scheduler, period: Duration) {
        let sink = self.this.clone();
        let pushed = scheduler.push(period, move |scheduler| {
            if let Some(sink) = sink.upgrade() {
                sink.reap();
                sink.schedule_reaper_on(scheduler, period);
            }
        });
        if let Err(e) = pushed {
            debug!("reaper not scheduled: {e}");
        }
    }

    fn schedule_delivery(&self, scheduler: &Scheduler, row: &RowRef, delay: Duration) {
        let job = Delivery {
            sink: self.this.clone(),
            row: Arc::downgrade(row),
        };
        if let Err(e) = scheduler.push(delay, move |s| job.run(s)) {
            debug!(key = %row.key(), "delivery not scheduled: {e}");
        }
    }

    fn lock_busy(&self) -> MutexGuard<'_, BTreeSet<Key>> {
        lock_keys(&self.busy)
    }
}

fn lock_keys(keys: &Mutex<BTreeSet<Key>>) -> MutexGuard<'_, BTreeSet<Key>> {
    keys.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a subscription as mid-delivery until dropped, unwinding included,
/// so the reaper never sees a stale mark.
struct Busy<'a> {
    keys: &'a Mutex<BTreeSet<Key>>,
    key: Key,
}

impl<'a> Busy<'a> {
    fn mark(keys: &'a Mutex<BTreeSet<Key>>, key: &Key) -> Self {
        lock_keys(keys).insert(key.clone());
        Self {
            keys,
            key: key.clone(),
        }
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        lock_keys(self.keys).remove(&self.key);
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("subscriptions", &self.sinx.len())
            .field("tracked", &self.reaper.len())
            .field("period_unit", &self.period_unit)
            .finish_non_exhaustive()
    }
}

impl RowActor for Sink {
    fn reserve2(&self, table: &Table, request: &Request) -> Result<(), ProtocolError> {
        if destination(&request.key).is_none() {
            debug!(table = table.name(), key = %request.key, "invalid destination");
            return Err(ProtocolError::WrongValue);
        }
        if request.column == catalog::sinx::ACKS
            && request
                .value
                .as_ref()
                .and_then(Value::as_integer)
                .is_some_and(|acks| acks < 0)
        {
            return Err(ProtocolError::WrongValue);
        }
        Ok(())
    }

    fn committed(&self, _: &Table, created: &[RowRef]) {
        for row in created {
            self.reaper.track(row);
            let Some(subscription) = Subscription::from_row(row) else {
                continue;
            };
            info!(
                host = %subscription.host,
                port = subscription.port,
                acks = subscription.acks,
                "subscription created"
            );
            self.schedule_delivery(&self.scheduler, row, self.period(&subscription));
        }
    }
}

/// The periodic delivery job of one subscription.
struct Delivery {
    sink: Weak<Sink>,
    row: Weak<Row>,
}

impl Delivery {
    fn run(self, scheduler: &Scheduler) {
        let (Some(sink), Some(row)) = (self.sink.upgrade(), self.row.upgrade()) else {
            return;
        };
        if !sink.sinx.find(row.key()).is_some_and(|r| Arc::ptr_eq(&r, &row)) {
            debug!(key = %row.key(), "delivery of a destroyed subscription dropped");
            return;
        }
        let Some(subscription) = Subscription::from_row(&row) else {
            return;
        };
        if subscription.acks <= 0 {
            return;
        }
        if let Err(e) = sink.deliver(&row) {
            warn!(
                host = %subscription.host,
                port = subscription.port,
                "push failed: {e}"
            );
        }
        sink.schedule_delivery(scheduler, &row, sink.period(&subscription));
    }
}
