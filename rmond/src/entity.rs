//! Monitored entities: the host and each guest, backed by table rows.
//!
//! An entity owns the rows describing it. Pulls fetch a complete payload
//! from the collector first and only then apply it with one atomic
//! [`Row::update`](crate::table::Row::update) per row, so a failed or timed
//! out pull never leaves a row half-written.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::catalog::{self, Tables};
use crate::collector::{
    Collector, DiskUsage, EntityState, EntityUsage, GuestState, GuestUsage, HostState, HostUsage,
    InterfaceUsage, Sample, Target,
};
use crate::error::{CollectorError, TableError};
use crate::table::{Key, Row, RowRef, Table};
use crate::value::{Oid, Value};

/// One named value of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricValue {
    /// Instance OID: column OID followed by the encoded row key.
    pub oid: Oid,
    /// Current value.
    pub value: Value,
}

/// The set of column OIDs a subscriber wants. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricFilter {
    columns: BTreeSet<Oid>,
}

impl MetricFilter {
    /// A filter letting every metric through.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds a column OID to the filter.
    pub fn insert(&mut self, column: Oid) {
        self.columns.insert(column);
    }

    /// Returns `true` if the filter lets everything through.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns `true` if values of the column named by `column` pass.
    pub fn matches(&self, column: &Oid) -> bool {
        self.columns.is_empty() || self.columns.contains(column)
    }
}

impl FromIterator<Oid> for MetricFilter {
    fn from_iter<I: IntoIterator<Item = Oid>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

/// Something the server monitors.
pub trait Entity: Send + Sync + fmt::Debug {
    /// Returns the entity id: the guest id, or empty for the host.
    fn id(&self) -> &str;

    /// Returns what the entity stands for.
    fn target(&self) -> &Target;

    /// Refreshes configuration and run state.
    ///
    /// # Errors
    ///
    /// Returns the collector's error; the rows are left untouched.
    fn pull_state(&self, collector: &dyn Collector) -> Result<(), CollectorError>;

    /// Refreshes usage counters.
    ///
    /// # Errors
    ///
    /// Returns the collector's error; the rows are left untouched.
    fn pull_usage(&self, collector: &dyn Collector) -> Result<(), CollectorError>;

    /// Applies raw performance counters. Unknown counters are ignored.
    fn apply_samples(&self, samples: &[Sample]);

    /// Returns the current values passing `filter`.
    fn snapshot(&self, filter: &MetricFilter) -> Vec<MetricValue>;

    /// Removes every row the entity owns.
    fn teardown(&self);
}

fn snapshot_row(row: &Row, filter: &MetricFilter, out: &mut Vec<MetricValue>) {
    let schema = row.schema();
    for (column, value) in row.values() {
        if filter.matches(&schema.metric_oid(column)) {
            out.push(MetricValue {
                oid: schema.instance_oid(column, row.key()),
                value,
            });
        }
    }
}

fn unexpected(target: &Target) -> CollectorError {
    CollectorError::Unavailable {
        reason: format!("collector returned a payload for the wrong kind of entity than {target}"),
    }
}

fn saturating_i32(value: u64) -> Value {
    Value::Integer(i32::try_from(value).unwrap_or(i32::MAX))
}

fn saturating_count(value: usize) -> Value {
    Value::Integer(i32::try_from(value).unwrap_or(i32::MAX))
}

fn install(table: &Table, key: Key) -> Result<RowRef, TableError> {
    if let Some(row) = table.find(&key) {
        return Ok(row);
    }
    let row = table.new_row(key)?;
    table.insert(Arc::clone(&row))?;
    Ok(row)
}

/// The host scalar group.
#[derive(Debug)]
pub struct HostEntity {
    target: Target,
    table: Arc<Table>,
    row: RowRef,
}

impl HostEntity {
    /// Creates the host entity, installing its scalar row.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] if the row cannot be installed.
    pub fn new(tables: &Tables) -> Result<Self, TableError> {
        let row = install(&tables.host, Key::empty())?;
        Ok(Self {
            target: Target::Host,
            table: Arc::clone(&tables.host),
            row,
        })
    }

    /// Publishes the number of monitored guests.
    pub fn set_local_ves(&self, count: usize) {
        let _ = self.row.put(catalog::host::LOCAL_VES, saturating_count(count));
    }

    fn apply_state(&self, state: &HostState) -> Result<(), TableError> {
        use catalog::host::*;
        self.row.update([
            (LIMIT_VES, Value::Integer(state.limit_ves)),
            (LICENSE_VES, Value::Integer(state.license_ves)),
            (LICENSE_CTS, Value::Integer(state.license_cts)),
            (LICENSE_VMS, Value::Integer(state.license_vms)),
        ])
    }

    fn apply_usage(&self, usage: &HostUsage) -> Result<(), TableError> {
        use catalog::host::*;
        self.row.update([
            (LICENSE_CTS_USAGE, Value::Integer(usage.license_cts_usage)),
            (LICENSE_VMS_USAGE, Value::Integer(usage.license_vms_usage)),
        ])
    }
}

impl Entity for HostEntity {
    fn id(&self) -> &str {
        ""
    }

    fn target(&self) -> &Target {
        &self.target
    }

    fn pull_state(&self, collector: &dyn Collector) -> Result<(), CollectorError> {
        match collector.pull_state(&self.target)? {
            EntityState::Host(state) => {
                self.apply_state(&state).map_err(|e| CollectorError::Unavailable {
                    reason: e.to_string(),
                })
            }
            EntityState::Guest(_) => Err(unexpected(&self.target)),
        }
    }

    fn pull_usage(&self, collector: &dyn Collector) -> Result<(), CollectorError> {
        match collector.pull_usage(&self.target)? {
            EntityUsage::Host(usage) => {
                self.apply_usage(&usage).map_err(|e| CollectorError::Unavailable {
                    reason: e.to_string(),
                })
            }
            EntityUsage::Guest(_) => Err(unexpected(&self.target)),
        }
    }

    fn apply_samples(&self, samples: &[Sample]) {
        for sample in samples {
            if sample.name == "license.ves" {
                let _ = self
                    .row
                    .put(catalog::host::LICENSE_VES, saturating_i32(sample.value));
            }
        }
    }

    fn snapshot(&self, filter: &MetricFilter) -> Vec<MetricValue> {
        let mut out = Vec::new();
        snapshot_row(&self.row, filter, &mut out);
        out
    }

    fn teardown(&self) {
        self.table.erase_row(&self.row);
    }
}

/// One guest: its `ves` row plus its disk and interface rows.
#[derive(Debug)]
pub struct GuestEntity {
    id: String,
    target: Target,
    ves: Arc<Table>,
    vhds: Arc<Table>,
    veths: Arc<Table>,
    row: RowRef,
}

impl GuestEntity {
    /// Creates a guest entity, installing its `ves` row.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] if the row cannot be installed.
    pub fn new(id: impl Into<String>, tables: &Tables) -> Result<Self, TableError> {
        let id = id.into();
        let row = install(&tables.ves, Key::new(vec![Value::from(id.as_str())]))?;
        Ok(Self {
            target: Target::Guest(id.clone()),
            id,
            ves: Arc::clone(&tables.ves),
            vhds: Arc::clone(&tables.vhds),
            veths: Arc::clone(&tables.veths),
            row,
        })
    }

    fn prefix(&self) -> [Value; 1] {
        [Value::from(self.id.as_str())]
    }

    fn child_key(&self, name: &str) -> Key {
        Key::new(vec![Value::from(self.id.as_str()), Value::from(name)])
    }

    fn apply_state(&self, state: &GuestState) -> Result<(), TableError> {
        use catalog::ves::*;
        self.row.update([
            (NAME, Value::from(state.name.as_str())),
            (STATE, Value::Integer(state.state)),
            (PERFECT_NODE, Value::from(state.perfect_node.as_str())),
            (MEMORY_TOTAL, Value::Counter64(state.memory_total)),
            (SWAP_TOTAL, Value::Counter64(state.swap_total)),
            (CPU_NUMBER, Value::Integer(state.cpu_number)),
            (CPU_LIMIT, Value::Integer(state.cpu_limit)),
            (CPU_UNITS, Value::Integer(state.cpu_units)),
        ])
    }

    fn apply_usage(&self, usage: &GuestUsage) -> Result<(), TableError> {
        use catalog::ves::*;
        self.row.update([
            (MEMORY_USAGE, Value::Counter64(usage.memory_usage)),
            (SWAP_USAGE, Value::Counter64(usage.swap_usage)),
            (CPU_SYSTEM, Value::Integer(usage.cpu_system)),
            (CPU_USER, Value::Integer(usage.cpu_user)),
        ])?;

        let disks: BTreeMap<&str, &DiskUsage> =
            usage.disks.iter().map(|d| (d.name.as_str(), d)).collect();
        self.merge(&self.vhds, &disks, |row, disk| {
            use catalog::vhds::*;
            row.update([
                (TOTAL, Value::Counter64(disk.total)),
                (USAGE, Value::Counter64(disk.usage)),
                (READ_REQUESTS, Value::Counter64(disk.read_requests)),
                (WRITE_REQUESTS, Value::Counter64(disk.write_requests)),
                (READ_BYTES, Value::Counter64(disk.read_bytes)),
                (WRITE_BYTES, Value::Counter64(disk.write_bytes)),
            ])
        })?;

        let interfaces: BTreeMap<&str, &InterfaceUsage> =
            usage.interfaces.iter().map(|i| (i.name.as_str(), i)).collect();
        self.merge(&self.veths, &interfaces, |row, nic| {
            use catalog::veths::*;
            row.update([
                (IN_BYTES, Value::Counter64(nic.in_bytes)),
                (OUT_BYTES, Value::Counter64(nic.out_bytes)),
                (IN_PACKETS, Value::Counter64(nic.in_packets)),
                (OUT_PACKETS, Value::Counter64(nic.out_packets)),
            ])
        })
    }

    /// Brings the child rows of `table` in line with `current`: rows of
    /// vanished devices are erased, new devices get rows, all are updated.
    fn merge<T>(
        &self,
        table: &Table,
        current: &BTreeMap<&str, &T>,
        apply: impl Fn(&Row, &T) -> Result<(), TableError>,
    ) -> Result<(), TableError> {
        for row in table.find_by_prefix(&self.prefix()) {
            let gone = row
                .key()
                .values()
                .get(1)
                .and_then(Value::as_str)
                .is_none_or(|name| !current.contains_key(name));
            if gone {
                table.erase_row(&row);
                debug!(guest = %self.id, table = table.name(), key = %row.key(), "device removed");
            }
        }
        for (name, usage) in current {
            let row = install(table, self.child_key(name))?;
            apply(&row, usage)?;
        }
        Ok(())
    }

    fn apply_sample(&self, sample: &Sample) {
        use catalog::ves::*;
        let value = sample.value;
        let result = match sample.name.as_str() {
            "cpu.system" => self.row.put(CPU_SYSTEM, saturating_i32(value)),
            "cpu.user" => self.row.put(CPU_USER, saturating_i32(value)),
            "mem.usage" => self.row.put(MEMORY_USAGE, Value::Counter64(value)),
            "mem.total" => self.row.put(MEMORY_TOTAL, Value::Counter64(value)),
            "swap.usage" => self.row.put(SWAP_USAGE, Value::Counter64(value)),
            "swap.total" => self.row.put(SWAP_TOTAL, Value::Counter64(value)),
            name => {
                if let Some((device, field)) =
                    name.strip_prefix("disk.").and_then(|r| r.rsplit_once('.'))
                {
                    self.apply_device_sample(&self.vhds, device, disk_column(field), value)
                } else if let Some((device, field)) =
                    name.strip_prefix("net.").and_then(|r| r.rsplit_once('.'))
                {
                    self.apply_device_sample(&self.veths, device, interface_column(field), value)
                } else {
                    return;
                }
            }
        };
        if let Err(e) = result {
            debug!(guest = %self.id, sample = %sample.name, "sample not applied: {e}");
        }
    }

    fn apply_device_sample(
        &self,
        table: &Table,
        device: &str,
        column: Option<u32>,
        value: u64,
    ) -> Result<Value, TableError> {
        let Some(column) = column else {
            return Ok(Value::Counter64(value));
        };
        match table.find(&self.child_key(device)) {
            Some(row) => row.put(column, Value::Counter64(value)),
            None => Ok(Value::Counter64(value)),
        }
    }
}

fn disk_column(field: &str) -> Option<u32> {
    use catalog::vhds::*;
    match field {
        "total" => Some(TOTAL),
        "usage" => Some(USAGE),
        "read_requests" => Some(READ_REQUESTS),
        "write_requests" => Some(WRITE_REQUESTS),
        "read_bytes" => Some(READ_BYTES),
        "write_bytes" => Some(WRITE_BYTES),
        _ => None,
    }
}

fn interface_column(field: &str) -> Option<u32> {
    use catalog::veths::*;
    match field {
        "in_bytes" => Some(IN_BYTES),
        "out_bytes" => Some(OUT_BYTES),
        "in_packets" => Some(IN_PACKETS),
        "out_packets" => Some(OUT_PACKETS),
        _ => None,
    }
}

impl Entity for GuestEntity {
    fn id(&self) -> &str {
        &self.id
    }

    fn target(&self) -> &Target {
        &self.target
    }

    fn pull_state(&self, collector: &dyn Collector) -> Result<(), CollectorError> {
        match collector.pull_state(&self.target)? {
            EntityState::Guest(state) => {
                self.apply_state(&state).map_err(|e| CollectorError::Unavailable {
                    reason: e.to_string(),
                })
            }
            EntityState::Host(_) => Err(unexpected(&self.target)),
        }
    }

    fn pull_usage(&self, collector: &dyn Collector) -> Result<(), CollectorError> {
        match collector.pull_usage(&self.target)? {
            EntityUsage::Guest(usage) => {
                self.apply_usage(&usage).map_err(|e| CollectorError::Unavailable {
                    reason: e.to_string(),
                })
            }
            EntityUsage::Host(_) => Err(unexpected(&self.target)),
        }
    }

    fn apply_samples(&self, samples: &[Sample]) {
        for sample in samples {
            self.apply_sample(sample);
        }
    }

    fn snapshot(&self, filter: &MetricFilter) -> Vec<MetricValue> {
        let mut out = Vec::new();
        snapshot_row(&self.row, filter, &mut out);
        for row in self.vhds.find_by_prefix(&self.prefix()) {
            snapshot_row(&row, filter, &mut out);
        }
        for row in self.veths.find_by_prefix(&self.prefix()) {
            snapshot_row(&row, filter, &mut out);
        }
        out
    }

    fn teardown(&self) {
        self.ves.erase_row(&self.row);
        self.vhds.erase_by_prefix(&self.prefix());
        self.veths.erase_by_prefix(&self.prefix());
    }
}
