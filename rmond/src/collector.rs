//! The virtualization-host SDK seam.
//!
//! The agent never talks to a hypervisor directly. Everything it knows about
//! the host and its guests comes through a [`Collector`]: synchronous pulls
//! of state and usage, plus an event callback the collector invokes from its
//! own threads whenever something happens on the host.
//!
//! Implementations are expected to bound every blocking call with their own
//! timeout and report it as [`CollectorError::Timeout`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CollectorError;

/// What a pull or subscription is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// The host itself.
    Host,
    /// A guest, by id.
    Guest(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest(id) => write!(f, "guest {id}"),
        }
    }
}

/// Host lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A guest was created or registered.
    Added,
    /// A guest was deleted.
    Removed,
    /// A guest was unregistered without being deleted.
    Unregistered,
    /// A guest changed its run state.
    StateChanged,
    /// A guest's configuration changed.
    ConfigChanged,
    /// A guest started.
    Started,
    /// A guest stopped.
    Stopped,
    /// A paused guest continued.
    Continued,
    /// A suspended guest resumed.
    Resumed,
    /// Raw performance counters arrived.
    PerformanceSample,
    /// The connection to the host service was closed.
    ConnectionClosed,
    /// The host service is shutting down.
    Shutdown,
}

/// One raw performance counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Counter name, e.g. `cpu.user` or `disk.hdd0.read_bytes`.
    pub name: String,
    /// Counter value.
    pub value: u64,
}

impl Sample {
    /// Creates a sample.
    pub fn new(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Id of the guest the event is about; empty for host-wide events.
    pub issuer: String,
    /// Counters carried by [`EventKind::PerformanceSample`] events.
    #[serde(default)]
    pub samples: Vec<Sample>,
}

impl Event {
    /// Creates an event without samples.
    pub fn new(kind: EventKind, issuer: impl Into<String>) -> Self {
        Self {
            kind,
            issuer: issuer.into(),
            samples: Vec::new(),
        }
    }

    /// Returns the target the event is about.
    pub fn target(&self) -> Target {
        if self.issuer.is_empty() {
            Target::Host
        } else {
            Target::Guest(self.issuer.clone())
        }
    }
}

/// Callback the collector invokes for every event.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Host configuration and license counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostState {
    /// Maximum number of guests the host may run.
    pub limit_ves: i32,
    /// Guests allowed by the license.
    pub license_ves: i32,
    /// Containers allowed by the license.
    pub license_cts: i32,
    /// Virtual machines allowed by the license.
    pub license_vms: i32,
}

/// Host license usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostUsage {
    /// Containers counted against the license.
    pub license_cts_usage: i32,
    /// Virtual machines counted against the license.
    pub license_vms_usage: i32,
}

/// Guest configuration and run state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestState {
    /// Display name.
    pub name: String,
    /// Run state code as reported by the host.
    pub state: i32,
    /// Node the guest prefers to run on.
    pub perfect_node: String,
    /// Configured memory, bytes.
    pub memory_total: u64,
    /// Configured swap, bytes.
    pub swap_total: u64,
    /// Number of virtual CPUs.
    pub cpu_number: i32,
    /// CPU limit, percent.
    pub cpu_limit: i32,
    /// CPU weight.
    pub cpu_units: i32,
}

/// Usage counters of one virtual disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskUsage {
    /// Disk name.
    pub name: String,
    /// Capacity, bytes.
    pub total: u64,
    /// Used space, bytes.
    pub usage: u64,
    /// Completed read requests.
    pub read_requests: u64,
    /// Completed write requests.
    pub write_requests: u64,
    /// Bytes read.
    pub read_bytes: u64,
    /// Bytes written.
    pub write_bytes: u64,
}

/// Usage counters of one network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceUsage {
    /// Interface name.
    pub name: String,
    /// Bytes received.
    pub in_bytes: u64,
    /// Bytes sent.
    pub out_bytes: u64,
    /// Packets received.
    pub in_packets: u64,
    /// Packets sent.
    pub out_packets: u64,
}

/// Guest resource usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestUsage {
    /// Memory in use, bytes.
    pub memory_usage: u64,
    /// Swap in use, bytes.
    pub swap_usage: u64,
    /// System CPU time share.
    pub cpu_system: i32,
    /// User CPU time share.
    pub cpu_user: i32,
    /// Per-disk counters.
    pub disks: Vec<DiskUsage>,
    /// Per-interface counters.
    pub interfaces: Vec<InterfaceUsage>,
}

/// Result of [`Collector::pull_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityState {
    /// State of the host.
    Host(HostState),
    /// State of a guest.
    Guest(GuestState),
}

/// Result of [`Collector::pull_usage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityUsage {
    /// Usage of the host.
    Host(HostUsage),
    /// Usage of a guest.
    Guest(GuestUsage),
}

/// Access to the virtualization host.
pub trait Collector: Send + Sync {
    /// Opens the connection to the host service.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] if the service cannot be reached.
    fn connect(&self) -> Result<(), CollectorError>;

    /// Closes the connection. Never fails.
    fn disconnect(&self);

    /// Registers the callback receiving every host event.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] if the registration is refused.
    fn subscribe_events(&self, callback: EventCallback) -> Result<(), CollectorError>;

    /// Drops the event callback.
    fn unsubscribe_events(&self);

    /// Lists the ids of every guest on the host.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] on failure or timeout.
    fn list_guests(&self) -> Result<Vec<String>, CollectorError>;

    /// Returns `true` if the host knows a guest with this id.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] on failure or timeout.
    fn probe_guest(&self, id: &str) -> Result<bool, CollectorError>;

    /// Asks the host to emit performance samples for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] on failure or timeout.
    fn subscribe_samples(&self, target: &Target) -> Result<(), CollectorError>;

    /// Stops performance samples for `target`.
    fn unsubscribe_samples(&self, target: &Target);

    /// Fetches configuration and run state.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] on failure or timeout.
    fn pull_state(&self, target: &Target) -> Result<EntityState, CollectorError>;

    /// Fetches resource usage counters.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError`] on failure or timeout.
    fn pull_usage(&self, target: &Target) -> Result<EntityUsage, CollectorError>;
}
