//! The agent's metric catalog: every table it serves and their OIDs.
//!
//! All tables live under the product subtree `1.3.6.1.4.1.26171.1.1`. Host
//! scalars sit directly under it (`.101` to `.107`); tables hang off their
//! own arc.

use std::sync::Arc;

use crate::error::Result;
use crate::schema::{Column, Schema};
use crate::table::Table;
use crate::value::{Oid, ProtocolType};

/// The product subtree every table lives under.
pub const PRODUCT: [u32; 9] = [1, 3, 6, 1, 4, 1, 26171, 1, 1];

/// Subtree under which push notifications are identified.
pub const TRAPS: [u32; 8] = [1, 3, 6, 1, 4, 1, 26171, 2];

/// Host scalar columns.
pub mod host {
    /// Number of monitored guests.
    pub const LOCAL_VES: u32 = 101;
    /// Maximum number of guests.
    pub const LIMIT_VES: u32 = 102;
    /// Guests allowed by the license.
    pub const LICENSE_VES: u32 = 103;
    /// Containers allowed by the license.
    pub const LICENSE_CTS: u32 = 104;
    /// Virtual machines allowed by the license.
    pub const LICENSE_VMS: u32 = 105;
    /// Containers counted against the license.
    pub const LICENSE_CTS_USAGE: u32 = 106;
    /// Virtual machines counted against the license.
    pub const LICENSE_VMS_USAGE: u32 = 107;
}

/// Guest table columns.
pub mod ves {
    /// Table arc under the product subtree.
    pub const ARC: u32 = 55;
    /// Guest id (index).
    pub const VEID: u32 = 1;
    /// Display name.
    pub const NAME: u32 = 2;
    /// Run state.
    pub const STATE: u32 = 3;
    /// Preferred node.
    pub const PERFECT_NODE: u32 = 4;
    /// Configured memory.
    pub const MEMORY_TOTAL: u32 = 5;
    /// Memory in use.
    pub const MEMORY_USAGE: u32 = 6;
    /// Configured swap.
    pub const SWAP_TOTAL: u32 = 7;
    /// Swap in use.
    pub const SWAP_USAGE: u32 = 8;
    /// Virtual CPU count.
    pub const CPU_NUMBER: u32 = 9;
    /// CPU limit.
    pub const CPU_LIMIT: u32 = 10;
    /// CPU weight.
    pub const CPU_UNITS: u32 = 11;
    /// System CPU share.
    pub const CPU_SYSTEM: u32 = 12;
    /// User CPU share.
    pub const CPU_USER: u32 = 13;
}

/// Guest disk table columns, keyed by guest id then disk name.
pub mod vhds {
    /// Table arc under the product subtree.
    pub const ARC: u32 = 56;
    /// Disk name (index).
    pub const NAME: u32 = 1;
    /// Capacity.
    pub const TOTAL: u32 = 2;
    /// Used space.
    pub const USAGE: u32 = 3;
    /// Read requests.
    pub const READ_REQUESTS: u32 = 4;
    /// Write requests.
    pub const WRITE_REQUESTS: u32 = 5;
    /// Bytes read.
    pub const READ_BYTES: u32 = 6;
    /// Bytes written.
    pub const WRITE_BYTES: u32 = 7;
}

/// Guest network interface table columns, keyed by guest id then name.
pub mod veths {
    /// Table arc under the product subtree.
    pub const ARC: u32 = 57;
    /// Interface name (index).
    pub const NAME: u32 = 1;
    /// Bytes received.
    pub const IN_BYTES: u32 = 2;
    /// Bytes sent.
    pub const OUT_BYTES: u32 = 3;
    /// Packets received.
    pub const IN_PACKETS: u32 = 4;
    /// Packets sent.
    pub const OUT_PACKETS: u32 = 5;
}

/// Subscription table columns, keyed by destination host and port.
pub mod sinx {
    /// Table arc under the product subtree.
    pub const ARC: u32 = 51;
    /// Destination host (index).
    pub const HOST: u32 = 1;
    /// Destination port (index).
    pub const PORT: u32 = 2;
    /// Push period, in period units.
    pub const PERIOD: u32 = 3;
    /// Maximum values per push; zero or less means unlimited.
    pub const LIMIT: u32 = 4;
    /// Remaining pushes.
    pub const ACKS: u32 = 5;
    /// RowStatus.
    pub const ROW_STATUS: u32 = 6;
    /// Correlation ticket echoed in every push.
    pub const TICKET: u32 = 7;
}

/// Metric filter table columns, keyed by subscription key then metric OID.
pub mod metrix {
    /// Table arc under the product subtree.
    pub const ARC: u32 = 52;
    /// Column OID of a wanted metric (index).
    pub const METRIC: u32 = 1;
    /// RowStatus.
    pub const ROW_STATUS: u32 = 2;
}

fn table_oid(arc: u32) -> Oid {
    Oid::new(PRODUCT).child(arc)
}

/// Schema of the host scalar group.
///
/// # Errors
///
/// Never fails for the built-in definition; the `Result` reflects
/// [`Schema::new`].
pub fn host_schema() -> Result<Schema> {
    use host::*;
    let columns = [
        LOCAL_VES,
        LIMIT_VES,
        LICENSE_VES,
        LICENSE_CTS,
        LICENSE_VMS,
        LICENSE_CTS_USAGE,
        LICENSE_VMS_USAGE,
    ]
    .into_iter()
    .map(|id| Column::read_only(id, ProtocolType::Integer))
    .collect();
    Schema::new("host", Oid::new(PRODUCT), columns, vec![], None)
}

/// Schema of the guest table.
///
/// # Errors
///
/// See [`host_schema`].
pub fn ves_schema() -> Result<Schema> {
    use ves::*;
    Schema::new(
        "ves",
        table_oid(ARC),
        vec![
            Column::read_only(VEID, ProtocolType::OctetString),
            Column::read_only(NAME, ProtocolType::OctetString),
            Column::read_only(STATE, ProtocolType::Integer),
            Column::read_only(PERFECT_NODE, ProtocolType::OctetString),
            Column::read_only(MEMORY_TOTAL, ProtocolType::Counter64),
            Column::read_only(MEMORY_USAGE, ProtocolType::Counter64),
            Column::read_only(SWAP_TOTAL, ProtocolType::Counter64),
            Column::read_only(SWAP_USAGE, ProtocolType::Counter64),
            Column::read_only(CPU_NUMBER, ProtocolType::Integer),
            Column::read_only(CPU_LIMIT, ProtocolType::Integer),
            Column::read_only(CPU_UNITS, ProtocolType::Integer),
            Column::read_only(CPU_SYSTEM, ProtocolType::Integer),
            Column::read_only(CPU_USER, ProtocolType::Integer),
        ],
        vec![VEID],
        None,
    )
}

/// Schema of the guest disk table.
///
/// # Errors
///
/// See [`host_schema`].
pub fn vhds_schema() -> Result<Schema> {
    use vhds::*;
    let mut columns = vec![Column::read_only(NAME, ProtocolType::OctetString)];
    columns.extend(
        [TOTAL, USAGE, READ_REQUESTS, WRITE_REQUESTS, READ_BYTES, WRITE_BYTES]
            .into_iter()
            .map(|id| Column::read_only(id, ProtocolType::Counter64)),
    );
    Ok(Schema::new("vhds", table_oid(ARC), columns, vec![NAME], None)?
        .with_parent_index([ProtocolType::OctetString]))
}

/// Schema of the guest network interface table.
///
/// # Errors
///
/// See [`host_schema`].
pub fn veths_schema() -> Result<Schema> {
    use veths::*;
    let mut columns = vec![Column::read_only(NAME, ProtocolType::OctetString)];
    columns.extend(
        [IN_BYTES, OUT_BYTES, IN_PACKETS, OUT_PACKETS]
            .into_iter()
            .map(|id| Column::read_only(id, ProtocolType::Counter64)),
    );
    Ok(Schema::new("veths", table_oid(ARC), columns, vec![NAME], None)?
        .with_parent_index([ProtocolType::OctetString]))
}

/// Schema of the subscription table.
///
/// # Errors
///
/// See [`host_schema`].
pub fn sinx_schema() -> Result<Schema> {
    use sinx::*;
    Schema::new(
        "sinx",
        table_oid(ARC),
        vec![
            Column::read_only(HOST, ProtocolType::OctetString),
            Column::read_only(PORT, ProtocolType::Integer),
            Column::read_write(PERIOD, ProtocolType::Integer),
            Column::read_write(LIMIT, ProtocolType::Integer),
            Column::read_write(ACKS, ProtocolType::Integer),
            Column::read_write(ROW_STATUS, ProtocolType::Integer),
            Column::read_write(TICKET, ProtocolType::OctetString),
        ],
        vec![HOST, PORT],
        Some(ROW_STATUS),
    )
}

/// Schema of the metric filter table.
///
/// # Errors
///
/// See [`host_schema`].
pub fn metrix_schema() -> Result<Schema> {
    use metrix::*;
    Ok(Schema::new(
        "metrix",
        table_oid(ARC),
        vec![
            Column::read_only(METRIC, ProtocolType::ObjectId),
            Column::read_write(ROW_STATUS, ProtocolType::Integer),
        ],
        vec![METRIC],
        Some(ROW_STATUS),
    )?
    .with_parent_index([ProtocolType::OctetString, ProtocolType::Integer]))
}

/// Every table the agent serves.
#[derive(Debug, Clone)]
pub struct Tables {
    /// Host scalars.
    pub host: Arc<Table>,
    /// Guests.
    pub ves: Arc<Table>,
    /// Guest disks.
    pub vhds: Arc<Table>,
    /// Guest network interfaces.
    pub veths: Arc<Table>,
    /// Subscriptions.
    pub sinx: Arc<Table>,
    /// Metric filters.
    pub metrix: Arc<Table>,
}

impl Tables {
    /// Creates every table, empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in schema fails validation.
    pub fn new() -> Result<Self> {
        Ok(Self {
            host: Arc::new(Table::new(host_schema()?)),
            ves: Arc::new(Table::new(ves_schema()?)),
            vhds: Arc::new(Table::new(vhds_schema()?)),
            veths: Arc::new(Table::new(veths_schema()?)),
            sinx: Arc::new(Table::new(sinx_schema()?)),
            metrix: Arc::new(Table::new(metrix_schema()?)),
        })
    }

    /// Returns every table, subscriptions first.
    pub fn all(&self) -> [&Arc<Table>; 6] {
        [
            &self.sinx,
            &self.metrix,
            &self.ves,
            &self.vhds,
            &self.veths,
            &self.host,
        ]
    }

    /// Looks a table up by name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<Table>> {
        self.all().into_iter().find(|t| t.name() == name)
    }
}
