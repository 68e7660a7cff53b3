//! Error types for the rmond monitoring agent.

use std::path::PathBuf;

use thiserror::Error;

use crate::value::ProtocolType;

/// The main error type for all rmond operations.
///
/// This enum covers every failure the engine can surface to its embedder,
/// from schema validation through table mutation, scheduling, collection and
/// push delivery.
#[derive(Error, Debug)]
pub enum RmondError {
    /// Error during schema validation.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Error during a table operation.
    #[error("table error: {0}")]
    Table(#[from] TableError),

    /// Error from the job scheduler.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Error from the collector collaborator.
    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),

    /// Error while pushing metrics to a subscriber.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Error while loading configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error from the agent lifecycle.
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    /// A protocol-level failure of a table request.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors that can occur during schema validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The schema declares no columns.
    #[error("schema '{name}' declares no columns")]
    NoColumns {
        /// The schema name.
        name: String,
    },

    /// Two columns share the same id.
    #[error("schema '{name}' declares column {column} twice")]
    DuplicateColumn {
        /// The schema name.
        name: String,
        /// The duplicated column id.
        column: u32,
    },

    /// An index column is not declared in the column list.
    #[error("schema '{name}' indexes undeclared column {column}")]
    UnknownIndexColumn {
        /// The schema name.
        name: String,
        /// The missing column id.
        column: u32,
    },

    /// An index column was declared mutable.
    #[error("schema '{name}': index column {column} cannot be mutable")]
    MutableIndexColumn {
        /// The schema name.
        name: String,
        /// The offending column id.
        column: u32,
    },

    /// The RowStatus column is missing, not an integer, read-only, or part of the index.
    #[error("schema '{name}': invalid RowStatus column {column}: {reason}")]
    InvalidRowStatus {
        /// The schema name.
        name: String,
        /// The RowStatus column id.
        column: u32,
        /// Why the column cannot carry the row status.
        reason: String,
    },
}

/// Errors that can occur during table operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// A row with the same key already exists.
    #[error("table '{table}' already holds a row with key {key}")]
    DuplicateKey {
        /// The table name.
        table: String,
        /// The conflicting key, rendered.
        key: String,
    },

    /// No row exists under the given key.
    #[error("table '{table}' has no row with key {key}")]
    NotFound {
        /// The table name.
        table: String,
        /// The missing key, rendered.
        key: String,
    },

    /// A key does not match the schema's index columns.
    #[error("table '{table}': invalid key: {reason}")]
    InvalidKey {
        /// The table name.
        table: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// The column is not declared by the schema.
    #[error("table '{table}' has no column {column}")]
    UnknownColumn {
        /// The table name.
        table: String,
        /// The unknown column id.
        column: u32,
    },

    /// A value of the wrong protocol type was written to a column.
    #[error("table '{table}': column {column} expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        /// The table name.
        table: String,
        /// The column id.
        column: u32,
        /// The declared type.
        expected: ProtocolType,
        /// The supplied type.
        actual: ProtocolType,
    },

    /// An attempt was made to change a key-composing column.
    #[error("table '{table}': column {column} is part of the row key")]
    IndexColumn {
        /// The table name.
        table: String,
        /// The column id.
        column: u32,
    },

    /// An attempt was made to write a read-only column through the protocol.
    #[error("table '{table}': column {column} is read-only")]
    ReadOnlyColumn {
        /// The table name.
        table: String,
        /// The column id.
        column: u32,
    },
}

/// Errors that can occur when driving the job scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The scheduler worker is already running.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// The scheduler worker is not running.
    #[error("scheduler is not running")]
    NotRunning,

    /// The worker thread could not be spawned.
    #[error("failed to spawn scheduler worker: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by the collector collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    /// The host SDK could not be reached or refused the call.
    #[error("collector unavailable: {reason}")]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The call did not complete within the collaborator's timeout.
    #[error("collector call '{call}' timed out")]
    Timeout {
        /// Name of the call that timed out.
        call: String,
    },

    /// The requested entity is not known to the host.
    #[error("unknown entity '{id}'")]
    UnknownEntity {
        /// The entity id.
        id: String,
    },
}

/// Errors that can occur while pushing a batch to a subscriber.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The destination could not be resolved to a socket address.
    #[error("cannot resolve destination {host}:{port}")]
    Resolve {
        /// The destination host.
        host: String,
        /// The destination port.
        port: u16,
    },

    /// A socket could not be opened or configured.
    #[error("socket error: {source}")]
    Socket {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Sending a message failed or timed out.
    #[error("send to {destination} failed: {source}")]
    Send {
        /// The destination address.
        destination: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The message could not be encoded.
    #[error("failed to encode push message: {reason}")]
    Encode {
        /// Description of the failure.
        reason: String,
    },
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`AgentConfig`](crate::config::AgentConfig).
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of what's invalid.
        reason: String,
    },
}

/// Errors from the agent start/stop lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// `start` was called on an agent that is already running.
    #[error("the agent has already been started")]
    AlreadyStarted,
}

/// Protocol-neutral failure of a table request.
///
/// The management-protocol layer maps each variant onto its own wire status.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolError {
    /// The row or column does not exist.
    #[error("no such object")]
    NoSuchObject,

    /// The value is not acceptable for the column.
    #[error("wrong value")]
    WrongValue,

    /// The value conflicts with the current state of the table.
    #[error("inconsistent value")]
    InconsistentValue,

    /// Any other failure.
    #[error("general error")]
    GenErr,
}

impl ProtocolError {
    /// Returns the status code the protocol layer reports for this error.
    pub fn status(self) -> Status {
        match self {
            Self::NoSuchObject => Status::NoSuchObject,
            Self::WrongValue => Status::WrongValue,
            Self::InconsistentValue => Status::InconsistentValue,
            Self::GenErr => Status::GenErr,
        }
    }
}

impl From<TableError> for ProtocolError {
    fn from(error: TableError) -> Self {
        match error {
            TableError::DuplicateKey { .. } => Self::InconsistentValue,
            TableError::NotFound { .. } | TableError::UnknownColumn { .. } => Self::NoSuchObject,
            TableError::TypeMismatch { .. } | TableError::InvalidKey { .. } => Self::WrongValue,
            TableError::IndexColumn { .. } | TableError::ReadOnlyColumn { .. } => {
                Self::NoSuchObject
            }
        }
    }
}

/// Result status of a table request, with SNMP-compatible numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// The request succeeded.
    #[default]
    NoError,
    /// See [`ProtocolError::NoSuchObject`].
    NoSuchObject,
    /// See [`ProtocolError::WrongValue`].
    WrongValue,
    /// See [`ProtocolError::InconsistentValue`].
    InconsistentValue,
    /// See [`ProtocolError::GenErr`].
    GenErr,
}

impl Status {
    /// Returns the numeric code of this status.
    pub fn code(self) -> i32 {
        match self {
            Self::NoError => 0,
            Self::GenErr => 5,
            Self::WrongValue => 10,
            Self::InconsistentValue => 12,
            Self::NoSuchObject => 128,
        }
    }

    /// Returns `true` when the status reports a failure.
    pub fn is_error(self) -> bool {
        self != Self::NoError
    }
}

impl From<ProtocolError> for Status {
    fn from(error: ProtocolError) -> Self {
        error.status()
    }
}

/// Type alias for `Result<T, RmondError>`.
pub type Result<T> = std::result::Result<T, RmondError>;
