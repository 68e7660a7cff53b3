//! # rmond
//!
//! Table-driven monitoring agent engine for virtualization hosts.
//!
//! rmond exposes live metrics of a host and the guests running on it as
//! typed, indexed management-protocol tables. Management sessions read the
//! tables with get/get-next and create or destroy subscription rows through
//! the standard RowStatus transaction; subscribers then receive periodic,
//! batched pushes of the metrics they selected until their ack budget runs
//! out.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Runtime schemas: one generic table engine serves every table
//! - Reserve/action/commit row transactions with full rollback
//! - A single scheduler thread drives polling, retries, delivery and reaping
//! - Background jobs hold weak references, so teardown is just removal
//! - The host SDK and the wire transport are traits, easy to fake in tests
//!
//! ## Quick Start
//!
//! ```rust
//! use rmond::catalog::{sinx, Tables};
//! use rmond::table::Key;
//! use rmond::transaction::{Exchange, Request, RowStatus, TableHandler, Trivial};
//! use rmond::value::Value;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tables = Tables::new()?;
//! let handler = TableHandler::mutable(&tables.sinx, Arc::new(Trivial));
//!
//! // Create a subscription row for 10.0.0.1:162 with 5 pushes.
//! let key = Key::new(vec![Value::from("10.0.0.1"), Value::Integer(162)]);
//! let mut exchange = Exchange::new(vec![
//!     Request::set(key.clone(), sinx::ROW_STATUS, RowStatus::CreateAndGo),
//!     Request::set(key.clone(), sinx::ACKS, 5),
//! ]);
//! assert!(!handler.apply(&mut exchange).is_error());
//!
//! let row = tables.sinx.find(&key).expect("row was created");
//! assert_eq!(row.get(sinx::ROW_STATUS), Some(RowStatus::Active.into()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Agent`]: Top-level handle; wires tables, server, sink and scheduler
//! - [`Server`]: Tracks host and guest entities from collector events
//! - [`Sink`]: Delivers subscriptions and reaps exhausted ones
//! - [`TableHandler`]: Protocol entry point of one table
//!
//! ## Modules
//!
//! - [`value`]: OIDs, protocol types and typed values
//! - [`schema`]: Table schemas and OID naming
//! - [`table`]: Ordered, thread-safe row storage
//! - [`transaction`]: RowStatus row lifecycle
//! - [`dispatch`]: Code to handler routing
//! - [`scheduler`]: Timer-ordered jobs on one worker thread
//! - [`collector`]: The host SDK seam
//! - [`catalog`]: The tables the agent serves
//! - [`entity`]: Host and guest entities
//! - [`registry`]: Process-wide server registry
//! - [`server`]: Entity orchestration
//! - [`sink`]: Push subscriptions
//! - [`config`]: Agent configuration
//! - [`agent`]: Lifecycle
//! - [`error`]: Error types

pub mod agent;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod sink;
pub mod table;
pub mod transaction;
pub mod value;

// Re-export primary API types at crate root for convenience.
pub use agent::Agent;
pub use collector::{Collector, Event, EventKind, Target};
pub use config::AgentConfig;
pub use entity::{MetricFilter, MetricValue};
pub use error::{Result, RmondError};
pub use scheduler::Scheduler;
pub use server::Server;
pub use sink::{Sink, Transport, UdpTransport};
pub use table::{Key, Table};
pub use transaction::TableHandler;
