//! CLI for the rmond monitoring agent.
//!
//! Runs the agent against a static host inventory and pushes metrics to
//! the subscribers given on the command line, or prints the served tables.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rmond::catalog::{Tables, sinx};
use rmond::collector::{
    Collector, EntityState, EntityUsage, EventCallback, GuestState, GuestUsage, HostState,
    HostUsage, Target,
};
use rmond::error::CollectorError;
use rmond::table::Key;
use rmond::transaction::{Exchange, Request, RowStatus};
use rmond::value::Value;
use rmond::{Agent, AgentConfig, UdpTransport};

/// rmond: Table-driven monitoring agent for virtualization hosts.
#[derive(Parser)]
#[command(name = "rmond", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the agent until stdin closes.
    Run {
        /// JSON file describing the host and its guests.
        #[arg(long)]
        inventory: PathBuf,

        /// JSON agent configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Subscriber to push to, as host:port. May be repeated.
        #[arg(long = "sink", value_name = "HOST:PORT")]
        sinks: Vec<String>,

        /// Push period of the subscriptions, in period units.
        #[arg(long, default_value = "5")]
        period: i32,

        /// Number of pushes of each subscription.
        #[arg(long, default_value = "10")]
        acks: i32,

        /// Maximum values per message (0 = unlimited).
        #[arg(long, default_value = "0")]
        limit: i32,
    },

    /// List the served tables and their columns.
    Tables,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            inventory,
            config,
            sinks,
            period,
            acks,
            limit,
        } => cmd_run(&inventory, config.as_deref(), &sinks, period, acks, limit),
        Commands::Tables => cmd_tables(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `rmond run`.
fn cmd_run(
    inventory: &Path,
    config: Option<&Path>,
    sinks: &[String],
    period: i32,
    acks: i32,
    limit: i32,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    let collector = Arc::new(FixtureCollector::load(inventory)?);
    let transport = Arc::new(UdpTransport::new(&config.sink));
    let agent = Agent::new(config, collector, transport)?;
    agent.start()?;

    for sink in sinks {
        let key = parse_sink(sink)?;
        let mut exchange = Exchange::new(vec![
            Request::set(key.clone(), sinx::ROW_STATUS, RowStatus::CreateAndGo),
            Request::set(key.clone(), sinx::PERIOD, period),
            Request::set(key.clone(), sinx::ACKS, acks),
            Request::set(key.clone(), sinx::LIMIT, limit),
        ]);
        let handler = agent.handler("sinx").ok_or("sinx table is not served")?;
        let status = handler.apply(&mut exchange);
        if status.is_error() {
            return Err(format!("cannot subscribe {sink}: {status:?}").into());
        }
        info!(%key, "subscription added");
    }

    println!("rmond running; type quit or close stdin to stop");
    for line in std::io::stdin().lock().lines() {
        if line?.trim() == "quit" {
            break;
        }
    }
    agent.stop();
    Ok(())
}

/// Implements `rmond tables`.
fn cmd_tables() -> Result<(), Box<dyn std::error::Error>> {
    let tables = Tables::new()?;
    for table in tables.all() {
        let schema = table.schema();
        println!("{} ({})", schema.name(), schema.oid());
        for column in schema.columns() {
            let access = if column.mutable { "read-write" } else { "read-only" };
            println!(
                "  {:>3}  {:<12} {access}",
                column.id,
                column.protocol_type.to_string()
            );
        }
        println!();
    }
    Ok(())
}

/// Parses `host:port` into a `sinx` key.
fn parse_sink(text: &str) -> Result<Key, Box<dyn std::error::Error>> {
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got '{text}'"))?;
    let port: u16 = port
        .parse()
        .map_err(|e| format!("invalid port in '{text}': {e}"))?;
    Ok(Key::new(vec![Value::from(host), Value::Integer(i32::from(port))]))
}

/// The inventory file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Inventory {
    host: HostState,
    host_usage: HostUsage,
    guests: BTreeMap<String, FixtureGuest>,
}

/// One guest of the inventory.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
struct FixtureGuest {
    state: GuestState,
    usage: GuestUsage,
}

/// A collector serving a fixed inventory.
///
/// It never loses its connection and emits no events; the agent only sees
/// what the inventory file describes.
struct FixtureCollector {
    inventory: Inventory,
    callback: Mutex<Option<EventCallback>>,
}

impl FixtureCollector {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read inventory '{}': {e}", path.display()))?;
        let inventory: Inventory = serde_json::from_str(&data)?;
        info!(guests = inventory.guests.len(), "inventory loaded");
        Ok(Self {
            inventory,
            callback: Mutex::new(None),
        })
    }

    fn guest(&self, id: &str) -> Result<&FixtureGuest, CollectorError> {
        self.inventory
            .guests
            .get(id)
            .ok_or_else(|| CollectorError::UnknownEntity { id: id.to_string() })
    }
}

impl Collector for FixtureCollector {
    fn connect(&self) -> Result<(), CollectorError> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn subscribe_events(&self, callback: EventCallback) -> Result<(), CollectorError> {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
        Ok(())
    }

    fn unsubscribe_events(&self) {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn list_guests(&self) -> Result<Vec<String>, CollectorError> {
        Ok(self.inventory.guests.keys().cloned().collect())
    }

    fn probe_guest(&self, id: &str) -> Result<bool, CollectorError> {
        Ok(self.inventory.guests.contains_key(id))
    }

    fn subscribe_samples(&self, _: &Target) -> Result<(), CollectorError> {
        Ok(())
    }

    fn unsubscribe_samples(&self, _: &Target) {}

    fn pull_state(&self, target: &Target) -> Result<EntityState, CollectorError> {
        match target {
            Target::Host => Ok(EntityState::Host(self.inventory.host.clone())),
            Target::Guest(id) => Ok(EntityState::Guest(self.guest(id)?.state.clone())),
        }
    }

    fn pull_usage(&self, target: &Target) -> Result<EntityUsage, CollectorError> {
        match target {
            Target::Host => Ok(EntityUsage::Host(self.inventory.host_usage.clone())),
            Target::Guest(id) => Ok(EntityUsage::Guest(self.guest(id)?.usage.clone())),
        }
    }
}
