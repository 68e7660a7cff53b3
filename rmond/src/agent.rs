//! Agent lifecycle: one-time wiring, start and stop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::catalog::Tables;
use crate::collector::Collector;
use crate::config::AgentConfig;
use crate::entity::{MetricFilter, MetricValue};
use crate::error::{AgentError, Result, SchedulerError};
use crate::scheduler::Scheduler;
use crate::server::Server;
use crate::sink::{MetricSource, Sink, Transport};
use crate::transaction::{RowActor, TableHandler, Trivial};

/// A fully wired monitoring agent.
///
/// Construction builds every table, the server, the sink and one
/// [`TableHandler`] per table; nothing runs until [`Agent::start`].
/// Dropping the agent stops it.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    tables: Tables,
    scheduler: Scheduler,
    server: Arc<Server>,
    sink: Arc<Sink>,
    handlers: BTreeMap<String, TableHandler>,
}

impl Agent {
    /// Wires an agent to `collector` and `transport`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        config: AgentConfig,
        collector: Arc<dyn Collector>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let tables = Tables::new()?;
        let scheduler = Scheduler::new();
        let server = Server::new(tables.clone(), collector, scheduler.clone(), &config);
        let sink = Sink::new(
            &tables,
            Arc::clone(&server) as Arc<dyn MetricSource>,
            transport,
            scheduler.clone(),
            &config.sink,
        );

        let mut handlers = BTreeMap::new();
        for table in tables.all() {
            let handler = if Arc::ptr_eq(table, &tables.sinx) {
                TableHandler::mutable(table, Arc::clone(&sink) as Arc<dyn RowActor>)
            } else if Arc::ptr_eq(table, &tables.metrix) {
                TableHandler::mutable(table, Arc::new(Trivial))
            } else {
                TableHandler::read_only(table)
            };
            handlers.insert(table.name().to_string(), handler);
        }

        Ok(Self {
            config,
            tables,
            scheduler,
            server,
            sink,
            handlers,
        })
    }

    /// Starts the scheduler, then queues the first connection attempt and
    /// the reaper.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::AlreadyStarted`] on a second call, or the
    /// scheduler's error if its worker cannot be spawned.
    pub fn start(&self) -> Result<()> {
        match self.scheduler.start() {
            Ok(()) => {}
            Err(SchedulerError::AlreadyRunning) => return Err(AgentError::AlreadyStarted.into()),
            Err(e) => return Err(e.into()),
        }
        self.server.schedule_link(Duration::ZERO);
        self.sink.schedule_reaper(self.config.reaper_period);
        info!("agent started");
        Ok(())
    }

    /// Stops the scheduler and tears the server down. Stopping a stopped
    /// agent does nothing.
    pub fn stop(&self) {
        if !self.scheduler.is_running() {
            return;
        }
        self.scheduler.stop();
        self.server.shutdown();
        info!("agent stopped");
    }

    /// Returns `true` between [`Agent::start`] and [`Agent::stop`].
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Returns the protocol handler of the table named `name`.
    pub fn handler(&self, name: &str) -> Option<&TableHandler> {
        self.handlers.get(name)
    }

    /// Returns the current values passing `filter`.
    pub fn snapshot(&self, filter: &MetricFilter) -> Vec<MetricValue> {
        self.server.snapshot(filter)
    }

    /// Returns every table.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Returns the sink.
    pub fn sink(&self) -> &Arc<Sink> {
        &self.sink
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}
