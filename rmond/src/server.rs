//! The orchestrator: entities, host events and periodic refresh.
//!
//! A [`Server`] is either detached from the collector or attached to it.
//! Attaching lists the guests, installs one entity per guest plus the host
//! entity, schedules a refresh job for each and subscribes to host events.
//! Losing the connection tears every entity down and schedules a reconnect.
//!
//! One coarse lock guards the link state and the entity map. It is never
//! held across a collector call: each operation copies what it needs out,
//! releases the lock, talks to the collector, then re-acquires the lock to
//! publish the result.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::Tables;
use crate::collector::{Collector, Event, EventCallback, EventKind, Target};
use crate::config::AgentConfig;
use crate::dispatch::Dispatcher;
use crate::entity::{Entity, GuestEntity, HostEntity, MetricFilter, MetricValue};
use crate::error::CollectorError;
use crate::registry::{self, ServerHandle};
use crate::scheduler::Scheduler;

/// Whether the server is connected to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected; a reconnect may be pending.
    Detached,
    /// Connected and subscribed to host events.
    Attached,
}

type EventHandler = fn(&Server, &Event);

struct Slot<E> {
    serial: u64,
    entity: Arc<E>,
}

struct Inner {
    state: LinkState,
    handle: Option<ServerHandle>,
    serial: u64,
    host: Option<Slot<HostEntity>>,
    guests: BTreeMap<String, Slot<GuestEntity>>,
}

impl Inner {
    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    fn local_ves(&self) -> Option<(Arc<HostEntity>, usize)> {
        self.host
            .as_ref()
            .map(|h| (Arc::clone(&h.entity), self.guests.len()))
    }
}

/// Monitors one virtualization host through a [`Collector`].
pub struct Server {
    this: Weak<Server>,
    tables: Tables,
    collector: Arc<dyn Collector>,
    scheduler: Scheduler,
    connect_retry: Duration,
    collect_period: Duration,
    events: Dispatcher<EventKind, EventHandler>,
    inner: Mutex<Inner>,
}

impl Server {
    /// Creates a detached server writing into `tables`.
    pub fn new(
        tables: Tables,
        collector: Arc<dyn Collector>,
        scheduler: Scheduler,
        config: &AgentConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            tables,
            collector,
            scheduler,
            connect_retry: config.connect_retry,
            collect_period: config.collect_period,
            events: event_routes(),
            inner: Mutex::new(Inner {
                state: LinkState::Detached,
                handle: None,
                serial: 0,
                host: None,
                guests: BTreeMap::new(),
            }),
        })
    }

    /// Returns the tables the server writes into.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Returns the current link state.
    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    /// Returns the registry handle while attached.
    pub fn handle(&self) -> Option<ServerHandle> {
        self.lock().handle
    }

    /// Returns the ids of the monitored guests, in order.
    pub fn guest_ids(&self) -> Vec<String> {
        self.lock().guests.keys().cloned().collect()
    }

    /// Queues a connection attempt after `delay`.
    ///
    /// The job holds only a weak reference and does nothing once the server
    /// is gone.
    pub fn schedule_link(&self, delay: Duration) {
        let server = self.this.clone();
        let pushed = self.scheduler.push(delay, move |_| {
            if let Some(server) = server.upgrade() {
                // The error is already logged and a retry scheduled.
                let _ = server.link();
            }
        });
        if let Err(e) = pushed {
            debug!("connection attempt not scheduled: {e}");
        }
    }

    /// Connects and attaches, scheduling a retry on failure.
    ///
    /// Does nothing when already attached.
    ///
    /// # Errors
    ///
    /// Returns the collector error that prevented attaching.
    pub fn link(&self) -> Result<(), CollectorError> {
        if self.state() == LinkState::Attached {
            return Ok(());
        }
        let attached = self.collector.connect().and_then(|()| self.attach());
        if let Err(e) = &attached {
            warn!(retry_in = ?self.connect_retry, "cannot attach to the host: {e}");
            self.collector.disconnect();
            self.schedule_link(self.connect_retry);
        }
        attached
    }

    fn attach(&self) -> Result<(), CollectorError> {
        let ids = self.collector.list_guests()?;
        let host = Arc::new(HostEntity::new(&self.tables).map_err(unavailable)?);
        let mut guests = Vec::with_capacity(ids.len());
        for id in ids {
            match GuestEntity::new(id, &self.tables) {
                Ok(guest) => guests.push(Arc::new(guest)),
                Err(e) => {
                    host.teardown();
                    guests.iter().for_each(|g| g.teardown());
                    return Err(unavailable(e));
                }
            }
        }
        self.subscribe_samples(&Target::Host);
        for guest in &guests {
            self.subscribe_samples(guest.target());
        }

        let mut jobs = Vec::with_capacity(guests.len() + 1);
        let local_ves = guests.len();
        {
            let mut inner = self.lock();
            let serial = inner.next_serial();
            inner.host = Some(Slot {
                serial,
                entity: Arc::clone(&host),
            });
            jobs.push((Target::Host, serial));
            for guest in guests {
                let serial = inner.next_serial();
                jobs.push((guest.target().clone(), serial));
                inner
                    .guests
                    .insert(guest.id().to_string(), Slot { serial, entity: guest });
            }
            inner.state = LinkState::Attached;
        }
        for (target, serial) in jobs {
            self.schedule_refresh(target, serial, true);
        }
        host.set_local_ves(local_ves);

        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };
        let handle = registry::register(&this);
        self.lock().handle = Some(handle);
        let callback: EventCallback = Arc::new(move |event: Event| {
            if let Some(server) = registry::lookup(handle) {
                server.handle_event(&event);
            }
        });
        if let Err(e) = self.collector.subscribe_events(callback) {
            self.release();
            return Err(e);
        }
        info!(%handle, guests = local_ves, "attached to the host");
        Ok(())
    }

    /// Tears down every entity and schedules a reconnect.
    pub fn detach(&self) {
        if self.release() {
            info!(retry_in = ?self.connect_retry, "detached from the host");
            self.collector.disconnect();
            self.schedule_link(self.connect_retry);
        }
    }

    /// Tears down every entity without reconnecting.
    pub fn shutdown(&self) {
        if self.release() {
            self.collector.disconnect();
            info!("server shut down");
        }
    }

    /// Leaves the attached state. Returns `false` if already detached.
    fn release(&self) -> bool {
        let (handle, host, guests) = {
            let mut inner = self.lock();
            if inner.state == LinkState::Detached {
                return false;
            }
            inner.state = LinkState::Detached;
            (
                inner.handle.take(),
                inner.host.take(),
                std::mem::take(&mut inner.guests),
            )
        };
        if let Some(handle) = handle {
            registry::unregister(handle);
        }
        self.collector.unsubscribe_events();
        for slot in guests.into_values() {
            self.collector.unsubscribe_samples(slot.entity.target());
            slot.entity.teardown();
        }
        if let Some(slot) = host {
            self.collector.unsubscribe_samples(slot.entity.target());
            slot.entity.teardown();
        }
        true
    }

    /// Routes a host event to its handler.
    pub fn handle_event(&self, event: &Event) {
        self.events.dispatch(&event.kind, self, event);
    }

    /// Refreshes the state of the entity `id` names, creating a guest entity
    /// for an id the host knows but the server does not.
    ///
    /// An empty `id` names the host.
    pub fn pull(&self, id: &str) {
        let known: Option<Arc<dyn Entity>> = {
            let inner = self.lock();
            if inner.state != LinkState::Attached {
                return;
            }
            if id.is_empty() {
                inner.host.as_ref().map(|h| Arc::clone(&h.entity) as Arc<dyn Entity>)
            } else {
                inner
                    .guests
                    .get(id)
                    .map(|g| Arc::clone(&g.entity) as Arc<dyn Entity>)
            }
        };
        if let Some(entity) = known {
            if let Err(e) = entity.pull_state(self.collector.as_ref()) {
                warn!(entity = %entity.target(), "state refresh failed: {e}");
            }
            return;
        }
        if id.is_empty() {
            return;
        }

        match self.collector.probe_guest(id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(guest = id, "event for an unknown guest");
                return;
            }
            Err(e) => {
                warn!(guest = id, "cannot probe guest: {e}");
                return;
            }
        }
        let guest = match GuestEntity::new(id, &self.tables) {
            Ok(guest) => Arc::new(guest),
            Err(e) => {
                warn!(guest = id, "cannot install guest: {e}");
                return;
            }
        };
        if let Err(e) = guest.pull_state(self.collector.as_ref()) {
            warn!(guest = id, "state refresh failed: {e}");
        }
        self.subscribe_samples(guest.target());

        let (serial, local_ves) = {
            let mut inner = self.lock();
            if inner.state != LinkState::Attached {
                // Detached while the collector was being asked; release()
                // never saw this guest, so its subscription is ours to drop.
                drop(inner);
                self.collector.unsubscribe_samples(guest.target());
                guest.teardown();
                return;
            }
            if inner.guests.contains_key(id) {
                return;
            }
            let serial = inner.next_serial();
            inner.guests.insert(
                id.to_string(),
                Slot {
                    serial,
                    entity: Arc::clone(&guest),
                },
            );
            (serial, inner.local_ves())
        };
        info!(guest = id, "guest added");
        if let Some((host, count)) = local_ves {
            host.set_local_ves(count);
        }
        self.schedule_refresh(guest.target().clone(), serial, false);
    }

    /// Stops monitoring guest `id` and erases its rows.
    pub fn erase(&self, id: &str) {
        let (removed, local_ves) = {
            let mut inner = self.lock();
            let removed = inner.guests.remove(id);
            (removed, inner.local_ves())
        };
        let Some(slot) = removed else {
            return;
        };
        self.collector.unsubscribe_samples(slot.entity.target());
        slot.entity.teardown();
        info!(guest = id, "guest removed");
        if let Some((host, count)) = local_ves {
            host.set_local_ves(count);
        }
    }

    /// Returns the current values of the host, then every guest in id order,
    /// that pass `filter`.
    pub fn snapshot(&self, filter: &MetricFilter) -> Vec<MetricValue> {
        let entities: Vec<Arc<dyn Entity>> = {
            let inner = self.lock();
            inner
                .host
                .iter()
                .map(|h| Arc::clone(&h.entity) as Arc<dyn Entity>)
                .chain(
                    inner
                        .guests
                        .values()
                        .map(|g| Arc::clone(&g.entity) as Arc<dyn Entity>),
                )
                .collect()
        };
        entities.iter().flat_map(|e| e.snapshot(filter)).collect()
    }

    fn apply_samples(&self, event: &Event) {
        let entity: Option<Arc<dyn Entity>> = {
            let inner = self.lock();
            match event.target() {
                Target::Host => inner
                    .host
                    .as_ref()
                    .map(|h| Arc::clone(&h.entity) as Arc<dyn Entity>),
                Target::Guest(id) => inner
                    .guests
                    .get(&id)
                    .map(|g| Arc::clone(&g.entity) as Arc<dyn Entity>),
            }
        };
        if let Some(entity) = entity {
            entity.apply_samples(&event.samples);
        }
    }

    /// Returns the entity `target` names if it is still the one installed
    /// under `serial`.
    fn current(&self, target: &Target, serial: u64) -> Option<Arc<dyn Entity>> {
        let inner = self.lock();
        match target {
            Target::Host => inner
                .host
                .as_ref()
                .filter(|h| h.serial == serial)
                .map(|h| Arc::clone(&h.entity) as Arc<dyn Entity>),
            Target::Guest(id) => inner
                .guests
                .get(id)
                .filter(|g| g.serial == serial)
                .map(|g| Arc::clone(&g.entity) as Arc<dyn Entity>),
        }
    }

    fn subscribe_samples(&self, target: &Target) {
        if let Err(e) = self.collector.subscribe_samples(target) {
            warn!(%target, "cannot subscribe to performance samples: {e}");
        }
    }

    fn schedule_refresh(&self, target: Target, serial: u64, first: bool) {
        let job = RefreshJob {
            server: self.this.clone(),
            target,
            serial,
            first,
        };
        if let Err(e) = self.scheduler.push(Duration::ZERO, move |s| job.run(s)) {
            debug!("refresh not scheduled: {e}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Server")
            .field("state", &inner.state)
            .field("handle", &inner.handle)
            .field("guests", &inner.guests.len())
            .finish_non_exhaustive()
    }
}

fn unavailable(e: impl fmt::Display) -> CollectorError {
    CollectorError::Unavailable {
        reason: e.to_string(),
    }
}

/// Periodic refresh of one entity.
///
/// Pulls state on its first run and usage on every run, then reschedules
/// itself. Stops silently once the server is gone or the entity was
/// removed or replaced.
struct RefreshJob {
    server: Weak<Server>,
    target: Target,
    serial: u64,
    first: bool,
}

impl RefreshJob {
    fn run(self, scheduler: &Scheduler) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let Some(entity) = server.current(&self.target, self.serial) else {
            debug!(entity = %self.target, "refresh of a retired entity dropped");
            return;
        };
        let collector = server.collector.as_ref();
        if self.first {
            if let Err(e) = entity.pull_state(collector) {
                warn!(entity = %self.target, "state refresh failed: {e}");
            }
        }
        if let Err(e) = entity.pull_usage(collector) {
            warn!(entity = %self.target, "usage refresh failed: {e}");
        }
        let period = server.collect_period;
        let next = Self {
            first: false,
            ..self
        };
        if let Err(e) = scheduler.push(period, move |s| next.run(s)) {
            debug!("refresh not rescheduled: {e}");
        }
    }
}

fn event_routes() -> Dispatcher<EventKind, EventHandler> {
    Dispatcher::new(ignore as EventHandler)
        .route(EventKind::ConnectionClosed, on_disconnect)
        .route(EventKind::Shutdown, on_disconnect)
        .route(EventKind::PerformanceSample, on_samples)
        .route(EventKind::Removed, on_removed)
        .route(EventKind::Unregistered, on_removed)
        .route(EventKind::Added, on_changed)
        .route(EventKind::StateChanged, on_changed)
        .route(EventKind::ConfigChanged, on_changed)
        .route(EventKind::Started, on_changed)
        .route(EventKind::Stopped, on_changed)
        .route(EventKind::Continued, on_changed)
        .route(EventKind::Resumed, on_changed)
}

fn ignore(_: &Server, event: &Event) {
    debug!(kind = ?event.kind, "event ignored");
}

fn on_disconnect(server: &Server, event: &Event) {
    warn!(kind = ?event.kind, "lost the host connection");
    server.detach();
}

fn on_samples(server: &Server, event: &Event) {
    server.apply_samples(event);
}

fn on_removed(server: &Server, event: &Event) {
    server.erase(&event.issuer);
}

fn on_changed(server: &Server, event: &Event) {
    server.pull(&event.issuer);
}
