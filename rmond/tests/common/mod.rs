//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rmond::collector::{
    Collector, EntityState, EntityUsage, Event, EventCallback, GuestState, GuestUsage, HostState,
    HostUsage, Target,
};
use rmond::error::{CollectorError, TransportError};
use rmond::sink::{PushChannel, PushMessage, Transport};

/// One fake guest.
#[derive(Debug, Clone, Default)]
pub struct Guest {
    pub state: GuestState,
    pub usage: GuestUsage,
}

/// An in-memory virtualization host.
#[derive(Default)]
pub struct MockCollector {
    pub host: Mutex<HostState>,
    pub guests: Mutex<BTreeMap<String, Guest>>,
    pub callback: Mutex<Option<EventCallback>>,
    /// Number of connection attempts to refuse before accepting.
    pub refuse_connects: AtomicUsize,
    pub connects: AtomicUsize,
    pub usage_pulls: AtomicUsize,
    pub failing: Mutex<bool>,
}

impl MockCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_guest(&self, id: &str, name: &str) {
        let guest = Guest {
            state: GuestState {
                name: name.to_string(),
                state: 1,
                ..GuestState::default()
            },
            ..Guest::default()
        };
        self.guests.lock().unwrap().insert(id.to_string(), guest);
    }

    pub fn remove_guest(&self, id: &str) {
        self.guests.lock().unwrap().remove(id);
    }

    pub fn set_usage(&self, id: &str, usage: GuestUsage) {
        if let Some(guest) = self.guests.lock().unwrap().get_mut(id) {
            guest.usage = usage;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Delivers `event` through the registered callback, if any.
    pub fn emit(&self, event: Event) -> bool {
        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    fn check(&self, call: &str) -> Result<(), CollectorError> {
        if *self.failing.lock().unwrap() {
            return Err(CollectorError::Timeout {
                call: call.to_string(),
            });
        }
        Ok(())
    }
}

impl Collector for MockCollector {
    fn connect(&self) -> Result<(), CollectorError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CollectorError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn disconnect(&self) {}

    fn subscribe_events(&self, callback: EventCallback) -> Result<(), CollectorError> {
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    fn unsubscribe_events(&self) {
        self.callback.lock().unwrap().take();
    }

    fn list_guests(&self) -> Result<Vec<String>, CollectorError> {
        Ok(self.guests.lock().unwrap().keys().cloned().collect())
    }

    fn probe_guest(&self, id: &str) -> Result<bool, CollectorError> {
        Ok(self.guests.lock().unwrap().contains_key(id))
    }

    fn subscribe_samples(&self, _: &Target) -> Result<(), CollectorError> {
        Ok(())
    }

    fn unsubscribe_samples(&self, _: &Target) {}

    fn pull_state(&self, target: &Target) -> Result<EntityState, CollectorError> {
        self.check("pull_state")?;
        match target {
            Target::Host => Ok(EntityState::Host(self.host.lock().unwrap().clone())),
            Target::Guest(id) => self
                .guests
                .lock()
                .unwrap()
                .get(id)
                .map(|g| EntityState::Guest(g.state.clone()))
                .ok_or_else(|| CollectorError::UnknownEntity { id: id.clone() }),
        }
    }

    fn pull_usage(&self, target: &Target) -> Result<EntityUsage, CollectorError> {
        self.check("pull_usage")?;
        self.usage_pulls.fetch_add(1, Ordering::SeqCst);
        match target {
            Target::Host => Ok(EntityUsage::Host(HostUsage::default())),
            Target::Guest(id) => self
                .guests
                .lock()
                .unwrap()
                .get(id)
                .map(|g| EntityUsage::Guest(g.usage.clone()))
                .ok_or_else(|| CollectorError::UnknownEntity { id: id.clone() }),
        }
    }
}

/// Records every message instead of sending it.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<(String, u16, PushMessage)>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<(String, u16, PushMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

struct Recording {
    host: String,
    port: u16,
    sent: Arc<Mutex<Vec<(String, u16, PushMessage)>>>,
}

impl PushChannel for Recording {
    fn send(&mut self, message: &PushMessage) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((self.host.clone(), self.port, message.clone()));
        Ok(())
    }
}

impl Transport for RecordingTransport {
    fn open(&self, host: &str, port: u16) -> Result<Box<dyn PushChannel>, TransportError> {
        Ok(Box::new(Recording {
            host: host.to_string(),
            port,
            sent: Arc::clone(&self.sent),
        }))
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A host with the given license counters.
pub fn host_state(limit_ves: i32) -> HostState {
    HostState {
        limit_ves,
        ..HostState::default()
    }
}
