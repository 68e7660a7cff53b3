//! Process-wide registry of attached servers.
//!
//! Collector callbacks arrive on collector-owned threads and must find
//! their way back to a server without keeping it alive. A server registers
//! on attach and receives an opaque [`ServerHandle`]; the callback captures
//! only that handle and looks the server up per event. Once the server
//! unregisters (on detach) or is dropped, lookups come back empty.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::server::Server;

/// Opaque identity of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerHandle(u64);

impl fmt::Display for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

#[derive(Default)]
struct Registry {
    next: u64,
    servers: BTreeMap<u64, Weak<Server>>,
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(Registry::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Registers `server`, returning a fresh handle.
pub fn register(server: &Arc<Server>) -> ServerHandle {
    let mut registry = registry();
    registry.next += 1;
    let id = registry.next;
    registry.servers.insert(id, Arc::downgrade(server));
    ServerHandle(id)
}

/// Removes a registration. Returns `true` if the handle was registered.
pub fn unregister(handle: ServerHandle) -> bool {
    registry().servers.remove(&handle.0).is_some()
}

/// Resolves a handle to its server, if still registered and alive.
pub fn lookup(handle: ServerHandle) -> Option<Arc<Server>> {
    registry().servers.get(&handle.0).and_then(Weak::upgrade)
}

/// Returns the number of registrations, live or not yet cleaned up.
pub fn len() -> usize {
    registry().servers.len()
}

/// Returns `true` if nothing is registered.
pub fn is_empty() -> bool {
    len() == 0
}
