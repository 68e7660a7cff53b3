//! Static code → handler routing.
//!
//! A [`Dispatcher`] is an ordered list of `(code, handler)` routes plus a
//! fallback answering every code no route claims. The same type routes
//! protocol phase codes to row-lifecycle handlers and host lifecycle events
//! to server refresh methods.

use std::fmt;

/// Ordered routing table from codes to handlers.
#[derive(Clone)]
pub struct Dispatcher<K, H> {
    routes: Vec<(K, H)>,
    fallback: H,
}

impl<K: PartialEq, H> Dispatcher<K, H> {
    /// Creates a dispatcher answering every code with `fallback`.
    pub fn new(fallback: H) -> Self {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    /// Adds a route. Earlier routes win over later ones for the same code.
    #[must_use]
    pub fn route(mut self, code: K, handler: H) -> Self {
        self.routes.push((code, handler));
        self
    }

    /// Returns the handler for `code`, or the fallback.
    pub fn resolve(&self, code: &K) -> &H {
        self.routes
            .iter()
            .find(|(k, _)| k == code)
            .map_or(&self.fallback, |(_, h)| h)
    }

    /// Returns `true` if a route (not the fallback) claims `code`.
    pub fn handles(&self, code: &K) -> bool {
        self.routes.iter().any(|(k, _)| k == code)
    }

    /// Iterates over the routed codes in declaration order.
    pub fn codes(&self) -> impl Iterator<Item = &K> {
        self.routes.iter().map(|(k, _)| k)
    }
}

impl<K: PartialEq, T: ?Sized, E: ?Sized, R> Dispatcher<K, fn(&T, &E) -> R> {
    /// Resolves `code` and invokes the handler on `target` and `event`.
    pub fn dispatch(&self, code: &K, target: &T, event: &E) -> R {
        (self.resolve(code))(target, event)
    }
}

impl<K: fmt::Debug, H> fmt::Debug for Dispatcher<K, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("codes", &self.routes.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
