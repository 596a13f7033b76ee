//! Handler registration sets.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError, Weak},
};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// Ordered set of listeners for one kind of value.
///
/// Delivery iterates a snapshot, so handlers may register or unsubscribe
/// from inside a callback. A panicking handler is logged and skipped; the
/// remaining handlers still run.
pub struct HandlerSet<T> {
    label: &'static str,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for HandlerSet<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: 'static> HandlerSet<T> {
    /// Create an empty set. `label` names it in logs.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler.
    pub fn add<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut reg = self.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handlers
                    .retain(|(h, _)| *h != id);
            }
        })
    }

    /// Deliver `value` to every handler. Returns how many ran without panicking.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Handler<T>> = self
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        let mut delivered = 0;
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!(handlers = self.label, "Handler panicked; continuing delivery");
            }
        }
        delivered
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.lock().handlers.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Capability to remove one registration.
///
/// Dropping it leaves the handler registered.
#[must_use = "dropping a Subscription keeps the handler registered forever"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wrap an arbitrary removal action.
    pub fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Remove the registration.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
