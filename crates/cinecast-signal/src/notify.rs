//! Single-subscriber notification slot.
//!
//! At most one handler is registered per slot; registering again replaces it.
//! `emit` calls the handler synchronously on the caller's task, so delivery
//! order is emit order. The handler is invoked without the slot lock held,
//! which lets a handler re-register or emit on another slot.

use std::sync::{Arc, Mutex, MutexGuard};

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct Notifier<T> {
    handler: Mutex<Option<Handler<T>>>,
}

impl<T> Default for Notifier<T> {
    fn default() -> Self {
        Self {
            handler: Mutex::new(None),
        }
    }
}

impl<T> Notifier<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(T) + Send + Sync + 'static) {
        *self.slot() = Some(Arc::new(handler));
    }

    pub fn clear(&self) {
        *self.slot() = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.slot().is_some()
    }

    /// Delivers `value` to the current handler. Returns `false` when nobody listens.
    pub fn emit(&self, value: T) -> bool {
        let handler = self.slot().clone();
        match handler {
            Some(handler) => {
                handler(value);
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Handler<T>>> {
        match self.handler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
