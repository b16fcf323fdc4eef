//! Lifecycle hooks.
//!
//! Observers subscribe to an event type; each event type has a fixed name
//! (`status.client`, `gateway.closing`, `client.state`) and carries a mutable
//! payload plus a `halt` flag. Dispatch is synchronous and calls every
//! observer in registration order. An observer setting `halt` suppresses the
//! default follow-on action of whoever dispatched the event, it does not stop
//! later observers from running.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::registry::Session;

/// A payload that can be dispatched through [`Hooks`].
pub trait HookEvent: Send + 'static {
    /// Event name observers are keyed by.
    const NAME: &'static str;

    fn halted(&self) -> bool;
}

/// A registered observer for events of type `E`.
pub type Observer<E> = Arc<dyn Fn(&mut E) + Send + Sync>;

type ErasedObserver = Box<dyn Any + Send + Sync>;

/// Process-wide hook dispatcher owned by the gateway.
#[derive(Default)]
pub struct Hooks {
    observers: RwLock<HashMap<&'static str, Vec<ErasedObserver>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `observer` to every future dispatch of `E`.
    pub fn register<E: HookEvent>(&self, observer: impl Fn(&mut E) + Send + Sync + 'static) {
        let observer: Observer<E> = Arc::new(observer);
        self.write()
            .entry(E::NAME)
            .or_default()
            .push(Box::new(observer));
    }

    /// Run every observer of `E` against `event`, in registration order.
    ///
    /// The observer list is copied out before any observer runs, so an
    /// observer may register further hooks without deadlocking.
    pub fn dispatch<E: HookEvent>(&self, event: &mut E) {
        let observers = self.observers_of::<E>();
        for observer in observers {
            observer(event);
        }
    }

    pub fn observer_count<E: HookEvent>(&self) -> usize {
        self.observers_of::<E>().len()
    }

    fn observers_of<E: HookEvent>(&self) -> Vec<Observer<E>> {
        self.read()
            .get(E::NAME)
            .map(|list| {
                list.iter()
                    .filter_map(|o| o.downcast_ref::<Observer<E>>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<&'static str, Vec<ErasedObserver>>> {
        self.observers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<&'static str, Vec<ErasedObserver>>> {
        self.observers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// One session's line of the status report. Observers may rewrite `line`, or
/// set `halt` to leave the session out of the report.
pub struct StatusLine {
    pub session: Arc<Session>,
    pub line: String,
    pub halt: bool,
}

impl HookEvent for StatusLine {
    const NAME: &'static str = "status.client";

    fn halted(&self) -> bool {
        self.halt
    }
}

/// Dispatched by [`Gateway::close`](crate::Gateway::close) before any listener is closed.
#[derive(Default)]
pub struct GatewayClosing {
    pub halt: bool,
}

impl HookEvent for GatewayClosing {
    const NAME: &'static str = "gateway.closing";

    fn halted(&self) -> bool {
        self.halt
    }
}

/// A session entered (`connected`) or left the registry.
pub struct SessionStateChanged {
    pub session: Arc<Session>,
    pub connected: bool,
    pub halt: bool,
}

impl HookEvent for SessionStateChanged {
    const NAME: &'static str = "client.state";

    fn halted(&self) -> bool {
        self.halt
    }
}
