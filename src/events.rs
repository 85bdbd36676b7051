//! Event types shared between the event bus and its callers.

use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::BrokerError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered event handler.
///
/// Handlers always return a future so sync and async callbacks share one
/// calling convention; a sync callback simply returns an already-ready
/// future (`Box::pin(async move { ... })`).
pub type HandlerFn =
    Arc<dyn Fn(&Event) -> BoxFuture<'static, Result<Value, BrokerError>> + Send + Sync>;

/// Callback the owning `Session` installs on its `EventBus` so `emit`
/// can touch `Session::updated_at` after dispatch, per spec.md §4.1 —
/// `EventBus` has no direct access to `Session`'s state.
pub type TouchHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Immutable record of an emitted event.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub results: Vec<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
            kwargs,
            results: Vec::new(),
        }
    }

    /// Return the positional and keyword payload as a tuple.
    pub fn unpack(&self) -> (&[Value], &Map<String, Value>) {
        (&self.args, &self.kwargs)
    }
}

pub(crate) struct HandlerRecord {
    pub id: u64,
    pub callback: HandlerFn,
    pub once: bool,
    pub priority: i32,
}

pub(crate) struct Waiter {
    pub id: u64,
    pub sender: Option<tokio::sync::oneshot::Sender<Result<Event, BrokerError>>>,
    pub predicate: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
}

/// Opaque reference to a registered handler, returned by `on`/`once`.
///
/// `cancel()` removes the registration; calling it again is a no-op.
pub struct HandlerToken {
    pub(crate) bus: crate::event_bus::WeakBus,
    pub(crate) event: String,
    pub(crate) id: u64,
    pub(crate) active: std::sync::atomic::AtomicBool,
}

impl HandlerToken {
    pub fn active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Cancel this handler registration. Returns `true` if it was still
    /// active and has now been removed, `false` if it was already
    /// cancelled (idempotent).
    pub fn cancel(&self) -> bool {
        if !self
            .active
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return false;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.off_by_id(&self.event, self.id);
        }
        true
    }
}

impl fmt::Debug for HandlerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerToken")
            .field("event", &self.event)
            .field("active", &self.active())
            .finish()
    }
}
