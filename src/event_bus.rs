//! Per-session event bus: registration, priority-ordered dispatch, and
//! one-shot waiters.
//!
//! Mirrors the emit/on/once/off/wait_for surface of the original
//! session's event dispatcher, but snapshots handler lists under a
//! synchronous lock and runs the handler futures after the lock is
//! dropped, so a slow or misbehaving handler can never block
//! registration or another dispatch.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{BrokerError, EventHandlerErrorDetail};
use crate::events::{Event, HandlerFn, HandlerRecord, HandlerToken, TouchHook, Waiter};

pub type WeakBus = Weak<EventBus>;

struct Inner {
    handlers: HashMap<String, Vec<HandlerRecord>>,
    waiters: HashMap<String, Vec<Waiter>>,
    closed: bool,
}

/// Registry of event handlers and waiters for a single session.
pub struct EventBus {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    touch_hook: Mutex<Option<TouchHook>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                handlers: HashMap::new(),
                waiters: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            touch_hook: Mutex::new(None),
        })
    }

    /// Install the callback `emit` runs after every dispatch so the
    /// owning `Session` can update its `updated_at`. Session-internal;
    /// a bus with no hook installed simply skips the touch.
    pub(crate) fn set_touch_hook(&self, hook: TouchHook) {
        *self.touch_hook.lock() = Some(hook);
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a handler for `event`. Returns a token that can cancel
    /// the registration exactly once.
    pub fn on(
        self: &Arc<Self>,
        event: impl Into<String>,
        callback: HandlerFn,
        priority: i32,
    ) -> HandlerToken {
        self.register(event.into(), callback, priority, false)
    }

    /// Register a handler that removes itself after firing once.
    pub fn once(
        self: &Arc<Self>,
        event: impl Into<String>,
        callback: HandlerFn,
        priority: i32,
    ) -> HandlerToken {
        self.register(event.into(), callback, priority, true)
    }

    fn register(
        self: &Arc<Self>,
        event: String,
        callback: HandlerFn,
        priority: i32,
        once: bool,
    ) -> HandlerToken {
        let id = self.alloc_id();
        {
            let mut inner = self.inner.lock();
            inner
                .handlers
                .entry(event.clone())
                .or_default()
                .push(HandlerRecord {
                    id,
                    callback,
                    once,
                    priority,
                });
        }
        HandlerToken {
            bus: Arc::downgrade(self),
            event,
            id,
            active: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Remove handlers registered for `event`. If `callback` is `Some`,
    /// only the handler(s) whose stored callback is the same `Arc`
    /// (compared by pointer identity) are removed; if `None`, every
    /// handler for `event` is removed. Returns the number removed.
    pub fn off(&self, event: &str, callback: Option<&HandlerFn>) -> usize {
        let mut inner = self.inner.lock();
        let Some(list) = inner.handlers.get_mut(event) else {
            return 0;
        };
        match callback {
            None => {
                let n = list.len();
                list.clear();
                n
            }
            Some(cb) => {
                let before = list.len();
                list.retain(|h| !Arc::ptr_eq(&h.callback, cb));
                before - list.len()
            }
        }
    }

    pub(crate) fn off_by_id(&self, event: &str, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.handlers.get_mut(event) {
            let before = list.len();
            list.retain(|h| h.id != id);
            return list.len() != before;
        }
        false
    }

    /// Emit an event and await every registered handler. On success the
    /// returned `Event` carries each handler's result in call order. If
    /// any handler fails, all failures are collected into a single
    /// `BrokerError::AggregateDispatch` rather than surfacing only the
    /// first one. Either way, dispatch concludes by notifying matching
    /// waiters and touching the owning session's `updated_at`.
    pub async fn emit(
        self: &Arc<Self>,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Event, BrokerError> {
        let mut event = Event::new(name, args, kwargs);

        let snapshot: Vec<HandlerFn> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(BrokerError::SessionClosed);
            }
            match inner.handlers.get_mut(name) {
                None => Vec::new(),
                Some(list) => {
                    // Stable sort, highest priority first, matching
                    // registration order for ties.
                    list.sort_by(|a, b| b.priority.cmp(&a.priority));
                    let snapshot = list.iter().map(|h| h.callback.clone()).collect();
                    list.retain(|h| !h.once);
                    snapshot
                }
            }
        };

        let mut errors = Vec::new();
        for callback in snapshot {
            match callback(&event).await {
                Ok(result) => event.results.push(result),
                Err(err) => errors.push(EventHandlerErrorDetail {
                    event: name.to_string(),
                    callback: "handler".to_string(),
                    original: err.to_string(),
                }),
            }
        }

        self.notify_waiters(name, &event);
        self.touch().await;

        if errors.is_empty() {
            Ok(event)
        } else {
            Err(BrokerError::AggregateDispatch(errors))
        }
    }

    async fn touch(&self) {
        let hook = self.touch_hook.lock().clone();
        if let Some(hook) = hook {
            hook().await;
        }
    }

    /// Fire-and-forget emit: spawns the dispatch and returns a handle
    /// the caller can join to observe its result. Dispatch failures are
    /// also logged so a caller who never joins still sees them.
    pub fn emit_nowait(
        self: &Arc<Self>,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> tokio::task::JoinHandle<Result<Event, BrokerError>> {
        let bus = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let result = bus.emit(&name, args, kwargs).await;
            if let Err(err) = &result {
                log::warn!("unhandled error dispatching event {name:?}: {err}");
            }
            result
        })
    }

    fn notify_waiters(&self, name: &str, event: &Event) {
        let mut inner = self.inner.lock();
        let Some(list) = inner.waiters.get_mut(name) else {
            return;
        };
        let mut remaining = Vec::with_capacity(list.len());
        for mut waiter in list.drain(..) {
            let matches = waiter
                .predicate
                .as_ref()
                .map(|p| p(event))
                .unwrap_or(true);
            if matches {
                if let Some(sender) = waiter.sender.take() {
                    let _ = sender.send(Ok(event.clone()));
                }
            } else {
                remaining.push(waiter);
            }
        }
        *list = remaining;
    }

    /// Wait for the next occurrence of `event` matching `predicate`
    /// (or any occurrence, if `predicate` is `None`), up to `timeout`.
    pub async fn wait_for(
        self: &Arc<Self>,
        event: impl Into<String>,
        predicate: Option<Arc<dyn Fn(&Event) -> bool + Send + Sync>>,
        timeout: Duration,
    ) -> Result<Event, BrokerError> {
        let event = event.into();
        let id = self.alloc_id();
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(BrokerError::SessionClosed);
            }
            inner.waiters.entry(event.clone()).or_default().push(Waiter {
                id,
                sender: Some(tx),
                predicate,
            });
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::SessionClosed),
            Err(_) => {
                let mut inner = self.inner.lock();
                if let Some(list) = inner.waiters.get_mut(&event) {
                    list.retain(|w| w.id != id);
                }
                Err(BrokerError::Timeout)
            }
        }
    }

    /// Mark the bus closed: clears every handler registry and fails
    /// every pending waiter with `BrokerError::SessionClosed`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.handlers.clear();
        for (_, waiters) in inner.waiters.drain() {
            for mut waiter in waiters {
                if let Some(sender) = waiter.sender.take() {
                    let _ = sender.send(Err(BrokerError::SessionClosed));
                }
            }
        }
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .handlers
            .get(event)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sync_handler(f: impl Fn(&Event) -> Value + Send + Sync + 'static) -> HandlerFn {
        Arc::new(move |event| {
            let result = f(event);
            Box::pin(async move { Ok(result) })
        })
    }

    #[tokio::test]
    async fn emit_invokes_registered_handlers_in_priority_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        bus.on(
            "ping",
            sync_handler(move |_| {
                o1.lock().push("low");
                Value::Null
            }),
            0,
        );
        let o2 = Arc::clone(&order);
        bus.on(
            "ping",
            sync_handler(move |_| {
                o2.lock().push("high");
                Value::Null
            }),
            10,
        );

        bus.emit("ping", vec![], Map::new()).await.unwrap();
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn once_handler_fires_exactly_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.once(
            "tick",
            sync_handler(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Value::Null
            }),
            0,
        );

        bus.emit("tick", vec![], Map::new()).await.unwrap();
        bus.emit("tick", vec![], Map::new()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn off_removes_all_handlers_for_event() {
        let bus = EventBus::new();
        bus.on("ping", sync_handler(|_| Value::Null), 0);
        bus.on("ping", sync_handler(|_| Value::Null), 0);
        assert_eq!(bus.off("ping", None), 2);
        assert_eq!(bus.handler_count("ping"), 0);
    }

    #[tokio::test]
    async fn off_with_callback_removes_only_that_handler() {
        let bus = EventBus::new();
        let first = sync_handler(|_| Value::Null);
        let second = sync_handler(|_| Value::Null);
        bus.on("ping", Arc::clone(&first), 0);
        bus.on("ping", Arc::clone(&second), 0);

        assert_eq!(bus.off("ping", Some(&first)), 1);
        assert_eq!(bus.handler_count("ping"), 1);

        // Removing the same callback again is a no-op, the other
        // handler is untouched.
        assert_eq!(bus.off("ping", Some(&first)), 0);
        assert_eq!(bus.off("ping", Some(&second)), 1);
        assert_eq!(bus.handler_count("ping"), 0);
    }

    #[tokio::test]
    async fn handler_token_cancel_is_idempotent() {
        let bus = EventBus::new();
        let token = bus.on("ping", sync_handler(|_| Value::Null), 0);
        assert!(token.cancel());
        assert!(!token.cancel());
        assert_eq!(bus.handler_count("ping"), 0);
    }

    #[tokio::test]
    async fn emit_aggregates_handler_errors() {
        let bus = EventBus::new();
        bus.on(
            "boom",
            Arc::new(|_: &Event| -> crate::events::BoxFuture<'static, Result<Value, BrokerError>> {
                Box::pin(async { Err(BrokerError::Session("first".into())) })
            }),
            0,
        );
        bus.on(
            "boom",
            Arc::new(|_: &Event| -> crate::events::BoxFuture<'static, Result<Value, BrokerError>> {
                Box::pin(async { Err(BrokerError::Session("second".into())) })
            }),
            0,
        );

        let err = bus.emit("boom", vec![], Map::new()).await.unwrap_err();
        match err {
            BrokerError::AggregateDispatch(details) => assert_eq!(details.len(), 2),
            other => panic!("expected AggregateDispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_emit() {
        let bus = EventBus::new();
        let bus2 = Arc::clone(&bus);
        let waiting = tokio::spawn(async move {
            bus2.wait_for("status", None, Duration::from_secs(1)).await
        });

        tokio::task::yield_now().await;
        bus.emit("status", vec![], Map::new()).await.unwrap();

        let event = waiting.await.unwrap().unwrap();
        assert_eq!(event.name, "status");
    }

    #[tokio::test]
    async fn wait_for_times_out_and_cleans_up() {
        let bus = EventBus::new();
        let result = bus.wait_for("never", None, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(BrokerError::Timeout)));
        assert_eq!(bus.inner.lock().waiters.get("never").map(Vec::len).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_waiters() {
        let bus = EventBus::new();
        let bus2 = Arc::clone(&bus);
        let waiting = tokio::spawn(async move {
            bus2.wait_for("status", None, Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        bus.shutdown();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(BrokerError::SessionClosed)));
    }

    #[tokio::test]
    async fn emit_after_shutdown_is_rejected() {
        let bus = EventBus::new();
        bus.shutdown();
        let result = bus.emit("anything", vec![], Map::new()).await;
        assert!(matches!(result, Err(BrokerError::SessionClosed)));
    }
}
