use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

pub const SESSION_OUTPUT: &str = "session-output";
pub const SESSION_DONE: &str = "session-done";
pub const LOG_LINE: &str = "log-line";
pub const LOG_ERROR: &str = "log-error";
pub const LOG_DONE: &str = "log-done";
pub const COMMAND_LINE: &str = "command-line";
pub const COMMAND_DONE: &str = "command-done";
pub const ANALYSIS_TOKEN: &str = "analysis-token";
pub const ANALYSIS_DONE: &str = "analysis-done";

type Handler = Box<dyn FnMut(&Value) + Send>;

struct Registered {
    id: u64,
    live: Arc<AtomicBool>,
    handler: Arc<Mutex<Handler>>,
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<HashMap<String, Vec<Registered>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        self: &Arc<Self>,
        event: &str,
        handler: impl FnMut(&Value) + Send + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));
        self.registry
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Registered {
                id,
                live: live.clone(),
                handler: Arc::new(Mutex::new(Box::new(handler))),
            });
        Subscription {
            bus: Arc::downgrade(self),
            event: event.to_string(),
            id,
            live,
        }
    }

    // Handlers run outside the registry lock so they may subscribe, emit, or
    // release without deadlocking.
    pub fn emit(&self, event: &str, payload: Value) {
        let handlers = {
            let registry = self.registry.lock();
            match registry.get(event) {
                Some(entries) => entries
                    .iter()
                    .map(|entry| (entry.live.clone(), entry.handler.clone()))
                    .collect::<Vec<_>>(),
                None => Vec::new(),
            }
        };

        trace!(event, listeners = handlers.len(), "emit");
        for (live, handler) in handlers {
            if live.load(Ordering::Acquire) {
                (handler.lock())(&payload);
            }
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .lock()
            .get(event)
            .map_or(0, |entries| entries.len())
    }

    fn remove(&self, event: &str, id: u64) {
        let mut registry = self.registry.lock();
        if let Some(entries) = registry.get_mut(event) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                registry.remove(event);
            }
        }
    }
}

pub struct Subscription {
    bus: Weak<EventBus>,
    event: String,
    id: u64,
    live: Arc<AtomicBool>,
}

impl Subscription {
    pub fn release(&mut self) {
        // Idempotent: a second release finds nothing to flip or remove.
        if self.live.swap(false, Ordering::AcqRel)
            && let Some(bus) = self.bus.upgrade()
        {
            bus.remove(&self.event, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns every subscription belonging to one controller run, so teardown is a
/// single `clear()` (or a drop) no matter which path exits the run.
#[derive(Default)]
pub struct SubscriptionSet {
    subs: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn push(&mut self, sub: Subscription) {
        self.subs.push(sub);
    }

    pub fn clear(&mut self) {
        for mut sub in self.subs.drain(..) {
            sub.release();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{EventBus, SubscriptionSet};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn recording_handler(seen: &Arc<Mutex<Vec<Value>>>) -> impl FnMut(&Value) + Send + 'static {
        let seen = seen.clone();
        move |payload: &Value| seen.lock().push(payload.clone())
    }

    #[test]
    fn emit_delivers_to_matching_subscribers_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _first = bus.subscribe("log-line", recording_handler(&seen));
        let other = Arc::new(Mutex::new(Vec::new()));
        let _second = bus.subscribe("log-done", recording_handler(&other));

        bus.emit("log-line", json!("starting"));
        bus.emit("log-line", json!("ready"));

        assert_eq!(*seen.lock(), vec![json!("starting"), json!("ready")]);
        assert!(other.lock().is_empty());
    }

    #[test]
    fn released_subscription_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sub = bus.subscribe("log-line", recording_handler(&seen));

        bus.emit("log-line", json!(1));
        sub.release();
        bus.emit("log-line", json!(2));

        assert_eq!(*seen.lock(), vec![json!(1)]);
    }

    #[test]
    fn double_release_is_safe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("log-line", |_| {});
        sub.release();
        sub.release();
    }

    #[test]
    fn dropping_a_subscription_releases_it() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let _sub = bus.subscribe("log-line", recording_handler(&seen));
            bus.emit("log-line", json!("in-scope"));
        }
        bus.emit("log-line", json!("after-drop"));

        assert_eq!(*seen.lock(), vec![json!("in-scope")]);
    }

    #[test]
    fn subscription_set_clear_releases_everything() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut set = SubscriptionSet::default();
        set.push(bus.subscribe("log-line", recording_handler(&seen)));
        set.push(bus.subscribe("log-done", recording_handler(&seen)));
        assert_eq!(set.len(), 2);

        set.clear();
        set.clear();
        assert!(set.is_empty());

        bus.emit("log-line", json!(1));
        bus.emit("log-done", json!(2));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn handler_may_subscribe_while_an_emit_is_in_flight() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let late = Arc::new(Mutex::new(Vec::<super::Subscription>::new()));

        let bus_inner = bus.clone();
        let seen_inner = seen.clone();
        let late_inner = late.clone();
        let _sub = bus.subscribe("log-line", move |_| {
            let sub = bus_inner.subscribe("log-done", recording_handler(&seen_inner));
            late_inner.lock().push(sub);
        });

        bus.emit("log-line", json!("trigger"));
        bus.emit("log-done", json!("delivered"));

        assert_eq!(*seen.lock(), vec![json!("delivered")]);
    }
}
