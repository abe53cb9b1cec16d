//! In-process publish/subscribe registry keyed by event name.
//!
//! Every [`EventSubscription`][crate::subscription::EventSubscription]
//! publishes onto a [`LocalEventBus`]; skill code registers listeners by
//! name.  The bus is an ordinary value owned by the skill entry point and
//! shared by `Arc`, so independent skill runs (and tests) never see each
//! other's listeners.
//!
//! # Routing keys
//!
//! | Name | Emitted when |
//! |---|---|
//! | `<localName>` | a push frame arrived; payload is its `message` field |
//! | `error_<localName>` | the transport failed or a frame could not be parsed |
//! | `close_<localName>` | the push connection closed |
//! | `open_<localName>` | the push connection opened |
//!
//! Listeners run synchronously on the emitting task, in registration order.
//! Code that must not race the main loop should use [`LocalEventBus::queue`]
//! or [`LocalEventBus::forward_to`] and consume events from a single task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use misty_types::Event;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A registered callback.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Name-keyed listener registry.
#[derive(Default)]
pub struct LocalEventBus {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl std::fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .listeners
            .read()
            .map(|l| l.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("LocalEventBus").field("names", &names).finish()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under `name`.  Listeners are never removed
    /// individually; they live as long as the bus.
    pub fn on<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(event = %name, "listener registered");
        let mut map = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        map.entry(name).or_default().push(Arc::new(listener));
    }

    /// Invoke every listener registered under `event.name`.
    ///
    /// Returns the number of listeners invoked.  Emitting on a name nobody
    /// listens to is a normal condition and returns `0`.
    pub fn emit(&self, event: &Event) -> usize {
        // Clone the handles out so a listener may register further listeners
        // without deadlocking on the registry lock.
        let listeners: Vec<Listener> = {
            let map = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            match map.get(&event.name) {
                Some(l) => l.clone(),
                None => {
                    trace!(event = %event.name, "no listeners");
                    return 0;
                }
            }
        };
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    /// Number of listeners registered under `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Forward every event emitted under any of `names` into `sender`.
    ///
    /// Events from one subscription keep their arrival order.  Send errors
    /// (the receiver was dropped) are ignored.
    pub fn forward_to<I, S, T>(&self, names: I, sender: mpsc::UnboundedSender<T>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        T: From<Event> + Send + 'static,
    {
        for name in names {
            let tx = sender.clone();
            self.on(name, move |event: &Event| {
                let _ = tx.send(T::from(event.clone()));
            });
        }
    }

    /// Single-consumer queue of every event emitted under `names`.
    pub fn queue<I, S>(&self, names: I) -> mpsc::UnboundedReceiver<Event>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.forward_to(names, tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn emit_without_listeners_is_noop() {
        let bus = LocalEventBus::new();
        assert_eq!(bus.emit(&Event::message("nobody", json!({}))), 0);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = LocalEventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.on("face", move |_| order.lock().unwrap().push(i));
        }

        assert_eq!(bus.emit(&Event::message("face", json!({"label": "alice"}))), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn listeners_only_see_their_name() {
        let bus = LocalEventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&hits);
        bus.on("battery_x", move |e| h.lock().unwrap().push(e.name.clone()));

        bus.emit(&Event::message("face", json!({})));
        bus.emit(&Event::error("battery_x", "refused"));
        bus.emit(&Event::message("battery_x", json!({"chargePercent": 42})));

        assert_eq!(*hits.lock().unwrap(), vec!["battery_x".to_string()]);
    }

    #[test]
    fn listener_may_register_during_emit() {
        let bus = Arc::new(LocalEventBus::new());
        let inner = Arc::clone(&bus);
        bus.on("outer", move |_| inner.on("late", |_| {}));

        bus.emit(&Event::message("outer", json!(null)));
        assert_eq!(bus.listener_count("late"), 1);
    }

    #[tokio::test]
    async fn queue_preserves_arrival_order() {
        let bus = LocalEventBus::new();
        let mut rx = bus.queue(["voice", "close_voice"]);

        bus.emit(&Event::message("voice", json!({"errorCode": 0})));
        bus.emit(&Event::closed("voice", "Closed"));
        bus.emit(&Event::message("other", json!({})));

        assert_eq!(rx.recv().await.unwrap().name, "voice");
        assert_eq!(rx.recv().await.unwrap().name, "close_voice");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn listener_count_tracks_registrations() {
        let bus = LocalEventBus::new();
        assert_eq!(bus.listener_count("x"), 0);
        bus.on("x", |_| {});
        bus.on("x", |_| {});
        assert_eq!(bus.listener_count("x"), 2);
    }
}
