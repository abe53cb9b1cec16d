//! One live push-event subscription on the robot.
//!
//! [`EventSubscription::subscribe`] spawns a dedicated Tokio task that:
//!
//! 1. connects to the robot's `ws://<ip>/pubsub` endpoint,
//! 2. sends the subscribe control frame for one event type,
//! 3. turns every inbound frame into an [`Event`] on the attached
//!    [`LocalEventBus`], keeping bounded histories of messages and of
//!    errors/log entries.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──open──▶ Open ──close / error / unsubscribe──▶ Closed
//! ```
//!
//! Message and error events fire only while `Open`.  There is no reconnect:
//! a dropped connection needs a fresh [`EventSubscription::subscribe`].
//!
//! [`EventSubscription::unsubscribe`] sends the unsubscribe frame, closes the
//! socket and waits for the task to exit, so no listener runs after it
//! returns.  Later calls are no-ops.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use misty_types::{Event, MistyError};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::LocalEventBus;
use crate::protocol::{ControlMessage, parse_frame};

/// Server-side debounce requested when the caller does not choose one.
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;

/// Default capacity of the message history and of the error log.
pub const DEFAULT_MAX_ENTRIES: usize = 10;

const CLOSED_MARKER: &str = "Closed";
const OPENED_MARKER: &str = "Opened";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// What to subscribe to and how to route it locally.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConfig {
    /// Server-side event type filter, e.g. `"FaceRecognition"`.
    pub event_type: String,
    /// Local routing key; also sent to the robot as `EventName`.
    pub event_name: String,
    pub debounce_ms: u64,
    pub return_property: Option<String>,
    /// Capacity of both the history and the log buffers.
    pub max_entries: usize,
}

impl SubscriptionConfig {
    pub fn new(event_type: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            event_name: event_name.into(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            return_property: None,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_return_property(mut self, property: impl Into<String>) -> Self {
        self.return_property = Some(property.into());
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// The subscribe control frame for this configuration.
    pub fn control_message(&self) -> ControlMessage {
        ControlMessage::Subscribe {
            event_type: self.event_type.clone(),
            debounce_ms: self.debounce_ms,
            event_name: self.event_name.clone(),
            return_property: self.return_property.clone(),
        }
    }
}

/// Connection state of an [`EventSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Open,
    Closed,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bounded buffer
// ─────────────────────────────────────────────────────────────────────────────

/// FIFO buffer that evicts its oldest entry once `capacity` is reached.
#[derive(Debug)]
pub(crate) struct BoundedBuffer<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T: Clone> BoundedBuffer<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub(crate) fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state between the handle and its receive task
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Shared {
    config: SubscriptionConfig,
    bus: Option<Arc<LocalEventBus>>,
    state: Mutex<SubscriptionState>,
    /// Set once the subscribe frame went out; never cleared.
    opened: AtomicBool,
    history: Mutex<BoundedBuffer<Value>>,
    log: Mutex<BoundedBuffer<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn new(config: SubscriptionConfig, bus: Option<Arc<LocalEventBus>>) -> Self {
        let capacity = config.max_entries;
        Self {
            config,
            bus,
            state: Mutex::new(SubscriptionState::Connecting),
            opened: AtomicBool::new(false),
            history: Mutex::new(BoundedBuffer::new(capacity)),
            log: Mutex::new(BoundedBuffer::new(capacity)),
        }
    }

    fn name(&self) -> &str {
        &self.config.event_name
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.emit(&event);
        }
    }

    /// Parse one inbound text frame, record it and publish it.
    fn handle_frame(&self, text: &str) -> Result<(), MistyError> {
        match parse_frame(text) {
            Ok(message) => {
                debug!(event = %self.name(), "push message received");
                lock(&self.history).push(message.clone());
                self.emit(Event::message(self.name(), message));
                Ok(())
            }
            Err(e) => {
                self.record_error(e.to_string());
                Err(e)
            }
        }
    }

    fn record_error(&self, details: String) {
        warn!(event = %self.name(), error = %details, "subscription error");
        lock(&self.log).push(details.clone());
        self.emit(Event::error(self.name(), details));
    }

    fn record_open(&self) {
        info!(event = %self.name(), event_type = %self.config.event_type, "subscription open");
        *lock(&self.state) = SubscriptionState::Open;
        self.opened.store(true, Ordering::Release);
        lock(&self.log).push(OPENED_MARKER.to_string());
        self.emit(Event::opened(self.name()));
    }

    fn record_close(&self) {
        info!(event = %self.name(), "subscription closed");
        *lock(&self.state) = SubscriptionState::Closed;
        lock(&self.log).push(CLOSED_MARKER.to_string());
        self.emit(Event::closed(self.name(), CLOSED_MARKER));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventSubscription
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one robot push-event subscription.
///
/// Exclusively owned by the skill that created it.  The bus only knows the
/// subscription's routing key.
#[derive(Debug)]
pub struct EventSubscription {
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EventSubscription {
    /// Open a push connection to `url` and subscribe according to `config`.
    ///
    /// Never fails: connection problems are recorded in [`log`][Self::log]
    /// and published as `error_<name>` followed by `close_<name>`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        url: impl Into<String>,
        config: SubscriptionConfig,
        bus: Option<Arc<LocalEventBus>>,
    ) -> Self {
        let url = url.into();
        let shared = Arc::new(Shared::new(config, bus));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(receive_loop(Arc::clone(&shared), url, shutdown_rx));
        Self {
            shared,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Local routing key of this subscription.
    pub fn event_name(&self) -> &str {
        self.shared.name()
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SubscriptionState {
        *lock(&self.shared.state)
    }

    /// Whether the push connection ever opened, even if it has closed since.
    ///
    /// Unlike the `Opened` entry in [`log`][Self::log], this survives
    /// eviction.
    pub fn was_opened(&self) -> bool {
        self.shared.opened.load(Ordering::Acquire)
    }

    /// The most recent messages, oldest first.
    pub fn history(&self) -> Vec<Value> {
        lock(&self.shared.history).to_vec()
    }

    /// The most recent errors and open/close markers, oldest first.
    pub fn log(&self) -> Vec<String> {
        lock(&self.shared.log).to_vec()
    }

    /// Send the unsubscribe frame, close the transport and wait for the
    /// receive task to finish.
    ///
    /// Calling it again is a no-op returning `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`MistyError::Transport`] if the receive task panicked.
    pub async fn unsubscribe(&mut self) -> Result<(), MistyError> {
        let Some(task) = self.task.take() else {
            debug!(event = %self.event_name(), "already unsubscribed");
            return Ok(());
        };
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        task.await
            .map_err(|e| MistyError::Transport(format!("receive task for {} failed: {e}", self.event_name())))
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receive loop
// ─────────────────────────────────────────────────────────────────────────────

async fn receive_loop(shared: Arc<Shared>, url: String, mut shutdown: oneshot::Receiver<()>) {
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = &mut shutdown => {
            shared.record_close();
            return;
        }
    };

    let ws_stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            shared.record_error(format!("connect to {url} failed: {e}"));
            shared.record_close();
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let subscribe_frame = match shared.config.control_message().to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            shared.record_error(e.to_string());
            shared.record_close();
            return;
        }
    };
    if let Err(e) = ws_tx.send(Message::Text(subscribe_frame.into())).await {
        shared.record_error(format!("subscribe send failed: {e}"));
        shared.record_close();
        return;
    }
    shared.record_open();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                match ControlMessage::unsubscribe(shared.name()).to_frame() {
                    Ok(frame) => {
                        if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                            warn!(event = %shared.name(), error = %e, "unsubscribe send failed");
                        }
                    }
                    Err(e) => warn!(event = %shared.name(), error = %e, "unsubscribe frame"),
                }
                let _ = ws_tx.close().await;
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = shared.handle_frame(text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        shared.record_error(e.to_string());
                        break;
                    }
                    // Ping/pong are answered by tungstenite; the robot never sends binary.
                    _ => {}
                }
            }
        }
    }

    shared.record_close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use misty_types::EventPayload;
    use serde_json::json;

    fn shared_with_bus(capacity: usize) -> (Arc<LocalEventBus>, Shared) {
        let bus = Arc::new(LocalEventBus::new());
        let config = SubscriptionConfig::new("BatteryCharge", "battery_x").with_max_entries(capacity);
        let shared = Shared::new(config, Some(Arc::clone(&bus)));
        (bus, shared)
    }

    #[test]
    fn bounded_buffer_keeps_most_recent_in_order() {
        let mut buf = BoundedBuffer::new(3);
        for i in 0..7 {
            buf.push(i);
        }
        assert_eq!(buf.to_vec(), vec![4, 5, 6]);
    }

    #[test]
    fn bounded_buffer_zero_capacity_stays_empty() {
        let mut buf = BoundedBuffer::new(0);
        buf.push("x");
        assert!(buf.to_vec().is_empty());
    }

    #[test]
    fn history_retains_last_capacity_frames() {
        let (_bus, shared) = shared_with_bus(4);
        for i in 0..10 {
            shared
                .handle_frame(&format!(r#"{{"message":{{"chargePercent":{i}}}}}"#))
                .unwrap();
        }
        let history = lock(&shared.history).to_vec();
        let expected: Vec<Value> = (6..10).map(|i| json!({"chargePercent": i})).collect();
        assert_eq!(history, expected);
    }

    #[test]
    fn frame_is_published_once_under_local_name() {
        let (bus, shared) = shared_with_bus(10);
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&received);
        bus.on("battery_x", move |e| r.lock().unwrap().push(e.payload.clone()));

        shared.handle_frame(r#"{"message":{"chargePercent":42}}"#).unwrap();

        assert_eq!(
            *received.lock().unwrap(),
            vec![EventPayload::Message(json!({"chargePercent": 42}))]
        );
    }

    #[test]
    fn malformed_frame_goes_to_log_and_error_event() {
        let (bus, shared) = shared_with_bus(10);
        let errors = Arc::new(Mutex::new(0));
        let e = Arc::clone(&errors);
        bus.on("error_battery_x", move |_| *e.lock().unwrap() += 1);

        assert!(shared.handle_frame(r#"{"nope":1}"#).is_err());
        assert_eq!(*errors.lock().unwrap(), 1);
        assert_eq!(lock(&shared.log).to_vec().len(), 1);
        assert!(lock(&shared.history).to_vec().is_empty());
    }

    #[test]
    fn close_marks_state_and_emits() {
        let (bus, shared) = shared_with_bus(10);
        let mut rx = bus.queue(["close_battery_x"]);

        shared.record_close();

        assert_eq!(*lock(&shared.state), SubscriptionState::Closed);
        assert_eq!(lock(&shared.log).to_vec(), vec!["Closed".to_string()]);
        assert_eq!(rx.try_recv().unwrap().payload, EventPayload::Closed("Closed".into()));
    }

    #[test]
    fn opened_flag_outlives_log_eviction() {
        let (_bus, shared) = shared_with_bus(3);
        assert!(!shared.opened.load(Ordering::Acquire));

        shared.record_open();
        for _ in 0..5 {
            assert!(shared.handle_frame(r#"{"status":"noise"}"#).is_err());
        }

        assert!(!lock(&shared.log).to_vec().iter().any(|e| e == OPENED_MARKER));
        assert!(shared.opened.load(Ordering::Acquire));
    }

    #[test]
    fn frames_without_bus_are_still_recorded() {
        let config = SubscriptionConfig::new("BatteryCharge", "battery_x");
        let shared = Shared::new(config, None);
        shared.handle_frame(r#"{"message":{"chargePercent":1}}"#).unwrap();
        assert_eq!(lock(&shared.history).to_vec().len(), 1);
    }

    #[test]
    fn config_defaults() {
        let config = SubscriptionConfig::new("VoiceRecord", "speech");
        assert_eq!(config.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(config.max_entries, DEFAULT_MAX_ENTRIES);
        assert!(config.return_property.is_none());
    }
}
