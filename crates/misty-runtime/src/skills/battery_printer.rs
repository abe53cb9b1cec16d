//! Print battery updates for a while.

use std::sync::Arc;
use std::time::Duration;

use misty_middleware::{EventSubscription, LocalEventBus, SubscriptionConfig};
use misty_types::ActionResult;
use serde_json::Value;
use tracing::info;

use super::random_suffix;
use crate::report::{ActionLog, SkillReport};

pub const BATTERY_CHARGE: &str = "BatteryCharge";

#[derive(Debug, Clone)]
pub struct BatteryPrinterConfig {
    pub pubsub_url: String,
    pub duration: Duration,
    pub debounce_ms: u64,
    pub max_entries: usize,
}

impl BatteryPrinterConfig {
    pub fn new(pubsub_url: impl Into<String>, duration: Duration) -> Self {
        Self {
            pubsub_url: pubsub_url.into(),
            duration,
            debounce_ms: misty_middleware::subscription::DEFAULT_DEBOUNCE_MS,
            max_entries: misty_middleware::subscription::DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Subscribe to `BatteryCharge`, print every message for `config.duration`,
/// then unsubscribe.  The report carries the retained message history.
pub async fn battery_printer(config: BatteryPrinterConfig) -> SkillReport {
    let bus = Arc::new(LocalEventBus::new());
    let event_name = format!("battery_loader_{}", random_suffix(6));
    bus.on(event_name.clone(), |event| {
        if let Some(message) = event.message_body() {
            println!("{message}");
        }
    });

    let subscription_config = SubscriptionConfig::new(BATTERY_CHARGE, event_name.clone())
        .with_debounce_ms(config.debounce_ms)
        .with_max_entries(config.max_entries);
    let mut subscription =
        EventSubscription::subscribe(config.pubsub_url.clone(), subscription_config, Some(bus));
    info!(event = %event_name, duration = ?config.duration, "printing battery updates");

    tokio::time::sleep(config.duration).await;

    let mut log = ActionLog::new();
    // The connection outcome is only known once the task has run.
    let subscribe = if subscription.was_opened() {
        ActionResult::ok(None)
    } else {
        let reason = subscription
            .log()
            .first()
            .cloned()
            .unwrap_or_else(|| "push channel never opened".to_string());
        ActionResult::failed(reason)
    };
    log.record("subscribe_battery", subscribe);

    let unsubscribe = match subscription.unsubscribe().await {
        Ok(()) => ActionResult::ok(None),
        Err(e) => ActionResult::failed(e.to_string()),
    };
    log.record("unsubscribe_battery", unsubscribe);

    log.report().with_data(Value::Array(subscription.history()))
}
