//! End-to-end tests of `EventSubscription` against an in-process robot.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use misty_middleware::{EventSubscription, LocalEventBus, SubscriptionConfig, SubscriptionState};
use misty_types::{Event, EventPayload};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type TestResult = Result<(), Box<dyn Error>>;

const WAIT: Duration = Duration::from_secs(5);

/// Accept one client, wait for its subscribe frame, push `frames`, then
/// either close (`close_after_push`) or record client frames until it closes.
async fn fake_robot(
    frames: Vec<String>,
    close_after_push: bool,
) -> Result<(String, JoinHandle<Vec<String>>), Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let mut received = Vec::new();
        let Ok((stream, _)) = listener.accept().await else {
            return received;
        };
        let Ok(mut ws) = accept_async(stream).await else {
            return received;
        };
        if let Some(Ok(Message::Text(t))) = ws.next().await {
            received.push(t.to_string());
        }
        for frame in frames {
            if ws.send(Message::Text(frame.into())).await.is_err() {
                return received;
            }
        }
        if close_after_push {
            let _ = ws.close(None).await;
            return received;
        }
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(t) => received.push(t.to_string()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        received
    });
    Ok((format!("ws://{addr}/pubsub"), handle))
}

async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Result<Event, Box<dyn Error>> {
    Ok(tokio::time::timeout(WAIT, rx.recv()).await?.ok_or("queue closed")?)
}

#[tokio::test]
async fn battery_message_reaches_listener_exactly_once() -> TestResult {
    let (url, robot) = fake_robot(vec![r#"{"message":{"chargePercent":42}}"#.to_string()], false).await?;
    let bus = Arc::new(LocalEventBus::new());
    let mut rx = bus.queue(["battery_x"]);

    let mut sub = EventSubscription::subscribe(
        url,
        SubscriptionConfig::new("BatteryCharge", "battery_x"),
        Some(Arc::clone(&bus)),
    );

    let event = next_event(&mut rx).await?;
    assert_eq!(event.payload, EventPayload::Message(json!({"chargePercent": 42})));
    assert_eq!(sub.state(), SubscriptionState::Open);

    sub.unsubscribe().await?;
    assert!(rx.try_recv().is_err(), "no second delivery");
    assert_eq!(sub.history(), vec![json!({"chargePercent": 42})]);

    let frames = robot.await?;
    assert_eq!(
        frames,
        vec![
            r#"{"Operation":"subscribe","Type":"BatteryCharge","DebounceMs":250,"EventName":"battery_x","ReturnProperty":null}"#.to_string(),
            r#"{"Operation":"unsubscribe","EventName":"battery_x","Message":""}"#.to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn unsubscribe_twice_is_noop_and_silences_events() -> TestResult {
    let (url, robot) = fake_robot(vec![], false).await?;
    let bus = Arc::new(LocalEventBus::new());
    let mut opened = bus.queue(["open_speech"]);
    let mut all = bus.queue(["speech", "error_speech", "close_speech"]);

    let mut sub = EventSubscription::subscribe(
        url,
        SubscriptionConfig::new("VoiceRecord", "speech"),
        Some(Arc::clone(&bus)),
    );
    next_event(&mut opened).await?;

    sub.unsubscribe().await?;
    sub.unsubscribe().await?;
    assert_eq!(sub.state(), SubscriptionState::Closed);

    // Only the close notification, emitted before unsubscribe returned.
    let events: Vec<String> = std::iter::from_fn(|| all.try_recv().ok()).map(|e| e.name).collect();
    assert_eq!(events, vec!["close_speech".to_string()]);

    robot.await?;
    Ok(())
}

#[tokio::test]
async fn history_keeps_most_recent_entries() -> TestResult {
    let frames: Vec<String> = (0..15)
        .map(|i| format!(r#"{{"message":{{"seq":{i}}}}}"#))
        .collect();
    let (url, _robot) = fake_robot(frames, false).await?;
    let bus = Arc::new(LocalEventBus::new());
    let mut rx = bus.queue(["seq"]);

    let mut sub = EventSubscription::subscribe(
        url,
        SubscriptionConfig::new("TimeOfFlight", "seq").with_max_entries(10),
        Some(Arc::clone(&bus)),
    );
    for _ in 0..15 {
        next_event(&mut rx).await?;
    }

    let expected: Vec<Value> = (5..15).map(|i| json!({"seq": i})).collect();
    assert_eq!(sub.history(), expected);
    sub.unsubscribe().await?;
    Ok(())
}

#[tokio::test]
async fn server_close_emits_close_event() -> TestResult {
    let (url, _robot) = fake_robot(vec![r#"{"message":{"label":"alice"}}"#.to_string()], true).await?;
    let bus = Arc::new(LocalEventBus::new());
    let mut rx = bus.queue(["face", "close_face"]);

    let sub = EventSubscription::subscribe(
        url,
        SubscriptionConfig::new("FaceRecognition", "face"),
        Some(Arc::clone(&bus)),
    );

    assert_eq!(next_event(&mut rx).await?.name, "face");
    let closed = next_event(&mut rx).await?;
    assert_eq!(closed.name, "close_face");
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(sub.log().last().map(String::as_str), Some("Closed"));
    Ok(())
}

#[tokio::test]
async fn malformed_frame_is_reported_not_fatal() -> TestResult {
    let frames = vec![
        r#"{"no_message":true}"#.to_string(),
        r#"{"message":{"chargePercent":7}}"#.to_string(),
    ];
    let (url, _robot) = fake_robot(frames, false).await?;
    let bus = Arc::new(LocalEventBus::new());
    let mut rx = bus.queue(["battery_x", "error_battery_x"]);

    let mut sub = EventSubscription::subscribe(
        url,
        SubscriptionConfig::new("BatteryCharge", "battery_x"),
        Some(Arc::clone(&bus)),
    );

    assert_eq!(next_event(&mut rx).await?.name, "error_battery_x");
    assert_eq!(next_event(&mut rx).await?.name, "battery_x");
    sub.unsubscribe().await?;
    Ok(())
}

#[tokio::test]
async fn unreachable_robot_reports_error_then_close() -> TestResult {
    // Grab a free port, then release it so nothing listens there.
    let port = TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port();
    let bus = Arc::new(LocalEventBus::new());
    let mut rx = bus.queue(["error_battery_x", "close_battery_x"]);

    let mut sub = EventSubscription::subscribe(
        format!("ws://127.0.0.1:{port}/pubsub"),
        SubscriptionConfig::new("BatteryCharge", "battery_x"),
        Some(Arc::clone(&bus)),
    );

    let error = next_event(&mut rx).await?;
    assert_eq!(error.name, "error_battery_x");
    assert!(matches!(error.payload, EventPayload::Error(_)));
    assert_eq!(next_event(&mut rx).await?.name, "close_battery_x");

    sub.unsubscribe().await?;
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(sub.log().len(), 2);
    Ok(())
}
