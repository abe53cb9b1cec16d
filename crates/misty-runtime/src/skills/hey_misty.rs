//! React to the "Hey, Misty" key phrase.
//!
//! Key-phrase recognition runs on the robot.  Every `KeyPhraseRecognized`
//! push event with a confidence of at least [`CONFIDENCE_THRESHOLD`] makes
//! the robot light up and play its wake sound.  Any console line (a bare
//! Enter included) ends the skill.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use misty_middleware::{ActionApi, EventSubscription, LocalEventBus, SubscriptionConfig};
use misty_types::{ActionResult, EventPayload, close_event_name, error_event_name};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{cancel_running_skills, random_suffix};
use crate::report::{ActionLog, SkillReport};
use crate::skill::{Dispatch, Skill, SkillInput, SkillInputs, SkillLoop};
use crate::status::{SkillStatus, StatusData, StatusPatch, StatusStore};

pub const KEY_PHRASE_RECOGNIZED: &str = "KeyPhraseRecognized";

/// Lowest `confidence` the robot must report before the skill reacts.
pub const CONFIDENCE_THRESHOLD: i64 = 60;

/// How long the listening light stays on.
pub const EXPRESSION_DURATION: Duration = Duration::from_millis(1500);

const WAKE_SOUND: &str = "s_SystemWakeWord.wav";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeyStatus {
    #[default]
    Initialised,
    Listening,
    Stop,
}

impl SkillStatus for HeyStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, HeyStatus::Stop)
    }
}

/// Whether a `KeyPhraseRecognized` message is confident enough to answer.
///
/// The robot reports an integer percentage; anything else is ignored.
pub fn is_confident(message: &Value) -> bool {
    message
        .get("confidence")
        .and_then(Value::as_i64)
        .is_some_and(|c| c >= CONFIDENCE_THRESHOLD)
}

/// Light up azure and play the wake sound, then turn the light off after
/// `duration`.
pub async fn listening_expression(api: &dyn ActionApi, duration: Duration) -> SkillReport {
    let mut log = ActionLog::new();
    let led = api
        .perform_action("led", Some(json!({"Red": 0, "Green": 127, "Blue": 255})))
        .await;
    log.record("led", led);
    let sound = api
        .perform_action("audio_play", Some(json!({"FileName": WAKE_SOUND})))
        .await;
    log.record("audio_play", sound);

    tokio::time::sleep(duration).await;

    let off = api
        .perform_action("led", Some(json!({"Red": 0, "Green": 0, "Blue": 0})))
        .await;
    log.record("led_off", off);
    log.report()
}

#[derive(Debug, Clone)]
pub struct HeyMistyConfig {
    pub pubsub_url: String,
    pub debounce_ms: u64,
    pub max_entries: usize,
    pub expression_duration: Duration,
}

impl HeyMistyConfig {
    pub fn new(pubsub_url: impl Into<String>) -> Self {
        Self {
            pubsub_url: pubsub_url.into(),
            debounce_ms: misty_middleware::subscription::DEFAULT_DEBOUNCE_MS,
            max_entries: misty_middleware::subscription::DEFAULT_MAX_ENTRIES,
            expression_duration: EXPRESSION_DURATION,
        }
    }
}

pub struct HeyMisty {
    api: Arc<dyn ActionApi>,
    config: HeyMistyConfig,
    bus: Arc<LocalEventBus>,
    event_name: String,
    subscription: Option<EventSubscription>,
    log: ActionLog,
}

impl HeyMisty {
    pub fn new(api: Arc<dyn ActionApi>, config: HeyMistyConfig) -> Self {
        Self {
            api,
            config,
            bus: Arc::new(LocalEventBus::new()),
            event_name: format!("keyphrase_greeting_{}", random_suffix(6)),
            subscription: None,
            log: ActionLog::new(),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub fn route_events(&self, sender: mpsc::UnboundedSender<SkillInput>) {
        self.bus.forward_to(
            [
                self.event_name.clone(),
                error_event_name(&self.event_name),
                close_event_name(&self.event_name),
            ],
            sender,
        );
    }

    /// Cancel other skills, enable audio and start key-phrase recognition.
    ///
    /// Returns `false` when recognition did not start.
    pub async fn prepare(&mut self) -> bool {
        cancel_running_skills(self.api.as_ref(), &mut self.log).await;

        let audio = self.api.perform_action("audio_enable", None).await;
        self.log.record("audio_enable", audio);

        let mut start = self
            .api
            .perform_action("keyphrase_start", Some(json!({"CaptureSpeech": "false"})))
            .await;
        if !start.is_truthy() {
            start.success = false;
            start
                .message
                .get_or_insert_with(|| "key-phrase recognition did not start".to_string());
            self.log.record("keyphrase_start", start);
            return false;
        }
        self.log.record("keyphrase_start", start);
        true
    }

    pub fn subscribe(&mut self) {
        let config = SubscriptionConfig::new(KEY_PHRASE_RECOGNIZED, self.event_name.clone())
            .with_debounce_ms(self.config.debounce_ms)
            .with_max_entries(self.config.max_entries);
        self.subscription = Some(EventSubscription::subscribe(
            self.config.pubsub_url.clone(),
            config,
            Some(Arc::clone(&self.bus)),
        ));
    }

    /// Unsubscribe, stop recognition and switch audio off again.
    pub async fn teardown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            let result = match subscription.unsubscribe().await {
                Ok(()) => ActionResult::ok(None),
                Err(e) => ActionResult::failed(e.to_string()),
            };
            self.log.record("unsubscribe_keyphrase", result);
        }
        let stop = self.api.perform_action("keyphrase_stop", None).await;
        self.log.record("keyphrase_stop", stop);
        let audio = self.api.perform_action("audio_disable", None).await;
        self.log.record("audio_disable", audio);
    }

    /// Run the whole skill.  The report data tells whether the key phrase
    /// was heard and how the last reaction went.
    pub async fn run(mut self, inputs: SkillInputs) -> SkillReport {
        let store = Arc::new(StatusStore::new());
        store.set(StatusPatch::data(StatusData::Json(json!({"keyphrase detected": false}))));
        if !self.prepare().await {
            return self.log.report();
        }

        self.route_events(inputs.sender());
        self.subscribe();
        store.set(StatusPatch::status(HeyStatus::Listening));
        println!("Keyphrase recognition started.");
        println!(">>> Press enter to terminate <<<");

        let mut skill_loop = SkillLoop::new(self, Arc::clone(&store), inputs.into_receiver());
        let exit = skill_loop.run().await;
        info!(?exit, "key-phrase greeting finished");
        println!("Keyphrase recognition ended.");

        let mut skill = skill_loop.into_skill();
        skill.teardown().await;
        let data = store.data().as_json().cloned().unwrap_or_default();
        skill.log.report().with_data(data)
    }

    async fn react(&mut self, store: &StatusStore<HeyStatus>) {
        println!("Hello!");
        let expression = listening_expression(self.api.as_ref(), self.config.expression_duration).await;
        for entry in &expression.actions {
            self.log.record(entry.name.clone(), entry.result.clone());
        }
        let details = serde_json::to_value(&expression).unwrap_or_default();
        store.set(StatusPatch::data(StatusData::Json(json!({
            "keyphrase detected": true,
            "reaction_success": expression.overall_success,
            "keyphrase_reaction_details": details,
        }))));
    }
}

#[async_trait]
impl Skill for HeyMisty {
    type Status = HeyStatus;

    async fn on_input(&mut self, input: SkillInput, store: &StatusStore<HeyStatus>) {
        let event = match input {
            SkillInput::UserLine(_) => {
                store.set(StatusPatch::status(HeyStatus::Stop));
                return;
            }
            SkillInput::Event(event) => event,
        };
        match &event.payload {
            EventPayload::Message(body) if event.name == self.event_name => {
                if is_confident(body) {
                    self.react(store).await;
                } else {
                    debug!(confidence = ?body.get("confidence"), "key phrase too uncertain");
                }
            }
            EventPayload::Error(details) => warn!(%details, "key-phrase channel error"),
            EventPayload::Closed(reason) => warn!(%reason, "key-phrase channel closed"),
            _ => {}
        }
    }

    async fn dispatch(&mut self, status: HeyStatus, store: &StatusStore<HeyStatus>) -> Dispatch {
        match status {
            HeyStatus::Initialised => {
                store.set(StatusPatch::status(HeyStatus::Listening));
                Dispatch::Continue
            }
            HeyStatus::Listening => Dispatch::AwaitInput,
            HeyStatus::Stop => Dispatch::Stop,
        }
    }
}
