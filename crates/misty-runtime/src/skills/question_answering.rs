//! Spoken question answering.
//!
//! The robot records one utterance at a time (`speech_capture`).  When the
//! `VoiceRecord` push event reports a finished capture, the recording is
//! fetched, archived locally as `NNNN.wav`, transcribed, and answered with a
//! canned reply chosen from the transcript's intents and keywords.
//!
//! ```text
//! Reinit ──capture──▶ Listen ──errorCode 0──▶ Infer ──▶ Prep ──▶ Speak ─┐
//!   ▲                   │ errorCode 3            │ no recording          │
//!   └───────────────────┴────────────────────────┘◀──────────────────────┘
//!                                            "goodbye" or channel closed ──▶ Stop
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{Datelike, Local, NaiveDate};
use misty_middleware::{ActionApi, EventSubscription, LocalEventBus, SubscriptionConfig};
use misty_types::{EventPayload, MistyError, close_event_name, error_event_name};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{cancel_running_skills, is_stop_word, random_suffix};
use crate::report::{ActionLog, SkillReport};
use crate::skill::{Dispatch, Skill, SkillInput, SkillInputs, SkillLoop};
use crate::status::{SkillStatus, StatusData, StatusPatch, StatusStore};
use crate::transcribe::Transcriber;

/// Name of the robot-side capture file.
pub const SPEECH_FILE: &str = "capture_Dialogue.wav";

/// Push event type announcing capture results.
pub const VOICE_RECORD: &str = "VoiceRecord";

/// `errorCode` of a successful capture.
const CAPTURE_OK: i64 = 0;
/// `errorCode` of a capture that timed out without speech.
const CAPTURE_SILENT: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QaStatus {
    #[default]
    Initialised,
    Reinit,
    Listen,
    Infer,
    Prep,
    Speak,
    Stop,
}

impl SkillStatus for QaStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, QaStatus::Stop)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply selection
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of canned reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utterance {
    Hello,
    Goodbye,
    Date,
    Month,
    Year,
    Test,
    Unknown,
}

impl Utterance {
    pub fn as_str(self) -> &'static str {
        match self {
            Utterance::Hello => "hello",
            Utterance::Goodbye => "goodbye",
            Utterance::Date => "date",
            Utterance::Month => "month",
            Utterance::Year => "year",
            Utterance::Test => "test",
            Utterance::Unknown => "unknown",
        }
    }

    /// Inverse of [`as_str`][Self::as_str]; anything else is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "hello" => Utterance::Hello,
            "goodbye" => Utterance::Goodbye,
            "date" => Utterance::Date,
            "month" => Utterance::Month,
            "year" => Utterance::Year,
            "test" => Utterance::Test,
            _ => Utterance::Unknown,
        }
    }

    /// The sentence spoken for this reply on `today`.
    pub fn reply(self, today: NaiveDate) -> String {
        match self {
            Utterance::Test => "I received your test.".to_string(),
            Utterance::Unknown => "I am sorry, I do not understand.".to_string(),
            Utterance::Hello => "Hello!".to_string(),
            Utterance::Goodbye => "Goodbye!".to_string(),
            Utterance::Year => format!("It is the year {}.", today.year()),
            Utterance::Month => format!("It is the month of {}.", today.format("%B")),
            Utterance::Date => format!(
                "It is the {} of {}, year {}.",
                ordinal(today.day()),
                today.format("%B"),
                today.year()
            ),
        }
    }
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// Split a wit.ai `entities` map into intent values and the other keys.
pub fn intents_and_keywords(entities: &Value) -> (Vec<String>, Vec<String>) {
    let mut intents = Vec::new();
    let mut keywords = Vec::new();
    let Some(map) = entities.as_object() else {
        return (intents, keywords);
    };
    for (key, value) in map {
        if key == "intent" {
            intents.extend(
                value
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|i| i.get("value").and_then(Value::as_str))
                    .map(str::to_string),
            );
        } else {
            keywords.push(key.clone());
        }
    }
    (intents, keywords)
}

/// Pick the reply for a transcript.
///
/// Precedence: `greet` over `datetime` over `test`.  Within `greet`, `hello`
/// beats `goodbye` and a bare greeting is a hello; within `datetime`, `date`
/// beats `month` beats `year`.
pub fn choose_reply(transcript: &Value) -> Utterance {
    let entities = transcript
        .get("content")
        .and_then(|c| c.get("entities"))
        .or_else(|| transcript.get("entities"));
    let (intents, keywords) = entities.map(intents_and_keywords).unwrap_or_default();
    let intent = |w: &str| intents.iter().any(|i| i == w);
    let keyword = |w: &str| keywords.iter().any(|k| k == w);

    if intent("greet") {
        if keyword("hello") {
            Utterance::Hello
        } else if keyword("goodbye") {
            Utterance::Goodbye
        } else {
            Utterance::Hello
        }
    } else if intent("datetime") {
        if keyword("date") {
            Utterance::Date
        } else if keyword("month") {
            Utterance::Month
        } else if keyword("year") {
            Utterance::Year
        } else {
            Utterance::Unknown
        }
    } else if intent("test") {
        Utterance::Test
    } else {
        Utterance::Unknown
    }
}

/// Path of the next recording in `dir`: one past the highest numbered file,
/// zero-padded to four digits.  Creates `dir` if needed.
///
/// # Errors
///
/// Fails on I/O errors, or when a file already carries the largest
/// representable number.
pub fn next_recording_path(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let mut highest = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(n) = number {
            highest = highest.max(n);
        }
    }
    let next = highest.checked_add(1).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "recording numbers exhausted")
    })?;
    Ok(dir.join(format!("{next:04}.wav")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Skill
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QuestionAnsweringConfig {
    pub pubsub_url: String,
    /// Where fetched recordings are archived.
    pub recordings_dir: PathBuf,
    pub debounce_ms: u64,
    pub max_entries: usize,
}

impl QuestionAnsweringConfig {
    pub fn new(pubsub_url: impl Into<String>, recordings_dir: impl Into<PathBuf>) -> Self {
        Self {
            pubsub_url: pubsub_url.into(),
            recordings_dir: recordings_dir.into(),
            debounce_ms: misty_middleware::subscription::DEFAULT_DEBOUNCE_MS,
            max_entries: misty_middleware::subscription::DEFAULT_MAX_ENTRIES,
        }
    }
}

pub struct QuestionAnswering {
    api: Arc<dyn ActionApi>,
    transcriber: Arc<dyn Transcriber>,
    config: QuestionAnsweringConfig,
    bus: Arc<LocalEventBus>,
    event_name: String,
    subscription: Option<EventSubscription>,
    log: ActionLog,
}

impl QuestionAnswering {
    pub fn new(
        api: Arc<dyn ActionApi>,
        transcriber: Arc<dyn Transcriber>,
        config: QuestionAnsweringConfig,
    ) -> Self {
        Self {
            api,
            transcriber,
            config,
            bus: Arc::new(LocalEventBus::new()),
            event_name: format!("user_speech_{}", random_suffix(6)),
            subscription: None,
            log: ActionLog::new(),
        }
    }

    /// Local routing key of the `VoiceRecord` subscription.
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Forward this skill's push events into `sender`.
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

    /// Cancel other skills and make sure audio works.
    ///
    /// Returns `false` when the audio service cannot be enabled; the skill
    /// must not start listening then.
    pub async fn prepare(&mut self) -> bool {
        cancel_running_skills(self.api.as_ref(), &mut self.log).await;

        let audio_on = self
            .log
            .record("audio_status", self.api.get_info("audio_status", &[]).await)
            .is_truthy();
        if !audio_on {
            let mut enable = self.api.perform_action("audio_enable", None).await;
            if !enable.is_truthy() {
                enable.success = false;
                enable
                    .message
                    .get_or_insert_with(|| "audio service stayed disabled".to_string());
                error!(message = ?enable.message, "audio could not be enabled");
                self.log.record("audio_enable", enable);
                return false;
            }
            self.log.record("audio_enable", enable);
        }

        let volume = self
            .api
            .perform_action("volume_settings", Some(json!({"Volume": "5"})))
            .await;
        self.log.record("volume_settings", volume);
        true
    }

    /// Open the `VoiceRecord` push subscription.
    pub fn subscribe(&mut self) {
        let config = SubscriptionConfig::new(VOICE_RECORD, self.event_name.clone())
            .with_debounce_ms(self.config.debounce_ms)
            .with_max_entries(self.config.max_entries);
        self.subscription = Some(EventSubscription::subscribe(
            self.config.pubsub_url.clone(),
            config,
            Some(Arc::clone(&self.bus)),
        ));
    }

    pub async fn teardown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            let result = match subscription.unsubscribe().await {
                Ok(()) => misty_types::ActionResult::ok(None),
                Err(e) => misty_types::ActionResult::failed(e.to_string()),
            };
            self.log.record("unsubscribe_voice_record", result);
        }
    }

    /// Run the whole skill and return its report.
    pub async fn run(mut self, inputs: SkillInputs) -> SkillReport {
        let store = Arc::new(StatusStore::new());
        if !self.prepare().await {
            store.set(StatusPatch::status(QaStatus::Stop));
            return self.log.report();
        }

        self.route_events(inputs.sender());
        self.subscribe();
        store.set(StatusPatch::status(QaStatus::Reinit));
        info!(event = %self.event_name, "listening for questions");

        let mut skill_loop = SkillLoop::new(self, store, inputs.into_receiver());
        let exit = skill_loop.run().await;
        info!(?exit, "question answering finished");

        let mut skill = skill_loop.into_skill();
        skill.teardown().await;
        skill.log.report()
    }

    async fn speak(&mut self, text: &str) {
        info!(%text, "speaking");
        let result = self
            .api
            .perform_action("speak", Some(json!({"Text": text, "Flush": "true"})))
            .await;
        self.log.record("speak", result);
    }

    /// Download the robot's capture file, if it has one.
    async fn fetch_recording(&mut self) -> Option<Vec<u8>> {
        let listing = self
            .log
            .record("audio_list", self.api.get_info("audio_list", &[]).await);
        let present = listing
            .result
            .as_ref()
            .and_then(Value::as_array)
            .is_some_and(|files| {
                files
                    .iter()
                    .any(|f| f.get("name").and_then(Value::as_str) == Some(SPEECH_FILE))
            });
        if !present {
            debug!("no capture file on the robot");
            return None;
        }

        let file = self.api.get_info("audio_file", &[("FileName", SPEECH_FILE), ("Base64", "true")]).await;
        let file = self.log.record("audio_file", file);
        let encoded = file
            .result
            .as_ref()
            .and_then(|r| r.get("base64"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if encoded.is_empty() {
            return None;
        }
        match STANDARD.decode(encoded) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "capture file is not valid base64");
                None
            }
        }
    }

    async fn save_recording(&self, wav: &[u8]) -> Result<PathBuf, MistyError> {
        let path = next_recording_path(&self.config.recordings_dir)
            .map_err(|e| MistyError::Recording(e.to_string()))?;
        tokio::fs::write(&path, wav)
            .await
            .map_err(|e| MistyError::Recording(format!("{}: {e}", path.display())))?;
        Ok(path)
    }

    async fn infer(&mut self, store: &StatusStore<QaStatus>) {
        let Some(wav) = self.fetch_recording().await else {
            store.set(StatusPatch::status(QaStatus::Reinit).with_data(StatusData::Empty));
            return;
        };

        match self.save_recording(&wav).await {
            Ok(path) => info!(path = %path.display(), "recording saved"),
            Err(e) => warn!(error = %e, "recording not saved"),
        }

        // A failed transcription still gets an answer: the "not understood" one.
        let transcript = match self.transcriber.transcribe(&wav).await {
            Ok(answer) => StatusData::Json(answer),
            Err(e) => {
                warn!(error = %e, "transcription failed");
                StatusData::Empty
            }
        };
        store.set(StatusPatch::status(QaStatus::Prep).with_data(transcript));
    }
}

#[async_trait]
impl Skill for QuestionAnswering {
    type Status = QaStatus;

    async fn on_input(&mut self, input: SkillInput, store: &StatusStore<QaStatus>) {
        let event = match input {
            SkillInput::Event(event) => event,
            SkillInput::UserLine(line) => {
                if is_stop_word(&line) {
                    store.set(StatusPatch::status(QaStatus::Stop));
                }
                return;
            }
        };

        match &event.payload {
            EventPayload::Message(body) if event.name == self.event_name => {
                match body.get("errorCode").and_then(Value::as_i64) {
                    Some(CAPTURE_OK) => store.set(StatusPatch::status(QaStatus::Infer)),
                    Some(CAPTURE_SILENT) => store.set(StatusPatch::status(QaStatus::Reinit)),
                    code => debug!(?code, "voice record event ignored"),
                }
            }
            EventPayload::Closed(reason) => {
                warn!(%reason, "voice record channel closed");
                store.set(StatusPatch::status(QaStatus::Stop));
            }
            EventPayload::Error(details) => warn!(%details, "voice record channel error"),
            _ => {}
        }
    }

    async fn dispatch(&mut self, status: QaStatus, store: &StatusStore<QaStatus>) -> Dispatch {
        match status {
            QaStatus::Initialised => {
                store.set(StatusPatch::status(QaStatus::Reinit));
                Dispatch::Continue
            }
            QaStatus::Reinit => {
                let result = self
                    .api
                    .perform_action("speech_capture", Some(json!({"RequireKeyPhrase": false})))
                    .await;
                self.log.record("speech_capture", result);
                store.set(StatusPatch::status(QaStatus::Listen));
                Dispatch::Continue
            }
            QaStatus::Listen => Dispatch::AwaitInput,
            QaStatus::Infer => {
                self.infer(store).await;
                Dispatch::Continue
            }
            QaStatus::Prep => {
                let utterance = store
                    .data()
                    .as_json()
                    .map_or(Utterance::Unknown, choose_reply);
                debug!(reply = utterance.as_str(), "reply chosen");
                store.set(
                    StatusPatch::status(QaStatus::Speak)
                        .with_data(StatusData::text(utterance.as_str())),
                );
                Dispatch::Continue
            }
            QaStatus::Speak => {
                let utterance = store
                    .data()
                    .as_text()
                    .map_or(Utterance::Unknown, Utterance::parse);
                self.speak(&utterance.reply(Local::now().date_naive())).await;
                let next = match utterance {
                    Utterance::Goodbye => QaStatus::Stop,
                    _ => QaStatus::Reinit,
                };
                store.set(StatusPatch::status(next));
                Dispatch::Continue
            }
            QaStatus::Stop => Dispatch::Stop,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
