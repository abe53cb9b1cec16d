//! Greet known faces, offer training to unknown ones.
//!
//! Recognition events are only acted upon in [`FaceStatus::Main`] and are
//! debounced per label with [`should_handle`].  Console lines answer the
//! training prompt, name the new face, or end the skill.
//!
//! | Status | Entered when | Left when |
//! |---|---|---|
//! | `Main` | start-up, after greeting / training / cancel | a face is recognised |
//! | `Greet` | a known face was recognised | the greeting was spoken |
//! | `Prompt` | an unknown face was recognised | the user answers |
//! | `Init` | the user accepted training | the user types a name or a stop word |
//! | `Train` | training started | the robot reports the embedding phase complete |
//! | `Talk` | while any utterance is being spoken | the utterance was sent |

use std::sync::Arc;

use async_trait::async_trait;
use misty_middleware::{ActionApi, EventSubscription, LocalEventBus, SubscriptionConfig};
use misty_types::{ActionResult, Event, EventPayload, close_event_name, error_event_name};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{is_stop_word, random_suffix};
use crate::report::{ActionLog, SkillReport};
use crate::skill::{Dispatch, Skill, SkillInput, SkillInputs, SkillLoop};
use crate::status::{SkillStatus, StatusData, StatusPatch, StatusStore};

/// Minimal time in seconds between two greetings of the same label.
pub const UPDATE_TIME: f64 = 1.0;

/// Label the robot reports for a face it does not know.
pub const UNKNOWN_LABEL: &str = "unknown person";

/// Faces whose id starts with this are forgotten at start-up.
pub const TESTING_NAME: &str = "chris";

/// `FaceTraining` message marking the end of a training session.
pub const TRAINING_COMPLETE: &str = "Face training embedding phase complete.";

pub const YES_WORDS: [&str; 2] = ["yes", "y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceStatus {
    #[default]
    Initialised,
    Main,
    Prompt,
    Init,
    Train,
    Greet,
    Talk,
}

impl SkillStatus for FaceStatus {}

/// Whether a detection of `label` at `now` deserves a reaction, given the
/// previously handled label and the time of the previous detection.
pub fn should_handle(prev_label: Option<&str>, prev_time: f64, label: &str, now: f64) -> bool {
    now - prev_time > UPDATE_TIME || prev_label != Some(label)
}

/// Display name for a face id: the part before the first `_`, capitalised.
pub fn user_from_face_id(face_id: &str) -> String {
    let base = face_id.split('_').next().unwrap_or_default();
    let mut chars = base.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn event_seconds(event: &Event) -> f64 {
    event.timestamp.timestamp_millis() as f64 / 1000.0
}

fn names_in(result: &ActionResult) -> Option<Vec<String>> {
    result.result.as_ref().and_then(Value::as_array).map(|faces| {
        faces
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Skill
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FaceRecognitionConfig {
    pub pubsub_url: String,
    pub debounce_ms: u64,
    pub max_entries: usize,
}

impl FaceRecognitionConfig {
    pub fn new(pubsub_url: impl Into<String>) -> Self {
        Self {
            pubsub_url: pubsub_url.into(),
            debounce_ms: misty_middleware::subscription::DEFAULT_DEBOUNCE_MS,
            max_entries: misty_middleware::subscription::DEFAULT_MAX_ENTRIES,
        }
    }
}

pub struct FaceRecognition {
    api: Arc<dyn ActionApi>,
    config: FaceRecognitionConfig,
    bus: Arc<LocalEventBus>,
    event_name: String,
    train_event_name: String,
    recognition: Option<EventSubscription>,
    training: Option<EventSubscription>,
    stop_requested: bool,
    log: ActionLog,
}

impl FaceRecognition {
    pub fn new(api: Arc<dyn ActionApi>, config: FaceRecognitionConfig) -> Self {
        Self {
            api,
            config,
            bus: Arc::new(LocalEventBus::new()),
            event_name: format!("face_rec_{}", random_suffix(6)),
            train_event_name: format!("face_train_{}", random_suffix(6)),
            recognition: None,
            training: None,
            stop_requested: false,
            log: ActionLog::new(),
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn train_event_name(&self) -> &str {
        &self.train_event_name
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    /// Forward recognition and training push events into `sender`.
    pub fn route_events(&self, sender: mpsc::UnboundedSender<SkillInput>) {
        let mut names = Vec::new();
        for name in [&self.event_name, &self.train_event_name] {
            names.push(name.clone());
            names.push(error_event_name(name));
            names.push(close_event_name(name));
        }
        self.bus.forward_to(names, sender);
    }

    fn subscription(&self, event_type: &str, event_name: &str) -> EventSubscription {
        let config = SubscriptionConfig::new(event_type, event_name)
            .with_debounce_ms(self.config.debounce_ms)
            .with_max_entries(self.config.max_entries);
        EventSubscription::subscribe(
            self.config.pubsub_url.clone(),
            config,
            Some(Arc::clone(&self.bus)),
        )
    }

    /// Lower the volume, forget test faces and start recognition.
    pub async fn prepare(&mut self) {
        let volume = self
            .api
            .perform_action("volume_settings", Some(json!({"Volume": "5"})))
            .await;
        self.log.record("volume_settings", volume);

        let known = self.api.get_info("faces_known", &[]).await;
        match names_in(&self.log.record("faces_known", known)) {
            Some(faces) => {
                println!("Your Misty currently knows these faces: {}.", faces.join(", "));
                for face in faces.iter().filter(|f| f.starts_with(TESTING_NAME)) {
                    let result = self
                        .api
                        .perform_action("face_delete", Some(json!({"FaceId": face})))
                        .await;
                    if result.success {
                        println!("Successfully forgot the face of {face}.");
                    } else {
                        println!("Failed to forget the face of {face}.");
                    }
                    self.log.record("face_delete", result);
                }
            }
            None => println!("Your Misty currently does not know any faces."),
        }

        let start = self.api.perform_action("face_recognition_start", None).await;
        self.log.record("face_recognition_start", start);
    }

    pub fn subscribe(&mut self) {
        self.recognition = Some(self.subscription("FaceRecognition", &self.event_name));
    }

    /// Unsubscribe everything, stop recognition and say goodbye.
    pub async fn teardown(&mut self, store: &StatusStore<FaceStatus>) {
        for (name, subscription) in [
            ("unsubscribe_face_recognition", self.recognition.take()),
            ("unsubscribe_face_training", self.training.take()),
        ] {
            if let Some(mut subscription) = subscription {
                let result = match subscription.unsubscribe().await {
                    Ok(()) => ActionResult::ok(None),
                    Err(e) => ActionResult::failed(e.to_string()),
                };
                self.log.record(name, result);
            }
        }
        let stop = self.api.perform_action("face_recognition_stop", None).await;
        self.log.record("face_recognition_stop", stop);
        self.speak(store, "Bye!").await;
    }

    pub async fn run(mut self, inputs: SkillInputs) -> SkillReport {
        let store = Arc::new(StatusStore::new());
        self.prepare().await;
        self.route_events(inputs.sender());
        self.subscribe();
        store.set(StatusPatch::status(FaceStatus::Main));
        println!(">>> Type 'stop' to terminate <<<");

        let mut skill_loop = SkillLoop::new(self, Arc::clone(&store), inputs.into_receiver());
        let exit = skill_loop.run().await;
        info!(?exit, "face recognition finished");

        let mut skill = skill_loop.into_skill();
        skill.teardown(&store).await;
        skill.log.report()
    }

    /// Speak `text`, showing `Talk` for the duration.
    async fn speak(&mut self, store: &StatusStore<FaceStatus>, text: &str) {
        let previous = store.status();
        store.set(StatusPatch::status(FaceStatus::Talk));
        println!("{text}");
        let result = self
            .api
            .perform_action(
                "speak",
                Some(json!({"Text": text, "UtteranceId": format!("utterance_{}", random_suffix(6))})),
            )
            .await;
        if !result.success {
            warn!(message = ?result.message, "talking failed");
        }
        self.log.record("speak", result);
        store.set(StatusPatch::status(previous));
    }

    async fn on_recognition(&mut self, event: &Event, body: &Value, store: &StatusStore<FaceStatus>) {
        if store.status() != FaceStatus::Main {
            return;
        }
        let Some(label) = body.get("label").and_then(Value::as_str) else {
            debug!("face event without label");
            return;
        };
        let now = event_seconds(event);
        let (prev_label, prev_time) = store.update(|r| (r.data.as_text().map(str::to_string), r.time));

        if should_handle(prev_label.as_deref(), prev_time, label, now) {
            store.set(StatusPatch::data(StatusData::text(label)).with_time(now));
            if label == UNKNOWN_LABEL {
                self.training_prompt(store).await;
            } else {
                self.greet(store, label).await;
            }
        }
        store.set(StatusPatch::time(now));
    }

    async fn training_prompt(&mut self, store: &StatusStore<FaceStatus>) {
        store.set(StatusPatch::status(FaceStatus::Prompt));
        self.speak(
            store,
            "Hello! I do not know you yet, do you want to begin the face training session?",
        )
        .await;
        println!("An unknown face detected.\nDo you want to start training (yes/no)? [no]");
    }

    async fn greet(&mut self, store: &StatusStore<FaceStatus>, label: &str) {
        store.set(StatusPatch::status(FaceStatus::Greet));
        self.speak(store, &format!("Hello, {}!", user_from_face_id(label))).await;
        store.set(StatusPatch::status(FaceStatus::Main));
    }

    async fn initialise_training(&mut self, store: &StatusStore<FaceStatus>) {
        store.set(StatusPatch::status(FaceStatus::Init));
        self.speak(
            store,
            "<p>How should I call you?</p><p>Please enter your name in the terminal.</p>",
        )
        .await;
        println!("Enter your name (the first name suffices)");
    }

    async fn perform_training(&mut self, store: &StatusStore<FaceStatus>, name: &str) {
        store.set(StatusPatch::status(FaceStatus::Train));

        let known = self.api.get_info("faces_known", &[]).await;
        let known = names_in(&self.log.record("faces_known", known)).unwrap_or_default();
        let mut face_id = name.to_string();
        while known.contains(&face_id) {
            face_id = format!("{name}_{}", random_suffix(3));
        }
        if face_id != name {
            println!("The name {name} is already in use, using {face_id} instead.");
        }
        if face_id.is_empty() {
            face_id = random_suffix(6);
            println!("The name {name} is invalid, using {face_id} instead.");
        }

        info!(%face_id, "face training started");
        let start = self
            .api
            .perform_action("face_train_start", Some(json!({"FaceId": face_id})))
            .await;
        self.log.record("face_train_start", start);
        self.speak(store, "The training has commenced, please do not look away now.")
            .await;
        self.training = Some(self.subscription("FaceTraining", &self.train_event_name));
    }

    async fn on_training_complete(&mut self, store: &StatusStore<FaceStatus>) {
        self.speak(store, "Thank you, the training is complete now.").await;
        store.set(StatusPatch::status(FaceStatus::Main));
        if let Some(mut training) = self.training.take() {
            let result = match training.unsubscribe().await {
                Ok(()) => ActionResult::ok(None),
                Err(e) => ActionResult::failed(e.to_string()),
            };
            self.log.record("unsubscribe_face_training", result);
        }
    }

    async fn on_user_line(&mut self, line: &str, store: &StatusStore<FaceStatus>) {
        let input = line.trim().to_lowercase();
        let stop = is_stop_word(&input);

        match store.status() {
            FaceStatus::Prompt if YES_WORDS.contains(&input.as_str()) => {
                self.initialise_training(store).await;
            }
            FaceStatus::Prompt => {
                println!("Training not initialised.");
                store.set(StatusPatch::status(FaceStatus::Main));
            }
            FaceStatus::Init if !stop => self.perform_training(store, &input).await,
            FaceStatus::Init => {
                let cancel = self.api.perform_action("face_train_cancel", None).await;
                self.log.record("face_train_cancel", cancel);
                store.set(StatusPatch::status(FaceStatus::Main));
            }
            FaceStatus::Talk if stop => {
                let quiet = self.api.perform_action("speak_stop", None).await;
                self.log.record("speak_stop", quiet);
                store.set(StatusPatch::status(FaceStatus::Main));
            }
            _ => {}
        }

        if stop && store.status() == FaceStatus::Main {
            self.stop_requested = true;
        }
    }
}

#[async_trait]
impl Skill for FaceRecognition {
    type Status = FaceStatus;

    async fn on_input(&mut self, input: SkillInput, store: &StatusStore<FaceStatus>) {
        let event = match input {
            SkillInput::UserLine(line) => return self.on_user_line(&line, store).await,
            SkillInput::Event(event) => event,
        };
        match &event.payload {
            EventPayload::Message(body) if event.name == self.event_name => {
                self.on_recognition(&event, body, store).await;
            }
            EventPayload::Message(body) if event.name == self.train_event_name => {
                if body.get("message").and_then(Value::as_str) == Some(TRAINING_COMPLETE) {
                    self.on_training_complete(store).await;
                }
            }
            EventPayload::Error(details) => warn!(event = %event.name, %details, "push channel error"),
            EventPayload::Closed(reason) => warn!(event = %event.name, %reason, "push channel closed"),
            _ => {}
        }
    }

    async fn dispatch(&mut self, status: FaceStatus, store: &StatusStore<FaceStatus>) -> Dispatch {
        match status {
            FaceStatus::Initialised => {
                store.set(StatusPatch::status(FaceStatus::Main));
                Dispatch::Continue
            }
            FaceStatus::Main if self.stop_requested => Dispatch::Stop,
            FaceStatus::Main
            | FaceStatus::Prompt
            | FaceStatus::Init
            | FaceStatus::Train
            | FaceStatus::Greet
            | FaceStatus::Talk => Dispatch::AwaitInput,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::testing::FakeRobot;
    use chrono::{Duration, Utc};

    fn skill(robot: &Arc<FakeRobot>) -> FaceRecognition {
        FaceRecognition::new(
            Arc::clone(robot) as Arc<dyn ActionApi>,
            FaceRecognitionConfig::new("ws://127.0.0.1:9/pubsub"),
        )
    }

    fn main_store() -> StatusStore<FaceStatus> {
        let store = StatusStore::new();
        store.set(StatusPatch::status(FaceStatus::Main));
        store
    }

    /// Recognition events for `labels` at the given offsets in milliseconds.
    fn detections(name: &str, seen: &[(&str, i64)]) -> Vec<SkillInput> {
        let start = Utc::now();
        seen.iter()
            .map(|(label, offset)| {
                let mut event = Event::message(name, json!({"label": label}));
                event.timestamp = start + Duration::milliseconds(*offset);
                event.into()
            })
            .collect()
    }

    async fn feed(face: &mut FaceRecognition, store: &StatusStore<FaceStatus>, inputs: Vec<SkillInput>) {
        for input in inputs {
            face.on_input(input, store).await;
        }
    }

    #[test]
    fn debounce_rule() {
        assert!(should_handle(None, 0.0, "alice", 0.5));
        assert!(!should_handle(Some("alice"), 10.0, "alice", 10.5));
        assert!(!should_handle(Some("alice"), 10.0, "alice", 11.0));
        assert!(should_handle(Some("alice"), 10.0, "alice", 11.5));
        assert!(should_handle(Some("alice"), 10.0, "bob", 10.1));
    }

    #[test]
    fn display_names() {
        assert_eq!(user_from_face_id("alice_ab1"), "Alice");
        assert_eq!(user_from_face_id("BOB"), "Bob");
        assert_eq!(user_from_face_id(""), "");
    }

    #[tokio::test]
    async fn same_face_within_update_time_greeted_once() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = main_store();
        let inputs = detections(face.event_name(), &[("alice", 0), ("alice", 500)]);

        feed(&mut face, &store, inputs).await;

        assert_eq!(robot.spoken(), ["Hello, Alice!"]);
        assert_eq!(store.status(), FaceStatus::Main);
        assert_eq!(store.data().as_text(), Some("alice"));
    }

    #[tokio::test]
    async fn same_face_after_update_time_greeted_again() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = main_store();
        let inputs = detections(face.event_name(), &[("alice", 0), ("alice", 1500)]);

        feed(&mut face, &store, inputs).await;

        assert_eq!(robot.spoken(), ["Hello, Alice!", "Hello, Alice!"]);
    }

    #[tokio::test]
    async fn time_advances_on_every_detection() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = main_store();
        // Each detection is under a second after the previous one.
        let inputs = detections(face.event_name(), &[("alice", 0), ("alice", 800), ("alice", 1600)]);

        feed(&mut face, &store, inputs).await;

        assert_eq!(robot.spoken().len(), 1);
    }

    #[tokio::test]
    async fn new_label_is_handled_immediately() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = main_store();
        let inputs = detections(face.event_name(), &[("alice_x", 0), ("bob_y", 100)]);

        feed(&mut face, &store, inputs).await;

        assert_eq!(robot.spoken(), ["Hello, Alice!", "Hello, Bob!"]);
    }

    #[tokio::test]
    async fn detections_outside_main_are_ignored() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = StatusStore::new();
        store.set(StatusPatch::status(FaceStatus::Train));
        let inputs = detections(face.event_name(), &[("alice", 0)]);

        feed(&mut face, &store, inputs).await;

        assert!(robot.spoken().is_empty());
        assert_eq!(store.time(), 0.0);
    }

    #[tokio::test]
    async fn unknown_face_leads_through_training() {
        let robot = Arc::new(
            FakeRobot::new().respond("faces_known", ActionResult::ok(Some(json!(["dana"])))),
        );
        let mut face = skill(&robot);
        let store = main_store();

        let unknown = detections(face.event_name(), &[(UNKNOWN_LABEL, 0)]);
        feed(&mut face, &store, unknown).await;
        assert_eq!(store.status(), FaceStatus::Prompt);

        face.on_input(SkillInput::UserLine("Yes".into()), &store).await;
        assert_eq!(store.status(), FaceStatus::Init);

        face.on_input(SkillInput::UserLine("Dana".into()), &store).await;
        assert_eq!(store.status(), FaceStatus::Train);
        let started = robot
            .calls()
            .into_iter()
            .find(|c| c.id == "face_train_start")
            .and_then(|c| c.data)
            .and_then(|d| d["FaceId"].as_str().map(str::to_string))
            .unwrap();
        assert!(started.starts_with("dana_"), "{started}");
        assert_eq!(started.len(), "dana_".len() + 3);

        let done = Event::message(face.train_event_name(), json!({"message": TRAINING_COMPLETE}));
        face.on_input(done.into(), &store).await;
        assert_eq!(store.status(), FaceStatus::Main);
        assert_eq!(
            robot.spoken().last().map(String::as_str),
            Some("Thank you, the training is complete now.")
        );
        assert!(face.log().names().contains(&"unsubscribe_face_training"));
    }

    #[tokio::test]
    async fn declining_the_prompt_returns_to_main() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = StatusStore::new();
        store.set(StatusPatch::status(FaceStatus::Prompt));

        face.on_input(SkillInput::UserLine("no".into()), &store).await;

        assert_eq!(store.status(), FaceStatus::Main);
        assert_eq!(face.dispatch(FaceStatus::Main, &store).await, Dispatch::AwaitInput);
    }

    #[tokio::test]
    async fn stop_while_naming_cancels_training_and_ends() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = StatusStore::new();
        store.set(StatusPatch::status(FaceStatus::Init));

        face.on_input(SkillInput::UserLine("stop".into()), &store).await;

        assert_eq!(robot.ids(), ["face_train_cancel"]);
        assert_eq!(store.status(), FaceStatus::Main);
        assert_eq!(face.dispatch(FaceStatus::Main, &store).await, Dispatch::Stop);
    }

    #[tokio::test]
    async fn stop_while_talking_silences_the_robot() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = StatusStore::new();
        store.set(StatusPatch::status(FaceStatus::Talk));

        face.on_input(SkillInput::UserLine("s".into()), &store).await;

        assert_eq!(robot.ids(), ["speak_stop"]);
        assert_eq!(store.status(), FaceStatus::Main);
    }

    #[tokio::test]
    async fn start_up_forgets_testing_faces() {
        let robot = Arc::new(
            FakeRobot::new().respond("faces_known", ActionResult::ok(Some(json!(["chris_1", "alice"])))),
        );
        let mut face = skill(&robot);

        face.prepare().await;

        let deleted: Vec<_> = robot
            .calls()
            .into_iter()
            .filter(|c| c.id == "face_delete")
            .map(|c| c.data)
            .collect();
        assert_eq!(deleted, vec![Some(json!({"FaceId": "chris_1"}))]);
        assert_eq!(robot.ids().last().map(String::as_str), Some("face_recognition_start"));
    }

    #[tokio::test]
    async fn teardown_says_bye_after_stopping_recognition() {
        let robot = Arc::new(FakeRobot::new());
        let mut face = skill(&robot);
        let store = main_store();

        face.teardown(&store).await;

        assert_eq!(robot.ids(), ["face_recognition_stop", "speak"]);
        assert_eq!(robot.spoken(), ["Bye!"]);
        assert!(face.log().report().overall_success);
    }
}
