//! Bundled skills.
//!
//! | Skill | Push events | Ends when |
//! |---|---|---|
//! | [`question_answering`] | `VoiceRecord` | the user says goodbye, or the push channel closes |
//! | [`face_recognition`] | `FaceRecognition`, `FaceTraining` | the user types a stop word in the main state |
//! | [`battery_printer`] | `BatteryCharge` | the requested duration elapses |
//! | [`hey_misty`] | `KeyPhraseRecognized` | the user presses Enter |

pub mod battery_printer;
pub mod face_recognition;
pub mod hey_misty;
pub mod question_answering;

use misty_middleware::ActionApi;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::report::ActionLog;

/// Console words that end a skill (face recognition: only from the main state).
pub const STOP_WORDS: [&str; 3] = ["stop", "s", "terminate"];

pub fn is_stop_word(line: &str) -> bool {
    STOP_WORDS.contains(&line.trim().to_lowercase().as_str())
}

/// Random lowercase hex string of `len` characters (at most 32).
pub fn random_suffix(len: usize) -> String {
    Uuid::new_v4().simple().to_string().chars().take(len).collect()
}

/// Stop every skill currently running on the robot.
pub(crate) async fn cancel_running_skills(api: &dyn ActionApi, log: &mut ActionLog) {
    let running = log.record("skills_running", api.get_info("skills_running", &[]).await);
    let ids: Vec<String> = running
        .result
        .as_ref()
        .and_then(Value::as_array)
        .map(|skills| {
            skills
                .iter()
                .filter_map(|s| s.get("uniqueId").and_then(Value::as_str))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    for id in ids {
        let result = api.perform_action("skill_cancel", Some(json!({"Skill": id}))).await;
        log.record("skill_cancel", result);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRobot;
    use super::*;
    use misty_types::ActionResult;

    #[test]
    fn suffix_length_and_alphabet() {
        let s = random_suffix(6);
        assert_eq!(s.len(), 6);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_suffix(12), random_suffix(12));
    }

    #[test]
    fn stop_words_ignore_case_and_padding() {
        assert!(is_stop_word(" Stop "));
        assert!(is_stop_word("s"));
        assert!(is_stop_word("TERMINATE"));
        assert!(!is_stop_word("stopping"));
    }

    #[tokio::test]
    async fn cancels_each_running_skill() {
        let robot = FakeRobot::new().respond(
            "skills_running",
            ActionResult::ok(Some(json!([{"uniqueId": "a"}, {"uniqueId": ""}, {"uniqueId": "b"}]))),
        );
        let mut log = ActionLog::new();

        cancel_running_skills(&robot, &mut log).await;

        let cancelled: Vec<_> = robot
            .calls()
            .into_iter()
            .filter(|c| c.id == "skill_cancel")
            .map(|c| c.data)
            .collect();
        assert_eq!(cancelled, vec![Some(json!({"Skill": "a"})), Some(json!({"Skill": "b"}))]);
        assert_eq!(log.names(), vec!["skills_running", "skill_cancel", "skill_cancel"]);
    }
}
