//! The robot's request/response action API.
//!
//! Skills command the robot (speak, capture speech, train faces, …) through
//! the [`ActionApi`] trait.  The push-event channel covers the other
//! direction.  Every call yields an [`ActionResult`]; failures are reported
//! in it and never abort the caller.
//!
//! [`RestActionApi`] talks to the robot's HTTP endpoints.  It only knows the
//! action identifiers used by the bundled skills.

use async_trait::async_trait;
use misty_types::ActionResult;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

/// Side-effecting calls against the robot.
#[async_trait]
pub trait ActionApi: Send + Sync {
    /// Ask the robot to perform `action` with an optional JSON body.
    async fn perform_action(&self, action: &str, data: Option<Value>) -> ActionResult;

    /// Query the robot for `info` with optional query parameters.
    async fn get_info(&self, info: &str, params: &[(&str, &str)]) -> ActionResult;
}

/// HTTP route of an action or info identifier.
fn route(id: &str) -> Option<(Method, &'static str)> {
    let route = match id {
        // actions
        "speak" => (Method::POST, "api/tts/speak"),
        "speak_stop" => (Method::POST, "api/tts/stop"),
        "speech_capture" => (Method::POST, "api/audio/speech/capture"),
        "audio_enable" => (Method::POST, "api/services/audio/enable"),
        "audio_disable" => (Method::POST, "api/services/audio/disable"),
        "audio_play" => (Method::POST, "api/audio/play"),
        "keyphrase_start" => (Method::POST, "api/audio/keyphrase/start"),
        "keyphrase_stop" => (Method::POST, "api/audio/keyphrase/stop"),
        "led" => (Method::POST, "api/led"),
        "volume_settings" => (Method::POST, "api/audio/volume"),
        "face_recognition_start" => (Method::POST, "api/faces/recognition/start"),
        "face_recognition_stop" => (Method::POST, "api/faces/recognition/stop"),
        "face_train_start" => (Method::POST, "api/faces/training/start"),
        "face_train_cancel" => (Method::POST, "api/faces/training/cancel"),
        "face_delete" => (Method::DELETE, "api/faces"),
        "skill_cancel" => (Method::POST, "api/skills/cancel"),
        // info
        "audio_status" => (Method::GET, "api/services/audio"),
        "audio_list" => (Method::GET, "api/audio/list"),
        "audio_file" => (Method::GET, "api/audio"),
        "faces_known" => (Method::GET, "api/faces"),
        "skills_running" => (Method::GET, "api/skills/running"),
        "battery" => (Method::GET, "api/battery"),
        _ => return None,
    };
    Some(route)
}

/// Interpret the robot's `{"result": .., "status": .., "error": ..}` envelope.
fn parse_envelope(http_ok: bool, body: Value) -> ActionResult {
    let status_ok = match body.get("status").and_then(Value::as_str) {
        Some(s) => s.eq_ignore_ascii_case("success"),
        None => http_ok,
    };
    let message = body
        .get("error")
        .or_else(|| body.get("errorMessage"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let result = body.get("result").cloned().filter(|v| !v.is_null());
    ActionResult {
        success: http_ok && status_ok,
        result,
        message,
    }
}

/// [`ActionApi`] over the robot's REST interface.
#[derive(Debug, Clone)]
pub struct RestActionApi {
    base_url: String,
    client: reqwest::Client,
}

impl RestActionApi {
    /// `ip` is the robot address (host or host:port).
    pub fn new(ip: &str) -> Self {
        Self::with_base_url(format!("http://{ip}"))
    }

    /// Point the client at an arbitrary base URL (e.g. a mock server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, id: &str, body: Option<Value>, params: &[(&str, &str)]) -> ActionResult {
        let Some((method, path)) = route(id) else {
            warn!(action = %id, "unknown action identifier");
            return ActionResult::failed(format!("unknown action `{id}`"));
        };
        let url = format!("{}/{}", self.base_url, path);
        debug!(action = %id, %method, %url, "robot request");

        let mut request = self.client.request(method, &url);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(action = %id, error = %e, "robot request failed");
                return ActionResult::failed(e.to_string());
            }
        };
        let http_ok = response.status().is_success();
        let status = response.status();
        match response.json::<Value>().await {
            Ok(body) => parse_envelope(http_ok, body),
            Err(e) if http_ok => ActionResult::failed(format!("unreadable response: {e}")),
            Err(_) => ActionResult::failed(format!("HTTP {status}")),
        }
    }
}

#[async_trait]
impl ActionApi for RestActionApi {
    async fn perform_action(&self, action: &str, data: Option<Value>) -> ActionResult {
        // DELETE endpoints take their arguments in the query string.
        if matches!(route(action), Some((method, _)) if method == Method::DELETE) {
            let pairs: Vec<(String, String)> = data
                .as_ref()
                .and_then(Value::as_object)
                .map(|o| {
                    o.iter()
                        .map(|(k, v)| {
                            let v = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                            (k.clone(), v)
                        })
                        .collect()
                })
                .unwrap_or_default();
            let params: Vec<(&str, &str)> =
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            return self.call(action, None, &params).await;
        }
        self.call(action, Some(data.unwrap_or_else(|| Value::Object(Default::default()))), &[])
            .await
    }

    async fn get_info(&self, info: &str, params: &[(&str, &str)]) -> ActionResult {
        self.call(info, None, params).await
    }
}
