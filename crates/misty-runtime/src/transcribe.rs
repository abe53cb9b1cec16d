//! Speech-to-text for recorded dialogue.
//!
//! [`WitTranscriber`] sends a WAV recording to the wit.ai speech endpoint and
//! returns its JSON answer unchanged.  The question answering skill reads
//! the `entities` map (top-level or under `content`) out of that answer.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Default wit.ai API root.
pub const WIT_API_URL: &str = "https://api.wit.ai";

/// API version pinned in every request; later versions stream partial results.
pub const WIT_API_VERSION: &str = "20200513";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TranscriptionError {
    /// The request could not be sent or the service answered with an error status.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// No API key configured.
    #[error("missing wit.ai key")]
    MissingKey,
    /// The answer was not a JSON object.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a complete WAV file.
    async fn transcribe(&self, wav: &[u8]) -> Result<Value, TranscriptionError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// wit.ai client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WitTranscriber {
    base_url: String,
    key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for WitTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WitTranscriber")
            .field("base_url", &self.base_url)
            .field("key", &"[redacted]")
            .finish()
    }
}

impl WitTranscriber {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_base_url(WIT_API_URL, key)
    }

    pub fn with_base_url(base_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transcriber for WitTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<Value, TranscriptionError> {
        if self.key.is_empty() {
            return Err(TranscriptionError::MissingKey);
        }
        let url = format!("{}/speech", self.base_url);
        debug!(%url, bytes = wav.len(), "transcription request");

        let answer: Value = self
            .client
            .post(&url)
            .query(&[("v", WIT_API_VERSION)])
            .bearer_auth(&self.key)
            .header(CONTENT_TYPE, "audio/wav")
            .body(wav.to_vec())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !answer.is_object() {
            return Err(TranscriptionError::BadResponse(answer.to_string()));
        }
        Ok(answer)
    }
}
