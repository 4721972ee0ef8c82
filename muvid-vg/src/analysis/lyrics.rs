//! Lyrics transcription and section alignment
//!
//! Optional: runs only when a transcription service is configured.
//! Failure leaves section lyrics empty and never fails the analysis.

use crate::config::ServiceEndpoint;
use crate::models::Section;
use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;

/// Transcription failure modes
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("transcription service transient failure: {0}")]
    Transient(String),

    #[error("transcription service rejected request: {0}")]
    Permanent(String),
}

/// One transcribed word with timing
#[derive(Debug, Clone, Deserialize)]
pub struct TimedWord {
    pub word: String,
    pub start_sec: f64,
    pub end_sec: f64,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    words: Vec<TimedWord>,
}

/// External transcription service client
pub struct TranscriptionClient {
    http: reqwest::Client,
    endpoint: ServiceEndpoint,
}

impl TranscriptionClient {
    pub fn new(endpoint: ServiceEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("muvid/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self { http, endpoint })
    }

    /// Transcribe the track behind the given read URL with word timings
    pub async fn transcribe(
        &self,
        audio_url: &str,
    ) -> std::result::Result<Vec<TimedWord>, TranscriptionError> {
        let mut request = self
            .http
            .post(format!("{}/v1/transcribe", self.endpoint.base_url))
            .json(&serde_json::json!({
                "audio_url": audio_url,
                "word_timings": true,
            }));
        if let Some(token) = &self.endpoint.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranscriptionError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TranscriptionError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TranscriptionError::Permanent(format!("HTTP {status}")));
        }

        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Permanent(format!("malformed response: {e}")))?;

        Ok(body.words)
    }
}

/// Assign each word to the section containing its midpoint
pub fn align_words_to_sections(words: &[TimedWord], sections: &mut [Section]) {
    for section in sections.iter_mut() {
        section.lyrics = None;
    }

    for word in words {
        let midpoint = (word.start_sec + word.end_sec) / 2.0;
        if let Some(section) = sections.iter_mut().find(|s| s.contains(midpoint)) {
            match &mut section.lyrics {
                Some(text) => {
                    text.push(' ');
                    text.push_str(&word.word);
                }
                None => section.lyrics = Some(word.word.clone()),
            }
        }
    }
}
