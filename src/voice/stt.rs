//! Speech-to-text (STT) processing

use async_trait::async_trait;

use crate::config::EndpointConfig;
use crate::{Error, Result};

/// Converts a recorded utterance into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio to text
    ///
    /// An empty string means nothing intelligible was recognized.
    ///
    /// # Errors
    ///
    /// Returns error if the recognition backend cannot be reached or fails
    async fn transcribe(&self, wav: &[u8]) -> Result<String>;
}

/// Response from the kiosk transcription endpoint
#[derive(serde::Deserialize)]
struct SttResponse {
    #[serde(default)]
    text: Option<String>,
}

/// Error body from the kiosk transcription endpoint
#[derive(serde::Deserialize)]
struct SttErrorBody {
    error: Option<String>,
}

/// Transcribes speech through the kiosk backend's `/api/stt` endpoint
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
}

impl HttpTranscriber {
    /// Create a transcriber for the configured backend
    #[must_use]
    pub fn new(endpoints: &EndpointConfig) -> Self {
        Self::with_client(reqwest::Client::new(), endpoints)
    }

    /// Create a transcriber sharing an existing HTTP client
    #[must_use]
    pub fn with_client(client: reqwest::Client, endpoints: &EndpointConfig) -> Self {
        Self {
            client,
            url: endpoints.url(&endpoints.stt_path),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(wav.to_vec())
                .file_name("recording.wav")
                .mime_str("audio/wav")
                .map_err(|e| Error::Stt(e.to_string()))?,
        );

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "STT request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<SttErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| format!("server error {status}"));
            tracing::error!(status = %status, body = %body, "STT API error");
            return Err(Error::Stt(message));
        }

        let result: SttResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        let transcript = result.text.unwrap_or_default();
        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}
