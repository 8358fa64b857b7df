//! Text-to-speech (TTS) processing
//!
//! The kiosk synthesis endpoint accepts the same payload in three request
//! encodings. JSON is tried first; a 415/422 format rejection retries as a
//! multipart form, and a failed form falls back to a GET with the payload in
//! the query string. The response is either audio bytes or a JSON locator
//! pointing at the audio.

use async_trait::async_trait;
use reqwest::StatusCode;

use super::playback::Clip;
use crate::config::{EndpointConfig, SpeechConfig};
use crate::{Error, Result};

/// JSON fields that may carry an audio locator, in priority order
const LOCATOR_KEYS: [&str; 4] = ["audioUrl", "url", "audio_url", "location"];

/// Result of a synthesis request
#[derive(Debug, Clone)]
pub enum SynthesizedAudio {
    /// Audio bytes returned directly
    Clip(Clip),
    /// Location to fetch the audio bytes from
    Locator(String),
}

/// Synthesizes speech from text
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize text to speech
    ///
    /// # Errors
    ///
    /// Returns [`Error::TtsFailed`] if the endpoint rejects every request
    /// encoding, or another error if the request cannot be made
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;

    /// Fetch the audio a locator points at
    ///
    /// # Errors
    ///
    /// Returns error if the audio cannot be fetched
    async fn fetch_locator(&self, locator: &str) -> Result<Clip>;
}

/// Synthesizes speech through the kiosk backend's `/api/tts` endpoint
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    url: String,
    voice: Option<String>,
    speed: Option<f32>,
}

#[derive(serde::Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
}

impl HttpSynthesizer {
    /// Create a synthesizer for the configured backend
    #[must_use]
    pub fn new(endpoints: &EndpointConfig, speech: &SpeechConfig) -> Self {
        Self::with_client(reqwest::Client::new(), endpoints, speech)
    }

    /// Create a synthesizer sharing an existing HTTP client
    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        endpoints: &EndpointConfig,
        speech: &SpeechConfig,
    ) -> Self {
        Self {
            client,
            base_url: endpoints.base_url.clone(),
            url: endpoints.url(&endpoints.tts_path),
            voice: speech.voice.clone(),
            speed: speech.speed,
        }
    }

    async fn post_json(&self, text: &str) -> Result<reqwest::Response> {
        let request = TtsRequest {
            text,
            voice: self.voice.as_deref(),
            speed: self.speed,
        };
        Ok(self.client.post(&self.url).json(&request).send().await?)
    }

    async fn post_form(&self, text: &str) -> Result<reqwest::Response> {
        let mut form = reqwest::multipart::Form::new().text("text", text.to_string());
        if let Some(voice) = &self.voice {
            form = form.text("voice", voice.clone());
        }
        if let Some(speed) = self.speed {
            form = form.text("speed", speed.to_string());
        }
        Ok(self.client.post(&self.url).multipart(form).send().await?)
    }

    async fn get_query(&self, text: &str) -> Result<reqwest::Response> {
        Ok(self.client.get(self.query_url(text)).send().await?)
    }

    fn query_url(&self, text: &str) -> String {
        let mut url = format!("{}?text={}", self.url, urlencoding::encode(text));
        if let Some(voice) = &self.voice {
            url.push_str("&voice=");
            url.push_str(&urlencoding::encode(voice));
        }
        if let Some(speed) = self.speed {
            url.push_str(&format!("&speed={speed}"));
        }
        url
    }

    async fn audio_from_response(response: reqwest::Response) -> Result<SynthesizedAudio> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_lowercase);

        if content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("application/json"))
        {
            let body: serde_json::Value = response.json().await?;
            return locator_from_json(&body)
                .map(SynthesizedAudio::Locator)
                .ok_or_else(|| Error::Tts("JSON response carries no audio locator".to_string()));
        }

        let audio = response.bytes().await?;
        Ok(SynthesizedAudio::Clip(Clip::new(audio.to_vec(), content_type)))
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        tracing::debug!(text_len = text.len(), "requesting synthesis");

        let mut response = self.post_json(text).await?;

        if matches!(
            response.status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            tracing::debug!(status = %response.status(), "JSON rejected, retrying as form");
            response = self.post_form(text).await?;

            if !response.status().is_success() {
                tracing::debug!(status = %response.status(), "form rejected, falling back to GET");
                response = self.get_query(text).await?;
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "TTS API error");
            return Err(Error::TtsFailed {
                status: status.as_u16(),
                body,
            });
        }

        Self::audio_from_response(response).await
    }

    async fn fetch_locator(&self, locator: &str) -> Result<Clip> {
        let url = url::Url::parse(&self.base_url)?.join(locator)?;
        tracing::debug!(url = %url, "fetching synthesized audio");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TtsFailed {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_lowercase);
        let audio = response.bytes().await?;
        Ok(Clip::new(audio.to_vec(), content_type))
    }
}

/// Pick the audio locator out of a JSON synthesis response
fn locator_from_json(body: &serde_json::Value) -> Option<String> {
    LOCATOR_KEYS
        .iter()
        .find_map(|key| body.get(key).and_then(serde_json::Value::as_str))
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
