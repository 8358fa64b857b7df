//! Intent routing for recognized commands
//!
//! The kiosk backend summarizes a transcript; the summary's keywords pick the
//! screen the kiosk moves to. Weather requests also fetch the forecast whose
//! Korean summary is read aloud.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EndpointConfig;
use crate::{Error, Result};

/// Screen the kiosk moves to after a command
#[derive(Debug, Clone, PartialEq)]
pub enum Screen {
    /// Seoul festival and event listings
    Festival {
        /// Original transcript
        keyword: String,
    },
    /// Current weather and weekly forecast
    Weather {
        /// Original transcript
        keyword: String,
        /// Raw forecast payload
        data: serde_json::Value,
        /// Korean summary to read aloud, may be empty
        summary: String,
    },
    /// Resident registration number entry for a document request
    PinInput,
    /// Nothing matched
    Unrecognized,
}

/// Result of routing a command
#[derive(Debug, Clone, PartialEq)]
pub struct IntentRoute {
    /// Target screen
    pub screen: Screen,
    /// Purpose reported by the backend, or the requested document name
    pub purpose: String,
}

impl IntentRoute {
    /// A route to the unrecognized screen
    #[must_use]
    pub const fn unrecognized() -> Self {
        Self {
            screen: Screen::Unrecognized,
            purpose: String::new(),
        }
    }
}

/// Keyword class of a backend summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Festival or event listings
    Festival,
    /// Weather lookup
    Weather,
    /// Certificate issuance, carrying the document name
    Document(&'static str),
    /// No rule matched
    Unrecognized,
}

/// Documents the kiosk can issue, keyed by summary keyword
const DOCUMENTS: [(&str, &str); 4] = [
    ("등본", "주민등록등본"),
    ("초본", "주민등록초본"),
    ("가족관계", "가족관계증명서"),
    ("건강보험", "건강보험자격득실확인서"),
];

/// Classify a summary with the kiosk keyword rules, first match wins
#[must_use]
pub fn classify(summary: &str) -> Intent {
    if summary.contains("축제") || summary.contains("행사") {
        return Intent::Festival;
    }
    if summary.contains("날씨") {
        return Intent::Weather;
    }
    DOCUMENTS
        .iter()
        .find(|(keyword, _)| summary.contains(keyword))
        .map_or(Intent::Unrecognized, |(_, document)| {
            Intent::Document(document)
        })
}

/// Routes a recognized command to a screen
#[async_trait]
pub trait IntentRouter: Send + Sync {
    /// Route a transcript
    ///
    /// # Errors
    ///
    /// Returns error if the routing or weather backend fails
    async fn route(&self, text: &str) -> Result<IntentRoute>;
}

#[derive(Serialize)]
struct RouteRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct RouteResponse {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
}

#[derive(Serialize)]
struct WeatherRequest<'a> {
    city: &'a str,
}

/// Routes commands through the kiosk backend
#[derive(Debug, Clone)]
pub struct HttpIntentRouter {
    client: Client,
    intent_url: String,
    weather_url: String,
    city: String,
}

impl HttpIntentRouter {
    /// Create a router for the configured backend
    #[must_use]
    pub fn new(endpoints: &EndpointConfig) -> Self {
        Self::with_client(Client::new(), endpoints)
    }

    /// Create a router sharing an existing HTTP client
    #[must_use]
    pub fn with_client(client: Client, endpoints: &EndpointConfig) -> Self {
        Self {
            client,
            intent_url: endpoints.url(&endpoints.intent_path),
            weather_url: endpoints.url(&endpoints.weather_path),
            city: endpoints.weather_city.clone(),
        }
    }

    async fn fetch_weather(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.weather_url)
            .json(&WeatherRequest { city: &self.city })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Intent(format!("weather API error: {status} - {body}")));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl IntentRouter for HttpIntentRouter {
    async fn route(&self, text: &str) -> Result<IntentRoute> {
        let response = self
            .client
            .post(&self.intent_url)
            .json(&RouteRequest { text })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Intent(format!("routing API error: {status}")));
        }

        let routed: RouteResponse = response.json().await?;
        let summary = routed
            .summary
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| text.to_string());
        let purpose = routed.purpose.unwrap_or_default();

        let intent = classify(&summary);
        tracing::info!(?intent, summary = %summary, "command routed");

        let screen = match intent {
            Intent::Festival => Screen::Festival {
                keyword: text.to_string(),
            },
            Intent::Weather => {
                let data = self.fetch_weather().await?;
                let summary = data
                    .pointer("/_meta/ai_summary_ko")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Screen::Weather {
                    keyword: text.to_string(),
                    data,
                    summary,
                }
            }
            Intent::Document(document) => {
                return Ok(IntentRoute {
                    screen: Screen::PinInput,
                    purpose: document.to_string(),
                });
            }
            Intent::Unrecognized => return Ok(IntentRoute::unrecognized()),
        };

        Ok(IntentRoute { screen, purpose })
    }
}

/// Split text into speakable chunks of at most `max_len` characters
///
/// Whitespace is collapsed, sentences (ending in `.`, `?` or `!`) are packed
/// greedily, and any single sentence longer than `max_len` is split by
/// characters.
#[must_use]
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for sentence in sentences(text) {
        let joined = if buf.is_empty() {
            sentence.chars().count()
        } else {
            buf.chars().count() + 1 + sentence.chars().count()
        };

        if joined <= max_len {
            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(&sentence);
            continue;
        }

        if !buf.is_empty() {
            chunks.push(std::mem::take(&mut buf));
        }
        if sentence.chars().count() > max_len {
            let chars: Vec<char> = sentence.chars().collect();
            chunks.extend(chars.chunks(max_len).map(|c| c.iter().collect::<String>()));
        } else {
            buf = sentence;
        }
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }
    chunks
}

/// Collapse whitespace and split after sentence-ending punctuation
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for word in text.split_whitespace() {
        current.push(word);
        if word.ends_with(['.', '?', '!']) {
            out.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}
