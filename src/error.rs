//! Error types for the kiosk voice pipeline

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for kiosk voice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone access was refused by the user or the platform
    #[error("microphone permission denied")]
    MicPermissionDenied,

    /// No input device is available
    #[error("no microphone available")]
    NoMicrophone,

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Speech synthesis endpoint rejected every request encoding
    #[error("TTS failed: {status} {body}")]
    TtsFailed {
        /// HTTP status of the last attempt
        status: u16,
        /// Response body of the last attempt (may be empty)
        body: String,
    },

    /// Text-to-speech error other than a rejected request
    #[error("TTS error: {0}")]
    Tts(String),

    /// A shared synthesis prefetch failed
    #[error("prefetch failed: {0}")]
    Prefetch(Arc<Error>),

    /// Playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// Output device refused to start playback before an unlock gesture
    #[error("playback not allowed before audio unlock")]
    PlaybackNotAllowed,

    /// Intent routing error
    #[error("intent error: {0}")]
    Intent(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing error
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
}
