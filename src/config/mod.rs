//! Configuration management for the kiosk voice pipeline

pub mod file;

use std::str::FromStr;
use std::time::Duration;

use crate::Result;

/// Kiosk voice configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Backend endpoints
    pub endpoints: EndpointConfig,

    /// Speech synthesis configuration
    pub speech: SpeechConfig,

    /// Voice activity detection configuration
    pub vad: VadConfig,

    /// Voice flow timing
    pub flow: FlowConfig,
}

/// Backend endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Base URL of the kiosk backend
    pub base_url: String,

    /// Speech synthesis path
    pub tts_path: String,

    /// Speech recognition path
    pub stt_path: String,

    /// Intent routing path
    pub intent_path: String,

    /// Weather lookup path
    pub weather_path: String,

    /// City sent with weather lookups
    pub weather_city: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            tts_path: "/api/tts".to_string(),
            stt_path: "/api/stt".to_string(),
            intent_path: "/receive-text/".to_string(),
            weather_path: "/weather/".to_string(),
            weather_city: "Seoul".to_string(),
        }
    }
}

impl EndpointConfig {
    /// Join a path onto the base URL
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Voice identifier forwarded to the synthesis endpoint
    pub voice: Option<String>,

    /// Speed multiplier forwarded to the synthesis endpoint
    pub speed: Option<f32>,

    /// Upper bound on waiting for prefetched audio to become playable
    pub ready_timeout: Duration,

    /// A speech whose audio is not playable after this long is abandoned
    pub speech_timeout: Duration,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            voice: None,
            speed: None,
            ready_timeout: Duration::from_millis(600),
            speech_timeout: Duration::from_millis(8000),
        }
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// Auto-stop on trailing silence (the hard ceiling always applies)
    pub enabled: bool,

    /// Sampling period of the energy detector
    pub analysis_interval: Duration,

    /// RMS energy at or above which a window counts as speech
    pub energy_threshold: f32,

    /// Trailing silence after speech that ends a session
    pub end_silence: Duration,

    /// Hard ceiling on session length
    pub max_recording: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            analysis_interval: Duration::from_millis(50),
            energy_threshold: 0.015,
            end_silence: Duration::from_millis(800),
            max_recording: Duration::from_millis(15_000),
        }
    }
}

/// Voice flow timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// Anti-echo pause between the end of playback and a queued capture
    pub listen_after_speech_delay: Duration,

    /// How long an error is shown before the flow returns to idle
    pub error_display: Duration,

    /// Delay before listening again after no speech was detected
    pub no_speech_retry: Duration,

    /// Recordings smaller than this are treated as "no speech"
    pub min_audio_bytes: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            listen_after_speech_delay: Duration::from_millis(300),
            error_display: Duration::from_millis(1200),
            no_speech_retry: Duration::from_millis(800),
            min_audio_bytes: 2000,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_file(fc)
    }

    /// Resolve configuration from a parsed file, applying environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn from_file(fc: file::KioskConfigFile) -> Result<Self> {
        let defaults = EndpointConfig::default();
        let endpoints = EndpointConfig {
            base_url: std::env::var("KIOSK_API_URL")
                .ok()
                .or(fc.endpoints.base_url)
                .unwrap_or(defaults.base_url),
            tts_path: fc.endpoints.tts_path.unwrap_or(defaults.tts_path),
            stt_path: fc.endpoints.stt_path.unwrap_or(defaults.stt_path),
            intent_path: fc.endpoints.intent_path.unwrap_or(defaults.intent_path),
            weather_path: fc.endpoints.weather_path.unwrap_or(defaults.weather_path),
            weather_city: std::env::var("KIOSK_WEATHER_CITY")
                .ok()
                .or(fc.endpoints.weather_city)
                .unwrap_or(defaults.weather_city),
        };

        let defaults = SpeechConfig::default();
        let speech = SpeechConfig {
            voice: std::env::var("KIOSK_TTS_VOICE").ok().or(fc.speech.voice),
            speed: env_parse("KIOSK_TTS_SPEED").or(fc.speech.speed),
            ready_timeout: fc
                .speech
                .ready_timeout_ms
                .map_or(defaults.ready_timeout, Duration::from_millis),
            speech_timeout: fc
                .speech
                .speech_timeout_ms
                .map_or(defaults.speech_timeout, Duration::from_millis),
        };

        let defaults = VadConfig::default();
        let vad = VadConfig {
            enabled: fc.vad.enabled.unwrap_or(defaults.enabled),
            analysis_interval: fc
                .vad
                .analysis_interval_ms
                .map_or(defaults.analysis_interval, Duration::from_millis),
            energy_threshold: env_parse("KIOSK_VAD_THRESHOLD")
                .or(fc.vad.energy_threshold)
                .unwrap_or(defaults.energy_threshold),
            end_silence: fc
                .vad
                .end_silence_ms
                .map_or(defaults.end_silence, Duration::from_millis),
            max_recording: fc
                .vad
                .max_recording_ms
                .map_or(defaults.max_recording, Duration::from_millis),
        };

        let defaults = FlowConfig::default();
        let flow = FlowConfig {
            listen_after_speech_delay: fc
                .flow
                .listen_after_speech_delay_ms
                .map_or(defaults.listen_after_speech_delay, Duration::from_millis),
            error_display: fc
                .flow
                .error_display_ms
                .map_or(defaults.error_display, Duration::from_millis),
            no_speech_retry: fc
                .flow
                .no_speech_retry_ms
                .map_or(defaults.no_speech_retry, Duration::from_millis),
            min_audio_bytes: fc.flow.min_audio_bytes.unwrap_or(defaults.min_audio_bytes),
        };

        let config = Self {
            endpoints,
            speech,
            vad,
            flow,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.endpoints.base_url)?;

        if self.vad.analysis_interval.is_zero() {
            return Err(crate::Error::Config(
                "vad.analysis_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.vad.energy_threshold) {
            return Err(crate::Error::Config(format!(
                "vad.energy_threshold must be within 0.0..=1.0, got {}",
                self.vad.energy_threshold
            )));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
