//! TOML configuration file loading
//!
//! Supports `~/.config/kiosk-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct KioskConfigFile {
    /// Backend endpoints
    #[serde(default)]
    pub endpoints: EndpointsFileConfig,

    /// Speech synthesis options
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Voice flow timing
    #[serde(default)]
    pub flow: FlowFileConfig,
}

/// Backend endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct EndpointsFileConfig {
    /// Base URL of the kiosk backend (e.g. `http://localhost:8000`)
    pub base_url: Option<String>,
    pub tts_path: Option<String>,
    pub stt_path: Option<String>,
    pub intent_path: Option<String>,
    pub weather_path: Option<String>,
    pub weather_city: Option<String>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Voice identifier forwarded to the synthesis endpoint
    pub voice: Option<String>,

    /// Speed multiplier forwarded to the synthesis endpoint
    pub speed: Option<f32>,

    /// Upper bound on waiting for prefetched audio to become playable
    pub ready_timeout_ms: Option<u64>,

    /// Abandon a speech whose audio is not playable after this long
    pub speech_timeout_ms: Option<u64>,
}

/// Voice activity detection configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub enabled: Option<bool>,
    pub analysis_interval_ms: Option<u64>,
    pub energy_threshold: Option<f32>,
    pub end_silence_ms: Option<u64>,
    pub max_recording_ms: Option<u64>,
}

/// Voice flow timing configuration
#[derive(Debug, Default, Deserialize)]
pub struct FlowFileConfig {
    pub listen_after_speech_delay_ms: Option<u64>,
    pub error_display_ms: Option<u64>,
    pub no_speech_retry_ms: Option<u64>,
    pub min_audio_bytes: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `KioskConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> KioskConfigFile {
    let Some(path) = config_file_path() else {
        return KioskConfigFile::default();
    };

    if !path.exists() {
        return KioskConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => parse_config_file(&content).unwrap_or_else(|e| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config file, using defaults"
            );
            KioskConfigFile::default()
        }),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            KioskConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the content is not valid TOML for this schema
pub fn parse_config_file(content: &str) -> crate::Result<KioskConfigFile> {
    let config = toml::from_str(content)?;
    tracing::info!("loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/kiosk-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("kiosk-voice").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let fc = parse_config_file(
            r#"
            [endpoints]
            base_url = "http://kiosk.local:9000"

            [vad]
            end_silence_ms = 650
            "#,
        )
        .unwrap();

        assert_eq!(fc.endpoints.base_url.as_deref(), Some("http://kiosk.local:9000"));
        assert_eq!(fc.vad.end_silence_ms, Some(650));
        assert!(fc.vad.energy_threshold.is_none());
        assert!(fc.flow.min_audio_bytes.is_none());
    }

    #[test]
    fn test_invalid_file() {
        assert!(parse_config_file("[vad]\nend_silence_ms = \"soon\"").is_err());
    }
}
