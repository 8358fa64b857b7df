//! Energy-based voice activity detection
//!
//! Decides when a recording session has reached the end of an utterance:
//! speech must be observed first, then a sustained run of low-energy windows
//! ends the session.

use std::time::Duration;

/// Outcome of observing one analysis window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Keep recording
    Continue,
    /// Trailing silence after speech reached the configured window
    EndOfSpeech,
}

/// Trailing-silence detector driven by RMS energy samples
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
    end_silence: Duration,
    speech_observed: bool,
    silence: Duration,
}

impl EnergyVad {
    /// Create a detector with an energy threshold and trailing-silence window
    #[must_use]
    pub const fn new(threshold: f32, end_silence: Duration) -> Self {
        Self {
            threshold,
            end_silence,
            speech_observed: false,
            silence: Duration::ZERO,
        }
    }

    /// Observe one window's energy, `elapsed` after the previous observation
    pub fn observe(&mut self, energy: f32, elapsed: Duration) -> VadDecision {
        if energy >= self.threshold {
            if !self.speech_observed {
                tracing::trace!(energy, "speech observed");
            }
            self.speech_observed = true;
            self.silence = Duration::ZERO;
        } else if self.speech_observed {
            self.silence += elapsed;
        }

        if self.speech_observed && self.silence >= self.end_silence {
            tracing::debug!(silence_ms = self.silence.as_millis(), "end of speech");
            VadDecision::EndOfSpeech
        } else {
            VadDecision::Continue
        }
    }

    /// Whether any window has reached the speech threshold
    #[must_use]
    pub const fn speech_observed(&self) -> bool {
        self.speech_observed
    }

    /// Silence accumulated since the last speech window
    #[must_use]
    pub const fn silence(&self) -> Duration {
        self.silence
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
