//! Microphone recording with automatic end-of-speech detection
//!
//! A [`Recorder`] runs one [`RecordingSession`] at a time. While a session is
//! active a fixed-interval sampler feeds the RMS energy of the newest samples
//! into an [`EnergyVad`]; the session ends on trailing silence after speech, on
//! the hard ceiling, or on a manual [`Recorder::stop`]. Whichever path ends it,
//! the device stream is released exactly once.
//!
//! The recorder does not reject overlapping sessions itself; callers gate
//! `start` on the flow state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::capture::{MicStream, Microphone, SAMPLE_RATE, samples_to_wav};
use super::vad::{EnergyVad, VadDecision, calculate_rms};
use crate::Result;
use crate::config::VadConfig;

/// Most recent samples considered per analysis tick
pub const ANALYSIS_WINDOW: usize = 2048;

/// Why a recording session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`Recorder::stop`] was called
    Manual,
    /// Trailing silence followed detected speech
    Silence,
    /// The hard ceiling elapsed
    MaxDuration,
}

/// Options for a single recording session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecordOptions {
    /// Detector parameters; `vad.enabled = false` leaves only the ceiling
    /// and manual stop
    pub vad: VadConfig,
}

impl From<VadConfig> for RecordOptions {
    fn from(vad: VadConfig) -> Self {
        Self { vad }
    }
}

/// A finished recording
#[derive(Debug, Clone)]
pub struct Recording {
    /// 16-bit mono WAV payload
    pub wav: Vec<u8>,
    /// Number of captured samples
    pub sample_count: usize,
    /// Wall time the session was open
    pub duration: Duration,
    /// Which stop path ended the session
    pub stop_reason: StopReason,
    /// Whether the detector saw any window above threshold
    pub speech_detected: bool,
}

impl Recording {
    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.wav.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wav.is_empty()
    }

    /// A header-only recording for a session that never captured audio
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn empty(stop_reason: StopReason, duration: Duration) -> Result<Self> {
        Ok(Self {
            wav: samples_to_wav(&[], SAMPLE_RATE)?,
            sample_count: 0,
            duration,
            stop_reason,
            speech_detected: false,
        })
    }

    /// Whether the payload is large enough to be worth transcribing
    #[must_use]
    pub fn has_speech(&self, min_bytes: usize) -> bool {
        self.wav.len() >= min_bytes
    }
}

struct ActiveSession {
    id: u64,
    stop: CancellationToken,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveSession>,
    next_id: u64,
}

/// Records one utterance at a time from a [`Microphone`]
pub struct Recorder {
    microphone: Arc<dyn Microphone>,
    slot: Mutex<Slot>,
}

impl Recorder {
    /// Create a recorder over a microphone
    #[must_use]
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self {
            microphone,
            slot: Mutex::new(Slot::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a session is active, including one still opening the device
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Stop the active session, if any
    ///
    /// The pending [`Recorder::start`] resolves with the audio captured so far,
    /// or with an empty recording if the device was still opening. Returns
    /// whether a session was active.
    pub fn stop(&self) -> bool {
        self.lock().active.as_ref().is_some_and(|session| {
            session.stop.cancel();
            true
        })
    }

    /// Record until the session ends and return the assembled payload
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MicPermissionDenied`] or
    /// [`crate::Error::NoMicrophone`] if the stream cannot be opened, or an
    /// audio error if the payload cannot be encoded
    pub async fn start(&self, options: RecordOptions) -> Result<Recording> {
        let vad_config = options.vad;
        let opening = Instant::now();

        let (id, stop) = {
            let mut slot = self.lock();
            slot.next_id += 1;
            let id = slot.next_id;
            let stop = CancellationToken::new();
            slot.active = Some(ActiveSession {
                id,
                stop: stop.clone(),
            });
            (id, stop)
        };
        let _active = ActiveGuard { recorder: self, id };

        // A stop while the device is still opening must not let capture begin
        let stream = tokio::select! {
            biased;
            () = stop.cancelled() => {
                tracing::debug!("recording stopped while opening the microphone");
                return Recording::empty(StopReason::Manual, opening.elapsed());
            }
            stream = self.microphone.open() => stream?,
        };

        let mut session = RecordingSession::new(stream);
        let mut vad = EnergyVad::new(vad_config.energy_threshold, vad_config.end_silence);

        tracing::debug!(
            vad = vad_config.enabled,
            interval_ms = vad_config.analysis_interval.as_millis(),
            max_ms = vad_config.max_recording.as_millis(),
            "recording started"
        );

        let started = Instant::now();
        let ceiling = tokio::time::sleep(vad_config.max_recording);
        tokio::pin!(ceiling);

        let mut sampler = tokio::time::interval(vad_config.analysis_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = started;

        let stop_reason = loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break StopReason::Manual,
                () = &mut ceiling => {
                    tracing::debug!("recording hit hard ceiling");
                    break StopReason::MaxDuration;
                }
                now = sampler.tick() => {
                    let elapsed = now.saturating_duration_since(last_tick);
                    last_tick = now;
                    let energy = session.pull();
                    if vad_config.enabled
                        && vad.observe(energy, elapsed) == VadDecision::EndOfSpeech
                    {
                        break StopReason::Silence;
                    }
                }
            }
        };

        session.finish(stop_reason, started.elapsed(), vad.speech_observed())
    }
}

/// Clears the recorder's active slot however the session future ends
struct ActiveGuard<'a> {
    recorder: &'a Recorder,
    id: u64,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.recorder.lock();
        if slot.active.as_ref().is_some_and(|s| s.id == self.id) {
            slot.active = None;
        }
    }
}

/// One recording: owns the live stream and the captured samples
pub struct RecordingSession {
    stream: Option<Box<dyn MicStream>>,
    sample_rate: u32,
    samples: Vec<f32>,
}

impl RecordingSession {
    /// Wrap an opened stream
    #[must_use]
    pub fn new(stream: Box<dyn MicStream>) -> Self {
        let sample_rate = stream.sample_rate();
        Self {
            stream: Some(stream),
            sample_rate,
            samples: Vec::new(),
        }
    }

    /// Pull newly captured samples and return the energy of the newest window
    pub fn pull(&mut self) -> f32 {
        let Some(stream) = self.stream.as_mut() else {
            return 0.0;
        };
        let fresh = stream.drain();
        let window = &fresh[fresh.len().saturating_sub(ANALYSIS_WINDOW)..];
        let energy = calculate_rms(window);
        self.samples.extend_from_slice(&fresh);
        energy
    }

    /// Release the stream; later calls are no-ops
    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            tracing::debug!(samples = self.samples.len(), "recording resources released");
        }
    }

    /// Drain the tail, release the stream, and encode the payload
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn finish(
        mut self,
        stop_reason: StopReason,
        duration: Duration,
        speech_detected: bool,
    ) -> Result<Recording> {
        self.pull();
        self.release();

        let samples = std::mem::take(&mut self.samples);
        let wav = samples_to_wav(&samples, self.sample_rate)?;

        tracing::info!(
            reason = ?stop_reason,
            bytes = wav.len(),
            duration_ms = duration.as_millis(),
            speech_detected,
            "recording finished"
        );

        Ok(Recording {
            wav,
            sample_count: samples.len(),
            duration,
            stop_reason,
            speech_detected,
        })
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingStream {
        chunks: Vec<Vec<f32>>,
        closes: Arc<AtomicUsize>,
    }

    impl MicStream for CountingStream {
        fn drain(&mut self) -> Vec<f32> {
            self.chunks.pop().unwrap_or_default()
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_session_releases_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let stream = CountingStream {
            chunks: vec![vec![0.5; 100]],
            closes: Arc::clone(&closes),
        };

        let mut session = RecordingSession::new(Box::new(stream));
        session.release();
        session.release();
        drop(session);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finish_collects_samples() {
        let closes = Arc::new(AtomicUsize::new(0));
        let stream = CountingStream {
            chunks: vec![vec![0.0; 300], vec![0.4; 500]],
            closes: Arc::clone(&closes),
        };

        let mut session = RecordingSession::new(Box::new(stream));
        let energy = session.pull();
        assert!((energy - 0.4).abs() < 0.001);

        let recording = session
            .finish(StopReason::Manual, Duration::from_millis(100), true)
            .unwrap();
        assert_eq!(recording.sample_count, 800);
        assert_eq!(recording.len(), 44 + 1600);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_window_uses_newest_samples() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut chunk = vec![0.9; 4096];
        chunk.extend(std::iter::repeat_n(0.0, ANALYSIS_WINDOW));
        let stream = CountingStream {
            chunks: vec![chunk],
            closes,
        };

        let mut session = RecordingSession::new(Box::new(stream));
        assert!(session.pull() < 0.001);
    }

    #[test]
    fn test_small_recording_is_not_speech() {
        let recording = Recording::empty(StopReason::Manual, Duration::from_millis(50)).unwrap();
        assert_eq!(recording.len(), 44);
        assert!(!recording.has_speech(2000));
    }
}
