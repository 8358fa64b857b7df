//! Voice processing module
//!
//! Handles audio capture with end-of-speech detection, synthesized speech
//! playback behind an autoplay gate, and the state machine that keeps the two
//! from overlapping. STT and TTS are served by the kiosk backend.

mod cache;
mod capture;
mod controller;
mod flow;
mod gate;
mod playback;
mod recorder;
mod speech;
mod stt;
mod tts;
mod vad;

pub use cache::{AudioSource, BufferState, SynthesisCache};
pub use capture::{MicStream, Microphone, SAMPLE_RATE, samples_to_wav};
pub use controller::{PipelineController, VoiceStack};
pub use flow::{ErrorCode, FlowError, FlowListener, FlowSettings, FlowState, VoiceFlow};
pub use gate::AudioGate;
pub use playback::{AudioOutput, Clip, PlaybackOutcome};
pub use recorder::{
    ANALYSIS_WINDOW, RecordOptions, Recorder, Recording, RecordingSession, StopReason,
};
pub use speech::{SpeechChannel, SpeechOutput};
pub use stt::{HttpTranscriber, Transcriber};
pub use tts::{HttpSynthesizer, SynthesizedAudio, Synthesizer};
pub use vad::{EnergyVad, VadDecision, calculate_rms};

#[cfg(feature = "device")]
pub use capture::CpalMicrophone;
#[cfg(feature = "device")]
pub use playback::CpalOutput;
