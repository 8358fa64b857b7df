//! Kiosk Voice - Voice interaction pipeline for a self-service kiosk
//!
//! This library provides the voice front end of the kiosk:
//! - Microphone capture with energy-based end-of-speech detection
//! - Synthesized speech behind a one-shot autoplay unlock gate
//! - A prefetch cache that collapses identical synthesis requests
//! - A state machine that never lets speaking and listening overlap
//! - Intent routing of recognized commands to kiosk screens
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               PipelineController                    │
//! │   speak_then_listen  │  say_then  │  stop_all       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  VoiceFlow                          │
//! │   IDLE │ SPEAKING │ LISTENING │ PROCESSING │ ERROR  │
//! └──────────┬─────────────────────────┬────────────────┘
//!            │                         │
//! ┌──────────▼───────────┐  ┌──────────▼────────────────┐
//! │ AudioGate ∥ Cache    │  │ Recorder + VAD            │
//! │ → SpeechChannel      │  │ → Transcriber             │
//! └──────────────────────┘  └───────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod intent;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use intent::{HttpIntentRouter, IntentRoute, IntentRouter, Screen, chunk_text};
pub use voice::{
    AudioGate, ErrorCode, FlowError, FlowListener, FlowState, PipelineController,
    SynthesisCache, VoiceFlow, VoiceStack,
};
