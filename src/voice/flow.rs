//! Voice interaction state machine
//!
//! [`VoiceFlow`] is the single owner of [`FlowState`]. Speaking and listening
//! never overlap: a listen requested while speaking is remembered in a single
//! flag and started once playback ends, after an anti-echo delay. Every
//! asynchronous continuation carries the turn id it was started for and
//! becomes a no-op once a stop or a newer request has moved the machine on.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::playback::PlaybackOutcome;
use super::recorder::{RecordOptions, Recorder};
use super::speech::SpeechOutput;
use super::stt::Transcriber;
use crate::config::{Config, FlowConfig, VadConfig};
use crate::{Error, Result};

/// What the voice pipeline is doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowState {
    /// Ready for a request
    #[default]
    Idle,
    /// Playing synthesized speech
    Speaking,
    /// Capturing the microphone
    Listening,
    /// Transcribing a finished recording
    Processing,
    /// Showing a failure; returns to idle on its own
    Error,
}

/// Normalized failure codes surfaced to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Microphone access was refused
    MicPermissionDenied,
    /// No input device exists
    NoMicrophone,
    /// The recording was too small to contain speech
    SttNoSpeech,
    /// Nothing intelligible was recognized
    SttLowConfidence,
    /// The recognition backend failed
    SttNetworkError,
}

impl ErrorCode {
    /// Classify a capture or transcription failure
    #[must_use]
    pub const fn classify(error: &Error) -> Self {
        match error {
            Error::MicPermissionDenied => Self::MicPermissionDenied,
            Error::NoMicrophone => Self::NoMicrophone,
            _ => Self::SttNetworkError,
        }
    }

    /// Whether the flow re-attempts listening on its own
    #[must_use]
    pub const fn retries(self) -> bool {
        matches!(self, Self::SttNoSpeech)
    }

    /// Wire name of the code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MicPermissionDenied => "MIC_PERMISSION_DENIED",
            Self::NoMicrophone => "NO_MICROPHONE",
            Self::SttNoSpeech => "STT_NO_SPEECH",
            Self::SttLowConfidence => "STT_LOW_CONFIDENCE",
            Self::SttNetworkError => "STT_NETWORK_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure surfaced through [`FlowListener::on_error`]
#[derive(Debug, Clone)]
pub struct FlowError {
    /// Normalized code
    pub code: ErrorCode,
    /// Underlying error
    pub cause: Arc<Error>,
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.cause)
    }
}

/// Receives recognized commands and failures
pub trait FlowListener: Send + Sync {
    /// A non-empty transcript was recognized
    fn on_command(&self, transcript: &str);

    /// A capture or recognition attempt failed
    fn on_error(&self, error: &FlowError) {
        let _ = error;
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    PostSpeechListen,
    NoSpeechRetry,
    ErrorReset,
}

struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    listen_queued: bool,
    speech_turn: Option<u64>,
    listen_turn: Option<u64>,
    post_speech_listen: Option<Timer>,
    no_speech_retry: Option<Timer>,
    error_reset: Option<Timer>,
    error: Option<FlowError>,
    error_epoch: u64,
    next_id: u64,
}

impl Control {
    const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    const fn timer(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::PostSpeechListen => &mut self.post_speech_listen,
            TimerKind::NoSpeechRetry => &mut self.no_speech_retry,
            TimerKind::ErrorReset => &mut self.error_reset,
        }
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(timer) = self.timer(kind).take() {
            tracing::trace!(?kind, id = timer.id, "timer cancelled");
            timer.handle.abort();
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_timer(TimerKind::PostSpeechListen);
        self.cancel_timer(TimerKind::NoSpeechRetry);
        self.cancel_timer(TimerKind::ErrorReset);
    }
}

struct Inner {
    flow: FlowConfig,
    vad: VadConfig,
    speech: Arc<dyn SpeechOutput>,
    recorder: Recorder,
    transcriber: Arc<dyn Transcriber>,
    listener: Arc<dyn FlowListener>,
    state: watch::Sender<FlowState>,
    control: Mutex<Control>,
}

/// Timing knobs for a [`VoiceFlow`]
#[derive(Debug, Clone, Copy)]
pub struct FlowSettings {
    /// Flow timers and thresholds
    pub flow: FlowConfig,
    /// Detector parameters for each listen
    pub vad: VadConfig,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for FlowSettings {
    fn from(config: &Config) -> Self {
        Self {
            flow: config.flow,
            vad: config.vad,
        }
    }
}

/// Handle to the voice state machine
///
/// Cloning is cheap; all clones drive the same machine.
#[derive(Clone)]
pub struct VoiceFlow {
    inner: Arc<Inner>,
}

impl VoiceFlow {
    /// Create an idle flow
    #[must_use]
    pub fn new(
        settings: FlowSettings,
        speech: Arc<dyn SpeechOutput>,
        recorder: Recorder,
        transcriber: Arc<dyn Transcriber>,
        listener: Arc<dyn FlowListener>,
    ) -> Self {
        let (state, _) = watch::channel(FlowState::Idle);
        Self {
            inner: Arc::new(Inner {
                flow: settings.flow,
                vad: settings.vad,
                speech,
                recorder,
                transcriber,
                listener,
                state,
                control: Mutex::new(Control::default()),
            }),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> FlowState {
        *self.inner.state.borrow()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.inner.state.subscribe()
    }

    /// Whether a listen is waiting for the current speech to end
    #[must_use]
    pub fn is_listen_queued(&self) -> bool {
        self.lock().listen_queued
    }

    /// The most recent failure, if any
    #[must_use]
    pub fn last_error(&self) -> Option<FlowError> {
        self.lock().error.clone()
    }

    /// Whether the microphone is open
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.inner.recorder.is_recording()
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition, holding the control lock so transitions are serialized
    fn set_state(&self, _ctl: &mut Control, next: FlowState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "flow transition");
        }
    }

    fn schedule(
        &self,
        ctl: &mut Control,
        kind: TimerKind,
        delay: Duration,
        action: impl FnOnce(Self) -> BoxFuture<'static, ()> + Send + 'static,
    ) {
        ctl.cancel_timer(kind);
        let id = ctl.next_id();
        let flow = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut ctl = flow.lock();
                let slot = ctl.timer(kind);
                if slot.as_ref().is_none_or(|t| t.id != id) {
                    return;
                }
                // Detach our own handle; the slot is free for the next timer
                *slot = None;
            }
            tracing::trace!(?kind, id, "timer fired");
            action(flow).await;
        });
        *ctl.timer(kind) = Some(Timer { id, handle });
    }

    /// Speak a text, pre-empting any speech, capture, or pending timer
    ///
    /// When playback ends (finished, failed, or abandoned) and either
    /// `listen_after` is set or a listen was queued meanwhile, listening starts
    /// after the anti-echo delay. A speech superseded by a stop or a newer
    /// speak does not start a listen.
    ///
    /// # Errors
    ///
    /// Returns the synthesis or playback failure; the flow itself still
    /// returns to idle
    pub async fn speak(&self, text: &str, listen_after: bool) -> Result<PlaybackOutcome> {
        let turn = {
            let mut ctl = self.lock();
            ctl.cancel_all_timers();
            ctl.listen_queued = false;
            if ctl.listen_turn.take().is_some() {
                tracing::debug!("speech pre-empts active capture");
                self.inner.recorder.stop();
            }
            let turn = ctl.next_id();
            ctl.speech_turn = Some(turn);
            self.set_state(&mut ctl, FlowState::Speaking);
            turn
        };
        tracing::debug!(turn, listen_after, text_len = text.len(), "speaking");

        let outcome = self.inner.speech.speak(text).await;

        let mut ctl = self.lock();
        if ctl.speech_turn != Some(turn) {
            tracing::debug!(turn, "speech superseded");
            return outcome;
        }
        ctl.speech_turn = None;
        if self.state() == FlowState::Speaking {
            self.set_state(&mut ctl, FlowState::Idle);
        }
        if ctl.listen_queued || listen_after {
            ctl.listen_queued = false;
            tracing::debug!(
                delay_ms = self.inner.flow.listen_after_speech_delay.as_millis(),
                "listening after speech"
            );
            self.schedule(
                &mut ctl,
                TimerKind::PostSpeechListen,
                self.inner.flow.listen_after_speech_delay,
                |flow| flow.listen_and_recognize(),
            );
        }
        outcome
    }

    /// Capture one utterance and deliver its transcript
    ///
    /// While speaking this only queues a listen; while already listening or
    /// processing it does nothing. The returned future resolves when this
    /// request has been handled, which for a queued listen is immediately.
    pub fn listen_and_recognize(&self) -> BoxFuture<'static, ()> {
        let flow = self.clone();
        async move { flow.run_listen().await }.boxed()
    }

    async fn run_listen(self) {
        let turn = {
            let mut ctl = self.lock();
            match self.state() {
                FlowState::Speaking => {
                    if ctl.listen_queued {
                        tracing::debug!("listen already queued");
                    } else {
                        tracing::debug!("speech in progress, queuing listen");
                        ctl.listen_queued = true;
                    }
                    return;
                }
                FlowState::Listening | FlowState::Processing => {
                    tracing::debug!("capture already active, ignoring listen");
                    return;
                }
                FlowState::Idle | FlowState::Error => {}
            }
            ctl.listen_queued = false;
            ctl.cancel_timer(TimerKind::PostSpeechListen);
            ctl.cancel_timer(TimerKind::NoSpeechRetry);
            let turn = ctl.next_id();
            ctl.listen_turn = Some(turn);
            self.set_state(&mut ctl, FlowState::Listening);
            turn
        };
        tracing::debug!(turn, "listening");

        let recording = self
            .inner
            .recorder
            .start(RecordOptions::from(self.inner.vad))
            .await;

        let recording = {
            let mut ctl = self.lock();
            if ctl.listen_turn != Some(turn) {
                tracing::debug!(turn, "capture result discarded");
                return;
            }
            match recording {
                Ok(recording) => {
                    self.set_state(&mut ctl, FlowState::Processing);
                    recording
                }
                Err(e) => {
                    let code = ErrorCode::classify(&e);
                    let error = self.fail_locked(&mut ctl, code, e);
                    drop(ctl);
                    self.report(&error);
                    return;
                }
            }
        };

        if !recording.has_speech(self.inner.flow.min_audio_bytes) {
            tracing::debug!(bytes = recording.len(), "recording too small");
            let error = {
                let mut ctl = self.lock();
                if ctl.listen_turn != Some(turn) {
                    return;
                }
                self.fail_locked(
                    &mut ctl,
                    ErrorCode::SttNoSpeech,
                    Error::Stt("no speech detected".to_string()),
                )
            };
            self.report(&error);
            return;
        }

        let transcript = self.inner.transcriber.transcribe(&recording.wav).await;

        let mut ctl = self.lock();
        if ctl.listen_turn != Some(turn) {
            tracing::debug!(turn, "transcript discarded");
            return;
        }
        let failure = match transcript {
            Ok(text) if !text.trim().is_empty() => {
                ctl.listen_turn = None;
                if self.state() == FlowState::Processing {
                    self.set_state(&mut ctl, FlowState::Idle);
                }
                drop(ctl);
                self.inner.listener.on_command(text.trim());
                return;
            }
            Ok(_) => self.fail_locked(
                &mut ctl,
                ErrorCode::SttLowConfidence,
                Error::Stt("could not recognize speech".to_string()),
            ),
            Err(e) => self.fail_locked(&mut ctl, ErrorCode::SttNetworkError, e),
        };
        drop(ctl);
        self.report(&failure);
    }

    /// Enter the error state and schedule the automatic reset
    fn fail_locked(&self, ctl: &mut Control, code: ErrorCode, cause: Error) -> FlowError {
        let error = FlowError {
            code,
            cause: Arc::new(cause),
        };
        ctl.listen_turn = None;
        ctl.error = Some(error.clone());
        ctl.error_epoch += 1;
        let epoch = ctl.error_epoch;
        self.set_state(ctl, FlowState::Error);

        self.schedule(
            ctl,
            TimerKind::ErrorReset,
            self.inner.flow.error_display,
            move |flow| {
                async move {
                    let mut ctl = flow.lock();
                    if flow.state() == FlowState::Error && ctl.error_epoch == epoch {
                        flow.set_state(&mut ctl, FlowState::Idle);
                    }
                }
                .boxed()
            },
        );

        if code.retries() {
            self.schedule(
                ctl,
                TimerKind::NoSpeechRetry,
                self.inner.flow.no_speech_retry,
                |flow| flow.listen_and_recognize(),
            );
        }

        error
    }

    fn report(&self, error: &FlowError) {
        tracing::error!(code = %error.code, cause = %error.cause, "voice flow error");
        self.inner.listener.on_error(error);
    }

    /// Record a failure from outside the capture path
    ///
    /// The flow enters [`FlowState::Error`], notifies the listener, and
    /// returns to idle after the display window.
    pub fn fail(&self, code: ErrorCode, cause: Error) {
        let error = {
            let mut ctl = self.lock();
            self.fail_locked(&mut ctl, code, cause)
        };
        self.report(&error);
    }

    /// Stop speaking and forget any queued listen
    pub fn stop_speaking(&self) {
        {
            let mut ctl = self.lock();
            ctl.cancel_timer(TimerKind::PostSpeechListen);
            ctl.listen_queued = false;
            ctl.speech_turn = None;
            if self.state() == FlowState::Speaking {
                self.set_state(&mut ctl, FlowState::Idle);
            }
        }
        self.inner.speech.stop();
    }

    /// Abandon the active capture; its result is discarded
    pub fn stop_listening(&self) {
        {
            let mut ctl = self.lock();
            ctl.cancel_timer(TimerKind::NoSpeechRetry);
            if ctl.listen_turn.take().is_some()
                && matches!(self.state(), FlowState::Listening | FlowState::Processing)
            {
                self.set_state(&mut ctl, FlowState::Idle);
            }
        }
        self.inner.recorder.stop();
    }

    /// End the active capture early and transcribe what was recorded
    ///
    /// Returns whether a capture was active.
    pub fn finish_listening(&self) -> bool {
        self.inner.recorder.stop()
    }

    /// Return to idle, cancelling speech, capture, and every pending timer
    pub fn stop(&self) {
        {
            let mut ctl = self.lock();
            ctl.cancel_all_timers();
            ctl.listen_queued = false;
            ctl.speech_turn = None;
            ctl.listen_turn = None;
            ctl.error = None;
            self.set_state(&mut ctl, FlowState::Idle);
        }
        self.inner.speech.stop();
        self.inner.recorder.stop();
        tracing::debug!("voice flow stopped");
    }
}
