//! Top-level voice pipeline orchestration
//!
//! [`PipelineController`] wires the gate, cache, speech channel, recorder, and
//! flow together and owns every timer and pending utterance it creates.
//! [`PipelineController::stop_all`] is the single teardown path run on every
//! screen transition.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::cache::SynthesisCache;
use super::capture::Microphone;
use super::flow::{FlowListener, FlowSettings, FlowState, VoiceFlow};
use super::gate::AudioGate;
use super::playback::{AudioOutput, PlaybackOutcome};
use super::recorder::Recorder;
use super::speech::{SpeechChannel, SpeechOutput};
use super::stt::Transcriber;
use super::tts::Synthesizer;
use crate::Result;
use crate::config::Config;

/// Devices and backends the pipeline runs on
#[derive(Clone)]
pub struct VoiceStack {
    /// Speaker
    pub output: Arc<dyn AudioOutput>,
    /// Microphone
    pub microphone: Arc<dyn Microphone>,
    /// Speech synthesis backend
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Speech recognition backend
    pub transcriber: Arc<dyn Transcriber>,
}

#[derive(Default)]
struct Owned {
    /// Speech sequence or delayed speech started by the controller
    task: Option<JoinHandle<()>>,
    /// Waits for the gate to unlock, then speaks `pending`
    unlock_flush: Option<JoinHandle<()>>,
    /// At most one utterance waiting for the gate
    pending: Option<String>,
}

impl Owned {
    fn clear(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(flush) = self.unlock_flush.take() {
            flush.abort();
        }
        self.pending = None;
    }
}

/// Orchestrates speaking and listening for the kiosk
pub struct PipelineController {
    gate: Arc<AudioGate>,
    cache: Arc<SynthesisCache>,
    channel: Arc<SpeechChannel>,
    flow: VoiceFlow,
    owned: Arc<Mutex<Owned>>,
}

impl PipelineController {
    /// Build the pipeline from configuration and a device stack
    #[must_use]
    pub fn new(config: &Config, stack: VoiceStack, listener: Arc<dyn FlowListener>) -> Self {
        let gate = Arc::new(AudioGate::new(Arc::clone(&stack.output)));
        let cache = Arc::new(SynthesisCache::new(
            stack.synthesizer,
            config.speech.ready_timeout,
        ));
        let channel = Arc::new(SpeechChannel::new(
            Arc::clone(&gate),
            Arc::clone(&cache),
            stack.output,
            config.speech.speech_timeout,
        ));
        let flow = VoiceFlow::new(
            FlowSettings::from(config),
            Arc::clone(&channel) as Arc<dyn SpeechOutput>,
            Recorder::new(stack.microphone),
            stack.transcriber,
            listener,
        );

        Self {
            gate,
            cache,
            channel,
            flow,
            owned: Arc::new(Mutex::new(Owned::default())),
        }
    }

    fn owned(&self) -> MutexGuard<'_, Owned> {
        lock_owned(&self.owned)
    }

    /// The voice state machine
    #[must_use]
    pub const fn flow(&self) -> &VoiceFlow {
        &self.flow
    }

    /// The audio unlock gate
    #[must_use]
    pub const fn gate(&self) -> &Arc<AudioGate> {
        &self.gate
    }

    /// The synthesis cache
    #[must_use]
    pub const fn cache(&self) -> &Arc<SynthesisCache> {
        &self.cache
    }

    /// Current flow state
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.flow.state()
    }

    /// Utterance waiting for the gate to unlock, if any
    #[must_use]
    pub fn pending_speech(&self) -> Option<String> {
        self.owned().pending.clone()
    }

    /// Unlock audio from a user gesture
    pub async fn on_user_gesture(&self) {
        self.gate.unlock().await;
    }

    /// Speak a text, then listen whether or not speaking succeeded
    ///
    /// # Errors
    ///
    /// Returns the speech failure; listening is attempted regardless
    pub async fn speak_then_listen(&self, text: &str) -> Result<PlaybackOutcome> {
        self.owned().clear();
        self.flow.speak(text, true).await
    }

    /// Speak a text now, replacing anything in progress
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    pub async fn speak_now(&self, text: &str) -> Result<PlaybackOutcome> {
        self.owned().clear();
        self.flow.speak(text, false).await
    }

    /// Speak a text best-effort, then run a continuation unconditionally
    pub async fn say_then<F, T>(&self, text: &str, after: F) -> T
    where
        F: FnOnce() -> T,
    {
        if let Err(e) = self.speak_now(text).await {
            tracing::debug!(error = %e, "speech failed, continuing");
        }
        after()
    }

    /// Start listening for one utterance
    pub async fn listen(&self) {
        self.flow.listen_and_recognize().await;
    }

    /// Speak a sequence of chunks, prefetching all of them up front
    ///
    /// Stops at the first chunk that was cut short. With `listen_after`, the
    /// flow listens once the last chunk has played.
    ///
    /// # Errors
    ///
    /// Returns the first synthesis or playback failure
    pub async fn speak_chunks(
        &self,
        chunks: &[String],
        listen_after: bool,
    ) -> Result<PlaybackOutcome> {
        self.owned().clear();
        for chunk in chunks {
            self.cache.warm(chunk);
        }

        let mut outcome = PlaybackOutcome::Finished;
        for (i, chunk) in chunks.iter().enumerate() {
            let last = i + 1 == chunks.len();
            outcome = self.flow.speak(chunk, listen_after && last).await?;
            if outcome == PlaybackOutcome::Stopped {
                tracing::debug!(chunk = i, "chunk sequence interrupted");
                break;
            }
        }
        Ok(outcome)
    }

    /// Speak a text after a delay unless torn down first
    pub fn speak_after(&self, delay: Duration, text: impl Into<String>, listen_after: bool) {
        let text = text.into();
        let flow = self.flow.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = flow.speak(&text, listen_after).await {
                tracing::debug!(error = %e, "delayed speech failed");
            }
        });

        if let Some(previous) = self.owned().task.replace(task) {
            previous.abort();
        }
    }

    /// Tear down, then speak now if audio is unlocked or remember the text
    ///
    /// Only the most recent deferred utterance is kept; it is spoken once the
    /// gate unlocks. Returns whether the text is being spoken immediately.
    pub fn safe_speak(&self, text: impl Into<String>) -> bool {
        self.stop_all();
        let text = text.into();

        if self.gate.is_unlocked() {
            let flow = self.flow.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = flow.speak(&text, false).await {
                    tracing::debug!(error = %e, "speech failed");
                }
            });
            self.owned().task = Some(task);
            return true;
        }

        tracing::debug!(text_len = text.len(), "audio locked, deferring speech");
        let mut owned = self.owned();
        owned.pending = Some(text);
        if owned.unlock_flush.is_none() {
            let gate = Arc::clone(&self.gate);
            let flow = self.flow.clone();
            let shared = Arc::clone(&self.owned);
            owned.unlock_flush = Some(tokio::spawn(async move {
                gate.wait_unlocked().await;
                let pending = {
                    let mut owned = lock_owned(&shared);
                    owned.unlock_flush = None;
                    owned.pending.take()
                };
                if let Some(text) = pending {
                    tracing::debug!("flushing deferred speech");
                    if let Err(e) = flow.speak(&text, false).await {
                        tracing::debug!(error = %e, "deferred speech failed");
                    }
                }
            }));
        }
        false
    }

    /// Cancel all speech, capture, timers, and pending utterances
    pub fn stop_all(&self) {
        self.owned().clear();
        self.flow.stop();
        self.channel.stop();
        tracing::debug!("pipeline torn down");
    }

    /// Tear down and pause the output device
    pub fn stop_basic(&self) {
        self.stop_all();
        self.gate.suspend_if_running();
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.owned().clear();
    }
}

fn lock_owned(owned: &Mutex<Owned>) -> MutexGuard<'_, Owned> {
    owned.lock().unwrap_or_else(PoisonError::into_inner)
}
