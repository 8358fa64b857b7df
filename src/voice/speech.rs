//! Speech output channel
//!
//! Speaking a text unlocks the gate and prefetches the audio concurrently, then
//! plays a private copy of the cached clip. At most one playback is audible:
//! the newest request to reach playback cancels the previous handle, and an
//! older request whose audio arrives late is torn down as soon as it starts.
//! A request whose audio is not playable within the start timeout is
//! abandoned; once playing, a clip runs to its end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::cache::SynthesisCache;
use super::gate::AudioGate;
use super::playback::{AudioOutput, Clip, PlaybackOutcome};
use crate::{Error, Result};

/// Something that can speak text aloud
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Speak a text, returning when playback ends
    ///
    /// Returns [`PlaybackOutcome::Stopped`] if a newer request or
    /// [`SpeechOutput::stop`] cut it short, or if its audio never became
    /// playable in time.
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    async fn speak(&self, text: &str) -> Result<PlaybackOutcome>;

    /// Stop the current playback and every request still preparing
    fn stop(&self);
}

struct PlaybackHandle {
    id: u64,
    cancel: CancellationToken,
}

struct Slot {
    playing: Option<PlaybackHandle>,
    /// Newest request id that has reached playback
    newest: u64,
    /// Cancelled by [`SpeechOutput::stop`] for every request issued before it
    teardown: CancellationToken,
}

/// Plays synthesized speech through an [`AudioOutput`]
pub struct SpeechChannel {
    gate: Arc<AudioGate>,
    cache: Arc<SynthesisCache>,
    output: Arc<dyn AudioOutput>,
    start_timeout: Duration,
    slot: Mutex<Slot>,
    next_id: AtomicU64,
}

impl SpeechChannel {
    /// Create a channel over a gate, cache, and output device
    ///
    /// A request whose audio is not ready to play within `start_timeout` is
    /// abandoned.
    #[must_use]
    pub fn new(
        gate: Arc<AudioGate>,
        cache: Arc<SynthesisCache>,
        output: Arc<dyn AudioOutput>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            gate,
            cache,
            output,
            start_timeout,
            slot: Mutex::new(Slot {
                playing: None,
                newest: 0,
                teardown: CancellationToken::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// The synthesis cache backing this channel
    #[must_use]
    pub fn cache(&self) -> &Arc<SynthesisCache> {
        &self.cache
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the output for request `id`, cancelling whatever older one plays
    ///
    /// Returns `None` if the request was torn down. A request older than the
    /// newest one to reach playback gets an already-cancelled token.
    fn take_over(&self, id: u64, teardown: &CancellationToken) -> Option<CancellationToken> {
        let mut slot = self.lock();
        if teardown.is_cancelled() {
            return None;
        }

        let cancel = CancellationToken::new();
        if id < slot.newest {
            tracing::debug!(id, newest = slot.newest, "request superseded before playback");
            cancel.cancel();
            return Some(cancel);
        }

        slot.newest = id;
        let previous = slot.playing.replace(PlaybackHandle {
            id,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            tracing::debug!(previous = previous.id, next = id, "pre-empting playback");
            previous.cancel.cancel();
        }
        Some(cancel)
    }

    /// Unlock audio and resolve the text to a playable clip
    async fn prepare(&self, text: &str) -> Result<Option<Clip>> {
        let (_, source) = tokio::join!(self.gate.unlock(), self.cache.prefetch(text));
        let Some(source) = source? else {
            return Ok(None);
        };
        source.clip().await.map(Some)
    }

    async fn play(
        &self,
        id: u64,
        clip: Clip,
        cancel: &CancellationToken,
    ) -> Result<PlaybackOutcome> {
        tracing::debug!(id, bytes = clip.len(), "starting playback");
        match self.output.play(clip.clone(), cancel.clone()).await {
            Err(Error::PlaybackNotAllowed) => {
                tracing::warn!("playback rejected before unlock, resuming and retrying");
                self.gate.unlock().await;
                if let Err(e) = self.output.resume().await {
                    tracing::debug!(error = %e, "resume before retry failed");
                }
                if cancel.is_cancelled() {
                    return Ok(PlaybackOutcome::Stopped);
                }
                self.output.play(clip, cancel.clone()).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl SpeechOutput for SpeechChannel {
    async fn speak(&self, text: &str) -> Result<PlaybackOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let teardown = self.lock().teardown.clone();

        let prepared = tokio::select! {
            biased;
            () = teardown.cancelled() => {
                tracing::debug!(id, "speech torn down before playback");
                return Ok(PlaybackOutcome::Stopped);
            }
            prepared = tokio::time::timeout(self.start_timeout, self.prepare(text)) => prepared,
        };

        let Some(cancel) = self.take_over(id, &teardown) else {
            tracing::debug!(id, "speech torn down before playback");
            return Ok(PlaybackOutcome::Stopped);
        };
        let _release = ReleaseHandle { channel: self, id };

        let outcome = match prepared {
            Ok(Ok(Some(clip))) => self.play(id, clip, &cancel).await,
            Ok(Ok(None)) => {
                tracing::debug!(id, "nothing to speak");
                Ok(PlaybackOutcome::Finished)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(
                    id,
                    timeout_ms = self.start_timeout.as_millis(),
                    "speech audio not ready in time, abandoning"
                );
                Ok(PlaybackOutcome::Stopped)
            }
        };
        match &outcome {
            Ok(PlaybackOutcome::Finished) => tracing::debug!(id, "playback finished"),
            Ok(PlaybackOutcome::Stopped) => tracing::debug!(id, "playback stopped"),
            Err(e) => tracing::warn!(id, error = %e, "speech failed"),
        }
        outcome
    }

    fn stop(&self) {
        let mut slot = self.lock();
        slot.teardown.cancel();
        slot.teardown = CancellationToken::new();
        if let Some(handle) = slot.playing.take() {
            tracing::debug!(id = handle.id, "stopping playback");
            handle.cancel.cancel();
        }
    }
}

/// Drops the channel's reference to a playback handle on every exit path
struct ReleaseHandle<'a> {
    channel: &'a SpeechChannel,
    id: u64,
}

impl Drop for ReleaseHandle<'_> {
    fn drop(&mut self) {
        let mut slot = self.channel.lock();
        if slot.playing.as_ref().is_some_and(|h| h.id == self.id)
            && let Some(handle) = slot.playing.take()
        {
            handle.cancel.cancel();
        }
    }
}
