//! Prefetch cache for synthesized speech
//!
//! Entries are keyed by the exact spoken text and live for the whole session.
//! The first request for a text starts one synthesis fetch; every later
//! request, including ones made while that fetch is in flight, shares its
//! result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;

use super::playback::Clip;
use super::tts::{SynthesizedAudio, Synthesizer};
use crate::{Error, Result};

type SharedPrefetch =
    Shared<BoxFuture<'static, std::result::Result<Option<Arc<AudioSource>>, Arc<Error>>>>;

/// Buffering progress of a synthesized clip
#[derive(Debug, Clone)]
pub enum BufferState {
    /// Audio bytes are still being fetched
    Buffering,
    /// Audio is fully available
    Ready(Clip),
    /// Fetching the audio failed
    Failed(Arc<Error>),
}

/// A shared, read-only handle to synthesized audio
///
/// Playback never consumes the source: each attempt takes its own [`Clip`].
#[derive(Debug)]
pub struct AudioSource {
    state: watch::Receiver<BufferState>,
}

impl AudioSource {
    fn ready(clip: Clip) -> Self {
        let (_, state) = watch::channel(BufferState::Ready(clip));
        Self { state }
    }

    fn buffering() -> (watch::Sender<BufferState>, Self) {
        let (tx, state) = watch::channel(BufferState::Buffering);
        (tx, Self { state })
    }

    /// Current buffering state
    #[must_use]
    pub fn state(&self) -> BufferState {
        self.state.borrow().clone()
    }

    /// Whether the audio is fully buffered
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), BufferState::Ready(_))
    }

    /// Wait until the audio is fully buffered and take a playable copy
    ///
    /// # Errors
    ///
    /// Returns [`Error::Prefetch`] if fetching the audio failed
    pub async fn clip(&self) -> Result<Clip> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| !matches!(s, BufferState::Buffering))
            .await
            .map(|s| (*s).clone())
            .map_err(|_| Error::Tts("audio fetch abandoned".to_string()))?;

        match state {
            BufferState::Ready(clip) => Ok(clip),
            BufferState::Failed(e) => Err(Error::Prefetch(e)),
            BufferState::Buffering => Err(Error::Tts("audio still buffering".to_string())),
        }
    }

    async fn wait_playable(&self, timeout: Duration) {
        let mut rx = self.state.clone();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| !matches!(s, BufferState::Buffering)),
        )
        .await;
        if settled.is_err() {
            tracing::debug!(
                timeout_ms = timeout.as_millis(),
                "audio not buffered before readiness timeout"
            );
        }
    }
}

/// Session-scoped cache of prefetched synthesis results
pub struct SynthesisCache {
    synthesizer: Arc<dyn Synthesizer>,
    ready_timeout: Duration,
    entries: Mutex<HashMap<String, SharedPrefetch>>,
}

impl SynthesisCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(synthesizer: Arc<dyn Synthesizer>, ready_timeout: Duration) -> Self {
        Self {
            synthesizer,
            ready_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the playable audio for a text, fetching it on first request
    ///
    /// Resolves to `None` for empty or whitespace-only text without touching
    /// the network. Otherwise resolves once the audio is buffered or the
    /// readiness timeout elapses, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Prefetch`] wrapping the synthesis failure; the same
    /// failure is shared by every caller for that text
    pub async fn prefetch(&self, text: &str) -> Result<Option<Arc<AudioSource>>> {
        let Some(entry) = self.entry(text) else {
            return Ok(None);
        };
        entry.await.map_err(Error::Prefetch)
    }

    /// Start fetching a text in the background without waiting for it
    pub fn warm(&self, text: &str) {
        let _ = self.entry(text);
    }

    /// Whether an entry exists for a text
    #[must_use]
    pub fn contains(&self, text: &str) -> bool {
        self.lock().contains_key(text)
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedPrefetch>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, text: &str) -> Option<SharedPrefetch> {
        if text.trim().is_empty() {
            return None;
        }

        let mut entries = self.lock();
        if let Some(existing) = entries.get(text) {
            tracing::trace!(text_len = text.len(), "synthesis cache hit");
            return Some(existing.clone());
        }

        tracing::debug!(text_len = text.len(), "prefetching synthesis");
        let fetch = tokio::spawn(fetch_source(
            Arc::clone(&self.synthesizer),
            text.to_string(),
            self.ready_timeout,
        ));
        let shared = async move {
            fetch
                .await
                .map_err(|e| Arc::new(Error::Tts(format!("prefetch task failed: {e}"))))?
        }
        .boxed()
        .shared();

        entries.insert(text.to_string(), shared.clone());
        Some(shared)
    }
}

async fn fetch_source(
    synthesizer: Arc<dyn Synthesizer>,
    text: String,
    ready_timeout: Duration,
) -> std::result::Result<Option<Arc<AudioSource>>, Arc<Error>> {
    let audio = synthesizer.synthesize(&text).await.map_err(|e| {
        tracing::warn!(error = %e, text_len = text.len(), "synthesis failed");
        Arc::new(e)
    })?;

    let source = match audio {
        SynthesizedAudio::Clip(clip) => {
            tracing::debug!(bytes = clip.len(), "synthesis returned audio");
            Arc::new(AudioSource::ready(clip))
        }
        SynthesizedAudio::Locator(locator) => {
            let (tx, source) = AudioSource::buffering();
            let source = Arc::new(source);
            tokio::spawn(async move {
                let state = match synthesizer.fetch_locator(&locator).await {
                    Ok(clip) => {
                        tracing::debug!(bytes = clip.len(), "located audio fetched");
                        BufferState::Ready(clip)
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            locator = %locator,
                            "located audio fetch failed"
                        );
                        BufferState::Failed(Arc::new(e))
                    }
                };
                tx.send_replace(state);
            });
            source.wait_playable(ready_timeout).await;
            source
        }
    };

    Ok(Some(source))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct SlowSynthesizer {
        calls: AtomicUsize,
        locator_delay: Option<Duration>,
    }

    impl SlowSynthesizer {
        fn direct() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                locator_delay: None,
            }
        }

        fn located(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                locator_delay: Some(delay),
            }
        }
    }

    #[async_trait]
    impl Synthesizer for SlowSynthesizer {
        async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            if text == "fail" {
                return Err(Error::TtsFailed {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(match self.locator_delay {
                Some(_) => SynthesizedAudio::Locator(format!("/audio/{}", text.len())),
                None => SynthesizedAudio::Clip(Clip::new(text.as_bytes().to_vec(), None)),
            })
        }

        async fn fetch_locator(&self, locator: &str) -> Result<Clip> {
            tokio::time::sleep(self.locator_delay.unwrap_or_default()).await;
            Ok(Clip::new(locator.as_bytes().to_vec(), None))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_text_skips_network() {
        let synth = Arc::new(SlowSynthesizer::direct());
        let cache = SynthesisCache::new(
            Arc::clone(&synth) as Arc<dyn Synthesizer>,
            Duration::from_millis(600),
        );

        assert!(cache.prefetch("").await.unwrap().is_none());
        assert!(cache.prefetch("   \n").await.unwrap().is_none());
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_prefetch_shares_fetch() {
        let synth = Arc::new(SlowSynthesizer::direct());
        let cache = SynthesisCache::new(
            Arc::clone(&synth) as Arc<dyn Synthesizer>,
            Duration::from_millis(600),
        );

        let (a, b) = tokio::join!(cache.prefetch("안녕하세요"), cache.prefetch("안녕하세요"));
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        let clip_a = a.clip().await.unwrap();
        let clip_b = b.clip().await.unwrap();
        assert!(Arc::ptr_eq(&clip_a.data, &clip_b.data));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_locator_resolves_at_timeout() {
        let synth = Arc::new(SlowSynthesizer::located(Duration::from_secs(5)));
        let cache = SynthesisCache::new(
            Arc::clone(&synth) as Arc<dyn Synthesizer>,
            Duration::from_millis(600),
        );

        let started = tokio::time::Instant::now();
        let source = cache.prefetch("느린 응답").await.unwrap().unwrap();

        // 100ms synthesis + 600ms readiness cap
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(700));
        assert!(waited < Duration::from_secs(1));
        assert!(!source.is_ready());

        let clip = source.clip().await.unwrap();
        assert!(!clip.is_empty());
        assert!(source.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_and_kept() {
        let synth = Arc::new(SlowSynthesizer::direct());
        let cache = SynthesisCache::new(
            Arc::clone(&synth) as Arc<dyn Synthesizer>,
            Duration::from_millis(600),
        );

        let (a, b) = tokio::join!(cache.prefetch("fail"), cache.prefetch("fail"));
        assert!(matches!(a, Err(Error::Prefetch(_))));
        assert!(matches!(b, Err(Error::Prefetch(_))));

        assert!(cache.prefetch("fail").await.is_err());
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(cache.contains("fail"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_starts_fetch() {
        let synth = Arc::new(SlowSynthesizer::direct());
        let cache = SynthesisCache::new(
            Arc::clone(&synth) as Arc<dyn Synthesizer>,
            Duration::from_millis(600),
        );

        cache.warm("미리 받기");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        cache.prefetch("미리 받기").await.unwrap();
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
    }
}
