//! Audio playback to speakers

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A playable piece of encoded audio (MP3 or WAV)
///
/// The bytes are shared, so cloning a clip is cheap and every playback
/// attempt can own its own instance without touching the cached source.
#[derive(Debug, Clone)]
pub struct Clip {
    /// Encoded audio bytes
    pub data: Arc<[u8]>,
    /// Content type reported by the backend, if any
    pub content_type: Option<String>,
}

impl Clip {
    /// Create a clip from encoded bytes
    #[must_use]
    pub fn new(data: impl Into<Arc<[u8]>>, content_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            content_type,
        }
    }

    /// Size of the encoded audio in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the clip has no audio bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the payload looks like a RIFF/WAVE file
    #[must_use]
    pub fn is_wav(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("wav"))
            || self.data.starts_with(b"RIFF")
    }
}

/// How a playback attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The clip played to the end
    Finished,
    /// Playback was stopped before the end
    Stopped,
}

/// An audio output device
///
/// `resume` and `suspend` model the platform autoplay switch; `play` runs one
/// private playback instance until it ends or `cancel` fires.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Resume the output device so playback is permitted
    ///
    /// # Errors
    ///
    /// Returns error if the platform refuses to resume
    async fn resume(&self) -> Result<()>;

    /// Pause the output device if it is running
    ///
    /// # Errors
    ///
    /// Returns error if the platform refuses to suspend
    fn suspend(&self) -> Result<()>;

    /// Play a clip to completion or until cancelled
    ///
    /// A token that is already cancelled must end the call without emitting
    /// audio.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PlaybackNotAllowed`] if the device has not been
    /// unlocked, or another error if decoding or playback fails
    async fn play(&self, clip: Clip, cancel: CancellationToken) -> Result<PlaybackOutcome>;
}

#[cfg(feature = "device")]
pub use device::CpalOutput;

#[cfg(feature = "device")]
mod device {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use cpal::SampleRate;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tokio_util::sync::CancellationToken;

    use super::{AudioOutput, Clip, PlaybackOutcome};
    use crate::{Error, Result};

    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Plays audio to the default output device
    #[derive(Debug, Default)]
    pub struct CpalOutput {
        suspended: Arc<AtomicBool>,
    }

    impl CpalOutput {
        /// Create a new output, checking that a device exists
        ///
        /// # Errors
        ///
        /// Returns error if no output device is available
        pub fn new() -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

            tracing::debug!(
                device = device.name().unwrap_or_default(),
                "audio output initialized"
            );

            Ok(Self::default())
        }
    }

    #[async_trait]
    impl AudioOutput for CpalOutput {
        async fn resume(&self) -> Result<()> {
            self.suspended.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn suspend(&self) -> Result<()> {
            self.suspended.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn play(&self, clip: Clip, cancel: CancellationToken) -> Result<PlaybackOutcome> {
            if cancel.is_cancelled() {
                return Ok(PlaybackOutcome::Stopped);
            }
            let (samples, sample_rate) = decode(&clip)?;
            if samples.is_empty() {
                return Ok(PlaybackOutcome::Finished);
            }

            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let suspended = Arc::clone(&self.suspended);
            let mut task = tokio::task::spawn_blocking(move || {
                play_blocking(&samples, sample_rate, &stop_flag, &suspended)
            });

            tokio::select! {
                joined = &mut task => {
                    joined.map_err(|e| Error::Playback(e.to_string()))??;
                    Ok(PlaybackOutcome::Finished)
                }
                () = cancel.cancelled() => {
                    stop.store(true, Ordering::SeqCst);
                    let _ = task.await;
                    tracing::debug!("playback stopped");
                    Ok(PlaybackOutcome::Stopped)
                }
            }
        }
    }

    /// Play samples on a blocking thread, returning when done or stopped
    fn play_blocking(
        samples: &Arc<Vec<f32>>,
        sample_rate: u32,
        stop: &AtomicBool,
        suspended: &AtomicBool,
    ) -> Result<()> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))?;

        let supported = |channels: u16| {
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == channels
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        };
        let config = supported(1)
            .or_else(|| supported(2))
            .ok_or_else(|| Error::Audio(format!("no output config for {sample_rate} Hz")))?
            .with_sample_rate(SampleRate(sample_rate))
            .config();
        let channels = usize::from(config.channels);

        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let callback_samples = Arc::clone(samples);
        let callback_position = Arc::clone(&position);
        let callback_finished = Arc::clone(&finished);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let pos = callback_position.load(Ordering::Relaxed);
                        let sample = callback_samples.get(pos).copied().unwrap_or_else(|| {
                            callback_finished.store(true, Ordering::Relaxed);
                            0.0
                        });
                        frame.fill(sample);
                        if pos < callback_samples.len() {
                            callback_position.store(pos + 1, Ordering::Relaxed);
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (samples.len() as u64 * 1000) / u64::from(sample_rate);
        let budget = Duration::from_millis(duration_ms + 500);
        let mut played = Duration::ZERO;
        let mut paused = false;

        while !finished.load(Ordering::Relaxed) && !stop.load(Ordering::SeqCst) {
            let want_pause = suspended.load(Ordering::SeqCst);
            if want_pause != paused {
                let toggled = if want_pause {
                    stream.pause().map_err(|e| e.to_string())
                } else {
                    stream.play().map_err(|e| e.to_string())
                };
                if let Err(e) = toggled {
                    tracing::warn!(error = %e, "failed to toggle output stream");
                }
                paused = want_pause;
            }
            if !paused {
                played += POLL_INTERVAL;
                if played > budget {
                    break;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        drop(stream);
        tracing::debug!(samples = samples.len(), "playback complete");
        Ok(())
    }

    /// Decode a clip into mono f32 samples and its sample rate
    fn decode(clip: &Clip) -> Result<(Arc<Vec<f32>>, u32)> {
        if clip.is_wav() {
            decode_wav(&clip.data)
        } else {
            decode_mp3(&clip.data)
        }
    }

    fn decode_wav(data: &[u8]) -> Result<(Arc<Vec<f32>>, u32)> {
        let mut reader =
            hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Audio(e.to_string()))?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / 32768.0))
                .collect::<std::result::Result<_, _>>(),
            hound::SampleFormat::Float => reader.samples::<f32>().collect(),
        }
        .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;

        #[allow(clippy::cast_precision_loss)]
        let mono = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Ok((Arc::new(mono), spec.sample_rate))
    }

    /// Decode MP3 bytes to mono f32 samples
    fn decode_mp3(mp3_data: &[u8]) -> Result<(Arc<Vec<f32>>, u32)> {
        let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
        let mut samples = Vec::new();
        let mut sample_rate = 24_000;

        loop {
            match decoder.next_frame() {
                Ok(frame) => {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                    if frame.channels == 2 {
                        samples.extend(frame.data.chunks(2).map(|chunk| {
                            let left = f32::from(chunk[0]) / 32768.0;
                            let right =
                                f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                            f32::midpoint(left, right)
                        }));
                    } else {
                        samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                    }
                }
                Err(minimp3::Error::Eof) => break,
                Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
            }
        }

        Ok((Arc::new(samples), sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_format_detection() {
        let wav = Clip::new(b"RIFF\0\0\0\0WAVE".to_vec(), None);
        assert!(wav.is_wav());

        let tagged = Clip::new(vec![0xFF, 0xFB], Some("audio/wav".to_string()));
        assert!(tagged.is_wav());

        let mp3 = Clip::new(vec![0xFF, 0xFB, 0x90], Some("audio/mpeg".to_string()));
        assert!(!mp3.is_wav());
        assert_eq!(mp3.len(), 3);
    }

    #[test]
    fn test_clip_clone_shares_bytes() {
        let clip = Clip::new(vec![1u8, 2, 3], None);
        let copy = clip.clone();
        assert!(Arc::ptr_eq(&clip.data, &copy.data));
    }
}
