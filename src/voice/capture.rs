//! Audio capture from microphone

use async_trait::async_trait;

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Opens live microphone streams
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Open a live input stream
    ///
    /// # Errors
    ///
    /// Returns [`Error::MicPermissionDenied`] if access is refused, or
    /// [`Error::NoMicrophone`] if there is no usable input device
    async fn open(&self) -> Result<Box<dyn MicStream>>;
}

/// A live input stream owned by one recording session
pub trait MicStream: Send {
    /// Take the samples captured since the previous call
    fn drain(&mut self) -> Vec<f32>;

    /// Sample rate of the drained samples
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    /// Stop the device tracks and release the stream
    fn close(&mut self);
}

#[cfg(feature = "device")]
pub use device::CpalMicrophone;

#[cfg(feature = "device")]
mod device {
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex, PoisonError};

    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BuildStreamError, SampleRate};

    use super::{MicStream, Microphone, SAMPLE_RATE};
    use crate::{Error, Result};

    /// Captures audio from the default input device
    ///
    /// The cpal stream lives on a dedicated thread so the session handle can
    /// move between tasks.
    #[derive(Debug, Default)]
    pub struct CpalMicrophone;

    impl CpalMicrophone {
        /// Create a new microphone
        #[must_use]
        pub const fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl Microphone for CpalMicrophone {
        async fn open(&self) -> Result<Box<dyn MicStream>> {
            let buffer = Arc::new(Mutex::new(Vec::new()));
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

            let thread_buffer = Arc::clone(&buffer);
            std::thread::Builder::new()
                .name("mic-capture".to_string())
                .spawn(move || run_capture_thread(&thread_buffer, ready_tx, &stop_rx))?;

            ready_rx
                .await
                .map_err(|_| Error::Audio("capture thread exited early".to_string()))??;

            tracing::debug!("audio capture started");
            Ok(Box::new(CpalStream {
                buffer,
                stop: Some(stop_tx),
            }))
        }
    }

    fn run_capture_thread(
        buffer: &Arc<Mutex<Vec<f32>>>,
        ready: tokio::sync::oneshot::Sender<Result<()>>,
        stop: &std_mpsc::Receiver<()>,
    ) {
        match build_stream(buffer) {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                // Blocks until the session closes or drops its sender
                let _ = stop.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            }
            Err(e) => {
                let _ = ready.send(Err(e));
            }
        }
    }

    fn build_stream(buffer: &Arc<Mutex<Vec<f32>>>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(Error::NoMicrophone)?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        let callback_buffer = Arc::clone(buffer);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = callback_buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(map_build_error)?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        Ok(stream)
    }

    fn map_build_error(err: BuildStreamError) -> Error {
        match err {
            BuildStreamError::DeviceNotAvailable => Error::NoMicrophone,
            BuildStreamError::BackendSpecific { err } => {
                let description = err.description.to_lowercase();
                if description.contains("permission")
                    || description.contains("denied")
                    || description.contains("not allowed")
                {
                    Error::MicPermissionDenied
                } else {
                    Error::Audio(err.description)
                }
            }
            other => Error::Audio(other.to_string()),
        }
    }

    struct CpalStream {
        buffer: Arc<Mutex<Vec<f32>>>,
        stop: Option<std_mpsc::Sender<()>>,
    }

    impl MicStream for CpalStream {
        fn drain(&mut self) -> Vec<f32> {
            let mut buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *buf)
        }

        fn close(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.close();
        }
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_wav_is_header_only() {
        let wav = samples_to_wav(&[], SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44);
    }

    #[test]
    fn test_wav_size_tracks_samples() {
        let wav = samples_to_wav(&vec![0.1; 800], SAMPLE_RATE).unwrap();
        // 16-bit mono: two bytes per sample after the header
        assert_eq!(wav.len(), 44 + 1600);
    }
}
