//! Recorder and detector integration tests
//!
//! Drives recording sessions against scripted microphones on a paused clock

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use kiosk_voice::config::VadConfig;
use kiosk_voice::voice::{
    Microphone, RecordOptions, Recorder, SAMPLE_RATE, StopReason, samples_to_wav,
};

mod common;

use common::{Activity, MicScript, ScriptedMic, advance};

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

fn recorder(script: MicScript) -> (Recorder, Arc<ScriptedMic>) {
    let mic = Arc::new(ScriptedMic::new(Arc::new(Activity::default()), script));
    let recorder = Recorder::new(Arc::clone(&mic) as Arc<dyn Microphone>);
    (recorder, mic)
}

#[tokio::test(start_paused = true)]
async fn test_trailing_silence_ends_session() {
    let (recorder, mic) = recorder(MicScript::SpeechThenSilence(Duration::from_millis(400)));

    let recording = recorder
        .start(RecordOptions::from(VadConfig::default()))
        .await
        .unwrap();

    assert_eq!(recording.stop_reason, StopReason::Silence);
    assert!(recording.speech_detected);
    // 400ms of speech, then 800ms of silence observed at 50ms resolution
    assert!(recording.duration >= Duration::from_millis(1150));
    assert!(recording.duration <= Duration::from_millis(1250));
    assert!(recording.has_speech(2000));
    assert_eq!(mic.closes(), 1);
    assert!(!recorder.is_recording());
}

#[tokio::test(start_paused = true)]
async fn test_continuous_speech_hits_ceiling() {
    let (recorder, mic) = recorder(MicScript::Constant(0.3));

    let recording = recorder
        .start(RecordOptions::from(VadConfig::default()))
        .await
        .unwrap();

    assert_eq!(recording.stop_reason, StopReason::MaxDuration);
    assert!(recording.duration >= Duration::from_secs(15));
    assert!(recording.duration < Duration::from_millis(15_100));
    assert!(recording.speech_detected);
    assert_eq!(mic.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silence_without_speech_waits_for_ceiling() {
    let (recorder, _mic) = recorder(MicScript::Constant(0.0));

    let recording = recorder
        .start(RecordOptions::from(VadConfig::default()))
        .await
        .unwrap();

    // Silence only counts after speech
    assert_eq!(recording.stop_reason, StopReason::MaxDuration);
    assert!(!recording.speech_detected);
    assert!(recording.sample_count > 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_vad_only_stops_at_ceiling() {
    let (recorder, _mic) = recorder(MicScript::SpeechThenSilence(Duration::from_millis(200)));
    let vad = VadConfig {
        enabled: false,
        max_recording: Duration::from_secs(3),
        ..VadConfig::default()
    };

    let recording = recorder.start(RecordOptions::from(vad)).await.unwrap();

    assert_eq!(recording.stop_reason, StopReason::MaxDuration);
    assert!(recording.duration >= Duration::from_secs(3));
    assert!(recording.duration < Duration::from_millis(3100));
}

#[tokio::test(start_paused = true)]
async fn test_manual_stop_returns_captured_audio() {
    let (recorder, mic) = recorder(MicScript::Constant(0.3));

    let (recording, stopped) = tokio::join!(
        recorder.start(RecordOptions::from(VadConfig::default())),
        async {
            advance(300).await;
            recorder.stop()
        }
    );
    let recording = recording.unwrap();

    assert!(stopped);
    assert_eq!(recording.stop_reason, StopReason::Manual);
    assert!((4000..=4800).contains(&recording.sample_count));
    assert_eq!(mic.closes(), 1);

    // Nothing left to stop
    assert!(!recorder.stop());
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_opening_never_captures() {
    let mic = Arc::new(
        ScriptedMic::new(Arc::new(Activity::default()), MicScript::Constant(0.3))
            .with_open_delay(Duration::from_millis(200)),
    );
    let recorder = Recorder::new(Arc::clone(&mic) as Arc<dyn Microphone>);

    let (recording, stopped) = tokio::join!(
        recorder.start(RecordOptions::from(VadConfig::default())),
        async {
            advance(50).await;
            assert!(recorder.is_recording());
            recorder.stop()
        }
    );
    let recording = recording.unwrap();
    advance(500).await;

    assert!(stopped);
    assert_eq!(recording.stop_reason, StopReason::Manual);
    assert_eq!(recording.sample_count, 0);
    assert_eq!(recording.len(), 44);
    assert_eq!(mic.opens(), 0);
    assert_eq!(mic.closes(), 0);
    assert!(!recorder.is_recording());
}

#[tokio::test(start_paused = true)]
async fn test_sessions_reopen_the_device() {
    let (recorder, mic) = recorder(MicScript::SpeechThenSilence(Duration::from_millis(100)));

    for _ in 0..2 {
        recorder
            .start(RecordOptions::from(VadConfig::default()))
            .await
            .unwrap();
    }

    assert_eq!(mic.opens(), 2);
    assert_eq!(mic.closes(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dead_microphone_yields_header_only() {
    let (recorder, _mic) = recorder(MicScript::Dead);
    let vad = VadConfig {
        max_recording: Duration::from_millis(500),
        ..VadConfig::default()
    };

    let recording = recorder.start(RecordOptions::from(vad)).await.unwrap();

    assert_eq!(recording.sample_count, 0);
    assert_eq!(recording.len(), 44);
    assert!(!recording.has_speech(2000));
}

#[tokio::test]
async fn test_open_failure_propagates() {
    let (recorder, _mic) = recorder(MicScript::Fails(|| kiosk_voice::Error::NoMicrophone));

    let result = recorder.start(RecordOptions::default()).await;

    assert!(matches!(result, Err(kiosk_voice::Error::NoMicrophone)));
    assert!(!recorder.is_recording());
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // WAV header is 44 bytes, then 16-bit samples
    assert_eq!(wav.len(), 44 + samples.len() * 2);
    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");
}

#[test]
fn test_wav_roundtrip() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();

    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.bits_per_sample, 16);

    let read: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(read.len(), samples.len());
}
