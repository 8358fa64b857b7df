//! Shared test utilities
//!
//! Fake devices and backends for driving the voice pipeline without audio
//! hardware or a network. All timing runs on the tokio clock so tests can use
//! `start_paused`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kiosk_voice::voice::{
    AudioOutput, Clip, ErrorCode, FlowError, FlowListener, MicStream, Microphone,
    PipelineController, PlaybackOutcome, SAMPLE_RATE, SynthesizedAudio, Synthesizer, Transcriber,
    VoiceStack,
};
use kiosk_voice::{Config, Error, Result};

/// Tracks concurrent playback and capture across the fakes
#[derive(Debug, Default)]
pub struct Activity {
    pub playing: AtomicUsize,
    pub recording: AtomicUsize,
    pub max_playing: AtomicUsize,
    pub overlap: AtomicBool,
}

impl Activity {
    fn start_playing(&self) {
        let now = self.playing.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_playing.fetch_max(now, Ordering::SeqCst);
        if self.recording.load(Ordering::SeqCst) > 0 {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn start_recording(&self) {
        self.recording.fetch_add(1, Ordering::SeqCst);
        if self.playing.load(Ordering::SeqCst) > 0 {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    pub fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

/// Speaker that "plays" a clip by sleeping
pub struct FakeOutput {
    pub activity: Arc<Activity>,
    pub play_duration: Duration,
    pub played: Mutex<Vec<String>>,
    pub attempts: AtomicUsize,
    pub resumes: AtomicUsize,
    pub reject_next: AtomicBool,
}

impl FakeOutput {
    pub fn new(activity: Arc<Activity>, play_duration: Duration) -> Self {
        Self {
            activity,
            play_duration,
            played: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            reject_next: AtomicBool::new(false),
        }
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn resume(&self) -> Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        Ok(())
    }

    async fn play(&self, clip: Clip, cancel: CancellationToken) -> Result<PlaybackOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return Err(Error::PlaybackNotAllowed);
        }
        if cancel.is_cancelled() {
            return Ok(PlaybackOutcome::Stopped);
        }

        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&clip.data).into_owned());
        self.activity.start_playing();

        let outcome = tokio::select! {
            () = tokio::time::sleep(self.play_duration) => PlaybackOutcome::Finished,
            () = cancel.cancelled() => PlaybackOutcome::Stopped,
        };

        self.activity.playing.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

/// What a scripted microphone hears over time
#[derive(Debug, Clone)]
pub enum MicScript {
    /// Loud speech for a while, then silence
    SpeechThenSilence(Duration),
    /// Constant amplitude forever
    Constant(f32),
    /// The device delivers no samples at all
    Dead,
    /// Opening fails
    Fails(fn() -> Error),
}

/// Microphone that synthesizes constant-amplitude samples from a script
pub struct ScriptedMic {
    pub activity: Arc<Activity>,
    pub script: MicScript,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    /// How long the device takes to open, like a permission prompt
    pub open_delay: Duration,
}

impl ScriptedMic {
    pub fn new(activity: Arc<Activity>, script: MicScript) -> Self {
        Self {
            activity,
            script,
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            open_delay: Duration::ZERO,
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub const SPEECH_LEVEL: f32 = 0.2;

#[async_trait]
impl Microphone for ScriptedMic {
    async fn open(&self) -> Result<Box<dyn MicStream>> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let MicScript::Fails(make_error) = self.script {
            return Err(make_error());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.activity.start_recording();
        let now = Instant::now();
        Ok(Box::new(ScriptedStream {
            script: self.script.clone(),
            opened: now,
            last: now,
            activity: Arc::clone(&self.activity),
            closes: Arc::clone(&self.closes),
            closed: false,
        }))
    }
}

struct ScriptedStream {
    script: MicScript,
    opened: Instant,
    last: Instant,
    activity: Arc<Activity>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl MicStream for ScriptedStream {
    fn drain(&mut self) -> Vec<f32> {
        let now = Instant::now();
        let elapsed = now - self.last;
        self.last = now;

        let amplitude = match self.script {
            MicScript::SpeechThenSilence(speech) if now - self.opened < speech => SPEECH_LEVEL,
            MicScript::Constant(level) => level,
            MicScript::Dead => return Vec::new(),
            _ => 0.0,
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = (elapsed.as_secs_f64() * f64::from(SAMPLE_RATE)) as usize;
        vec![amplitude; count]
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.activity.recording.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Synthesizer that counts requests and returns the text bytes as audio
pub struct CountingSynthesizer {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub fail: bool,
    /// A text that takes longer to synthesize than the rest
    pub slow: Option<(String, Duration)>,
}

impl CountingSynthesizer {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            fail: false,
            slow: None,
        }
    }

    pub fn slow_for(mut self, text: &str, delay: Duration) -> Self {
        self.slow = Some((text.to_string(), delay));
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::from_millis(10))
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for CountingSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = match &self.slow {
            Some((slow, delay)) if slow == text => *delay,
            _ => self.delay,
        };
        tokio::time::sleep(delay).await;
        if self.fail {
            return Err(Error::TtsFailed {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(SynthesizedAudio::Clip(Clip::new(
            text.as_bytes().to_vec(),
            Some("audio/mpeg".to_string()),
        )))
    }

    async fn fetch_locator(&self, locator: &str) -> Result<Clip> {
        Ok(Clip::new(locator.as_bytes().to_vec(), None))
    }
}

/// Transcriber with queued responses; defaults to an empty transcript
pub struct FakeTranscriber {
    pub responses: Mutex<VecDeque<Result<String>>>,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl FakeTranscriber {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(100),
        }
    }

    pub fn saying(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _wav: &[u8]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// Listener that records every callback
#[derive(Default)]
pub struct RecordingListener {
    pub commands: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<ErrorCode>>,
}

impl RecordingListener {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<ErrorCode> {
        self.errors.lock().unwrap().clone()
    }
}

impl FlowListener for RecordingListener {
    fn on_command(&self, transcript: &str) {
        self.commands.lock().unwrap().push(transcript.to_string());
    }

    fn on_error(&self, error: &FlowError) {
        self.errors.lock().unwrap().push(error.code);
    }
}

/// A pipeline wired to fakes, with handles to inspect them
pub struct Harness {
    pub controller: PipelineController,
    pub activity: Arc<Activity>,
    pub output: Arc<FakeOutput>,
    pub mic: Arc<ScriptedMic>,
    pub synth: Arc<CountingSynthesizer>,
    pub stt: Arc<FakeTranscriber>,
    pub listener: Arc<RecordingListener>,
}

/// Builder for [`Harness`]
pub struct HarnessBuilder {
    config: Config,
    play_duration: Duration,
    script: MicScript,
    open_delay: Duration,
    synth: CountingSynthesizer,
    stt: FakeTranscriber,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            play_duration: Duration::from_secs(1),
            script: MicScript::SpeechThenSilence(Duration::from_millis(400)),
            open_delay: Duration::ZERO,
            synth: CountingSynthesizer::new(Duration::from_millis(100)),
            stt: FakeTranscriber::saying("날씨 알려줘"),
        }
    }
}

impl HarnessBuilder {
    pub fn config(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn play_duration(mut self, duration: Duration) -> Self {
        self.play_duration = duration;
        self
    }

    pub fn script(mut self, script: MicScript) -> Self {
        self.script = script;
        self
    }

    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn synth(mut self, synth: CountingSynthesizer) -> Self {
        self.synth = synth;
        self
    }

    pub fn stt(mut self, stt: FakeTranscriber) -> Self {
        self.stt = stt;
        self
    }

    pub fn build(self) -> Harness {
        let activity = Arc::new(Activity::default());
        let output = Arc::new(FakeOutput::new(Arc::clone(&activity), self.play_duration));
        let mic = Arc::new(
            ScriptedMic::new(Arc::clone(&activity), self.script).with_open_delay(self.open_delay),
        );
        let synth = Arc::new(self.synth);
        let stt = Arc::new(self.stt);
        let listener = Arc::new(RecordingListener::default());

        let stack = VoiceStack {
            output: Arc::clone(&output) as Arc<dyn AudioOutput>,
            microphone: Arc::clone(&mic) as Arc<dyn Microphone>,
            synthesizer: Arc::clone(&synth) as Arc<dyn Synthesizer>,
            transcriber: Arc::clone(&stt) as Arc<dyn Transcriber>,
        };
        let controller = PipelineController::new(
            &self.config,
            stack,
            Arc::clone(&listener) as Arc<dyn FlowListener>,
        );

        Harness {
            controller,
            activity,
            output,
            mic,
            synth,
            stt,
            listener,
        }
    }
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder::default()
}

/// Advance the paused clock
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
