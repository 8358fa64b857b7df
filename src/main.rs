use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use kiosk_voice::voice::{
    ErrorCode, FlowError, FlowListener, FlowState, PipelineController, VoiceStack,
};
use kiosk_voice::{Config, HttpIntentRouter, IntentRouter, Screen, chunk_text};

const WELCOME: &str = "안녕하세요! 무엇을 도와드릴까요? 아래 버튼을 누르거나 음성으로 말씀해주세요.";
const FESTIVAL_INTRO: &str = "서울시 행사 정보를 알려드립니다.";
const WEATHER_INTRO: &str = "현재 날씨와 주간 예보를 알려드립니다.";
const PIN_PROMPT: &str = "주민등록번호 열 세자리를 입력해주세요.";
const NOT_UNDERSTOOD: &str = "죄송해요. 잘 이해하지 못했어요. 다시 한번 말씀해 주세요.";
const REQUEST_FAILED: &str = "요청을 처리하는 중 문제가 발생했어요. 다시 한번 말씀해 주세요.";

/// Maximum characters per synthesized chunk of a long announcement
const CHUNK_LEN: usize = 240;

/// Kiosk - Voice front end for a self-service civil service kiosk
#[derive(Parser)]
#[command(name = "kiosk", version, about)]
struct Cli {
    /// Kiosk backend base URL
    #[arg(long, env = "KIOSK_API_URL")]
    api_url: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the interactive kiosk session (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Speak a text through the synthesis backend
    Say {
        /// Text to speak
        #[arg(default_value = WELCOME)]
        text: String,
    },
    /// Record one utterance and print the transcript
    Listen,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,kiosk_voice=info",
        1 => "info,kiosk_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = cli.api_url {
        config.endpoints.base_url = url;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_kiosk(config).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::Say { text } => say(&config, &text).await,
        Command::Listen => listen_once(&config).await,
    }
}

/// Events delivered by the voice flow to the kiosk loop
#[derive(Debug)]
enum KioskEvent {
    Command(String),
    Error(FlowError),
}

struct ChannelListener {
    events: mpsc::UnboundedSender<KioskEvent>,
}

impl FlowListener for ChannelListener {
    fn on_command(&self, transcript: &str) {
        let _ = self.events.send(KioskEvent::Command(transcript.to_string()));
    }

    fn on_error(&self, error: &FlowError) {
        let _ = self.events.send(KioskEvent::Error(error.clone()));
    }
}

/// User-facing message for a flow error; no-speech retries silently
const fn error_message(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::MicPermissionDenied => Some("마이크 사용 권한을 허용해주세요."),
        ErrorCode::NoMicrophone => Some("사용 가능한 마이크 장치가 없습니다."),
        ErrorCode::SttNoSpeech => None,
        ErrorCode::SttLowConfidence => {
            Some("음성을 명확히 인식하지 못했습니다. 다시 말씀해주세요.")
        }
        ErrorCode::SttNetworkError => Some("음성 인식 중 오류가 발생했습니다."),
    }
}

#[cfg(feature = "device")]
fn device_stack(config: &Config) -> anyhow::Result<VoiceStack> {
    use kiosk_voice::voice::{CpalMicrophone, CpalOutput, HttpSynthesizer, HttpTranscriber};

    let client = reqwest::Client::new();
    Ok(VoiceStack {
        output: Arc::new(CpalOutput::new()?),
        microphone: Arc::new(CpalMicrophone::new()),
        synthesizer: Arc::new(HttpSynthesizer::with_client(
            client.clone(),
            &config.endpoints,
            &config.speech,
        )),
        transcriber: Arc::new(HttpTranscriber::with_client(client, &config.endpoints)),
    })
}

#[cfg(not(feature = "device"))]
fn device_stack(_config: &Config) -> anyhow::Result<VoiceStack> {
    anyhow::bail!("kiosk was built without audio device support (enable the `device` feature)")
}

/// Run the interactive kiosk: Enter starts a voice turn, typed text is a menu choice
async fn run_kiosk(config: Config) -> anyhow::Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let stack = device_stack(&config)?;
    let controller = Arc::new(PipelineController::new(
        &config,
        stack,
        Arc::new(ChannelListener { events: events_tx }),
    ));
    let router: Arc<dyn IntentRouter> = Arc::new(HttpIntentRouter::new(&config.endpoints));

    controller.cache().warm(WELCOME);

    println!("Press Enter to talk to the kiosk, or type a request. Ctrl-C to quit.");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim().to_string();
                if text.is_empty() {
                    start_voice_turn(&controller);
                } else {
                    controller.stop_all();
                    spawn_request(&controller, &router, text);
                }
            }
            Some(event) = events.recv() => match event {
                KioskEvent::Command(text) => {
                    println!("> {text}");
                    spawn_request(&controller, &router, text);
                }
                KioskEvent::Error(error) => {
                    if let Some(message) = error_message(error.code) {
                        println!("! {message}");
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    controller.stop_basic();
    Ok(())
}

/// A gesture arrived: unlock audio, greet, then listen
fn start_voice_turn(controller: &Arc<PipelineController>) {
    if matches!(
        controller.state(),
        FlowState::Listening | FlowState::Processing
    ) {
        return;
    }
    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        controller.on_user_gesture().await;
        if let Err(e) = controller.speak_then_listen(WELCOME).await {
            tracing::warn!(error = %e, "welcome prompt failed");
        }
    });
}

fn spawn_request(
    controller: &Arc<PipelineController>,
    router: &Arc<dyn IntentRouter>,
    text: String,
) {
    let controller = Arc::clone(controller);
    let router = Arc::clone(router);
    tokio::spawn(async move { handle_request(&controller, router.as_ref(), &text).await });
}

async fn handle_request(controller: &PipelineController, router: &dyn IntentRouter, text: &str) {
    let route = match router.route(text).await {
        Ok(route) => route,
        Err(e) => {
            tracing::error!(error = %e, "request failed");
            back_home_and_retry(controller, REQUEST_FAILED).await;
            return;
        }
    };

    match route.screen {
        Screen::Festival { keyword } => {
            println!("[festival] {keyword}");
            controller.safe_speak(FESTIVAL_INTRO);
        }
        Screen::Weather { summary, .. } => {
            println!("[weather] {summary}");
            let mut chunks = vec![WEATHER_INTRO.to_string()];
            chunks.extend(chunk_text(&summary, CHUNK_LEN));
            if let Err(e) = controller.speak_chunks(&chunks, false).await {
                tracing::warn!(error = %e, "weather summary failed, speaking it whole");
                controller.safe_speak(summary);
            }
        }
        Screen::PinInput => {
            println!("[pin-input] {}", route.purpose);
            controller.safe_speak(PIN_PROMPT);
        }
        Screen::Unrecognized => back_home_and_retry(controller, NOT_UNDERSTOOD).await,
    }
}

async fn back_home_and_retry(controller: &PipelineController, message: &str) {
    controller.stop_basic();
    let listen = controller
        .say_then(message, || controller.flow().listen_and_recognize())
        .await;
    listen.await;
}

/// Speak a text once
async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let (events_tx, _events) = mpsc::unbounded_channel();
    let controller = PipelineController::new(
        config,
        device_stack(config)?,
        Arc::new(ChannelListener { events: events_tx }),
    );

    controller.on_user_gesture().await;
    let outcome = controller.speak_now(text).await?;
    tracing::info!(?outcome, "speech complete");
    Ok(())
}

/// Record one utterance and print what was recognized
async fn listen_once(config: &Config) -> anyhow::Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let controller = PipelineController::new(
        config,
        device_stack(config)?,
        Arc::new(ChannelListener { events: events_tx }),
    );

    println!("Listening... speak now.");
    controller.listen().await;

    loop {
        match events.try_recv() {
            Ok(KioskEvent::Command(text)) => {
                println!("Transcript: {text}");
                break;
            }
            Ok(KioskEvent::Error(error)) if error.code == ErrorCode::SttNoSpeech => {
                println!("No speech detected.");
                break;
            }
            Ok(KioskEvent::Error(error)) => anyhow::bail!("recognition failed: {error}"),
            Err(_) => {
                println!("Nothing recognized.");
                break;
            }
        }
    }

    controller.stop_all();
    Ok(())
}

/// Test microphone input
#[cfg(feature = "device")]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    use std::time::Duration;

    use kiosk_voice::voice::{CpalMicrophone, Microphone, calculate_rms};

    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut stream = CpalMicrophone::new().open().await?;
    println!("Sample rate: {} Hz", stream.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = stream.drain();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    stream.close();

    println!("\n---");
    println!("Speech threshold is RMS 0.015.");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

#[cfg(not(feature = "device"))]
#[allow(clippy::unused_async)]
async fn test_mic(_duration: u64) -> anyhow::Result<()> {
    anyhow::bail!("kiosk was built without audio device support")
}

/// Test speaker output with a sine wave
#[cfg(feature = "device")]
async fn test_speaker() -> anyhow::Result<()> {
    use kiosk_voice::voice::{AudioOutput, Clip, CpalOutput, samples_to_wav};
    use tokio_util::sync::CancellationToken;

    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let output = CpalOutput::new()?;

    // Generate 2 seconds of 440Hz sine wave at 24kHz sample rate
    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    let clip = Clip::new(samples_to_wav(&samples, sample_rate)?, None);
    output.resume().await?;
    output.play(clip, CancellationToken::new()).await?;

    println!("Done! Did you hear the tone?");
    Ok(())
}

#[cfg(not(feature = "device"))]
#[allow(clippy::unused_async)]
async fn test_speaker() -> anyhow::Result<()> {
    anyhow::bail!("kiosk was built without audio device support")
}
