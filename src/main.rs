//! LiveLink - talk to a Live API model with a voice, a face and a camera
//!
//! Usage: livelink [MIC.wav] [--image PHOTO] [--out SPEECH.wav] [--pulse]
//!
//! Without `--pulse` the microphone is a WAV file replayed in real time and
//! model speech is written to a WAV file. Type `start`, `stop`, `quit`, or
//! `tool NAME {json}` on stdin to drive the session.

use anyhow::{bail, Context, Result};
use livelink::config::SessionConfig;
use livelink::devices::{FileLockStore, LoggingDevice};
use livelink::gemini_client::{GeminiClientConfig, GeminiConnector};
use livelink::health::{ConnectionHealthMonitor, TcpProbe};
use livelink::media::{Camera, FacingMode, MediaDevices, MediaHub};
use livelink::playback::OutputDevice;
use livelink::scenario::PlainScenario;
use livelink::session::{SessionHandle, SessionParts, SessionRunner};
use livelink::tools::ToolRegistry;
use livelink::view::SharedView;
use livelink::wav_io::{ImageCamera, WavMicrophone, WavSpeaker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VIEW_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct Args {
    mic: Option<PathBuf>,
    image: Option<PathBuf>,
    out: PathBuf,
    pulse: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        out: PathBuf::from("livelink_speech.wav"),
        ..Args::default()
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--image" => args.image = Some(it.next().context("--image needs a path")?.into()),
            "--out" => args.out = it.next().context("--out needs a path")?.into(),
            "--pulse" => args.pulse = true,
            flag if flag.starts_with("--") => bail!("unknown flag {}", flag),
            path => args.mic = Some(path.into()),
        }
    }
    Ok(args)
}

/// Microphone and speaker for this host.
fn audio_devices(
    args: &Args,
    camera: Option<Arc<dyn Camera>>,
) -> Result<(Arc<dyn MediaDevices>, Arc<dyn OutputDevice>, Option<Arc<WavSpeaker>>)> {
    if args.pulse {
        #[cfg(feature = "pulse")]
        {
            let speaker = livelink::pulse::PulseSpeaker::open().context("opening PulseAudio speaker")?;
            return Ok((
                Arc::new(livelink::pulse::PulseMicrophone::new(camera)),
                Arc::new(speaker),
                None,
            ));
        }
        #[cfg(not(feature = "pulse"))]
        bail!("--pulse requires building with the `pulse` feature");
    }

    let mic = args.mic.clone().context("a microphone WAV file is required without --pulse")?;
    let speaker = Arc::new(
        WavSpeaker::create(&args.out).with_context(|| format!("creating {}", args.out.display()))?,
    );
    let output: Arc<dyn OutputDevice> = speaker.clone();
    Ok((Arc::new(WavMicrophone::new(mic, camera)), output, Some(speaker)))
}

/// Print new user-facing log lines as they appear.
fn spawn_view_printer(view: SharedView) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen = 0;
        let mut ticker = tokio::time::interval(VIEW_POLL);
        loop {
            ticker.tick().await;
            let snapshot = view.snapshot();
            for line in snapshot.log.since(seen) {
                println!("[{}] {:?}: {}", line.timestamp, line.kind, line.text);
            }
            seen = snapshot.log.pushed();
        }
    })
}

async fn read_commands(handle: SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("start", _) => {
                handle.start();
            }
            ("stop", _) => {
                handle.abort();
            }
            ("quit", _) => break,
            ("tool", rest) => {
                let (name, args) = rest.trim().split_once(' ').unwrap_or((rest.trim(), "{}"));
                match serde_json::from_str(args) {
                    Ok(args) => {
                        handle.trigger_tool(name, args);
                    }
                    Err(e) => warn!("Bad tool arguments {:?}: {}", args, e),
                }
            }
            ("", _) => {}
            (other, _) => warn!("Unknown command {:?}", other),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting livelink");

    let args = parse_args()?;
    let config = SessionConfig::from_env();
    if config.api_key.is_none() {
        warn!("GEMINI_API_KEY is not set; connecting will fail");
    }

    let camera: Option<Arc<dyn Camera>> = match &args.image {
        Some(path) => {
            let camera = ImageCamera::open(path).with_context(|| format!("opening {}", path.display()))?;
            Some(Arc::new(camera))
        }
        None => None,
    };
    let (media_devices, output, wav_speaker) = audio_devices(&args, camera)?;

    let connector = GeminiConnector::new(GeminiClientConfig::from_api_key(
        config.api_key.as_deref().unwrap_or_default(),
    ));
    let registry = ToolRegistry::builtin(&config.secret_code);
    let parts = SessionParts {
        connector: Arc::new(connector),
        media: MediaHub::new(media_devices, FacingMode::User),
        devices: Arc::new(LoggingDevice::default()),
        output,
        lock_store: Arc::new(FileLockStore::new(&config.lock_file)),
        scenario: Arc::new(PlainScenario),
        registry,
    };

    let probe = Arc::new(TcpProbe {
        host: config.probe_host.clone(),
        timeout: config.probe_timeout,
    });
    let probe_interval = config.probe_interval;
    let speaking_poll = config.speaking_poll;

    let runner = SessionRunner::new(config, parts);
    let handle = runner.handle();
    let view = runner.view();
    let monitor = ConnectionHealthMonitor::start(
        runner.playback(),
        runner.output(),
        speaking_poll,
        Some((probe, probe_interval, handle.clone())),
    );
    let mut speaking = monitor.speaking();
    tokio::spawn(async move {
        while speaking.changed().await.is_ok() {
            let now = *speaking.borrow_and_update();
            info!("{}", if now { "🗣️ Agent speaking" } else { "🤫 Agent quiet" });
        }
    });

    let printer = spawn_view_printer(view);
    let session = tokio::spawn(runner.run());
    handle.start();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
        }
        result = read_commands(handle.clone()) => result?,
    }

    handle.abort();
    handle.shutdown();
    session.await.context("session task panicked")?;
    drop(monitor);
    printer.abort();

    if let Some(speaker) = wav_speaker {
        speaker.finalize().context("finalizing speech file")?;
        info!("Speech written to {}", args.out.display());
    }
    Ok(())
}
