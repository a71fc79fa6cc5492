/// Offline check of the capture encoder
/// Runs a WAV file through the same windowing, gain and resampling the live
/// microphone path uses, and reports how much of it counted as speech.
use anyhow::{Context, Result};
use livelink::audio_encoder::{AudioCaptureEncoder, WIRE_SAMPLE_RATE};
use livelink::config::{CAPTURE_WINDOW, INPUT_GAIN};
use livelink::wav_io::{read_wav_mono, write_wav_pcm16};
use std::path::PathBuf;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let input: PathBuf = args
        .next()
        .context("usage: resample_wav INPUT.wav [OUTPUT.wav]")?
        .into();
    let output: PathBuf = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| input.with_extension("16k.wav"));

    let (samples, rate) = read_wav_mono(&input).with_context(|| format!("reading {}", input.display()))?;
    println!("🎤 {}: {} samples @ {}Hz", input.display(), samples.len(), rate);

    let encoder = AudioCaptureEncoder::new(WIRE_SAMPLE_RATE, INPUT_GAIN);
    let mut pcm = Vec::with_capacity(samples.len() * WIRE_SAMPLE_RATE as usize / rate.max(1) as usize);
    let mut windows = 0usize;
    let mut speaking = 0usize;
    for window in samples.chunks(CAPTURE_WINDOW) {
        let frame = encoder.encode(window, rate);
        windows += 1;
        if frame.speaking {
            speaking += 1;
        }
        pcm.extend_from_slice(&frame.pcm);
    }

    write_wav_pcm16(&output, &pcm, WIRE_SAMPLE_RATE).with_context(|| format!("writing {}", output.display()))?;

    let ratio = if windows == 0 {
        0.0
    } else {
        speaking as f64 / windows as f64 * 100.0
    };
    println!("💾 Wrote {} samples @ {}Hz to {}", pcm.len(), WIRE_SAMPLE_RATE, output.display());
    println!("🗣️ Voice activity: {}/{} windows ({:.1}%)", speaking, windows, ratio);
    Ok(())
}
