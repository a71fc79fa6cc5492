//! Microphone capture encoder
//!
//! Turns a window of native-rate float samples into 16 kHz signed 16-bit
//! little-endian PCM for the realtime input stream, and derives a coarse
//! "user is speaking" flag from the same window.

/// Sample rate the remote service expects for realtime audio.
pub const WIRE_SAMPLE_RATE: u32 = 16000;

/// MIME type sent alongside encoded audio chunks.
pub const WIRE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// RMS level above which the user is considered to be speaking.
pub const VOICE_THRESHOLD: f32 = 0.01;

/// Only every Nth sample contributes to the RMS estimate.
const RMS_STRIDE: usize = 10;

/// Result of encoding one capture window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedFrame {
    pub pcm: Vec<i16>,
    pub speaking: bool,
}

impl EncodedFrame {
    /// PCM payload as little-endian bytes, ready for base64.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        i16_slice_to_u8(&self.pcm)
    }
}

/// Stateless per-window encoder. Gain is applied before resampling.
#[derive(Debug, Clone, Copy)]
pub struct AudioCaptureEncoder {
    target_rate: u32,
    gain: f32,
}

impl Default for AudioCaptureEncoder {
    fn default() -> Self {
        Self {
            target_rate: WIRE_SAMPLE_RATE,
            gain: 1.0,
        }
    }
}

impl AudioCaptureEncoder {
    pub fn new(target_rate: u32, gain: f32) -> Self {
        Self { target_rate, gain }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Encode a capture window taken at `input_rate`.
    pub fn encode(&self, samples: &[f32], input_rate: u32) -> EncodedFrame {
        if (self.gain - 1.0).abs() > f32::EPSILON {
            let boosted: Vec<f32> = samples.iter().map(|s| s * self.gain).collect();
            return EncodedFrame {
                pcm: resample(&boosted, input_rate, self.target_rate),
                speaking: is_speaking(&boosted),
            };
        }

        EncodedFrame {
            pcm: resample(samples, input_rate, self.target_rate),
            speaking: is_speaking(samples),
        }
    }
}

/// Resample to `output_rate` with box-filter decimation and quantize to i16.
///
/// Output sample `k` is the mean of the input samples whose index falls in
/// `[round(k * r), round((k + 1) * r))` where `r = input_rate / output_rate`.
/// Invalid rates or empty input produce an empty vector.
pub fn resample(samples: &[f32], input_rate: u32, output_rate: u32) -> Vec<i16> {
    if samples.is_empty() || input_rate == 0 || output_rate == 0 {
        return Vec::new();
    }

    if input_rate == output_rate {
        return samples.iter().map(|&s| quantize(s)).collect();
    }

    let ratio = input_rate as f64 / output_rate as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    let mut out = Vec::with_capacity(out_len);

    let mut start = 0usize;
    for k in 0..out_len {
        let end = (((k + 1) as f64) * ratio).round() as usize;
        let window = &samples[start.min(samples.len())..end.min(samples.len())];
        let mean = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|&s| s as f64).sum::<f64>() / window.len() as f64
        };
        out.push(quantize(mean as f32));
        start = end;
    }

    out
}

/// Clamp to [-1, 1] and scale asymmetrically onto the full i16 range.
pub fn quantize(sample: f32) -> i16 {
    if !sample.is_finite() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Root-mean-square over every tenth sample.
pub fn coarse_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples
        .iter()
        .step_by(RMS_STRIDE)
        .filter(|s| s.is_finite())
        .map(|s| s * s)
        .sum();
    (sum / (samples.len() as f32 / RMS_STRIDE as f32)).sqrt()
}

pub fn is_speaking(samples: &[f32]) -> bool {
    coarse_rms(samples) > VOICE_THRESHOLD
}

/// Convert i16 PCM samples to u8 bytes (for sending to audio APIs)
pub fn i16_slice_to_u8(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, rate: u32, freq: f32, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_48k_window_decimates_to_1600() {
        let input = sine(4800, 48000, 440.0, 0.5);
        assert_eq!(resample(&input, 48000, 16000).len(), 1600);
    }

    #[test]
    fn test_output_length_matches_ratio() {
        for &rate in &[16000u32, 22050, 32000, 44100, 48000, 96000] {
            for &len in &[1usize, 7, 441, 1024, 4096, 4410] {
                let input = vec![0.1f32; len];
                let ratio = rate as f64 / 16000.0;
                let expected = (len as f64 / ratio).round() as usize;
                assert_eq!(
                    resample(&input, rate, 16000).len(),
                    expected,
                    "rate {} len {}",
                    rate,
                    len
                );
            }
        }
    }

    #[test]
    fn test_box_filter_averages_window() {
        // 3:1 decimation of a ramp averages each triple.
        let input = [0.0, 0.3, 0.6, -0.3, -0.6, -0.9];
        let out = resample(&input, 48000, 16000);
        assert_eq!(out, vec![quantize(0.3), quantize(-0.6)]);
    }

    #[test]
    fn test_equal_rate_only_quantizes() {
        let input = [0.0, 0.5, -0.5, 1.0, -1.0];
        let out = resample(&input, 16000, 16000);
        assert_eq!(out, vec![0, 16384, -16384, 32767, -32768]);
    }

    #[test]
    fn test_out_of_range_input_is_clamped() {
        let input = [4.0, -7.5, f32::NAN, f32::INFINITY, 1.0001, -1.0001];
        for &rate in &[16000u32, 44100, 48000] {
            let out = resample(&input, rate, 16000);
            assert!(out.iter().all(|&s| (i16::MIN..=i16::MAX).contains(&s)));
        }
        assert_eq!(quantize(4.0), i16::MAX);
        assert_eq!(quantize(-7.5), i16::MIN);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn test_empty_or_invalid_input_yields_empty() {
        assert!(resample(&[], 48000, 16000).is_empty());
        assert!(resample(&[0.5; 10], 0, 16000).is_empty());
        assert!(resample(&[0.5; 10], 48000, 0).is_empty());
        let frame = AudioCaptureEncoder::default().encode(&[], 48000);
        assert!(frame.pcm.is_empty());
        assert!(!frame.speaking);
    }

    #[test]
    fn test_speaking_threshold() {
        assert!(!is_speaking(&vec![0.0; 4096]));
        assert!(!is_speaking(&vec![0.005; 4096]));
        assert!(is_speaking(&sine(4096, 48000, 300.0, 0.2)));
    }

    #[test]
    fn test_gain_applied_before_encoding() {
        let encoder = AudioCaptureEncoder::new(WIRE_SAMPLE_RATE, 2.0);
        let frame = encoder.encode(&[0.25; 3], 16000);
        assert_eq!(frame.pcm, vec![quantize(0.5); 3]);
    }

    #[test]
    fn test_le_bytes_layout() {
        let frame = EncodedFrame {
            pcm: vec![1, -2],
            speaking: false,
        };
        assert_eq!(frame.to_le_bytes(), vec![0x01, 0x00, 0xFE, 0xFF]);
    }
}
