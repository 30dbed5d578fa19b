//! Inbound speech enhancement.
//!
//! Chain (in order):
//! 1. high-pass at 80 Hz (rumble, handling noise)
//! 2. low-pass at 8 kHz, clamped below Nyquist
//! 3. speech-band (300–3400 Hz) analysis on a side copy; the output is never band-limited.
//!    The result only feeds the detector's onset log.
//! 4. fixed make-up gain
//! 5. soft-knee compressor (quadratic knee, make-up on the whole curve)
//! 6. brick-wall limiter
//!
//! Filter memories and the analysis counters are per-session and must be reset whenever the
//! VAD resets, so one utterance's tail doesn't ring into the next.

use crate::codec::SAMPLE_RATE;

const HIGH_PASS_HZ: f32 = 80.0;
const LOW_PASS_HZ: f32 = 8_000.0;
const VOICE_BAND_LOW_HZ: f32 = 300.0;
const VOICE_BAND_HIGH_HZ: f32 = 3_400.0;

const CALIBRATION_FRAMES: u32 = 10;
const VOICE_RATIO_THRESHOLD: f32 = 0.3;
const VOICE_RMS_FLOOR: f32 = 0.001;

const GAIN: f32 = 3.0;

const COMP_THRESHOLD: f32 = 0.7;
const COMP_RATIO: f32 = 2.5;
const COMP_KNEE: f32 = 0.2;
const COMP_MAKEUP: f32 = 1.05;

const LIMIT: f32 = 0.95;

/// Second-order IIR section (RBJ cookbook coefficients, direct form I).
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl Biquad {
    pub fn high_pass(cutoff_hz: f32, sample_rate: f32) -> Self {
        let (cos_w, alpha) = omega(cutoff_hz, sample_rate, std::f32::consts::FRAC_1_SQRT_2);
        let b0 = (1.0 + cos_w) / 2.0;
        Self::normalized(b0, -(1.0 + cos_w), b0, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha)
    }

    pub fn low_pass(cutoff_hz: f32, sample_rate: f32) -> Self {
        let (cos_w, alpha) = omega(cutoff_hz, sample_rate, std::f32::consts::FRAC_1_SQRT_2);
        let b0 = (1.0 - cos_w) / 2.0;
        Self::normalized(b0, 1.0 - cos_w, b0, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha)
    }

    /// Constant 0 dB peak-gain band-pass between `low_hz` and `high_hz`.
    pub fn band_pass(low_hz: f32, high_hz: f32, sample_rate: f32) -> Self {
        let center = (low_hz * high_hz).sqrt();
        let q = center / (high_hz - low_hz);
        let (cos_w, alpha) = omega(center, sample_rate, q);
        Self::normalized(alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos_w, 1.0 - alpha)
    }

    fn normalized(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn process_sample(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    pub fn process_in_place(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.process_sample(*s);
        }
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

fn omega(freq_hz: f32, sample_rate: f32, q: f32) -> (f32, f32) {
    let w = 2.0 * std::f32::consts::PI * freq_hz / sample_rate;
    (w.cos(), w.sin() / (2.0 * q))
}

/// Per-session enhancement state.
#[derive(Debug, Clone)]
pub struct AudioEnhancer {
    high_pass: Biquad,
    low_pass: Biquad,
    voice_band: Biquad,
    frames_seen: u32,
    voice_energy_ratio: f32,
    voice_detected: bool,
}

impl Default for AudioEnhancer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEnhancer {
    pub fn new() -> Self {
        let sr = SAMPLE_RATE as f32;
        Self {
            high_pass: Biquad::high_pass(HIGH_PASS_HZ, sr),
            // A cutoff at Nyquist is degenerate; keep it inside the band.
            low_pass: Biquad::low_pass(LOW_PASS_HZ.min(sr * 0.45), sr),
            voice_band: Biquad::band_pass(VOICE_BAND_LOW_HZ, VOICE_BAND_HIGH_HZ, sr),
            frames_seen: 0,
            voice_energy_ratio: 0.0,
            voice_detected: false,
        }
    }

    /// Run one frame of normalized samples through the chain.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if samples.is_empty() {
            return Vec::new();
        }

        let mut out = samples.to_vec();
        self.high_pass.process_in_place(&mut out);
        self.low_pass.process_in_place(&mut out);

        self.analyze_voice_band(&out);

        for s in out.iter_mut() {
            *s = limit(compress(*s * GAIN));
        }
        out
    }

    pub fn reset(&mut self) {
        self.high_pass.reset();
        self.low_pass.reset();
        self.voice_band.reset();
        self.frames_seen = 0;
        self.voice_energy_ratio = 0.0;
        self.voice_detected = false;
    }

    /// Fraction of the last frame's energy inside the speech band, in `[0, 1]`.
    pub fn voice_energy_ratio(&self) -> f32 {
        self.voice_energy_ratio
    }

    pub fn is_voice_detected(&self) -> bool {
        self.voice_detected
    }

    pub fn is_calibrated(&self) -> bool {
        self.frames_seen >= CALIBRATION_FRAMES
    }

    fn analyze_voice_band(&mut self, filtered: &[f32]) {
        self.frames_seen = self.frames_seen.saturating_add(1);

        let total = rms(filtered);
        let mut band = filtered.to_vec();
        self.voice_band.process_in_place(&mut band);
        let voiced = rms(&band);

        self.voice_energy_ratio = if total > 1e-8 {
            (voiced / total).min(1.0)
        } else {
            0.0
        };
        self.voice_detected = self.voice_energy_ratio > VOICE_RATIO_THRESHOLD
            && total > VOICE_RMS_FLOOR
            && self.is_calibrated();
    }
}

/// Quadratic soft knee around the threshold, make-up applied across the whole curve.
fn compress(sample: f32) -> f32 {
    let magnitude = sample.abs();
    let knee_start = COMP_THRESHOLD - COMP_KNEE / 2.0;
    let knee_end = COMP_THRESHOLD + COMP_KNEE / 2.0;

    let shaped = if magnitude <= knee_start {
        magnitude
    } else if magnitude < knee_end {
        let x = magnitude - knee_start;
        magnitude + (1.0 / COMP_RATIO - 1.0) * x * x / (2.0 * COMP_KNEE)
    } else {
        COMP_THRESHOLD + (magnitude - COMP_THRESHOLD) / COMP_RATIO
    };
    sample.signum() * shaped * COMP_MAKEUP
}

fn limit(sample: f32) -> f32 {
    sample.clamp(-LIMIT, LIMIT)
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
