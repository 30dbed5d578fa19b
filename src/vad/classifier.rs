use tracing::warn;

use crate::Result;

/// Samples per classifier window at 16 kHz.
pub const WINDOW_SAMPLES: usize = 512;

/// Hop between windows when a frame is longer than one window.
pub const WINDOW_STRIDE: usize = 256;

/// Scores fixed-size windows of normalized mono samples for speech.
///
/// Implementations may keep recurrent state across calls; [`SpeechClassifier::reset`] is
/// called at every utterance boundary.
pub trait SpeechClassifier: Send {
    /// Speech probability in `[0, 1]` for exactly [`WINDOW_SAMPLES`] samples.
    fn predict(&mut self, window: &[f32]) -> Result<f32>;

    fn reset(&mut self);
}

/// Score a whole frame.
///
/// - short frames are zero-padded to one window
/// - long frames are scanned with [`WINDOW_STRIDE`] and the highest score wins
/// - classifier failures count as "no speech" and leave the detector untouched
pub fn frame_probability(classifier: &mut dyn SpeechClassifier, samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    if samples.len() <= WINDOW_SAMPLES {
        let mut window = [0.0f32; WINDOW_SAMPLES];
        window[..samples.len()].copy_from_slice(samples);
        return score(classifier, &window);
    }

    let mut best = 0.0f32;
    let mut start = 0;
    loop {
        let end = start + WINDOW_SAMPLES;
        if end > samples.len() {
            // Cover the tail with one last full window aligned to the end.
            best = best.max(score(classifier, &samples[samples.len() - WINDOW_SAMPLES..]));
            break;
        }
        best = best.max(score(classifier, &samples[start..end]));
        if end == samples.len() {
            break;
        }
        start += WINDOW_STRIDE;
    }
    best
}

fn score(classifier: &mut dyn SpeechClassifier, window: &[f32]) -> f32 {
    match classifier.predict(window) {
        Ok(p) if p.is_finite() => p.clamp(0.0, 1.0),
        Ok(p) => {
            warn!(probability = p, "classifier returned a non-finite score");
            0.0
        }
        Err(err) => {
            warn!(error = %err, "speech classifier failed");
            0.0
        }
    }
}

/// Level + zero-crossing heuristic.
///
/// Maps window RMS (dBFS) through a logistic curve, then discounts windows whose
/// zero-crossing rate looks like broadband noise rather than voiced speech.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    /// RMS level (dBFS) that maps to probability 0.5.
    pub midpoint_db: f32,

    /// Logistic slope, in dB per unit of log-odds.
    pub slope_db: f32,

    /// Zero-crossing rate above which a window is treated as noise-like.
    pub noise_zcr: f32,
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self {
            midpoint_db: -45.0,
            slope_db: 4.0,
            noise_zcr: 0.4,
        }
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn predict(&mut self, window: &[f32]) -> Result<f32> {
        let rms = (window.iter().map(|s| s * s).sum::<f32>() / window.len().max(1) as f32).sqrt();
        let db = 20.0 * rms.max(1e-5).log10();
        let mut p = 1.0 / (1.0 + (-(db - self.midpoint_db) / self.slope_db).exp());

        if zero_crossing_rate(window) > self.noise_zcr {
            p *= 0.5;
        }
        Ok(p)
    }

    fn reset(&mut self) {}
}

fn zero_crossing_rate(window: &[f32]) -> f32 {
    if window.len() < 2 {
        return 0.0;
    }
    let crossings = window
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f32 / (window.len() - 1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn tone(len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / 16_000.0).sin() * amp)
            .collect()
    }

    #[test]
    fn energy_classifier_separates_tone_from_silence() -> anyhow::Result<()> {
        let mut c = EnergyClassifier::default();
        assert!(c.predict(&tone(WINDOW_SAMPLES, 0.3))? > 0.9);
        assert!(c.predict(&[0.0; WINDOW_SAMPLES])? < 0.01);
        Ok(())
    }

    #[test]
    fn alternating_noise_is_discounted() -> anyhow::Result<()> {
        let mut c = EnergyClassifier::default();
        let noise: Vec<f32> = (0..WINDOW_SAMPLES)
            .map(|i| if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        assert!(c.predict(&noise)? <= 0.5);
        Ok(())
    }

    struct Scripted {
        calls: usize,
        fail: bool,
    }

    impl SpeechClassifier for Scripted {
        fn predict(&mut self, window: &[f32]) -> Result<f32> {
            self.calls += 1;
            if self.fail {
                return Err(Error::msg("model unavailable"));
            }
            Ok(window.iter().cloned().fold(0.0, f32::max))
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn long_frames_take_the_best_window() {
        let mut c = Scripted {
            calls: 0,
            fail: false,
        };
        let mut frame = vec![0.0f32; 960];
        frame[900] = 0.8;
        let p = frame_probability(&mut c, &frame);
        assert!((p - 0.8).abs() < 1e-6);
        // 0..512, 256..768, then the end-aligned tail window.
        assert_eq!(c.calls, 3);
    }

    #[test]
    fn short_frames_are_padded_and_failures_score_zero() {
        let mut ok = Scripted {
            calls: 0,
            fail: false,
        };
        assert!((frame_probability(&mut ok, &[0.5; 100]) - 0.5).abs() < 1e-6);

        let mut failing = Scripted {
            calls: 0,
            fail: true,
        };
        assert_eq!(frame_probability(&mut failing, &[0.5; 100]), 0.0);
    }
}
