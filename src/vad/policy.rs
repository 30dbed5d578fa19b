use serde::Deserialize;

use crate::codec::SAMPLE_RATE;
use crate::{Error, Result};

/// Policy knobs for the streaming speech/silence state machine.
///
/// Values are expressed in human-friendly units (ms, normalized amplitude) and converted to
/// sample counts at the device rate when the detector is built.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct VadPolicy {
    /// Probability above which a frame with enough energy counts as speech.
    pub speech_threshold: f32,

    /// Probability below which a frame always counts as silence.
    pub silence_threshold: f32,

    /// Mean absolute amplitude below which a frame counts as silence.
    pub energy_threshold: f32,

    /// Wall-clock silence needed to end an utterance.
    pub silence_timeout_ms: u64,

    /// Audio kept from before speech onset.
    pub pre_roll_ms: u32,

    /// Trailing silence kept at the end of an utterance.
    pub tail_keep_ms: u32,

    /// Frames classified with relaxed thresholds after connecting.
    pub initial_frames: u32,

    /// Consecutive non-silent frames needed to reset the silence clock.
    pub min_speech_run: u32,

    /// Frames shorter than this are accumulated before classification.
    pub min_frame_ms: u32,

    /// Give up waiting for more short frames after this long.
    pub accumulate_timeout_ms: u64,
}

/// Defaults tuned for raw 16 kHz device microphones.
pub const DEFAULT_VAD_POLICY: VadPolicy = VadPolicy {
    speech_threshold: 0.4,
    silence_threshold: 0.3,
    energy_threshold: 0.001,
    silence_timeout_ms: 800,
    pre_roll_ms: 500,
    tail_keep_ms: 300,
    initial_frames: 10,
    min_speech_run: 2,
    min_frame_ms: 30,
    accumulate_timeout_ms: 300,
};

impl Default for VadPolicy {
    fn default() -> Self {
        DEFAULT_VAD_POLICY
    }
}

impl VadPolicy {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("speech_threshold", self.speech_threshold),
            ("silence_threshold", self.silence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::msg(format!("{name} must be within [0, 1], got {value}")));
            }
        }

        if self.silence_threshold > self.speech_threshold {
            return Err(Error::msg(format!(
                "silence_threshold ({}) must not exceed speech_threshold ({})",
                self.silence_threshold, self.speech_threshold
            )));
        }

        if self.energy_threshold < 0.0 {
            return Err(Error::msg("energy_threshold must not be negative"));
        }

        if self.silence_timeout_ms == 0 {
            return Err(Error::msg("silence_timeout_ms must be positive"));
        }

        Ok(())
    }

    pub(crate) fn pre_roll_samples(&self) -> usize {
        ms_to_samples(self.pre_roll_ms)
    }

    pub(crate) fn min_frame_samples(&self) -> usize {
        ms_to_samples(self.min_frame_ms)
    }
}

/// Convert milliseconds to a sample count at the device rate, rounding to the nearest sample.
pub(crate) fn ms_to_samples(ms: u32) -> usize {
    ((ms as f32 / 1000.0) * SAMPLE_RATE as f32).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> anyhow::Result<()> {
        DEFAULT_VAD_POLICY.validate()?;
        assert_eq!(DEFAULT_VAD_POLICY.pre_roll_samples(), 8_000);
        assert_eq!(DEFAULT_VAD_POLICY.min_frame_samples(), 480);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let policy = VadPolicy {
            speech_threshold: 1.5,
            ..DEFAULT_VAD_POLICY
        };
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("speech_threshold"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let policy = VadPolicy {
            silence_timeout_ms: 0,
            ..DEFAULT_VAD_POLICY
        };
        assert!(policy.validate().is_err());
    }
}
