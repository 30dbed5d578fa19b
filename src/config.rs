//! Engine-level configuration.
//!
//! Everything here is *library-level configuration*, not CLI flags. Frontends (the server
//! binary, tests, embedding services) build an [`EngineConfig`] programmatically or load it
//! from JSON, so that:
//! - every knob has a documented default (`DEFAULT_*` consts),
//! - partially specified JSON files fall back to those defaults field by field.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::Result;
use crate::vad::VadPolicy;

pub const DEFAULT_MAX_TTS_RETRIES: u32 = 1;
pub const DEFAULT_TTS_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SYNTH_POLL_MS: u64 = 60;
pub const DEFAULT_APOLOGY: &str = "抱歉，我在处理您的请求时遇到了问题。";

pub const DEFAULT_PREBUFFER_FRAMES: u32 = 2;
pub const DEFAULT_SENTENCE_GAP_FRAMES: u32 = 5;
pub const DEFAULT_TEXT_ONLY_PAUSE_MS: u64 = 500;
pub const DEFAULT_TRAILING_DELAY_MS: u64 = 500;
pub const DEFAULT_PLAYER_POLL_MS: u64 = 60;

pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_MESSAGES: usize = 16;

/// Top-level configuration for a [`crate::DialogueOrchestrator`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default VAD thresholds; a role binding may override them per device.
    pub vad: VadPolicy,
    pub enhancer: EnhancerConfig,
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Load a JSON config file. Missing sections and fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(raw).context("invalid engine config")?;
        cfg.vad.validate()?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    /// Run inbound PCM through the enhancement chain. Enhanced audio is what gets classified,
    /// buffered and recognized.
    ///
    /// Off by default: the thresholds in [`crate::vad::DEFAULT_VAD_POLICY`] are tuned for raw device audio.
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Immediate TTS retries per utterance before it is queued without audio.
    pub max_retries: u32,

    /// Upper bound on one TTS call; a timeout counts as a failed attempt.
    pub tts_timeout_ms: u64,

    /// Idle poll interval of the synthesis worker.
    pub poll_interval_ms: u64,

    /// Spoken in place of the reply when the LLM stream fails.
    pub apology: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_TTS_RETRIES,
            tts_timeout_ms: DEFAULT_TTS_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_SYNTH_POLL_MS,
            apology: DEFAULT_APOLOGY.to_owned(),
        }
    }
}

impl SynthesisConfig {
    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(self.tts_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Frames the schedule starts behind wall clock, so the device buffers ahead of jitter.
    pub prebuffer_frames: u32,

    /// Silent frame slots inserted between utterances.
    pub sentence_gap_frames: u32,

    /// Pause after an utterance that has no audio (start/emotion only).
    pub text_only_pause_ms: u64,

    /// Delay between the last frame and `tts:stop`.
    pub trailing_delay_ms: u64,

    /// Idle poll interval while waiting for the synthesizer.
    pub poll_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prebuffer_frames: DEFAULT_PREBUFFER_FRAMES,
            sentence_gap_frames: DEFAULT_SENTENCE_GAP_FRAMES,
            text_only_pause_ms: DEFAULT_TEXT_ONLY_PAUSE_MS,
            trailing_delay_ms: DEFAULT_TRAILING_DELAY_MS,
            poll_interval_ms: DEFAULT_PLAYER_POLL_MS,
        }
    }
}

impl PlaybackConfig {
    pub fn text_only_pause(&self) -> Duration {
        Duration::from_millis(self.text_only_pause_ms)
    }

    pub fn trailing_delay(&self) -> Duration {
        Duration::from_millis(self.trailing_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle for longer than this get the timeout farewell and are closed.
    pub inactivity_timeout_secs: u64,

    /// Rolling conversation window handed to the LLM (user + assistant messages).
    pub max_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}
