use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::classifier::{EnergyClassifier, SpeechClassifier, frame_probability};
use super::policy::VadPolicy;
use crate::codec::{AudioCodec, f32_to_pcm, pcm_to_f32, samples_to_ms};
use crate::enhancer::AudioEnhancer;
use crate::error::CodecError;

/// Smoothing factors for the running energy average.
const ENERGY_EMA_SILENT: f32 = 0.85;
const ENERGY_EMA_ACTIVE: f32 = 0.95;

/// Relaxed multipliers used while the detector is still calibrating.
const INITIAL_ENERGY_FACTOR: f32 = 0.3;
const INITIAL_SPEECH_FACTOR: f32 = 0.6;

/// One unit of inbound audio: decoded PCM plus the packet(s) it came from.
///
/// PCM fed directly (no codec) carries no packets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VadFrame {
    pub pcm: Vec<i16>,
    pub packets: Vec<Vec<u8>>,
}

impl VadFrame {
    fn append(&mut self, other: VadFrame) {
        self.pcm.extend_from_slice(&other.pcm);
        self.packets.extend(other.packets);
    }
}

/// A finished utterance, trailing silence trimmed.
#[derive(Debug, Clone, Default)]
pub struct SpeechSegment {
    pub pcm: Vec<i16>,
    pub packets: Vec<Vec<u8>>,
    /// Frames removed from the tail.
    pub trimmed_frames: usize,
}

impl SpeechSegment {
    pub fn duration_ms(&self) -> u64 {
        samples_to_ms(self.pcm.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadStatus {
    NoSpeech,
    SpeechStart,
    SpeechContinue,
    SpeechEnd,
    Error,
}

impl fmt::Display for VadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoSpeech => "NO_SPEECH",
            Self::SpeechStart => "SPEECH_START",
            Self::SpeechContinue => "SPEECH_CONTINUE",
            Self::SpeechEnd => "SPEECH_END",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Result of feeding one frame.
#[derive(Debug)]
pub enum VadOutcome {
    NoSpeech,
    /// Speech onset. Carries the pre-roll, oldest first, ending with the triggering frame.
    SpeechStart { pre_roll: Vec<VadFrame> },
    SpeechContinue { frame: VadFrame },
    SpeechEnd { segment: SpeechSegment },
    /// The frame could not be decoded; detector state is unchanged.
    Error(CodecError),
}

impl VadOutcome {
    pub fn status(&self) -> VadStatus {
        match self {
            Self::NoSpeech => VadStatus::NoSpeech,
            Self::SpeechStart { .. } => VadStatus::SpeechStart,
            Self::SpeechContinue { .. } => VadStatus::SpeechContinue,
            Self::SpeechEnd { .. } => VadStatus::SpeechEnd,
            Self::Error(_) => VadStatus::Error,
        }
    }
}

/// Per-session streaming voice activity detector.
///
/// Not `Sync`: the owning session feeds it from the frame path only.
pub struct VoiceActivityDetector {
    policy: VadPolicy,
    codec: AudioCodec,
    enhancer: Option<AudioEnhancer>,
    classifier: Box<dyn SpeechClassifier>,
    calibration: Calibration,
    state: VadState,
}

/// Connection-scoped: survives utterance boundaries.
#[derive(Default)]
struct Calibration {
    frames_classified: u32,
    average_energy: f32,
}

#[derive(Default)]
struct VadState {
    speaking: bool,
    consecutive_silence: u32,
    speech_run: u32,
    silence_started: Option<Instant>,
    /// Consecutive silent frames at the tail of `utterance`.
    trailing_silent_frames: usize,
    pre_roll: VecDeque<VadFrame>,
    pre_roll_samples: usize,
    utterance: Vec<VadFrame>,
    short_frames: Option<(VadFrame, Instant)>,
}

/// Per-frame measurements.
#[derive(Debug, Clone, Copy)]
struct Classification {
    energy: f32,
    probability: f32,
    is_speech: bool,
    is_silence: bool,
}

impl VoiceActivityDetector {
    /// Detector with the built-in [`EnergyClassifier`] and no enhancement.
    pub fn new(policy: VadPolicy) -> Result<Self, CodecError> {
        Self::with_classifier(policy, Box::new(EnergyClassifier::default()), false)
    }

    pub fn with_classifier(
        policy: VadPolicy,
        classifier: Box<dyn SpeechClassifier>,
        enhance: bool,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            policy,
            codec: AudioCodec::new()?,
            enhancer: enhance.then(AudioEnhancer::new),
            classifier,
            calibration: Calibration::default(),
            state: VadState::default(),
        })
    }

    pub fn policy(&self) -> &VadPolicy {
        &self.policy
    }

    pub fn is_speaking(&self) -> bool {
        self.state.speaking
    }

    pub fn average_energy(&self) -> f32 {
        self.calibration.average_energy
    }

    /// Decode one Opus packet and advance the state machine.
    pub fn process_frame(&mut self, packet: &[u8]) -> VadOutcome {
        self.process_frame_at(packet, Instant::now())
    }

    pub fn process_frame_at(&mut self, packet: &[u8], now: Instant) -> VadOutcome {
        match self.codec.decode_frame(packet) {
            Ok(pcm) => self.advance(
                VadFrame {
                    pcm,
                    packets: vec![packet.to_vec()],
                },
                now,
            ),
            Err(err) => {
                warn!(error = %err, bytes = packet.len(), "dropping undecodable frame");
                VadOutcome::Error(err)
            }
        }
    }

    /// Advance the state machine with already-decoded 16 kHz mono PCM.
    pub fn process_pcm(&mut self, pcm: &[i16]) -> VadOutcome {
        self.process_pcm_at(pcm, Instant::now())
    }

    pub fn process_pcm_at(&mut self, pcm: &[i16], now: Instant) -> VadOutcome {
        self.advance(
            VadFrame {
                pcm: pcm.to_vec(),
                packets: Vec::new(),
            },
            now,
        )
    }

    /// Start over as if freshly connected, calibration included.
    pub fn reset(&mut self) {
        self.calibration = Calibration::default();
        self.reset_utterance();
    }

    /// Drop per-utterance state, classifier memory and enhancer state.
    fn reset_utterance(&mut self) {
        self.state = VadState::default();
        self.classifier.reset();
        if let Some(enhancer) = self.enhancer.as_mut() {
            enhancer.reset();
        }
    }

    fn advance(&mut self, frame: VadFrame, now: Instant) -> VadOutcome {
        if frame.pcm.is_empty() {
            return VadOutcome::NoSpeech;
        }

        let Some(mut frame) = self.accumulate_short_frames(frame, now) else {
            return VadOutcome::NoSpeech;
        };

        let c = self.classify(&mut frame);
        self.update_hysteresis(&c, now);

        if !self.state.speaking {
            self.push_pre_roll(frame);

            if !c.is_speech {
                return VadOutcome::NoSpeech;
            }

            self.state.speaking = true;
            self.state.trailing_silent_frames = 0;
            self.state.silence_started = None;
            self.state.utterance.clear();

            let pre_roll: Vec<VadFrame> = self.state.pre_roll.drain(..).collect();
            self.state.pre_roll_samples = 0;
            self.state.utterance.extend(pre_roll.iter().cloned());

            debug!(
                energy = c.energy,
                probability = c.probability,
                voice_ratio = self.enhancer.as_ref().map(AudioEnhancer::voice_energy_ratio),
                voiced = self.enhancer.as_ref().map(AudioEnhancer::is_voice_detected),
                pre_roll_frames = pre_roll.len(),
                "speech start"
            );
            return VadOutcome::SpeechStart { pre_roll };
        }

        if c.is_silence {
            self.state.utterance.push(frame.clone());
            self.state.trailing_silent_frames += 1;

            let silent_for = self
                .state
                .silence_started
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default();

            if silent_for > Duration::from_millis(self.policy.silence_timeout_ms) {
                let silent_frames = self.state.consecutive_silence;
                let segment = self.finish_utterance(silent_for);
                debug!(
                    silence_ms = silent_for.as_millis() as u64,
                    silent_frames,
                    trimmed_frames = segment.trimmed_frames,
                    duration_ms = segment.duration_ms(),
                    "speech end"
                );
                return VadOutcome::SpeechEnd { segment };
            }

            return VadOutcome::SpeechContinue { frame };
        }

        self.state.utterance.push(frame.clone());
        self.state.trailing_silent_frames = 0;
        VadOutcome::SpeechContinue { frame }
    }

    /// While not speaking, frames shorter than the policy minimum are merged until they are
    /// long enough or the accumulation has waited too long.
    fn accumulate_short_frames(&mut self, frame: VadFrame, now: Instant) -> Option<VadFrame> {
        let min_samples = self.policy.min_frame_samples();
        if self.state.speaking
            || (self.state.short_frames.is_none() && frame.pcm.len() >= min_samples)
        {
            return Some(frame);
        }

        let (pending, started) = self.state.short_frames.get_or_insert_with(|| {
            (
                VadFrame {
                    pcm: Vec::with_capacity(min_samples),
                    packets: Vec::new(),
                },
                now,
            )
        });
        pending.append(frame);

        let waited = now.saturating_duration_since(*started);
        if pending.pcm.len() >= min_samples
            || waited > Duration::from_millis(self.policy.accumulate_timeout_ms)
        {
            return self.state.short_frames.take().map(|(frame, _)| frame);
        }
        None
    }

    /// Score a frame. With enhancement on, the frame's PCM is replaced by the enhanced
    /// signal so buffering and recognition see what was scored.
    fn classify(&mut self, frame: &mut VadFrame) -> Classification {
        let mut samples = pcm_to_f32(&frame.pcm);
        if let Some(enhancer) = self.enhancer.as_mut() {
            samples = enhancer.process(&samples);
            frame.pcm = f32_to_pcm(&samples);
        }

        let energy = samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len().max(1) as f32;
        let probability = frame_probability(self.classifier.as_mut(), &samples);

        let cal = &mut self.calibration;
        cal.frames_classified = cal.frames_classified.saturating_add(1);
        let calibrating = cal.frames_classified <= self.policy.initial_frames;

        let p = &self.policy;
        let (has_energy, is_speech) = if calibrating {
            let has_energy = energy > p.energy_threshold * INITIAL_ENERGY_FACTOR;
            (
                has_energy,
                probability > p.speech_threshold * INITIAL_SPEECH_FACTOR && has_energy,
            )
        } else {
            let has_energy = energy > p.energy_threshold;
            (has_energy, probability > p.speech_threshold && has_energy)
        };

        let is_silence = probability < p.silence_threshold
            || (probability < p.speech_threshold && !has_energy)
            || energy < p.energy_threshold;

        Classification {
            energy,
            probability,
            is_speech,
            is_silence,
        }
    }

    fn update_hysteresis(&mut self, c: &Classification, now: Instant) {
        let alpha = if c.is_silence {
            ENERGY_EMA_SILENT
        } else {
            ENERGY_EMA_ACTIVE
        };
        let cal = &mut self.calibration;
        cal.average_energy = cal.average_energy * alpha + c.energy * (1.0 - alpha);

        let s = &mut self.state;
        if c.is_silence {
            s.consecutive_silence += 1;
            s.speech_run = 0;
            s.silence_started.get_or_insert(now);
        } else {
            s.speech_run += 1;
            if s.speech_run >= self.policy.min_speech_run {
                s.consecutive_silence = 0;
                s.silence_started = None;
            }
        }
    }

    fn push_pre_roll(&mut self, frame: VadFrame) {
        let cap = self.policy.pre_roll_samples();
        let s = &mut self.state;
        s.pre_roll_samples += frame.pcm.len();
        s.pre_roll.push_back(frame);
        while s.pre_roll_samples > cap && s.pre_roll.len() > 1 {
            if let Some(old) = s.pre_roll.pop_front() {
                s.pre_roll_samples -= old.pcm.len();
            }
        }
    }

    fn finish_utterance(&mut self, silent_for: Duration) -> SpeechSegment {
        let mut frames = std::mem::take(&mut self.state.utterance);
        let remove = trailing_frames_to_trim(
            self.state.trailing_silent_frames,
            silent_for,
            Duration::from_millis(self.policy.tail_keep_ms as u64),
        )
        .min(frames.len());
        frames.truncate(frames.len() - remove);

        let mut segment = SpeechSegment {
            trimmed_frames: remove,
            ..SpeechSegment::default()
        };
        for frame in frames {
            segment.pcm.extend_from_slice(&frame.pcm);
            segment.packets.extend(frame.packets);
        }

        self.reset_utterance();
        segment
    }
}

/// Frames to drop from the tail: the share of the silent frames that corresponds to silence
/// beyond `tail_keep`, rounded up, never more than the silent frames themselves.
fn trailing_frames_to_trim(silent_frames: usize, silent_for: Duration, tail_keep: Duration) -> usize {
    if silent_frames == 0 || silent_for <= tail_keep {
        return 0;
    }
    let excess = (silent_for - tail_keep).as_secs_f64();
    let share = excess / silent_for.as_secs_f64();
    ((silent_frames as f64 * share).ceil() as usize).min(silent_frames)
}
