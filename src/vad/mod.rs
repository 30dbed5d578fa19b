//! Streaming Voice Activity Detection (VAD).
//!
//! Every inbound frame is decoded, optionally enhanced, scored by a [`SpeechClassifier`] and
//! combined with its energy. A small state machine with wall-clock hysteresis turns those
//! scores into utterance boundaries (`SPEECH_START` / `SPEECH_END`), keeping a pre-roll so the
//! first syllable isn't clipped.

mod classifier;
mod detector;
mod policy;
#[cfg(feature = "silero-onnx")]
mod silero;

pub use classifier::{
    EnergyClassifier, SpeechClassifier, WINDOW_SAMPLES, WINDOW_STRIDE, frame_probability,
};
pub use detector::{SpeechSegment, VadFrame, VadOutcome, VadStatus, VoiceActivityDetector};
pub use policy::{DEFAULT_VAD_POLICY, VadPolicy};
#[cfg(feature = "silero-onnx")]
pub use silero::SileroClassifier;
