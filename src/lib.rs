//! `voxloop`: a real-time voice dialogue engine for always-connected devices.
//!
//! This crate provides:
//! - Opus transcoding and streaming voice activity detection
//! - Sentence slicing of streamed model replies and paced, interruptible playback
//! - A per-session dialogue orchestrator wiring recognition, the language model and
//!   speech synthesis together (behind narrow collaborator traits)
//!
//! The library owns the real-time audio path; transports and AI providers plug in from the
//! outside (see the `voxloop-server` binary for a WebSocket reference transport).

// High-level API (most consumers should start here).
pub mod orchestrator;
pub mod session;

// Configuration and errors.
pub mod config;
mod error;

// Audio path.
pub mod codec;
pub mod enhancer;
pub mod resample;
pub mod vad;

// Reply path.
pub mod player;
pub mod synthesizer;
pub mod text;
pub mod utterance;

// Dialogue context and scripted behavior.
pub mod conversation;
pub mod intent;
pub mod phrases;

// Seams to the outside world.
pub mod collaborators;
pub mod messages;
pub mod store;

// Logging configuration and control.
#[cfg(feature = "logging")]
pub mod logging;

pub use crate::config::EngineConfig;
pub use crate::error::{CodecError, Error, Result, TtsError};
pub use crate::orchestrator::{ClassifierFactory, DialogueOrchestrator, Services};
pub use crate::session::{RoleBinding, Session, SessionRegistry};
