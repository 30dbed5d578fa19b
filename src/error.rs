use std::error::Error as StdError;

use thiserror::Error;

/// voxloop's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// voxloop's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream services aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Tts(#[from] TtsError),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Failures raised by the Opus transcoder.
///
/// A decode failure never poisons the session: the decoder is rebuilt before the error is
/// returned, so the next frame starts from a clean predictor.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty opus packet")]
    EmptyPacket,

    #[error("opus decode failed: {0}")]
    Decode(String),

    #[error("opus encode failed: {0}")]
    Encode(String),

    #[error("opus codec init failed: {0}")]
    Init(String),
}

/// Failures raised by a text-to-speech collaborator.
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("tts provider failed: {0}")]
    Provider(String),

    #[error("tts returned an empty clip")]
    EmptyClip,

    #[error("tts request timed out")]
    Timeout,
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<hound::Error> for Error {
    fn from(err: hound::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
