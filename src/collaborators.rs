//! Narrow seams to the services the engine drives but does not implement.
//!
//! Speech recognition, speech synthesis and the language model are remote in production and
//! mocked in tests; the outbound transport and turn persistence are plain synchronous sinks
//! so they can be called from any worker without holding a lock across an await.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::Result;
use crate::conversation::ChatMessage;
use crate::error::TtsError;
use crate::messages::Outbound;

/// Live PCM feed for one recognition call. Ends when the matching [`AudioFeed`] is closed
/// or dropped.
pub struct AudioSource {
    rx: mpsc::UnboundedReceiver<Vec<i16>>,
}

impl AudioSource {
    /// Next chunk of 16 kHz mono PCM, or `None` once the utterance is complete.
    pub async fn next_chunk(&mut self) -> Option<Vec<i16>> {
        self.rx.recv().await
    }

    /// Wait for the whole utterance.
    pub async fn collect(mut self) -> Vec<i16> {
        let mut pcm = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            pcm.extend_from_slice(&chunk);
        }
        pcm
    }
}

/// Producer half of an [`AudioSource`], held by the frame path.
#[derive(Clone)]
pub struct AudioFeed {
    tx: mpsc::UnboundedSender<Vec<i16>>,
}

impl AudioFeed {
    /// Returns `false` if the recognizer already stopped listening.
    pub fn push(&self, pcm: Vec<i16>) -> bool {
        self.tx.send(pcm).is_ok()
    }
}

pub fn audio_channel() -> (AudioFeed, AudioSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AudioFeed { tx }, AudioSource { rx })
}

#[async_trait]
pub trait SttService: Send + Sync {
    /// Transcribe one utterance. Errors are treated as "nothing recognized".
    async fn recognize(&self, audio: AudioSource) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsRequest {
    pub text: String,
    /// Provider voice bound to the session's role.
    pub voice: Option<String>,
}

/// Synthesized speech as returned by a provider, before normalization to device format.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechClip {
    /// Interleaved 16-bit samples.
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SpeechClip {
    pub fn mono_16k(pcm: Vec<i16>) -> Self {
        Self {
            pcm,
            sample_rate: crate::codec::SAMPLE_RATE,
            channels: 1,
        }
    }
}

#[async_trait]
pub trait TtsService: Send + Sync {
    async fn synthesize(&self, request: TtsRequest) -> std::result::Result<SpeechClip, TtsError>;
}

/// One item of a streamed model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmChunk {
    Text(String),
    /// The model asks to forget the user message that triggered this reply.
    Rollback,
}

pub type LlmStream = BoxStream<'static, Result<LlmChunk>>;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub session_id: String,
    pub device_id: String,
    pub role_id: String,
    /// Full context: system prompt (if any) followed by the rolling window.
    pub messages: Vec<ChatMessage>,
    /// Whether the model may call tools (disabled for wake-word greetings).
    pub use_tools: bool,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn chat_stream(&self, request: ChatRequest) -> Result<LlmStream>;
}

/// Device-bound transport. Messages must be delivered in call order.
pub trait OutboundSink: Send + Sync {
    fn send(&self, message: Outbound) -> Result<()>;

    /// Close the connection after everything already sent.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

/// One persisted side of a dialogue turn.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub device_id: String,
    pub role_id: String,
    pub session_id: String,
    pub speaker: Speaker,
    pub text: String,
    /// 16 kHz mono PCM; empty when the turn had no audio.
    pub pcm: Vec<i16>,
    pub at: DateTime<Utc>,
}

/// Append-only turn persistence. Called from a blocking context.
pub trait TurnStore: Send + Sync {
    fn record(&self, record: TurnRecord) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn audio_source_ends_when_feed_dropped() {
        let (feed, source) = audio_channel();
        assert!(feed.push(vec![1, 2]));
        assert!(feed.push(vec![3]));
        drop(feed);
        assert_eq!(source.collect().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn push_fails_once_source_is_gone() {
        let (feed, source) = audio_channel();
        drop(source);
        assert!(!feed.push(vec![0]));
    }
}
