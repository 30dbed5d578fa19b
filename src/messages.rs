//! Typed device protocol messages.
//!
//! Control messages travel as JSON text (`{"type":"tts","state":"start"}`); audio travels as
//! raw Opus packets.

use serde::{Deserialize, Serialize};

/// Playback state reported to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

/// Control message sent to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Recognized user speech.
    Stt { text: String },

    Tts {
        state: TtsState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// Face animation cue. Carried as the protocol's `llm` message.
    #[serde(rename = "llm")]
    Emotion { emotion: String },
}

impl ControlMessage {
    pub fn stt(text: impl Into<String>) -> Self {
        Self::Stt { text: text.into() }
    }

    pub fn tts_start() -> Self {
        Self::Tts {
            state: TtsState::Start,
            text: None,
        }
    }

    pub fn sentence_start(text: impl Into<String>) -> Self {
        Self::Tts {
            state: TtsState::SentenceStart,
            text: Some(text.into()),
        }
    }

    pub fn tts_stop() -> Self {
        Self::Tts {
            state: TtsState::Stop,
            text: None,
        }
    }

    pub fn emotion(tag: impl Into<String>) -> Self {
        Self::Emotion {
            emotion: tag.into(),
        }
    }

    pub fn is_tts_stop(&self) -> bool {
        matches!(
            self,
            Self::Tts {
                state: TtsState::Stop,
                ..
            }
        )
    }
}

/// Everything the engine sends to a device, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Audio(Vec<u8>),
    Control(ControlMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    /// Wake word detected on the device.
    Detect,
    /// Typed text instead of speech.
    Text,
}

/// Control message received from a device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Listen {
        state: ListenState,
        #[serde(default)]
        text: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_use_wire_names() -> anyhow::Result<()> {
        assert_eq!(
            serde_json::to_string(&ControlMessage::tts_start())?,
            r#"{"type":"tts","state":"start"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlMessage::sentence_start("你好"))?,
            r#"{"type":"tts","state":"sentence_start","text":"你好"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlMessage::emotion("happy"))?,
            r#"{"type":"llm","emotion":"happy"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlMessage::stt("你好"))?,
            r#"{"type":"stt","text":"你好"}"#
        );
        Ok(())
    }

    #[test]
    fn inbound_parses_wake_word_and_abort() -> anyhow::Result<()> {
        let wake: Inbound = serde_json::from_str(r#"{"type":"listen","state":"detect","text":"小智"}"#)?;
        assert_eq!(
            wake,
            Inbound::Listen {
                state: ListenState::Detect,
                text: Some("小智".to_owned())
            }
        );

        let abort: Inbound = serde_json::from_str(r#"{"type":"abort"}"#)?;
        assert_eq!(abort, Inbound::Abort { reason: None });
        Ok(())
    }

    #[test]
    fn stop_is_recognized() {
        assert!(ControlMessage::tts_stop().is_tts_stop());
        assert!(!ControlMessage::tts_start().is_tts_stop());
    }
}
