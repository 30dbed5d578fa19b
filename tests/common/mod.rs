#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;

use voxloop::codec::{AudioCodec, FRAME_SAMPLES};
use voxloop::collaborators::{
    AudioSource, ChatRequest, LlmChunk, LlmService, LlmStream, OutboundSink, SpeechClip,
    SttService, TtsRequest, TtsService, TurnStore,
};
use voxloop::intent::ExitKeywordDetector;
use voxloop::messages::{ControlMessage, Outbound, TtsState};
use voxloop::store::MemoryTurnStore;
use voxloop::{DialogueOrchestrator, EngineConfig, RoleBinding, Services, Session, TtsError};

pub const FRAME: Duration = Duration::from_millis(60);

/// Captures everything the engine sends to the device.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<Outbound>>,
    closed: AtomicBool,
}

impl OutboundSink for RecordingSink {
    fn send(&self, message: Outbound) -> voxloop::Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<Outbound> {
        self.messages.lock().clone()
    }

    pub fn controls(&self) -> Vec<ControlMessage> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Control(c) => Some(c),
                Outbound::Audio(_) => None,
            })
            .collect()
    }

    pub fn audio_frames(&self) -> usize {
        self.messages()
            .iter()
            .filter(|m| matches!(m, Outbound::Audio(_)))
            .count()
    }

    pub fn stops(&self) -> usize {
        self.controls().iter().filter(|c| c.is_tts_stop()).count()
    }

    /// Texts announced with `sentence_start`, in order.
    pub fn sentences(&self) -> Vec<String> {
        self.controls()
            .into_iter()
            .filter_map(|c| match c {
                ControlMessage::Tts {
                    state: TtsState::SentenceStart,
                    text,
                } => text,
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Answers recognitions from a script, after consuming the whole feed.
#[derive(Default)]
pub struct ScriptedStt {
    replies: Mutex<VecDeque<String>>,
    pub calls: AtomicUsize,
    pub samples: AtomicUsize,
}

impl ScriptedStt {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| (*r).to_owned()).collect()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SttService for ScriptedStt {
    async fn recognize(&self, audio: AudioSource) -> voxloop::Result<String> {
        let pcm = audio.collect().await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.samples.fetch_add(pcm.len(), Ordering::SeqCst);
        Ok(self.replies.lock().pop_front().unwrap_or_default())
    }
}

/// 300 ms of tone per request, at the device rate.
#[derive(Default)]
pub struct ToneTts {
    pub requests: Mutex<Vec<TtsRequest>>,
}

#[async_trait]
impl TtsService for ToneTts {
    async fn synthesize(&self, request: TtsRequest) -> Result<SpeechClip, TtsError> {
        self.requests.lock().push(request);
        Ok(SpeechClip::mono_16k(tone(FRAME_SAMPLES * 5)))
    }
}

/// What the language model does for one request.
pub enum LlmTurn {
    Reply(Vec<LlmChunk>),
    /// Emits the chunks, then never finishes.
    Stall(Vec<LlmChunk>),
    /// The request itself fails.
    Fail,
}

#[derive(Default)]
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<LlmTurn>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<LlmTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn chat_stream(&self, request: ChatRequest) -> voxloop::Result<LlmStream> {
        self.requests.lock().push(request);
        let turn = self.turns.lock().pop_front();
        match turn {
            Some(LlmTurn::Reply(chunks)) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
            Some(LlmTurn::Stall(chunks)) => Ok(stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Some(LlmTurn::Fail) | None => Err(voxloop::Error::Message("model unavailable".to_owned())),
        }
    }
}

pub fn text(reply: &str) -> LlmChunk {
    LlmChunk::Text(reply.to_owned())
}

pub struct Harness {
    pub orchestrator: Arc<DialogueOrchestrator>,
    pub stt: Arc<ScriptedStt>,
    pub tts: Arc<ToneTts>,
    pub llm: Arc<ScriptedLlm>,
    pub store: Arc<MemoryTurnStore>,
}

impl Harness {
    pub fn new(recognitions: &[&str], turns: Vec<LlmTurn>) -> anyhow::Result<Self> {
        Self::with_config(EngineConfig::default(), recognitions, turns)
    }

    pub fn with_config(
        config: EngineConfig,
        recognitions: &[&str],
        turns: Vec<LlmTurn>,
    ) -> anyhow::Result<Self> {
        let stt = Arc::new(ScriptedStt::new(recognitions));
        let tts = Arc::new(ToneTts::default());
        let llm = Arc::new(ScriptedLlm::new(turns));
        let store = Arc::new(MemoryTurnStore::new());
        let services = Services {
            stt: stt.clone(),
            tts: tts.clone(),
            llm: llm.clone(),
            intent: Arc::new(ExitKeywordDetector::new()?),
            store: Some(store.clone() as Arc<dyn TurnStore>),
        };
        Ok(Self {
            orchestrator: DialogueOrchestrator::new(config, services),
            stt,
            tts,
            llm,
            store,
        })
    }

    /// Open a session bound to role `1`.
    pub fn connect(&self, session_id: &str) -> anyhow::Result<(Arc<Session>, Arc<RecordingSink>)> {
        let sink = Arc::new(RecordingSink::default());
        let session = self
            .orchestrator
            .open_session(session_id, format!("dev-{session_id}"), sink.clone())?;
        self.orchestrator.bind_role(
            &session,
            RoleBinding {
                role_id: "1".to_owned(),
                voice: Some("xiaoyi".to_owned()),
                ..RoleBinding::default()
            },
        )?;
        Ok((session, sink))
    }

    /// Stream packets into a session at the device's real-time pace.
    pub async fn speak(&self, session: &Arc<Session>, packets: &[Vec<u8>]) {
        for packet in packets {
            self.orchestrator.on_audio(session, packet);
            tokio::time::sleep(FRAME).await;
        }
    }
}

pub fn tone(len: usize) -> Vec<i16> {
    (0..len)
        .map(|i| ((2.0 * std::f32::consts::PI * 220.0 * i as f32 / 16_000.0).sin() * 9_000.0) as i16)
        .collect()
}

/// Opus packets for `silent_before` silent frames, `speech` tone frames, `silent_after`
/// silent frames.
pub fn utterance_packets(
    silent_before: usize,
    speech: usize,
    silent_after: usize,
) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut codec = AudioCodec::new()?;
    let silence = vec![0i16; FRAME_SAMPLES];
    let voiced = tone(FRAME_SAMPLES);

    let mut packets = Vec::new();
    let frames = std::iter::repeat_n(&silence, silent_before)
        .chain(std::iter::repeat_n(&voiced, speech))
        .chain(std::iter::repeat_n(&silence, silent_after));
    for pcm in frames {
        packets.extend(codec.encode_stream(pcm, true)?);
    }
    Ok(packets)
}

/// Poll until `done` holds. Also yields real time, so blocking persistence can finish while
/// the paused clock is idle.
pub async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..2_000 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::thread::sleep(Duration::from_millis(1));
    }
    done()
}
