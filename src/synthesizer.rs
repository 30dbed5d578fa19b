//! Text-to-speech producer for one reply.
//!
//! A [`Synthesizer`] has two halves:
//! - [`Synthesizer::consume`] drains the model's token stream through a
//!   [`SentenceSplitter`] into a pending text buffer;
//! - a worker task turns the pending buffer into [`Utterance`]s, synthesizes them and hands
//!   them to the paired player's [`PlaybackQueue`].
//!
//! The worker keeps at most one synthesized utterance waiting: it only takes new text once
//! the queue is empty, so everything that piles up meanwhile is merged into the next
//! utterance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{LlmChunk, LlmStream, OutboundSink, TtsRequest, TtsService};
use crate::config::SynthesisConfig;
use crate::error::TtsError;
use crate::messages::{ControlMessage, Outbound};
use crate::resample::ClipNormalizer;
use crate::text::{DEFAULT_MOOD, SentenceSplitter};
use crate::utterance::{PlaybackQueue, Utterance};

/// Identity and wiring shared by one synthesizer/player pair.
#[derive(Clone)]
pub struct TurnContext {
    pub turn_id: u64,
    pub session_id: String,
    /// The owning session's current turn id; `turn_id` is live only while they match.
    pub current_turn: Arc<AtomicU64>,
    pub queue: Arc<PlaybackQueue>,
    pub outbound: Arc<dyn OutboundSink>,
}

impl TurnContext {
    pub fn is_current(&self) -> bool {
        self.current_turn.load(Ordering::SeqCst) == self.turn_id
    }

    pub(crate) fn send_control(&self, message: ControlMessage) {
        if let Err(err) = self.outbound.send(Outbound::Control(message)) {
            debug!(session_id = %self.session_id, error = %err, "control message dropped");
        }
    }
}

/// How the model stream ended, for the conversation log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyOutcome {
    /// Everything the model said, unsplit.
    pub text: String,
    pub rolled_back: bool,
    /// The stream errored and the apology was queued instead.
    pub failed: bool,
    /// Consumption stopped by abort.
    pub cancelled: bool,
}

pub struct Synthesizer {
    ctx: TurnContext,
    config: SynthesisConfig,
    tts: Arc<dyn TtsService>,
    voice: Option<String>,
    cancel: CancellationToken,
    aborted: AtomicBool,
    last: AtomicBool,
    in_flight: AtomicBool,
    rolled_back: AtomicBool,
    pending: Mutex<String>,
}

impl Synthesizer {
    pub fn new(
        ctx: TurnContext,
        config: SynthesisConfig,
        tts: Arc<dyn TtsService>,
        voice: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            tts,
            voice,
            cancel: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            last: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
            pending: Mutex::new(String::new()),
        })
    }

    pub fn context(&self) -> &TurnContext {
        &self.ctx
    }

    /// Start the synthesis worker. It exits once the reply is complete or on abort.
    pub fn spawn_worker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_worker().await })
    }

    /// Drain a model stream into the pending buffer, then mark the reply complete.
    pub async fn consume(&self, mut stream: LlmStream) -> ReplyOutcome {
        let mut splitter = SentenceSplitter::new();
        let mut outcome = ReplyOutcome::default();

        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                item = stream.next() => item,
            };

            match item {
                Some(Ok(LlmChunk::Text(token))) => {
                    outcome.text.push_str(&token);
                    for sentence in splitter.push(&token) {
                        self.append(&sentence);
                    }
                }
                Some(Ok(LlmChunk::Rollback)) => {
                    debug!(session_id = %self.ctx.session_id, "reply asked for rollback");
                    outcome.rolled_back = true;
                    self.rolled_back.store(true, Ordering::SeqCst);
                }
                Some(Err(err)) => {
                    warn!(session_id = %self.ctx.session_id, error = %err, "llm stream failed");
                    outcome.failed = true;
                    self.append(&self.config.apology);
                    break;
                }
                None => {
                    if let Some(rest) = splitter.finish() {
                        self.append(&rest);
                    }
                    break;
                }
            }
        }

        self.set_last();
        outcome
    }

    /// Queue text for synthesis, bypassing the model.
    pub fn append(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.pending.lock().push_str(text);
    }

    /// No more text will arrive for this reply.
    pub fn set_last(&self) {
        self.last.store(true, Ordering::SeqCst);
    }

    /// Stop consuming and synthesizing. In-flight TTS results are discarded.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.pending.lock().clear();
    }

    /// Resolves once [`Synthesizer::abort`] has been called.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_last(&self) -> bool {
        self.last.load(Ordering::SeqCst)
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back.load(Ordering::SeqCst)
    }

    /// Whether this reply still has text to speak or may receive more.
    pub fn is_dialog(&self) -> bool {
        !self.is_last() || self.has_pending() || self.in_flight.load(Ordering::SeqCst)
    }

    fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    // Takes the whole pending buffer and marks it in flight in one step, so `is_dialog` never
    // observes a gap between the two.
    fn take_pending(&self) -> Option<InFlight<'_>> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return None;
        }
        self.in_flight.store(true, Ordering::SeqCst);
        Some(InFlight {
            flag: &self.in_flight,
            text: std::mem::take(&mut *pending),
        })
    }

    async fn run_worker(&self) {
        let mut normalizer = ClipNormalizer::new();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let next = if self.ctx.queue.is_empty() {
                self.take_pending()
            } else {
                None
            };

            match next {
                Some(in_flight) => {
                    let utterance = Utterance::new(in_flight.text.as_str());
                    if let Some(utterance) = self.synthesize(utterance, &mut normalizer).await {
                        self.ctx.queue.push(utterance);
                    }
                    drop(in_flight);
                }
                None => {
                    if self.is_last() && !self.has_pending() {
                        break;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }

        debug!(session_id = %self.ctx.session_id, turn_id = self.ctx.turn_id, "synthesis worker done");
    }

    /// Synthesize one utterance. `None` means it must not be played (aborted or superseded).
    async fn synthesize(
        &self,
        mut utterance: Utterance,
        normalizer: &mut ClipNormalizer,
    ) -> Option<Utterance> {
        if utterance.is_speechless() {
            debug!(seq = utterance.seq(), text = utterance.text(), "speechless utterance, skipping tts");
            return (!self.is_aborted()).then_some(utterance);
        }

        utterance.synthesis_started = Some(Instant::now());
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                r = self.synthesize_once(utterance.speech_text(), normalizer) => r,
            };

            match result {
                Ok(pcm) => {
                    utterance.audio = Some(pcm);
                    break;
                }
                Err(err) if utterance.retry_count < self.config.max_retries => {
                    utterance.retry_count += 1;
                    utterance.is_retry = true;
                    warn!(
                        session_id = %self.ctx.session_id,
                        seq = utterance.seq(),
                        attempt = utterance.retry_count,
                        error = %err,
                        "tts failed, retrying"
                    );
                    // Keeps the device animated while the retry runs.
                    self.ctx.send_control(ControlMessage::emotion(DEFAULT_MOOD));
                }
                Err(err) => {
                    warn!(
                        session_id = %self.ctx.session_id,
                        seq = utterance.seq(),
                        error = %err,
                        "tts retries exhausted, queueing without audio"
                    );
                    break;
                }
            }
        }
        utterance.synthesis_finished = Some(Instant::now());

        if self.is_aborted() || !self.ctx.is_current() {
            debug!(seq = utterance.seq(), "discarding utterance of a stale turn");
            return None;
        }

        info!(
            session_id = %self.ctx.session_id,
            seq = utterance.seq(),
            audio_ms = utterance.audio_duration_ms(),
            synth_ms = utterance.synthesis_duration().map_or(0, |d| d.as_millis() as u64),
            "utterance ready"
        );
        Some(utterance)
    }

    async fn synthesize_once(
        &self,
        text: &str,
        normalizer: &mut ClipNormalizer,
    ) -> std::result::Result<Vec<i16>, TtsError> {
        let request = TtsRequest {
            text: text.to_owned(),
            voice: self.voice.clone(),
        };

        let clip = timeout(self.config.tts_timeout(), self.tts.synthesize(request))
            .await
            .map_err(|_| TtsError::Timeout)??;

        let pcm = normalizer
            .normalize(&clip.pcm, clip.sample_rate, clip.channels)
            .map_err(|e| TtsError::Provider(e.to_string()))?;
        if pcm.is_empty() {
            return Err(TtsError::EmptyClip);
        }
        Ok(pcm)
    }
}

struct InFlight<'a> {
    flag: &'a AtomicBool,
    text: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use anyhow::Context as _;
    use async_trait::async_trait;
    use futures_util::stream;

    use super::*;
    use crate::collaborators::SpeechClip;

    #[derive(Default)]
    struct Sink(Mutex<Vec<Outbound>>);

    impl OutboundSink for Sink {
        fn send(&self, message: Outbound) -> crate::Result<()> {
            self.0.lock().push(message);
            Ok(())
        }

        fn close(&self) {}
    }

    struct Tts {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl TtsService for Tts {
        async fn synthesize(&self, request: TtsRequest) -> std::result::Result<SpeechClip, TtsError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(TtsError::Provider("boom".to_owned()));
            }
            Ok(SpeechClip::mono_16k(vec![100; 160 * request.text.chars().count()]))
        }
    }

    fn synth(fail_first: usize) -> (Arc<Synthesizer>, Arc<Tts>, Arc<Sink>) {
        let sink = Arc::new(Sink::default());
        let tts = Arc::new(Tts {
            calls: AtomicUsize::new(0),
            fail_first,
        });
        let ctx = TurnContext {
            turn_id: 7,
            session_id: "s".to_owned(),
            current_turn: Arc::new(AtomicU64::new(7)),
            queue: Arc::new(PlaybackQueue::new()),
            outbound: sink.clone(),
        };
        let s = Synthesizer::new(ctx, SynthesisConfig::default(), tts.clone(), None);
        (s, tts, sink)
    }

    fn text_stream(chunks: &[&str]) -> LlmStream {
        let items: Vec<crate::Result<LlmChunk>> = chunks
            .iter()
            .map(|c| Ok(LlmChunk::Text((*c).to_owned())))
            .collect();
        stream::iter(items).boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn stream_becomes_one_utterance() -> anyhow::Result<()> {
        let (s, tts, _) = synth(0);
        let worker = s.spawn_worker();

        let outcome = s.consume(text_stream(&["你好！", "有什么可以帮你的？"])).await;
        assert_eq!(outcome.text, "你好！有什么可以帮你的？");
        worker.await?;

        let queue = &s.context().queue;
        assert_eq!(queue.len(), 1);
        let u = queue.pop().context("utterance queued")?;
        assert_eq!(u.text(), "你好！有什么可以帮你的？");
        assert!(u.has_audio());
        assert_eq!(tts.calls.load(Ordering::SeqCst), 1);
        assert!(!s.is_dialog());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tts_retries_once_with_heartbeat() -> anyhow::Result<()> {
        let (s, tts, sink) = synth(1);
        let worker = s.spawn_worker();
        s.append("今天天气很好。");
        s.set_last();
        worker.await?;

        let u = s.context().queue.pop().context("utterance queued")?;
        assert!(u.has_audio());
        assert_eq!(u.retry_count, 1);
        assert!(u.is_retry);
        assert_eq!(tts.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            sink.0.lock().as_slice(),
            &[Outbound::Control(ControlMessage::emotion("happy"))]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_still_queue_the_text() -> anyhow::Result<()> {
        let (s, tts, _) = synth(usize::MAX);
        let worker = s.spawn_worker();
        s.append("今天天气很好。");
        s.set_last();
        worker.await?;

        let u = s.context().queue.pop().context("utterance queued")?;
        assert!(!u.has_audio());
        assert_eq!(tts.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_queues_apology() -> anyhow::Result<()> {
        let (s, _, _) = synth(0);
        let items: Vec<crate::Result<LlmChunk>> = vec![Err(crate::Error::msg("upstream closed"))];
        let outcome = s.consume(stream::iter(items).boxed()).await;
        assert!(outcome.failed);
        assert!(s.is_last());

        s.spawn_worker().await?;
        let u = s.context().queue.pop().context("apology queued")?;
        assert_eq!(u.text(), SynthesisConfig::default().apology);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn text_waits_while_an_utterance_is_queued() -> anyhow::Result<()> {
        let (s, tts, _) = synth(0);
        s.context().queue.push(Utterance::new("占位的句子。"));
        let worker = s.spawn_worker();

        s.append("第一句话说完了。");
        s.append("第二句话也说完了。");
        s.set_last();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tts.calls.load(Ordering::SeqCst), 0);
        assert!(s.is_dialog());

        s.context().queue.pop();
        worker.await?;
        let merged = s.context().queue.pop().context("merged utterance")?;
        assert_eq!(merged.text(), "第一句话说完了。第二句话也说完了。");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn emoji_only_text_skips_tts() -> anyhow::Result<()> {
        let (s, tts, _) = synth(0);
        s.append("😊");
        s.set_last();
        s.spawn_worker().await?;

        let u = s.context().queue.pop().context("emoji utterance queued")?;
        assert!(!u.has_audio());
        assert_eq!(tts.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_consumption_and_worker() -> anyhow::Result<()> {
        let (s, _, _) = synth(0);
        let worker = s.spawn_worker();
        s.abort();
        let outcome = s.consume(stream::pending::<crate::Result<LlmChunk>>().boxed()).await;
        assert!(outcome.cancelled);
        worker.await?;
        assert!(s.context().queue.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_turn_discards_audio() -> anyhow::Result<()> {
        let (s, _, _) = synth(0);
        s.context().current_turn.store(8, Ordering::SeqCst);
        s.append("这句话不会播放。");
        s.set_last();
        s.spawn_worker().await?;
        assert!(s.context().queue.is_empty());
        Ok(())
    }
}
