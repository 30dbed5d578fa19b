//! Paced transmission of synthesized utterances.
//!
//! The device has a tiny jitter buffer, so frames must arrive at (close to) real time:
//! frame `n` of a reply is sent at `base + n * FRAME_DURATION_MS`, with `base` set a couple
//! of frames in the past so the device starts playback with some audio already buffered.
//! When the schedule falls further behind wall clock than that pre-buffer (a slow
//! synthesis, a text-only pause), it is re-based to "now" rather than bursting frames.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::{AudioCodec, FRAME_DURATION_MS};
use crate::collaborators::Speaker;
use crate::config::PlaybackConfig;
use crate::messages::{ControlMessage, Outbound};
use crate::store::TurnRecorder;
use crate::synthesizer::{Synthesizer, TurnContext};
use crate::utterance::Utterance;

/// What one playback run did.
#[derive(Debug, Clone, Default)]
pub struct PlaybackReport {
    /// Ran to the natural end of the reply (not stopped, not aborted).
    pub completed: bool,
    pub utterances: usize,
    pub frames_sent: usize,
}

pub struct Player {
    ctx: TurnContext,
    config: PlaybackConfig,
    recorder: Option<TurnRecorder>,
    // Held while emitting, so nothing goes out once `stop()` has returned.
    playing: Mutex<bool>,
    stop: CancellationToken,
}

impl Player {
    pub fn new(ctx: TurnContext, config: PlaybackConfig, recorder: Option<TurnRecorder>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            recorder,
            playing: Mutex::new(true),
            stop: CancellationToken::new(),
        })
    }

    pub fn is_playing(&self) -> bool {
        *self.playing.lock()
    }

    /// Clear the queue and end the run. Never sends `tts:stop`; that is the caller's call.
    pub fn stop(&self) {
        *self.playing.lock() = false;
        self.stop.cancel();
        let dropped = self.ctx.queue.clear();
        if dropped > 0 {
            debug!(session_id = %self.ctx.session_id, dropped, "playback queue cleared");
        }
    }

    /// Play the reply produced by `synth` until it is exhausted or the player is stopped.
    pub async fn run(&self, synth: &Synthesizer) -> PlaybackReport {
        let mut report = PlaybackReport::default();
        let mut codec = match AudioCodec::new() {
            Ok(codec) => codec,
            Err(err) => {
                error!(session_id = %self.ctx.session_id, error = %err, "player codec init failed");
                return report;
            }
        };

        let frame = Duration::from_millis(FRAME_DURATION_MS);
        let prebuffer = frame * self.config.prebuffer_frames;
        let mut schedule = Schedule::new(Instant::now(), frame, prebuffer);
        let mut spoken = Vec::new();
        let mut merged: Vec<i16> = Vec::new();

        while self.is_playing() {
            let Some(utterance) = self.ctx.queue.pop() else {
                if !synth.is_dialog() || synth.is_aborted() {
                    // The synthesizer may have queued its last utterance after our pop.
                    if self.ctx.queue.is_empty() {
                        break;
                    }
                    continue;
                }
                if !self.pause(self.config.poll_interval()).await {
                    break;
                }
                continue;
            };

            if report.utterances > 0 {
                schedule.skip(self.config.sentence_gap_frames);
            }
            report.utterances += 1;
            self.announce(&utterance);

            match utterance.audio.as_deref() {
                Some(pcm) if !pcm.is_empty() => {
                    let packets = match codec.encode_stream(pcm, false) {
                        Ok(packets) => packets,
                        Err(err) => {
                            error!(seq = utterance.seq(), error = %err, "failed to encode utterance");
                            continue;
                        }
                    };

                    for packet in packets {
                        let target = schedule.next_slot(Instant::now());
                        tokio::select! {
                            _ = self.stop.cancelled() => break,
                            _ = sleep_until(target) => {}
                        }
                        if !self.emit(Outbound::Audio(packet)) {
                            break;
                        }
                        report.frames_sent += 1;
                    }

                    if utterance.merge {
                        merged.extend_from_slice(pcm);
                    }
                }
                _ => {
                    if !self.pause(self.config.text_only_pause()).await {
                        break;
                    }
                }
            }

            spoken.push(utterance.text().to_owned());
        }

        if !self.is_playing() || synth.is_aborted() {
            debug!(session_id = %self.ctx.session_id, frames = report.frames_sent, "playback stopped");
            return report;
        }

        if !self.pause(self.config.trailing_delay()).await {
            return report;
        }

        report.completed = true;
        info!(
            session_id = %self.ctx.session_id,
            utterances = report.utterances,
            frames = report.frames_sent,
            "playback finished"
        );

        if let Some(recorder) = &self.recorder {
            if !synth.is_rolled_back() && !spoken.is_empty() {
                recorder
                    .record(Speaker::Assistant, spoken.concat(), merged)
                    .await;
            }
        }
        report
    }

    fn announce(&self, utterance: &Utterance) {
        if !utterance.is_only_emoji() {
            self.emit(Outbound::Control(ControlMessage::sentence_start(
                utterance.text(),
            )));
        }
        self.emit(Outbound::Control(ControlMessage::emotion(utterance.mood())));
    }

    // `false` once stopped; the message is not sent then.
    fn emit(&self, message: Outbound) -> bool {
        let playing = self.playing.lock();
        if !*playing {
            return false;
        }
        if let Err(err) = self.ctx.outbound.send(message) {
            debug!(session_id = %self.ctx.session_id, error = %err, "outbound message dropped");
        }
        true
    }

    // `false` when interrupted by `stop()`.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}

/// Frame slot clock for one reply.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    base: Instant,
    position: u32,
    frame: Duration,
    prebuffer: Duration,
}

impl Schedule {
    fn new(now: Instant, frame: Duration, prebuffer: Duration) -> Self {
        Self {
            base: now.checked_sub(prebuffer).unwrap_or(now),
            position: 0,
            frame,
            prebuffer,
        }
    }

    fn skip(&mut self, frames: u32) {
        self.position += frames;
    }

    /// Send time of the next frame; advances the position.
    fn next_slot(&mut self, now: Instant) -> Instant {
        let mut target = self.base + self.frame * self.position;
        if target + self.prebuffer < now {
            self.base = now.checked_sub(self.frame * self.position).unwrap_or(now);
            target = now;
        }
        self.position += 1;
        target
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use anyhow::Context as _;

    use super::*;
    use crate::codec::FRAME_SAMPLES;
    use crate::collaborators::{OutboundSink, SpeechClip, TtsRequest, TtsService};
    use crate::error::TtsError;
    use crate::config::SynthesisConfig;
    use crate::messages::TtsState;
    use crate::store::MemoryTurnStore;
    use crate::utterance::PlaybackQueue;

    #[derive(Default)]
    struct Sink(Mutex<Vec<(Instant, Outbound)>>);

    impl OutboundSink for Sink {
        fn send(&self, message: Outbound) -> crate::Result<()> {
            self.0.lock().push((Instant::now(), message));
            Ok(())
        }

        fn close(&self) {}
    }

    struct NoTts;

    #[async_trait::async_trait]
    impl TtsService for NoTts {
        async fn synthesize(&self, _: TtsRequest) -> std::result::Result<SpeechClip, TtsError> {
            Err(TtsError::Provider("unused".to_owned()))
        }
    }

    fn pair(recorder: Option<TurnRecorder>) -> (Arc<Synthesizer>, Arc<Player>, Arc<Sink>) {
        let sink = Arc::new(Sink::default());
        let ctx = TurnContext {
            turn_id: 1,
            session_id: "s".to_owned(),
            current_turn: Arc::new(AtomicU64::new(1)),
            queue: Arc::new(PlaybackQueue::new()),
            outbound: sink.clone(),
        };
        let synth = Synthesizer::new(ctx.clone(), SynthesisConfig::default(), Arc::new(NoTts), None);
        let player = Player::new(ctx, PlaybackConfig::default(), recorder);
        (synth, player, sink)
    }

    fn with_audio(text: &str, frames: usize) -> Utterance {
        let mut u = Utterance::new(text);
        u.audio = Some(vec![500; FRAME_SAMPLES * frames]);
        u
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_paced_after_prebuffer() -> anyhow::Result<()> {
        let (synth, player, sink) = pair(None);
        synth.context().queue.push(with_audio("你好，今天怎么样？", 5));
        synth.set_last();

        let start = Instant::now();
        let report = player.run(&synth).await;
        assert!(report.completed);
        assert_eq!(report.frames_sent, 5);

        let sent = sink.0.lock();
        let audio_times: Vec<Duration> = sent
            .iter()
            .filter(|(_, m)| matches!(m, Outbound::Audio(_)))
            .map(|(at, _)| at.duration_since(start))
            .collect();
        // Slots inside the pre-buffer are due immediately, then one every 60 ms.
        let ms: Vec<u128> = audio_times.iter().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![0, 0, 0, 60, 120]);

        assert_eq!(
            sent[0].1,
            Outbound::Control(ControlMessage::sentence_start("你好，今天怎么样？"))
        );
        assert_eq!(sent[1].1, Outbound::Control(ControlMessage::emotion("happy")));
        assert!(!sent.iter().any(|(_, m)| matches!(
            m,
            Outbound::Control(ControlMessage::Tts { state: TtsState::Stop, .. })
        )));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn gap_separates_utterances() -> anyhow::Result<()> {
        let (synth, player, sink) = pair(None);
        synth.context().queue.push(with_audio("第一句话。", 2));
        synth.context().queue.push(with_audio("第二句话。", 1));
        synth.set_last();

        let start = Instant::now();
        player.run(&synth).await;

        let ms: Vec<u128> = sink
            .0
            .lock()
            .iter()
            .filter(|(_, m)| matches!(m, Outbound::Audio(_)))
            .map(|(at, _)| at.duration_since(start).as_millis())
            .collect();
        // Slots 0 and 1, then 5 skipped slots, then slot 7 (base is 120 ms in the past).
        assert_eq!(ms, vec![0, 0, 300]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn emoji_only_utterance_sends_emotion_and_pauses() -> anyhow::Result<()> {
        let (synth, player, sink) = pair(None);
        synth.context().queue.push(Utterance::new("😊"));
        synth.set_last();

        let start = Instant::now();
        let report = player.run(&synth).await;
        assert!(report.completed);
        // Text-only pause plus trailing delay.
        assert_eq!(start.elapsed(), Duration::from_millis(1000));

        let sent = sink.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Outbound::Control(ControlMessage::emotion("happy")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_run_without_completion() -> anyhow::Result<()> {
        let (synth, player, sink) = pair(None);
        synth.context().queue.push(with_audio("很长的一句话。", 50));
        synth.context().queue.push(with_audio("另一句。", 50));
        synth.set_last();

        let runner = {
            let player = Arc::clone(&player);
            let synth = Arc::clone(&synth);
            tokio::spawn(async move { player.run(&synth).await })
        };
        sleep(Duration::from_millis(200)).await;
        player.stop();
        let report = runner.await?;

        assert!(!report.completed);
        assert!(report.frames_sent < 50);
        assert!(synth.context().queue.is_empty());
        let audio = sink
            .0
            .lock()
            .iter()
            .filter(|(_, m)| matches!(m, Outbound::Audio(_)))
            .count();
        assert_eq!(audio, report.frames_sent);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn completed_reply_is_recorded_merged() -> anyhow::Result<()> {
        let store = Arc::new(MemoryTurnStore::new());
        let recorder = TurnRecorder::new(store.clone(), "dev", "role", "s");
        let (synth, player, _) = pair(Some(recorder));
        synth.context().queue.push(with_audio("第一句话。", 1));
        let mut skipped = with_audio("不要合并。", 1);
        skipped.merge = false;
        synth.context().queue.push(skipped);
        synth.set_last();

        player.run(&synth).await;

        let records = store.records();
        let record = records.first().context("assistant turn recorded")?;
        assert_eq!(record.speaker, Speaker::Assistant);
        assert_eq!(record.text, "第一句话。不要合并。");
        assert_eq!(record.pcm.len(), FRAME_SAMPLES);
        Ok(())
    }

    #[test]
    fn schedule_rebases_when_far_behind() {
        let now = Instant::now();
        let frame = Duration::from_millis(60);
        let mut s = Schedule::new(now, frame, frame * 2);
        assert_eq!(s.next_slot(now) + frame * 2, now);

        let late = now + Duration::from_secs(1);
        assert_eq!(s.next_slot(late), late);
        assert_eq!(s.next_slot(late), late + frame);
    }
}
