//! Per-session dialogue state machine.
//!
//! Binds the frame path (decode, VAD) to recognition, intent detection, the language model
//! and the synthesizer/player pair, and owns the flows that cut across them: barge-in,
//! wake word, scripted farewells and the inactivity sweep.
//!
//! Every entry point returns quickly; anything that waits on a collaborator runs on its own
//! task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::collaborators::{
    AudioSource, ChatRequest, LlmService, OutboundSink, Speaker, SttService, TtsService,
    TurnStore, audio_channel,
};
use crate::config::EngineConfig;
use crate::conversation::Conversation;
use crate::intent::{IntentDetector, UserIntent};
use crate::messages::ControlMessage;
use crate::phrases;
use crate::player::{PlaybackReport, Player};
use crate::session::{DialogueState, Pipeline, RoleBinding, Session, SessionRegistry};
use crate::store::TurnRecorder;
use crate::synthesizer::{Synthesizer, TurnContext};
use crate::utterance::PlaybackQueue;
use crate::vad::{
    EnergyClassifier, SpeechClassifier, VadFrame, VadOutcome, VadPolicy, VoiceActivityDetector,
};

// 0 means "no pipeline" in a session's current-turn slot.
static NEXT_TURN_ID: AtomicU64 = AtomicU64::new(1);

/// Builds a fresh speech classifier for each session detector.
pub type ClassifierFactory = Arc<dyn Fn() -> Result<Box<dyn SpeechClassifier>> + Send + Sync>;

/// The collaborators a [`DialogueOrchestrator`] drives.
#[derive(Clone)]
pub struct Services {
    pub stt: Arc<dyn SttService>,
    pub tts: Arc<dyn TtsService>,
    pub llm: Arc<dyn LlmService>,
    pub intent: Arc<dyn IntentDetector>,
    /// Turn persistence; `None` disables recording.
    pub store: Option<Arc<dyn TurnStore>>,
}

pub struct DialogueOrchestrator {
    config: EngineConfig,
    services: Services,
    registry: SessionRegistry,
    classifier_factory: Option<ClassifierFactory>,
}

impl DialogueOrchestrator {
    pub fn new(config: EngineConfig, services: Services) -> Arc<Self> {
        Arc::new(Self {
            config,
            services,
            registry: SessionRegistry::new(),
            classifier_factory: None,
        })
    }

    /// Like [`DialogueOrchestrator::new`], with a custom classifier (e.g. Silero) per session.
    pub fn with_classifier_factory(
        config: EngineConfig,
        services: Services,
        factory: ClassifierFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            services,
            registry: SessionRegistry::new(),
            classifier_factory: Some(factory),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register a new device connection. A session with the same id is closed first.
    pub fn open_session(
        &self,
        session_id: impl Into<String>,
        device_id: impl Into<String>,
        outbound: Arc<dyn OutboundSink>,
    ) -> Result<Arc<Session>> {
        let session_id = session_id.into();
        if self.registry.get(&session_id).is_some() {
            self.close_session(&session_id);
        }

        let vad = self.build_detector(self.config.vad)?;
        let session = self
            .registry
            .insert(Session::new(session_id, device_id, outbound, vad));
        info!(session_id = %session.id(), device_id = %session.device_id(), "session opened");
        Ok(session)
    }

    /// Bind the device to a role. Until bound, audio is ignored.
    pub fn bind_role(&self, session: &Session, binding: RoleBinding) -> Result<()> {
        let vad = binding
            .vad
            .map(|policy| self.build_detector(policy))
            .transpose()?;
        let conversation = Conversation::new(
            session.device_id(),
            &binding.role_id,
            session.id(),
            self.config.session.max_messages,
        )
        .with_role_description(binding.description.clone())
        .with_location(binding.location.clone());

        info!(session_id = %session.id(), role_id = %binding.role_id, "role bound");
        session.bind(binding, conversation, vad);
        Ok(())
    }

    /// Tear a session down: stop its reply, drop recognition, close the transport.
    pub fn close_session(&self, session_id: &str) {
        let Some(session) = self.registry.remove(session_id) else {
            return;
        };
        if !session.mark_closed() {
            return;
        }

        if let Some(pipeline) = session.take_pipeline() {
            pipeline.halt();
        }
        session.finish_stt_feed(None);
        session.vad().reset();
        session.outbound().close();
        info!(session_id, "session closed");
    }

    /// Frame path: one inbound Opus packet.
    pub fn on_audio(self: &Arc<Self>, session: &Arc<Session>, packet: &[u8]) {
        if session.is_closed()
            || session.is_wakeup_response()
            || session.is_close_after_reply()
            || !session.has_role()
        {
            return;
        }

        let outcome = session.vad().process_frame(packet);
        if matches!(outcome, VadOutcome::Error(_)) {
            return;
        }
        session.touch();

        match outcome {
            VadOutcome::SpeechStart { pre_roll } => {
                let in_dialog = session
                    .pipeline()
                    .is_some_and(|p| p.synthesizer.is_dialog());
                if in_dialog {
                    self.on_abort(session, "speech detected");
                }
                self.start_recognition(session, pre_roll);
            }
            VadOutcome::SpeechContinue { frame } => session.feed_stt(frame.pcm),
            VadOutcome::SpeechEnd { segment } => {
                debug!(
                    session_id = %session.id(),
                    duration_ms = segment.duration_ms(),
                    trimmed_frames = segment.trimmed_frames,
                    "utterance captured"
                );
                session.set_state(DialogueState::Recognizing);
                session.finish_stt_feed(Some(segment.pcm));
            }
            VadOutcome::NoSpeech | VadOutcome::Error(_) => {}
        }
    }

    /// Typed input in place of speech.
    pub fn on_text(self: &Arc<Self>, session: &Arc<Session>, text: impl Into<String>) {
        let text = text.into();
        session.touch();
        let this = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move { this.handle_user_text(&session, text, Vec::new()).await });
    }

    /// The device heard its wake word; greet without tools and ignore audio until done.
    pub fn on_wake_word(self: &Arc<Self>, session: &Arc<Session>, text: impl Into<String>) {
        let text = text.into();
        let Some(role) = session.role() else {
            warn!(session_id = %session.id(), "wake word on unbound session");
            return;
        };
        info!(session_id = %session.id(), text = %text, "wake word");

        session.set_wakeup_response(true);
        session.touch();
        session.send_control(ControlMessage::stt(text.as_str()));
        self.record_user_turn(session, &role, text.clone(), Vec::new());
        session.with_conversation(|c| c.add_user(text));

        let this = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move { this.stream_reply(&session, &role, false).await });
    }

    /// Barge-in. Always tells the device to stop, even if nothing was playing.
    pub fn on_abort(&self, session: &Session, reason: &str) {
        info!(session_id = %session.id(), reason, "dialogue aborted");

        session.finish_stt_feed(None);
        if let Some(pipeline) = session.take_pipeline() {
            pipeline.halt();
        }
        session.set_wakeup_response(false);
        session.set_close_after_reply(false);
        session.set_state(DialogueState::Listening);
        session.send_control(ControlMessage::tts_stop());
    }

    /// Speak a farewell and close the session once it has played.
    pub fn send_goodbye(self: &Arc<Self>, session: &Arc<Session>) -> &'static str {
        let phrase = phrases::goodbye();
        self.speak_scripted(session, phrase, true);
        phrase
    }

    /// Speak a timeout notice and close the session once it has played.
    pub fn send_timeout_message(self: &Arc<Self>, session: &Arc<Session>) -> &'static str {
        let phrase = phrases::timeout();
        self.speak_scripted(session, phrase, true);
        phrase
    }

    /// Send the timeout flow to every idle session; returns the ids that got it.
    pub fn check_inactive_sessions(self: &Arc<Self>, now: Instant) -> Vec<String> {
        let timeout = self.config.session.inactivity_timeout();
        let mut timed_out = Vec::new();

        for session in self.registry.all() {
            if session.is_closed()
                || session.is_close_after_reply()
                || !session.has_role()
                || session.is_in_dialog()
                || session.is_streaming_stt()
            {
                continue;
            }

            let idle = now.saturating_duration_since(session.last_activity());
            if idle > timeout {
                info!(session_id = %session.id(), idle_secs = idle.as_secs(), "session inactive");
                self.send_timeout_message(&session);
                timed_out.push(session.id().to_owned());
            }
        }
        timed_out
    }

    /// Run [`DialogueOrchestrator::check_inactive_sessions`] every `every` until `shutdown`.
    pub fn spawn_inactivity_sweep(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.check_inactive_sessions(Instant::now());
                    }
                }
            }
        })
    }

    fn start_recognition(self: &Arc<Self>, session: &Arc<Session>, pre_roll: Vec<VadFrame>) {
        // A recognition still waiting on its feed is abandoned.
        session.finish_stt_feed(None);

        let (feed, source) = audio_channel();
        for frame in pre_roll {
            feed.push(frame.pcm);
        }
        let (segment_tx, segment_rx) = oneshot::channel();
        session.open_stt_feed(feed, segment_tx);
        session.set_state(DialogueState::Listening);

        let this = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move { this.recognize(&session, source, segment_rx).await });
    }

    async fn recognize(
        self: &Arc<Self>,
        session: &Arc<Session>,
        source: AudioSource,
        segment_rx: oneshot::Receiver<Vec<i16>>,
    ) {
        let text = match self.services.stt.recognize(source).await {
            Ok(text) => text.trim().to_owned(),
            Err(err) => {
                warn!(session_id = %session.id(), error = %err, "speech recognition failed");
                String::new()
            }
        };

        // Dropped sender: the feed was abandoned (abort or a newer utterance).
        let Ok(pcm) = segment_rx.await else {
            debug!(session_id = %session.id(), "recognition abandoned");
            return;
        };

        if text.is_empty() {
            debug!(session_id = %session.id(), "nothing recognized");
            session.set_state(DialogueState::Listening);
            return;
        }

        self.handle_user_text(session, text, pcm).await;
    }

    async fn handle_user_text(self: &Arc<Self>, session: &Arc<Session>, text: String, pcm: Vec<i16>) {
        let text = text.trim().to_owned();
        if text.is_empty() || session.is_closed() {
            return;
        }
        let Some(role) = session.role() else {
            warn!(session_id = %session.id(), "input on unbound session dropped");
            return;
        };
        info!(session_id = %session.id(), text = %text, "user said");

        session.send_control(ControlMessage::stt(text.as_str()));
        session.send_control(ControlMessage::tts_start());
        self.record_user_turn(session, &role, text.clone(), pcm);
        session.with_conversation(|c| c.add_user(text.as_str()));

        if self.services.intent.detect(&text) == Some(UserIntent::Exit) {
            info!(session_id = %session.id(), "exit intent");
            self.speak_scripted(session, phrases::goodbye(), false);
            return;
        }

        self.stream_reply(session, &role, true).await;
    }

    async fn stream_reply(self: &Arc<Self>, session: &Arc<Session>, role: &RoleBinding, use_tools: bool) {
        session.set_state(DialogueState::Thinking);
        let pipeline = self.start_pipeline(session, Some(role));
        let synthesizer = &pipeline.synthesizer;

        let Some(messages) = session.with_conversation(|c| c.context()) else {
            synthesizer.set_last();
            return;
        };
        let request = ChatRequest {
            session_id: session.id().to_owned(),
            device_id: session.device_id().to_owned(),
            role_id: role.role_id.clone(),
            messages,
            use_tools,
        };

        let stream = tokio::select! {
            biased;
            _ = synthesizer.cancelled() => return,
            opened = self.services.llm.chat_stream(request) => match opened {
                Ok(stream) => stream,
                Err(err) => futures_util::stream::once(async move { Err(err) }).boxed(),
            },
        };
        session.set_state(DialogueState::Speaking);

        let outcome = synthesizer.consume(stream).await;
        if outcome.cancelled || !synthesizer.context().is_current() {
            return;
        }

        session.with_conversation(|c| {
            if outcome.rolled_back {
                c.rollback();
            } else if !outcome.failed && !outcome.text.trim().is_empty() {
                c.add_assistant(outcome.text.trim());
            }
        });
    }

    // Scripted replies bypass the model: the text goes straight into a fresh synthesizer.
    fn speak_scripted(self: &Arc<Self>, session: &Arc<Session>, text: &str, send_start: bool) {
        info!(session_id = %session.id(), text, "scripted reply");
        session.set_close_after_reply(true);
        if send_start {
            session.send_control(ControlMessage::tts_start());
        }
        session.set_state(DialogueState::Speaking);

        let role = session.role();
        let pipeline = self.start_pipeline(session, role.as_ref());
        pipeline.synthesizer.append(text);
        pipeline.synthesizer.set_last();
    }

    /// Create a synthesizer/player pair, make it the session's live one and start it.
    fn start_pipeline(
        self: &Arc<Self>,
        session: &Arc<Session>,
        role: Option<&RoleBinding>,
    ) -> Arc<Pipeline> {
        let turn_id = NEXT_TURN_ID.fetch_add(1, Ordering::Relaxed);
        let ctx = TurnContext {
            turn_id,
            session_id: session.id().to_owned(),
            current_turn: session.current_turn(),
            queue: Arc::new(PlaybackQueue::new()),
            outbound: Arc::clone(session.outbound()),
        };

        let synthesizer = Synthesizer::new(
            ctx.clone(),
            self.config.synthesis.clone(),
            Arc::clone(&self.services.tts),
            role.and_then(|r| r.voice.clone()),
        );
        let player = Player::new(
            ctx,
            self.config.playback,
            role.and_then(|r| self.recorder(session, r)),
        );
        let pipeline = Arc::new(Pipeline {
            turn_id,
            synthesizer,
            player,
        });

        if let Some(previous) = session.replace_pipeline(Arc::clone(&pipeline)) {
            debug!(session_id = %session.id(), turn_id = previous.turn_id, "replacing live pipeline");
            previous.halt();
        }

        pipeline.synthesizer.spawn_worker();
        let supervisor = {
            let this = Arc::clone(self);
            let pipeline = Arc::clone(&pipeline);
            let session = Arc::clone(session);
            async move {
                let report = pipeline.player.run(&pipeline.synthesizer).await;
                this.finish_turn(&session, &pipeline, &report);
            }
        };
        tokio::spawn(supervisor);
        pipeline
    }

    // Natural end of a reply: only the still-live pipeline may tell the device to stop.
    fn finish_turn(&self, session: &Session, pipeline: &Pipeline, report: &PlaybackReport) {
        if !report.completed || !session.release_pipeline(pipeline.turn_id) {
            return;
        }

        session.send_control(ControlMessage::tts_stop());
        session.set_wakeup_response(false);
        session.set_state(DialogueState::Listening);
        session.touch();

        if session.is_close_after_reply() {
            info!(session_id = %session.id(), "closing after farewell");
            self.close_session(session.id());
        }
    }

    fn recorder(&self, session: &Session, role: &RoleBinding) -> Option<TurnRecorder> {
        let store = self.services.store.as_ref()?;
        Some(TurnRecorder::new(
            Arc::clone(store),
            session.device_id(),
            &role.role_id,
            session.id(),
        ))
    }

    fn record_user_turn(&self, session: &Session, role: &RoleBinding, text: String, pcm: Vec<i16>) {
        if let Some(recorder) = self.recorder(session, role) {
            tokio::spawn(async move { recorder.record(Speaker::User, text, pcm).await });
        }
    }

    fn build_detector(&self, policy: VadPolicy) -> Result<VoiceActivityDetector> {
        policy.validate()?;
        let classifier: Box<dyn SpeechClassifier> = match &self.classifier_factory {
            Some(factory) => factory()?,
            None => Box::new(EnergyClassifier::default()),
        };
        Ok(VoiceActivityDetector::with_classifier(
            policy,
            classifier,
            self.config.enhancer.enabled,
        )?)
    }
}
