//! Per-device session state and the registry that owns it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::collaborators::{AudioFeed, OutboundSink};
use crate::conversation::Conversation;
use crate::messages::{ControlMessage, Outbound};
use crate::player::Player;
use crate::synthesizer::Synthesizer;
use crate::vad::{VadPolicy, VoiceActivityDetector};

/// What a device is bound to: the persona it talks to and how that persona sounds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleBinding {
    pub role_id: String,
    /// TTS voice name passed to the provider.
    #[serde(default)]
    pub voice: Option<String>,
    /// Persona description, sent as the system message.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Overrides the engine-wide VAD policy for this role.
    #[serde(default)]
    pub vad: Option<VadPolicy>,
}

/// Coarse dialogue phase, for logging and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueState {
    Idle,
    Listening,
    Recognizing,
    Thinking,
    Speaking,
}

/// A live synthesizer/player pair. Replaced as a whole, never mutated in place.
pub struct Pipeline {
    pub turn_id: u64,
    pub synthesizer: Arc<Synthesizer>,
    pub player: Arc<Player>,
}

impl Pipeline {
    /// Stop producing and playing. Sends nothing to the device.
    pub fn halt(&self) {
        self.synthesizer.abort();
        self.player.stop();
    }
}

pub struct Session {
    id: String,
    device_id: String,
    outbound: Arc<dyn OutboundSink>,
    created_at: Instant,
    role: RwLock<Option<RoleBinding>>,
    conversation: Mutex<Option<Conversation>>,
    vad: Mutex<VoiceActivityDetector>,
    stt_feed: Mutex<Option<AudioFeed>>,
    segment_tx: Mutex<Option<tokio::sync::oneshot::Sender<Vec<i16>>>>,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
    current_turn: Arc<AtomicU64>,
    wakeup_response: AtomicBool,
    close_after_reply: AtomicBool,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
    state: Mutex<DialogueState>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        outbound: Arc<dyn OutboundSink>,
        vad: VoiceActivityDetector,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            device_id: device_id.into(),
            outbound,
            created_at: now,
            role: RwLock::new(None),
            conversation: Mutex::new(None),
            vad: Mutex::new(vad),
            stt_feed: Mutex::new(None),
            segment_tx: Mutex::new(None),
            pipeline: Mutex::new(None),
            current_turn: Arc::new(AtomicU64::new(0)),
            wakeup_response: AtomicBool::new(false),
            close_after_reply: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(now),
            state: Mutex::new(DialogueState::Idle),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn outbound(&self) -> &Arc<dyn OutboundSink> {
        &self.outbound
    }

    /// Best-effort control message; a vanished transport is not an engine error.
    pub fn send_control(&self, message: ControlMessage) {
        if let Err(err) = self.outbound.send(Outbound::Control(message)) {
            debug!(session_id = %self.id, error = %err, "control message dropped");
        }
    }

    pub fn role(&self) -> Option<RoleBinding> {
        self.role.read().clone()
    }

    pub fn has_role(&self) -> bool {
        self.role.read().is_some()
    }

    /// Bind a role, replacing the conversation (and the detector, if the role brings its own).
    pub(crate) fn bind(
        &self,
        binding: RoleBinding,
        conversation: Conversation,
        vad: Option<VoiceActivityDetector>,
    ) {
        *self.conversation.lock() = Some(conversation);
        if let Some(vad) = vad {
            *self.vad.lock() = vad;
        }
        *self.role.write() = Some(binding);
    }

    pub fn with_conversation<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> Option<R> {
        self.conversation.lock().as_mut().map(f)
    }

    pub(crate) fn vad(&self) -> parking_lot::MutexGuard<'_, VoiceActivityDetector> {
        self.vad.lock()
    }

    pub(crate) fn open_stt_feed(
        &self,
        feed: AudioFeed,
        segment_tx: tokio::sync::oneshot::Sender<Vec<i16>>,
    ) {
        *self.stt_feed.lock() = Some(feed);
        *self.segment_tx.lock() = Some(segment_tx);
    }

    pub(crate) fn feed_stt(&self, pcm: Vec<i16>) {
        if let Some(feed) = self.stt_feed.lock().as_ref() {
            feed.push(pcm);
        }
    }

    /// End the recognizer's input. `segment` is the finished utterance, kept for persistence.
    pub(crate) fn finish_stt_feed(&self, segment: Option<Vec<i16>>) {
        self.stt_feed.lock().take();
        let tx = self.segment_tx.lock().take();
        if let (Some(tx), Some(segment)) = (tx, segment) {
            let _ = tx.send(segment);
        }
    }

    pub fn is_streaming_stt(&self) -> bool {
        self.stt_feed.lock().is_some()
    }

    pub fn current_turn(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current_turn)
    }

    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.lock().clone()
    }

    /// Install `pipeline` as the live pair; returns the one it replaced.
    pub(crate) fn replace_pipeline(&self, pipeline: Arc<Pipeline>) -> Option<Arc<Pipeline>> {
        let mut slot = self.pipeline.lock();
        self.current_turn.store(pipeline.turn_id, Ordering::SeqCst);
        slot.replace(pipeline)
    }

    /// Detach the live pair, if any.
    pub(crate) fn take_pipeline(&self) -> Option<Arc<Pipeline>> {
        let mut slot = self.pipeline.lock();
        self.current_turn.store(0, Ordering::SeqCst);
        slot.take()
    }

    /// Detach the live pair only if it is still `turn_id`.
    pub(crate) fn release_pipeline(&self, turn_id: u64) -> bool {
        let mut slot = self.pipeline.lock();
        if slot.as_ref().is_some_and(|p| p.turn_id == turn_id) {
            self.current_turn.store(0, Ordering::SeqCst);
            *slot = None;
            true
        } else {
            false
        }
    }

    /// A reply is still being produced or played.
    pub fn is_in_dialog(&self) -> bool {
        self.pipeline
            .lock()
            .as_ref()
            .is_some_and(|p| p.synthesizer.is_dialog() || p.player.is_playing())
    }

    pub fn is_wakeup_response(&self) -> bool {
        self.wakeup_response.load(Ordering::SeqCst)
    }

    pub fn set_wakeup_response(&self, on: bool) {
        self.wakeup_response.store(on, Ordering::SeqCst);
    }

    pub fn is_close_after_reply(&self) -> bool {
        self.close_after_reply.load(Ordering::SeqCst)
    }

    pub fn set_close_after_reply(&self, on: bool) {
        self.close_after_reply.store(on, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed; `true` only for the first caller.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn state(&self) -> DialogueState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: DialogueState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!(session_id = %self.id, from = ?*current, to = ?state, "dialogue state");
            *current = state;
        }
    }
}

/// All live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .insert(session.id().to_owned(), Arc::clone(&session));
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(session_id)
    }

    pub fn find_by_device(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.device_id() == device_id)
            .cloned()
    }

    /// Snapshot; the registry lock is not held while callers use the sessions.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::DEFAULT_VAD_POLICY;

    struct NullSink;

    impl OutboundSink for NullSink {
        fn send(&self, _: Outbound) -> crate::Result<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn session(id: &str) -> anyhow::Result<Session> {
        Ok(Session::new(
            id,
            format!("dev-{id}"),
            Arc::new(NullSink),
            VoiceActivityDetector::new(DEFAULT_VAD_POLICY)?,
        ))
    }

    #[test]
    fn registry_lookup_and_removal() -> anyhow::Result<()> {
        let registry = SessionRegistry::new();
        registry.insert(session("a")?);
        registry.insert(session("b")?);

        assert_eq!(registry.len(), 2);
        assert!(registry.find_by_device("dev-b").is_some());
        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert_eq!(registry.all().len(), 1);
        Ok(())
    }

    #[test]
    fn close_is_reported_once() -> anyhow::Result<()> {
        let s = session("a")?;
        assert!(s.mark_closed());
        assert!(!s.mark_closed());
        assert!(s.is_closed());
        Ok(())
    }

    #[test]
    fn binding_creates_conversation() -> anyhow::Result<()> {
        let s = session("a")?;
        assert!(!s.has_role());
        assert!(s.with_conversation(|c| c.len()).is_none());

        let binding = RoleBinding {
            role_id: "1".to_owned(),
            ..RoleBinding::default()
        };
        s.bind(binding, Conversation::new("dev-a", "1", "a", 8), None);
        assert!(s.has_role());
        assert_eq!(s.with_conversation(|c| c.role_id().to_owned()).as_deref(), Some("1"));
        Ok(())
    }
}
