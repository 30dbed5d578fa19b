//! Reply utterances and the playback queue between synthesizer and player.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::codec::samples_to_ms;
use crate::text::{DEFAULT_MOOD, is_only_emoji, process_sentence};

// Process-wide; never reused, never reset.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, AtomicOrdering::Relaxed)
}

/// One clause-sized unit of reply text plus its synthesized audio.
#[derive(Debug, Clone)]
pub struct Utterance {
    seq: u64,
    text: String,
    speech_text: String,
    moods: Vec<String>,

    /// 16 kHz mono PCM, once synthesized.
    pub audio: Option<Vec<i16>>,

    /// Include this utterance's audio in the persisted assistant turn.
    pub merge: bool,

    /// Failed synthesis attempts so far.
    pub retry_count: u32,

    /// Jumps ahead of not-yet-played utterances in the playback queue.
    pub is_retry: bool,

    pub created_at: Instant,
    pub synthesis_started: Option<Instant>,
    pub synthesis_finished: Option<Instant>,
}

impl Utterance {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let (speech_text, moods) = process_sentence(&text);
        Self {
            seq: next_seq(),
            text,
            speech_text,
            moods,
            audio: None,
            merge: true,
            retry_count: 0,
            is_retry: false,
            created_at: Instant::now(),
            synthesis_started: None,
            synthesis_finished: None,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Raw text as the model produced it (emoji included).
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text safe to hand to TTS: emoji and kaomoji removed.
    pub fn speech_text(&self) -> &str {
        &self.speech_text
    }

    pub fn moods(&self) -> &[String] {
        &self.moods
    }

    /// First mood carried by the text, or the default.
    pub fn mood(&self) -> &str {
        self.moods.first().map(String::as_str).unwrap_or(DEFAULT_MOOD)
    }

    pub fn is_only_emoji(&self) -> bool {
        is_only_emoji(&self.text, &self.moods)
    }

    /// Nothing to synthesize: emoji-only or empty once emoji are removed.
    pub fn is_speechless(&self) -> bool {
        self.is_only_emoji() || self.speech_text.trim().is_empty()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.as_ref().is_some_and(|a| !a.is_empty())
    }

    pub fn audio_duration_ms(&self) -> u64 {
        self.audio.as_ref().map_or(0, |a| samples_to_ms(a.len()))
    }

    pub fn synthesis_duration(&self) -> Option<Duration> {
        Some(
            self.synthesis_finished?
                .saturating_duration_since(self.synthesis_started?),
        )
    }

    /// Queue ordering key: retries first, then ascending sequence.
    pub fn queue_key(&self) -> (u8, u64) {
        (if self.is_retry { 0 } else { 1 }, self.seq)
    }
}

struct Keyed(Utterance);

impl PartialEq for Keyed {
    fn eq(&self, other: &Self) -> bool {
        self.0.queue_key() == other.0.queue_key()
    }
}

impl Eq for Keyed {}

impl PartialOrd for Keyed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Keyed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.queue_key().cmp(&other.0.queue_key())
    }
}

/// Priority queue of utterances awaiting playback, shared by one synthesizer/player pair.
#[derive(Default)]
pub struct PlaybackQueue {
    heap: Mutex<BinaryHeap<Reverse<Keyed>>>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, utterance: Utterance) {
        self.heap.lock().push(Reverse(Keyed(utterance)));
    }

    pub fn pop(&self) -> Option<Utterance> {
        self.heap.lock().pop().map(|Reverse(Keyed(u))| u)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Drop everything queued; returns how many utterances were discarded.
    pub fn clear(&self) -> usize {
        let mut heap = self.heap.lock();
        let n = heap.len();
        heap.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_strictly_increase() {
        let a = Utterance::new("一");
        let b = Utterance::new("二");
        assert!(b.seq() > a.seq());
    }

    #[test]
    fn emoji_only_text_is_speechless() {
        let u = Utterance::new("😊");
        assert!(u.is_only_emoji());
        assert!(u.is_speechless());
        assert_eq!(u.mood(), "happy");

        let plain = Utterance::new("你好呀，朋友");
        assert!(!plain.is_speechless());
        assert_eq!(plain.mood(), DEFAULT_MOOD);
    }

    #[test]
    fn queue_drains_by_sequence() {
        let one = Utterance::new("1");
        let two = Utterance::new("2");
        let three = Utterance::new("3");
        let seqs = [one.seq(), two.seq(), three.seq()];

        let q = PlaybackQueue::new();
        q.push(three);
        q.push(one);
        q.push(two);

        let drained: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|u| u.seq()).collect();
        assert_eq!(drained, seqs);
    }

    #[test]
    fn retry_jumps_ahead_of_later_sequences() {
        let q = PlaybackQueue::new();
        let mut two = Utterance::new("2");
        let four = Utterance::new("4");
        let five = Utterance::new("5");
        let (two_seq, four_seq, five_seq) = (two.seq(), four.seq(), five.seq());

        let mut six = Utterance::new("6");
        let six_seq = six.seq();

        q.push(four);
        q.push(five);
        two.is_retry = true;
        two.retry_count = 1;
        q.push(two);
        // A retried utterance outranks even earlier sequences that are not retries.
        six.is_retry = true;
        q.push(six);

        let drained: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|u| u.seq()).collect();
        assert_eq!(drained, vec![two_seq, six_seq, four_seq, five_seq]);
    }

    #[test]
    fn clear_reports_discarded() {
        let q = PlaybackQueue::new();
        q.push(Utterance::new("a"));
        q.push(Utterance::new("b"));
        assert_eq!(q.clear(), 2);
        assert!(q.is_empty());
    }
}
