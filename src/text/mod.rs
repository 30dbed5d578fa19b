//! Reply text handling: streaming sentence slicing and emoji/kaomoji processing.

mod emoji;
mod splitter;

pub use emoji::{
    DEFAULT_MOOD, contains_kaomoji, filter_kaomoji, is_emoji, is_only_emoji, mood_for,
    process_sentence,
};
pub use splitter::{MIN_SENTENCE_CHARS, SentenceSplitter, has_substantial_content};
