use super::emoji::{contains_kaomoji, filter_kaomoji, is_emoji};

/// Minimum sentence length (chars) before any cut is allowed.
pub const MIN_SENTENCE_CHARS: usize = 5;

/// Non-punctuation, non-whitespace chars a fragment needs to be worth speaking.
const MIN_SUBSTANTIAL_CHARS: usize = 2;

const END_MARKS: &[char] = &['。', '！', '？', '!', '?', '.'];
const PAUSE_MARKS: &[char] = &['，', '、', '；', ',', ';'];

/// Incremental sentence slicer for streamed LLM text.
///
/// Feed tokens with [`SentenceSplitter::push`] as they arrive; completed sentences come back
/// immediately so synthesis can start before the reply is finished. Call
/// [`SentenceSplitter::finish`] at end of stream for the remainder.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    current: String,
    current_chars: usize,
    // A '.' right after a digit: cut or decimal point, decided by the next char.
    pending_dot: bool,
    last_char: Option<char>,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token; returns the sentences it completed, in order.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        let mut out = Vec::new();
        for c in token.chars() {
            if let Some(sentence) = self.push_char(c) {
                out.push(sentence);
            }
        }
        out
    }

    /// Flush whatever is buffered, regardless of length.
    pub fn finish(&mut self) -> Option<String> {
        let remainder = std::mem::take(&mut self.current);
        self.current_chars = 0;
        self.pending_dot = false;
        self.last_char = None;

        let trimmed = remainder.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    }

    pub fn is_empty(&self) -> bool {
        self.current.trim().is_empty()
    }

    fn push_char(&mut self, c: char) -> Option<String> {
        let mut emitted = None;

        if std::mem::take(&mut self.pending_dot) && !c.is_ascii_digit() {
            // The '.' was a full stop after all.
            emitted = self.try_cut();
        }

        self.current.push(c);
        self.current_chars += 1;
        let prev = self.last_char.replace(c);

        if c == '.' && prev.is_some_and(|p| p.is_ascii_digit()) {
            self.pending_dot = true;
            return emitted;
        }

        let is_end = END_MARKS.contains(&c) || c == '\n' || c == '\r';
        let is_soft = PAUSE_MARKS.contains(&c)
            || is_emoji(c)
            || (self.current_chars >= 3 && contains_kaomoji(&self.current));

        if (is_end || is_soft) && self.current_chars >= MIN_SENTENCE_CHARS {
            // A cut here can't coexist with one from the pending dot: that one cleared the buffer.
            if let Some(sentence) = self.try_cut() {
                return Some(sentence);
            }
        }
        emitted
    }

    fn try_cut(&mut self) -> Option<String> {
        if self.current_chars < MIN_SENTENCE_CHARS {
            return None;
        }

        let sentence = filter_kaomoji(self.current.trim());
        if !has_substantial_content(&sentence) {
            return None;
        }

        self.current.clear();
        self.current_chars = 0;
        Some(sentence)
    }
}

/// At least [`MIN_SENTENCE_CHARS`] chars, of which at least two are not punctuation or
/// whitespace.
pub fn has_substantial_content(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_SENTENCE_CHARS {
        return false;
    }
    trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && !is_punctuation(*c))
        .count()
        >= MIN_SUBSTANTIAL_CHARS
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c as u32,
            0x2010..=0x2027 // dashes, quotes, ellipsis
                | 0x2030..=0x205E
                | 0x3001..=0x3003 // 、。〃
                | 0x3008..=0x3011 // CJK brackets
                | 0x3014..=0x301F
                | 0xFF01..=0xFF0F // fullwidth ！＂＃…／
                | 0xFF1A..=0xFF20
                | 0xFF3B..=0xFF40
                | 0xFF5B..=0xFF65
        )
}
