//! Emoji and kaomoji handling for reply text.
//!
//! Emoji are never spoken: they are mapped to mood tags that drive the device's face
//! animation (`emotion` messages). Kaomoji are dropped entirely.

/// Mood sent when a sentence carries no recognizable emoji.
pub const DEFAULT_MOOD: &str = "happy";

const MOODS: &[(char, &str)] = &[
    ('😶', "neutral"),
    ('🙂', "happy"),
    ('😊', "happy"),
    ('😀', "happy"),
    ('😆', "laughing"),
    ('😂', "funny"),
    ('🤣', "funny"),
    ('😔', "sad"),
    ('😢', "crying"),
    ('😭', "crying"),
    ('😠', "angry"),
    ('😡', "angry"),
    ('😍', "loving"),
    ('🥰', "loving"),
    ('😳', "embarrassed"),
    ('😲', "surprised"),
    ('😮', "surprised"),
    ('😱', "shocked"),
    ('🤔', "thinking"),
    ('😉', "winking"),
    ('😎', "cool"),
    ('😌', "relaxed"),
    ('🤤', "delicious"),
    ('😋', "delicious"),
    ('😘', "kissy"),
    ('😏', "confident"),
    ('😴', "sleepy"),
    ('😜', "silly"),
    ('🙄', "confused"),
];

// Characters that make up kaomoji faces; a bracketed run of only these is treated as one.
const FACE_CHARS: &str = "＾^▽´`ω・◕‿≧≦°∀∇☆ﾟ●￣ε╯╰□︶＿_;；><＞＜･ｰДд〃♡♥✿*-~oOಠ益";

const BARE_KAOMOJI: &[&str] = &["^_^", ">_<", "-_-", "=_=", "^^"];

const MAX_KAOMOJI_INNER: usize = 12;

/// Whether `c` is a pictographic emoji (or one of its joiners/modifiers).
pub fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF   // pictographs, emoticons, transport, supplemental symbols
            | 0x2600..=0x27BF // misc symbols, dingbats
            | 0x2B00..=0x2BFF // arrows/stars used as emoji
            | 0xFE0F          // variation selector-16
            | 0x200D          // zero-width joiner
    )
}

/// Mood tag for one emoji, if it is one the device has an animation for.
pub fn mood_for(c: char) -> Option<&'static str> {
    MOODS.iter().find(|(e, _)| *e == c).map(|(_, mood)| *mood)
}

/// Split a sentence into its speakable text and the moods carried by its emoji.
///
/// Speech text has emoji and kaomoji removed and is trimmed. Moods keep emoji order; emoji
/// without a known mood are dropped silently.
pub fn process_sentence(text: &str) -> (String, Vec<String>) {
    let mut moods = Vec::new();
    let mut speech = String::with_capacity(text.len());

    for c in text.chars() {
        if is_emoji(c) {
            if let Some(mood) = mood_for(c) {
                moods.push(mood.to_owned());
            }
            continue;
        }
        speech.push(c);
    }

    (filter_kaomoji(&speech).trim().to_owned(), moods)
}

/// Remove bracketed kaomoji like `(^▽^)` or `（╯°□°）` and a few bare ones like `^_^`.
pub fn filter_kaomoji(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        if let Some(len) = kaomoji_at(&chars[i..]) {
            i += len;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }

    for bare in BARE_KAOMOJI {
        if out.contains(bare) {
            out = out.replace(bare, "");
        }
    }
    out
}

/// Whether `text` contains at least one kaomoji.
pub fn contains_kaomoji(text: &str) -> bool {
    let chars: Vec<char> = text.chars().collect();
    (0..chars.len()).any(|i| kaomoji_at(&chars[i..]).is_some())
        || BARE_KAOMOJI.iter().any(|k| text.contains(k))
}

/// Length in chars of a bracketed kaomoji starting at `chars[0]`.
fn kaomoji_at(chars: &[char]) -> Option<usize> {
    let close = match chars.first()? {
        '(' => ')',
        '（' => '）',
        _ => return None,
    };

    let close_at = 1 + chars
        .iter()
        .skip(1)
        .take(MAX_KAOMOJI_INNER + 1)
        .position(|c| *c == close || *c == ')' || *c == '）')?;
    let inner = &chars[1..close_at];

    let is_face = inner
        .iter()
        .all(|c| c.is_whitespace() || FACE_CHARS.contains(*c));
    let has_symbol = inner.iter().any(|c| !c.is_whitespace());
    (is_face && has_symbol).then_some(close_at + 1)
}

/// `true` when the text is nothing but emoji (plus a little whitespace).
pub fn is_only_emoji(text: &str, moods: &[String]) -> bool {
    !moods.is_empty() && text.trim().chars().count() <= 4
}
