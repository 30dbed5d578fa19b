//! Lightweight intent detection on recognized text, run before the LLM is consulted.

use regex::RegexSet;

use crate::Result;

/// Intents the orchestrator handles without the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIntent {
    /// The user wants to end the conversation.
    Exit,
}

pub trait IntentDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<UserIntent>;
}

/// Inputs longer than this (in chars) only match the full farewell patterns.
const MAX_KEYWORD_INPUT_CHARS: usize = 15;

// Questions and negations about leaving ("不要走", "怎么退出") are not farewells.
const EXCLUDE_PATTERNS: &[&str] = &[
    r"(不|别|不要|为什么|怎么|如何|能否|可以|会|什么).*(退出|离开|走|退下|结束)",
    r"(don't|not).*(leave|exit|quit|bye)",
];

const FAREWELL_PATTERNS: &[&str] = &[
    "拜拜",
    "再见",
    "退下",
    "走了",
    "结束对话",
    "退出",
    "告辞",
    "告退",
    "离开",
    "下线",
    r"bye\s*bye",
    "goodbye",
    r"see\s+you",
    r"see\s+ya",
];

const FAREWELL_KEYWORDS: &[&str] = &[
    "拜拜", "再见", "退下", "走了", "我走了", "我要走了", "结束对话", "退出", "下线", "结束",
    "告辞", "告退", "离开", "goodbye", "bye", "bye bye", "byebye", "see you", "see ya",
];

/// Keyword/pattern farewell detector.
///
/// Exclusions win over everything; farewell patterns match anywhere; bare keywords only count
/// in short inputs, where they are unlikely to be part of an unrelated sentence.
pub struct ExitKeywordDetector {
    exclude: RegexSet,
    farewell: RegexSet,
}

impl ExitKeywordDetector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            exclude: RegexSet::new(EXCLUDE_PATTERNS)?,
            farewell: RegexSet::new(FAREWELL_PATTERNS)?,
        })
    }

    pub fn is_exit(&self, text: &str) -> bool {
        let text = text.trim().to_lowercase();
        if text.is_empty() || self.exclude.is_match(&text) {
            return false;
        }
        if self.farewell.is_match(&text) {
            return true;
        }
        text.chars().count() <= MAX_KEYWORD_INPUT_CHARS
            && FAREWELL_KEYWORDS.iter().any(|k| text.contains(k))
    }
}

impl IntentDetector for ExitKeywordDetector {
    fn detect(&self, text: &str) -> Option<UserIntent> {
        self.is_exit(text).then_some(UserIntent::Exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn farewells_are_detected() -> anyhow::Result<()> {
        let d = ExitKeywordDetector::new()?;
        for text in ["拜拜", "好的再见", "你退下吧", "Goodbye!", "bye  bye", "See you tomorrow", "结束"] {
            assert_eq!(d.detect(text), Some(UserIntent::Exit), "{text}");
        }
        Ok(())
    }

    #[test]
    fn negations_and_questions_are_not_farewells() -> anyhow::Result<()> {
        let d = ExitKeywordDetector::new()?;
        for text in ["不要走", "怎么退出这个程序", "别离开我", "please don't leave", "为什么要结束"] {
            assert_eq!(d.detect(text), None, "{text}");
        }
        Ok(())
    }

    #[test]
    fn bare_keyword_only_counts_in_short_input() -> anyhow::Result<()> {
        let d = ExitKeywordDetector::new()?;
        assert!(d.is_exit("那就结束吧"));
        assert!(!d.is_exit("这部电影的结束部分让我印象非常深刻真的很好看"));
        assert!(!d.is_exit("今天天气怎么样"));
        assert!(!d.is_exit("   "));
        Ok(())
    }
}
