//! Rolling LLM context for one session.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Dialogue history bound to one (device, role, session).
///
/// The identity never changes; the message window is trimmed by whole user+assistant rounds
/// whenever the context is read, so the window may briefly hold one extra (user) message.
#[derive(Debug, Clone)]
pub struct Conversation {
    device_id: String,
    role_id: String,
    session_id: String,
    role_description: Option<String>,
    location: Option<String>,
    max_messages: usize,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new(
        device_id: impl Into<String>,
        role_id: impl Into<String>,
        session_id: impl Into<String>,
        max_messages: usize,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            role_id: role_id.into(),
            session_id: session_id.into(),
            role_description: None,
            location: None,
            max_messages,
            messages: Vec::new(),
        }
    }

    pub fn with_role_description(mut self, description: Option<String>) -> Self {
        self.role_description = description.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location.filter(|l| !l.trim().is_empty());
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn role_id(&self) -> &str {
        &self.role_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn add_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::new(MessageRole::User, text));
    }

    pub fn add_assistant(&mut self, text: impl Into<String>) {
        self.messages
            .push(ChatMessage::new(MessageRole::Assistant, text));
    }

    /// Forget the most recent message (the user message a rolled-back reply answered).
    pub fn rollback(&mut self) -> Option<ChatMessage> {
        self.messages.pop()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Context for the next LLM call: role system message (if any) followed by the window.
    pub fn context(&mut self) -> Vec<ChatMessage> {
        while self.messages.len() > self.max_messages + 1 && self.messages.len() >= 2 {
            self.messages.drain(..2);
        }

        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.extend(self.system_message());
        out.extend(self.messages.iter().cloned());
        out
    }

    fn system_message(&self) -> Option<ChatMessage> {
        let description = self.role_description.as_deref()?;

        let mut prompt = format!("角色描述：{description}\n");
        if let Some(location) = &self.location {
            prompt.push_str(&format!(
                "当前位置：{location}。如果用户提及现在在哪里，则以新地方为准。\n"
            ));
        }
        prompt.push_str(&format!(
            "当前时间：{}",
            Local::now().format("%Y-%m-%dT%H:%M:%S")
        ));
        Some(ChatMessage::new(MessageRole::System, prompt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn window_drops_whole_rounds_from_the_front() {
        let mut c = Conversation::new("dev", "role", "s1", 4);
        for i in 0..3 {
            c.add_user(format!("u{i}"));
            c.add_assistant(format!("a{i}"));
        }
        c.add_user("u3");

        let ctx = c.context();
        assert_eq!(contents(&ctx), vec!["u1", "a1", "u2", "a2", "u3"]);
    }

    #[test]
    fn system_prompt_leads_when_role_has_description() {
        let mut c = Conversation::new("dev", "role", "s1", 4)
            .with_role_description(Some("一个可爱的助手".to_owned()))
            .with_location(Some("上海".to_owned()));
        c.add_user("你好");

        let ctx = c.context();
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx[0].role, MessageRole::System);
        assert!(ctx[0].content.starts_with("角色描述：一个可爱的助手"));
        assert!(ctx[0].content.contains("当前位置：上海"));
        assert_eq!(ctx[1].role, MessageRole::User);
    }

    #[test]
    fn rollback_removes_latest_message() {
        let mut c = Conversation::new("dev", "role", "s1", 4)
            .with_role_description(Some("  ".to_owned()));
        c.add_user("第一句");
        c.add_user("打开灯");
        assert_eq!(c.rollback().map(|m| m.content), Some("打开灯".to_owned()));
        assert_eq!(contents(&c.context()), vec!["第一句"]);

        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.rollback(), None);
    }
}
