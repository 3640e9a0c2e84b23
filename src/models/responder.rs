use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::models::surface::TargetHints;

/// Maximum number of prior messages a responder carries as context.
pub const HISTORY_LIMIT: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}

impl HistoryMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// Trailing window of exchanged messages, oldest discarded first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<HistoryMessage>", into = "Vec<HistoryMessage>")]
pub struct MessageWindow {
    messages: VecDeque<HistoryMessage>,
}

impl MessageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: HistoryMessage) {
        self.messages.push_back(message);
        while self.messages.len() > HISTORY_LIMIT {
            self.messages.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryMessage> {
        self.messages.iter()
    }

    /// The last `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<&HistoryMessage> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).collect()
    }
}

impl From<Vec<HistoryMessage>> for MessageWindow {
    fn from(messages: Vec<HistoryMessage>) -> Self {
        let mut window = MessageWindow::new();
        for message in messages {
            window.push(message);
        }
        window
    }
}

impl From<MessageWindow> for Vec<HistoryMessage> {
    fn from(window: MessageWindow) -> Self {
        window.messages.into_iter().collect()
    }
}

/// One addressable participant, as snapshotted from the caller's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Responder {
    pub instance_id: String,
    pub kind: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub history: MessageWindow,
    /// Automation selectors taken from the responder catalog.
    #[serde(default)]
    pub target: Option<TargetHints>,
}

impl Responder {
    pub fn new(instance_id: impl Into<String>, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            instance_id: instance_id.into(),
            display_name: kind.clone(),
            kind,
            history: MessageWindow::new(),
            target: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_target(mut self, target: TargetHints) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_history(mut self, history: MessageWindow) -> Self {
        self.history = history;
        self
    }

    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.kind
        } else {
            &self.display_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_discards_oldest() {
        let mut window = MessageWindow::new();
        for i in 0..(HISTORY_LIMIT + 5) {
            window.push(HistoryMessage::new(MessageRole::User, format!("m{i}")));
        }
        assert_eq!(window.len(), HISTORY_LIMIT);
        assert_eq!(window.iter().next().map(|m| m.content.as_str()), Some("m5"));

        let recent = window.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].content, format!("m{}", HISTORY_LIMIT + 4));
    }

    #[test]
    fn test_window_deserializes_capped() {
        let messages: Vec<serde_json::Value> = (0..45)
            .map(|i| serde_json::json!({"role": "assistant", "content": i.to_string(), "created_at": ""}))
            .collect();
        let responder: Responder = serde_json::from_value(serde_json::json!({
            "instanceId": "slot-1",
            "kind": "gemini",
            "history": messages,
        }))
        .expect("should deserialize");

        assert_eq!(responder.history.len(), HISTORY_LIMIT);
        assert_eq!(responder.display_name(), "gemini");
    }
}
