use crate::provider::{Message, Role, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub at: DateTime<Utc>,
    pub message: Message,
}

/// Per-thread message history kept by the text-protocol adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    entries: Vec<ConversationEntry>,
    /// System prompt (always sent first, never part of the searchable history)
    system_prompt: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(mut self, prompt: String) -> Self {
        self.system_prompt = Some(prompt);
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn push(&mut self, message: Message) {
        self.push_at(message, Utc::now());
    }

    pub fn push_at(&mut self, message: Message, at: DateTime<Utc>) {
        self.entries.push(ConversationEntry { at, message });
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The message list sent to the model: system prompt first, then history.
    pub fn messages(&self) -> Vec<Message> {
        self.system_prompt
            .iter()
            .map(|p| Message::system(p.clone()))
            .chain(self.entries.iter().map(|e| e.message.clone()))
            .collect()
    }

    /// Entries whose content contains `text` (case-insensitive) and whose
    /// timestamp falls inside `range`. Both filters are optional.
    pub fn search(&self, text: Option<&str>, range: Option<TimeRange>) -> Vec<&ConversationEntry> {
        let needle = text.map(str::to_lowercase);
        self.entries
            .iter()
            .filter(|e| range.map_or(true, |r| r.contains(e.at)))
            .filter(|e| {
                needle
                    .as_deref()
                    .map_or(true, |n| e.message.content.to_lowercase().contains(n))
            })
            .collect()
    }

    /// Render search hits one per line as `[timestamp] role: content`.
    pub fn render_search(&self, text: Option<&str>, range: Option<TimeRange>) -> String {
        let hits = self.search(text, range);
        if hits.is_empty() {
            return "No matching messages".to_string();
        }
        hits.iter()
            .map(|e| {
                format!(
                    "[{}] {}: {}",
                    e.at.to_rfc3339(),
                    role_label(e.message.role),
                    e.message.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}
