//! Conversation history shared by the aggregator pair.
//!
//! The context is append-only. Readers take snapshots; only the aggregator
//! halves in [`aggregator`] append.

pub mod aggregator;

pub use aggregator::{AssistantAggregator, ContextAggregatorPair, UserAggregator};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(name)
    }
}

/// One structured piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Audio attached to a message, recorded by its shape only.
    Audio { sample_rate: u32, duration_ms: u64 },
}

/// Message body: plain text or a list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Concatenated text of the content, ignoring non-text parts.
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Audio { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// User turn carried by audio alone, before any transcript is known.
    pub fn user_audio(sample_rate: u32, duration: Duration) -> Self {
        Self {
            role: Role::User,
            content: Content::Parts(vec![ContentPart::Audio {
                sample_rate,
                duration_ms: duration.as_millis() as u64,
            }]),
        }
    }

    /// Whether the message carries audio and no text yet.
    pub fn is_untranscribed_audio(&self) -> bool {
        match &self.content {
            Content::Parts(parts) => {
                parts.iter().any(|p| matches!(p, ContentPart::Audio { .. }))
                    && !parts.iter().any(|p| matches!(p, ContentPart::Text { .. }))
            }
            Content::Text(_) => false,
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Ordered, append-only message history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// Shared reference to one conversation.
///
/// Cloning shares the same history. Appends are serialized by the lock and
/// only available inside the crate.
#[derive(Debug, Clone, Default)]
pub struct ContextHandle {
    inner: Arc<Mutex<ConversationContext>>,
}

impl ContextHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_context(context: ConversationContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationContext> {
        // Appends are single pushes, so a poisoned lock still holds a valid history.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the full history.
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn last(&self) -> Option<Message> {
        self.lock().last().cloned()
    }

    /// Serializes the history as a pretty-printed JSON transcript.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.lock())?)
    }

    pub(crate) fn append(&self, message: Message) {
        self.lock().push(message);
    }

    /// Adds a transcript to the most recent user message when that message
    /// is audio-only. Returns false when there is no such message.
    pub(crate) fn transcribe_last_user_audio(&self, text: &str) -> bool {
        let mut context = self.lock();
        let Some(message) = context
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::User)
        else {
            return false;
        };
        let Content::Parts(parts) = &mut message.content else {
            return false;
        };
        if !parts.iter().any(|p| matches!(p, ContentPart::Audio { .. })) {
            return false;
        }
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });
        true
    }

    pub(crate) fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        let mut context = self.lock();
        for message in messages {
            context.push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let message = Message::user("Hello");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.text(), "Hello");
        assert_eq!(Message::assistant("Hi").role, Role::Assistant);
        assert_eq!(Message::system("Be brief").role, Role::System);
    }

    #[test]
    fn test_parts_as_text_skips_audio() {
        let content = Content::Parts(vec![
            ContentPart::Text {
                text: "look".to_string(),
            },
            ContentPart::Audio {
                sample_rate: 16000,
                duration_ms: 400,
            },
            ContentPart::Text {
                text: "here".to_string(),
            },
        ]);
        assert_eq!(content.as_text(), "look here");
    }

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_string(&Message::user("Hello")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"Hello"}"#);

        let parsed: Message =
            serde_json::from_str(r#"{"role":"assistant","content":[{"type":"text","text":"Hi"}]}"#)
                .unwrap();
        assert_eq!(parsed.role, Role::Assistant);
        assert_eq!(parsed.text(), "Hi");
    }

    #[test]
    fn test_handle_appends_in_order() {
        let handle = ContextHandle::new();
        assert!(handle.is_empty());

        handle.append(Message::user("one"));
        handle.extend([Message::assistant("two"), Message::user("three")]);

        let texts: Vec<String> = handle.snapshot().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(handle.len(), 3);
        assert_eq!(handle.last(), Some(Message::user("three")));
    }

    #[test]
    fn test_clones_share_history() {
        let handle = ContextHandle::new();
        let other = handle.clone();
        handle.append(Message::user("shared"));
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_to_json_transcript() {
        let handle = ContextHandle::from_context(ConversationContext::with_messages(vec![
            Message::user("Hello"),
        ]));
        let json = handle.to_json().unwrap();
        assert!(json.contains("\"messages\""));
        assert!(json.contains("\"Hello\""));
    }

    #[test]
    fn test_transcript_attaches_to_audio_turn() {
        let handle = ContextHandle::new();
        handle.append(Message::user_audio(16000, Duration::from_millis(480)));
        handle.append(Message::assistant("I didn't catch that."));
        assert!(handle.snapshot()[0].is_untranscribed_audio());

        assert!(handle.transcribe_last_user_audio("do beagles shed?"));

        let messages = handle.snapshot();
        assert_eq!(messages.len(), 2);
        assert!(!messages[0].is_untranscribed_audio());
        assert_eq!(messages[0].text(), "do beagles shed?");
        assert_eq!(
            messages[0].content,
            Content::Parts(vec![
                ContentPart::Audio {
                    sample_rate: 16000,
                    duration_ms: 480,
                },
                ContentPart::Text {
                    text: "do beagles shed?".to_string(),
                },
            ])
        );
    }

    #[test]
    fn test_transcript_never_rewrites_text_turns() {
        let handle = ContextHandle::new();
        assert!(!handle.transcribe_last_user_audio("nothing to attach to"));

        handle.append(Message::user("typed"));
        assert!(!handle.transcribe_last_user_audio("late"));
        assert_eq!(handle.snapshot(), vec![Message::user("typed")]);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
