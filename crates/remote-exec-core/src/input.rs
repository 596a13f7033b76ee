//! Send input normalization.
//!
//! Callers may hand `send` plain text, one or many content blocks, one or
//! many messages, or an already-structured body. Everything is reduced to
//! [`CanonicalInput`] before it goes on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Type-specific fields (image source, tool ids, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContentBlock {
    /// A plain text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: Map::new(),
        }
    }
}

/// A role-tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// A user message with the given blocks.
    #[must_use]
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }

    /// A user message holding a single text block.
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }
}

/// The single shape every send body takes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalInput {
    pub messages: Vec<Message>,
    /// Additional top-level options, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Anything `send` accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum SendInput {
    Text(String),
    Block(ContentBlock),
    Blocks(Vec<ContentBlock>),
    Message(Message),
    Messages(Vec<Message>),
    Structured(CanonicalInput),
}

impl SendInput {
    /// Reduce to the canonical wire shape.
    #[must_use]
    pub fn normalize(self) -> CanonicalInput {
        let messages = match self {
            Self::Structured(input) => return input,
            Self::Text(text) => vec![Message::user_text(text)],
            Self::Block(block) => vec![Message::user(vec![block])],
            Self::Blocks(blocks) => vec![Message::user(blocks)],
            Self::Message(message) => vec![message],
            Self::Messages(messages) => messages,
        };
        CanonicalInput {
            messages,
            extra: Map::new(),
        }
    }
}

impl From<&str> for SendInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SendInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<ContentBlock> for SendInput {
    fn from(value: ContentBlock) -> Self {
        Self::Block(value)
    }
}

impl From<Vec<ContentBlock>> for SendInput {
    fn from(value: Vec<ContentBlock>) -> Self {
        Self::Blocks(value)
    }
}

impl From<Message> for SendInput {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<Vec<Message>> for SendInput {
    fn from(value: Vec<Message>) -> Self {
        Self::Messages(value)
    }
}

impl From<CanonicalInput> for SendInput {
    fn from(value: CanonicalInput) -> Self {
        Self::Structured(value)
    }
}
