//! Chat Message Model
//!
//! Defines the unit of conversation exchanged with the backend and its JSON
//! wire format: one message per text frame,
//! `{ "type", "content", "sender", "timestamp"? }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a chat message, serialized as the wire `type` field.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    #[serde(rename = "message")]
    Text,
    #[serde(rename = "error")]
    Error,
}

/// Who authored a message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
    System,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => write!(f, "user"),
            Sender::Ai => write!(f, "ai"),
            Sender::System => write!(f, "system"),
        }
    }
}

/// Raised when a message violates the outbound preconditions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message content cannot be empty")]
    EmptyContent,
}

/// A single chat message. Immutable once constructed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    content: String,
    sender: Sender,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Builds a validated message stamped with the current time.
    pub fn new(
        kind: MessageKind,
        content: impl Into<String>,
        sender: Sender,
    ) -> Result<Self, ValidationError> {
        let message = Self {
            kind,
            content: content.into(),
            sender,
            timestamp: Utc::now(),
        };
        message.validate()?;
        Ok(message)
    }

    /// Builds an outbound text message from the user.
    pub fn user(content: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(MessageKind::Text, content, Sender::User)
    }

    /// Checks the preconditions every message must meet before transmission.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        Ok(())
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// True for an assistant reply that should be shown and spoken.
    pub fn is_ai_reply(&self) -> bool {
        self.kind == MessageKind::Text && self.sender == Sender::Ai
    }

    /// Serializes the message into a wire frame.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses an inbound wire frame. Content is not validated here; the
    /// server owns its payloads.
    pub fn from_wire(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
