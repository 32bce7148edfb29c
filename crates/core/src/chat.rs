//! Chat Session
//!
//! Composes the connection with the outbound pipeline and the conversation
//! transcript. This is what front-ends and the voice controller talk to when
//! they want to say something to the assistant.

use crate::{
    connection::{ConnectionManager, ConnectionStatus},
    message::{ChatMessage, Sender, ValidationError},
    pipeline::OutboundPipeline,
    transcript::Transcript,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Why a user message did not leave the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("not connected to the chat server")]
    NotConnected,
}

/// Destination for user utterances.
#[cfg_attr(test, mockall::automock)]
pub trait MessageSink: Send + Sync {
    fn send_user_text(&self, text: &str) -> Result<(), SendError>;
}

impl MessageSink for ConnectionManager {
    fn send_user_text(&self, text: &str) -> Result<(), SendError> {
        let message = ChatMessage::user(text)?;
        if self.send(&message) {
            Ok(())
        } else {
            Err(SendError::NotConnected)
        }
    }
}

pub struct ChatSession {
    connection: ConnectionManager,
    pipeline: OutboundPipeline,
    transcript: Arc<Mutex<Transcript>>,
}

impl ChatSession {
    /// Inbound assistant and system messages are recorded in the transcript
    /// as they arrive.
    pub fn new(connection: ConnectionManager, pipeline: OutboundPipeline) -> Self {
        let transcript = Arc::new(Mutex::new(Transcript::new()));
        let log = transcript.clone();
        connection.on_message(move |message| {
            if message.sender() != Sender::User {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(message.sender(), message.content());
            }
        });
        Self {
            connection,
            pipeline,
            transcript,
        }
    }

    /// Validates, transforms and sends `text`. The transcript keeps the text
    /// as the user entered it, not the transformed wire content.
    pub fn send_text(&self, text: &str) -> Result<ChatMessage, SendError> {
        let display = text.trim();
        if display.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let message = ChatMessage::user(self.pipeline.apply(display.to_string()))?;
        if !self.connection.send(&message) {
            warn!(status = ?self.connection.status(), "Message not sent.");
            return Err(SendError::NotConnected);
        }
        self.transcript().record(Sender::User, display);
        Ok(message)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn transcript(&self) -> MutexGuard<'_, Transcript> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageSink for ChatSession {
    fn send_user_text(&self, text: &str) -> Result<(), SendError> {
        self.send_text(text).map(|_| ())
    }
}
