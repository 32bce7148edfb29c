//! Speech input capability.
//!
//! Two interchangeable providers sit behind [`SpeechInput`]: continuous
//! on-device recognition ([`RecognitionInput`]) and record-then-transcribe
//! ([`RecordingInput`](super::RecordingInput)). Both receive raw engine
//! events and classify them into [`InputSignal`]s for the controller.

use super::VoiceError;
use crate::transcribe::{Recording, TranscribeError};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Raw events posted by recognition engines and capture devices.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    RecognitionStarted,
    SpeechStarted,
    Recognized(String),
    RecognitionEnded,
    RecognitionFailed(RecognitionError),
    /// Microphone level reading in dBFS.
    Level(f32),
    Chunk(Bytes),
    /// The capture device stopped and produced its final recording.
    CaptureStopped(Recording),
    CaptureFailed(String),
    /// Outcome of uploading the recording of capture turn `turn`.
    Transcribed {
        turn: u64,
        result: Result<String, TranscribeError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionError {
    #[error("no speech detected")]
    NoSpeech,
    #[error("recognition aborted")]
    Aborted,
    #[error("microphone access denied")]
    NotAllowed,
    #[error("{0}")]
    Other(String),
}

/// Classified input outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSignal {
    SpeechDetected,
    Recognized(String),
    /// Capture ended and the turn is being transcribed remotely.
    Uploading,
    /// The engine finished a session on its own.
    Ended,
    /// A recoverable hiccup; capture should simply continue.
    Transient(String),
    Failed(VoiceError),
}

pub trait SpeechInput: Send {
    fn is_available(&self) -> bool;
    fn start(&mut self) -> Result<(), VoiceError>;
    /// Stops capture and abandons any turn still in progress.
    fn stop(&mut self);
    fn handle(&mut self, event: InputEvent, now: Instant) -> Option<InputSignal>;
}

/// A continuous speech recognition engine. Results arrive as
/// [`InputEvent`]s posted by the engine itself.
#[cfg_attr(test, mockall::automock)]
pub trait Recognizer: Send {
    fn is_available(&self) -> bool;
    fn start(&mut self) -> Result<(), RecognitionError>;
    fn stop(&mut self);
}

pub struct RecognitionInput {
    recognizer: Box<dyn Recognizer>,
    listening: bool,
}

impl RecognitionInput {
    pub fn new(recognizer: Box<dyn Recognizer>) -> Self {
        Self {
            recognizer,
            listening: false,
        }
    }
}

impl SpeechInput for RecognitionInput {
    fn is_available(&self) -> bool {
        self.recognizer.is_available()
    }

    fn start(&mut self) -> Result<(), VoiceError> {
        if self.listening {
            return Ok(());
        }
        if !self.recognizer.is_available() {
            return Err(VoiceError::CapabilityMissing);
        }
        self.recognizer
            .start()
            .map_err(|e| VoiceError::Recognition(e.to_string()))?;
        self.listening = true;
        Ok(())
    }

    fn stop(&mut self) {
        if self.listening {
            self.listening = false;
            self.recognizer.stop();
        }
    }

    fn handle(&mut self, event: InputEvent, _now: Instant) -> Option<InputSignal> {
        match event {
            InputEvent::RecognitionStarted => {
                debug!("Recognition started.");
                None
            }
            InputEvent::SpeechStarted => self.listening.then_some(InputSignal::SpeechDetected),
            InputEvent::Recognized(text) => Some(InputSignal::Recognized(text)),
            // An end we asked for ourselves is not news.
            InputEvent::RecognitionEnded => {
                std::mem::take(&mut self.listening).then_some(InputSignal::Ended)
            }
            InputEvent::RecognitionFailed(RecognitionError::NoSpeech) => {
                Some(InputSignal::Transient(RecognitionError::NoSpeech.to_string()))
            }
            InputEvent::RecognitionFailed(RecognitionError::Aborted) => None,
            InputEvent::RecognitionFailed(error) => {
                warn!(%error, "Speech recognition error.");
                self.listening = false;
                Some(InputSignal::Failed(VoiceError::Recognition(
                    error.to_string(),
                )))
            }
            _ => None,
        }
    }
}
