//! Voice Session
//!
//! The hands-free conversation loop: capture the user's speech, forward it
//! to the backend as a chat message, speak the assistant's reply, and go back
//! to listening. Speech engines, synthesizers and audio devices are consumed
//! through the traits in [`input`], [`recording`] and [`output`]; everything
//! they report flows into the [`VoiceController`] as [`VoiceEvent`]s.

pub mod controller;
pub mod input;
pub mod output;
pub mod recording;
pub mod speech_text;
pub mod vad;

pub use controller::{VoiceController, forward_replies};
pub use input::{
    InputEvent, InputSignal, RecognitionError, RecognitionInput, Recognizer, SpeechInput,
};
pub use output::{OutputError, OutputEvent, SpeechOutput, Utterance, VoiceInfo, select_voice};
pub use recording::{CaptureError, MediaCapture, RecordingInput};
pub use vad::{VadSettings, VadTransition, VoiceActivityDetector};

use crate::{chat::SendError, message::ChatMessage};
use std::{fmt, str::FromStr, time::Duration};
use tokio::sync::mpsc;

pub const DEFAULT_SPEECH_LANG: &str = "en-US";
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Listening,
    Uploading,
    Speaking,
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoiceState::Idle => "idle",
            VoiceState::Listening => "listening",
            VoiceState::Uploading => "uploading",
            VoiceState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceGender {
    Female,
    Male,
}

impl FromStr for VoiceGender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "female" => Ok(VoiceGender::Female),
            "male" => Ok(VoiceGender::Male),
            other => Err(format!("unknown voice gender '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoiceSettings {
    /// BCP 47 language tag used for recognition and synthesis.
    pub lang: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    /// `None` accepts any voice in the configured language.
    pub gender: Option<VoiceGender>,
    /// Pause between returning to idle and listening again.
    pub restart_delay: Duration,
    pub speak_replies: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            lang: DEFAULT_SPEECH_LANG.to_string(),
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
            gender: Some(VoiceGender::Female),
            restart_delay: DEFAULT_RESTART_DELAY,
            speak_replies: true,
        }
    }
}

/// Classified voice failures. Provider-specific errors are converted into
/// one of these before they reach observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("speech recognition is not available")]
    CapabilityMissing,
    #[error("audio capture failed: {0}")]
    Capture(String),
    #[error("speech recognition failed: {0}")]
    Recognition(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("speech output failed: {0}")]
    Output(String),
    #[error("message not sent: {0}")]
    Send(#[from] SendError),
    #[error("server error: {0}")]
    Server(String),
}

/// Everything the controller reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    MicOn,
    MicOff,
    ToggleMic,
    Input(InputEvent),
    Output(OutputEvent),
    Reply(ChatMessage),
    ResumeListening,
}

/// What the controller reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(VoiceState),
    SpeechDetected,
    /// Text that was forwarded to the backend on the user's behalf.
    UserSpeech(String),
    OutputEnded { interrupted: bool },
    Error(VoiceError),
}

pub type EventSender = mpsc::UnboundedSender<VoiceEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<VoiceEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
