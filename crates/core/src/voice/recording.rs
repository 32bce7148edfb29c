//! Record-then-transcribe speech input.
//!
//! A capture device records one turn at a time. Level readings feed the
//! voice activity detector; once the speaker has been silent long enough the
//! device is stopped and its final recording is uploaded for transcription.
//! The upload runs on its own task and reports back through the event stream,
//! tagged with the turn it belongs to, so results for abandoned turns can be
//! recognised and dropped.

use super::{
    EventSender, VoiceError, VoiceEvent,
    input::{InputEvent, InputSignal, SpeechInput},
    vad::{VadSettings, VadTransition, VoiceActivityDetector},
};
use crate::transcribe::{Recording, Transcriber};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no capture device available")]
    Unavailable,
    #[error("failed to start capture: {0}")]
    Start(String),
}

/// An audio capture device. While recording it posts `Chunk` and `Level`
/// events; after `stop` it posts exactly one `CaptureStopped` carrying the
/// whole recording (or `CaptureFailed`). `stop` must release the microphone.
#[cfg_attr(test, mockall::automock)]
pub trait MediaCapture: Send {
    fn is_available(&self) -> bool;
    fn start(&mut self) -> Result<(), CaptureError>;
    fn stop(&mut self);
}

pub struct RecordingInput {
    capture: Box<dyn MediaCapture>,
    transcriber: Arc<dyn Transcriber>,
    events: EventSender,
    vad: VoiceActivityDetector,
    turn: u64,
    recording: bool,
    captured_bytes: usize,
    /// The current turn was stopped and its recording is still to arrive.
    awaiting_recording: bool,
    /// Turn whose transcription is in flight.
    uploading: Option<u64>,
}

impl RecordingInput {
    pub fn new(
        capture: Box<dyn MediaCapture>,
        transcriber: Arc<dyn Transcriber>,
        events: EventSender,
        vad: VadSettings,
    ) -> Self {
        Self {
            capture,
            transcriber,
            events,
            vad: VoiceActivityDetector::new(vad),
            turn: 0,
            recording: false,
            captured_bytes: 0,
            awaiting_recording: false,
            uploading: None,
        }
    }

    fn finish_turn(&mut self) -> InputSignal {
        self.capture.stop();
        self.recording = false;
        self.awaiting_recording = true;
        info!(
            turn = self.turn,
            bytes = self.captured_bytes,
            "End of speech, stopping capture for upload."
        );
        InputSignal::Uploading
    }

    fn upload(&mut self, turn: u64, recording: Recording) {
        self.uploading = Some(turn);
        let transcriber = self.transcriber.clone();
        let events = self.events.clone();
        tokio::spawn(
            async move {
                let result = transcriber.transcribe(recording).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Transcription failed.");
                }
                let _ = events.send(VoiceEvent::Input(InputEvent::Transcribed { turn, result }));
            }
            .instrument(info_span!("upload", turn)),
        );
    }
}

impl SpeechInput for RecordingInput {
    fn is_available(&self) -> bool {
        self.capture.is_available()
    }

    fn start(&mut self) -> Result<(), VoiceError> {
        if self.recording {
            return Ok(());
        }
        self.turn += 1;
        self.awaiting_recording = false;
        self.uploading = None;
        self.captured_bytes = 0;
        self.vad.reset();
        self.capture.start().map_err(|e| match e {
            CaptureError::Unavailable => VoiceError::CapabilityMissing,
            other => VoiceError::Capture(other.to_string()),
        })?;
        self.recording = true;
        debug!(turn = self.turn, "Capture started.");
        Ok(())
    }

    fn stop(&mut self) {
        if self.recording {
            self.capture.stop();
            self.recording = false;
        }
        let awaiting = std::mem::take(&mut self.awaiting_recording);
        if self.uploading.take().is_some() || awaiting {
            debug!(turn = self.turn, "Abandoned turn.");
        }
    }

    fn handle(&mut self, event: InputEvent, now: Instant) -> Option<InputSignal> {
        match event {
            InputEvent::Level(level_db) if self.recording => {
                match self.vad.observe(level_db, now)? {
                    VadTransition::SpeechStarted => Some(InputSignal::SpeechDetected),
                    VadTransition::SilenceElapsed => Some(self.finish_turn()),
                }
            }
            InputEvent::Chunk(data) if self.recording => {
                self.captured_bytes += data.len();
                None
            }
            InputEvent::CaptureStopped(recording) => {
                let announced = if self.recording {
                    // The device ended the turn on its own.
                    self.recording = false;
                    if !self.vad.heard_speech() {
                        return Some(InputSignal::Ended);
                    }
                    false
                } else if std::mem::take(&mut self.awaiting_recording) {
                    true
                } else {
                    debug!("Ignoring recording of an abandoned turn.");
                    return None;
                };
                if recording.is_empty() {
                    return Some(InputSignal::Failed(VoiceError::Transcription(
                        "no audio was recorded".to_string(),
                    )));
                }
                self.upload(self.turn, recording);
                (!announced).then_some(InputSignal::Uploading)
            }
            InputEvent::CaptureFailed(reason) => {
                let was_active = self.recording || self.awaiting_recording;
                self.recording = false;
                self.awaiting_recording = false;
                was_active.then_some(InputSignal::Failed(VoiceError::Capture(reason)))
            }
            InputEvent::Transcribed { turn, result } => {
                if self.uploading != Some(turn) {
                    debug!(turn, "Dropping transcription of an abandoned turn.");
                    return None;
                }
                self.uploading = None;
                Some(match result {
                    Ok(text) if text.trim().is_empty() => InputSignal::Failed(
                        VoiceError::Transcription("empty transcript".to_string()),
                    ),
                    Ok(text) => InputSignal::Recognized(text),
                    Err(e) => InputSignal::Failed(VoiceError::Transcription(e.to_string())),
                })
            }
            _ => None,
        }
    }
}
