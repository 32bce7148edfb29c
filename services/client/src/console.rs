//! Terminal stand-ins for speech engines.
//!
//! `ConsoleRecognizer` treats typed lines as recognised speech, and
//! `ConsoleSynthesizer` prints replies and takes as long to "say" them as a
//! real voice would.

use std::{io::Write, time::Duration};
use tokio::task::JoinHandle;
use tracing::debug;
use voicechat_core::voice::{
    EventSender, InputEvent, OutputError, OutputEvent, RecognitionError, Recognizer,
    SpeechOutput, Utterance, VoiceEvent, VoiceGender, VoiceInfo,
};

const WORD_DURATION: Duration = Duration::from_millis(300);

/// The engine side of typed speech. The lines themselves are posted by the
/// terminal front-end as `Recognized` events.
pub struct ConsoleRecognizer {
    events: EventSender,
}

impl ConsoleRecognizer {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

impl Recognizer for ConsoleRecognizer {
    fn is_available(&self) -> bool {
        true
    }

    fn start(&mut self) -> Result<(), RecognitionError> {
        self.events
            .send(VoiceEvent::Input(InputEvent::RecognitionStarted))
            .map_err(|_| RecognitionError::Other("voice session has ended".to_string()))
    }

    fn stop(&mut self) {
        let _ = self
            .events
            .send(VoiceEvent::Input(InputEvent::RecognitionEnded));
    }
}

/// How long it takes to say `text` at `rate`.
pub fn speaking_time(text: &str, rate: f32) -> Duration {
    let words = text.split_whitespace().count().max(1) as u32;
    (WORD_DURATION * words).div_f32(rate.max(0.1))
}

pub struct ConsoleSynthesizer {
    events: EventSender,
    playback: Option<JoinHandle<()>>,
}

impl ConsoleSynthesizer {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            playback: None,
        }
    }
}

impl SpeechOutput for ConsoleSynthesizer {
    fn voices(&self) -> Vec<VoiceInfo> {
        vec![
            VoiceInfo::new("Console Female", "en-US").with_gender(VoiceGender::Female),
            VoiceInfo::new("Console Male", "en-US").with_gender(VoiceGender::Male),
        ]
    }

    fn speak(&mut self, utterance: Utterance) -> Result<(), OutputError> {
        self.cancel();
        let voice = utterance
            .voice
            .as_ref()
            .map_or("default voice", |v| v.name.as_str());
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "🔊 ({voice}) {}", utterance.text)
            .and_then(|_| stdout.flush())
            .map_err(|e| OutputError::Engine(e.to_string()))?;

        let id = utterance.id;
        let duration = speaking_time(&utterance.text, utterance.rate);
        let events = self.events.clone();
        let _ = events.send(VoiceEvent::Output(OutputEvent::Started { id }));
        self.playback = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(VoiceEvent::Output(OutputEvent::Finished { id }));
        }));
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(playback) = self.playback.take() {
            debug!("Cancelling playback.");
            playback.abort();
        }
    }
}
