//! Volume-threshold voice activity detection for record-and-upload turns.

use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_SILENCE_THRESHOLD_DB: f32 = -50.0;
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    /// Readings above this level count as speech.
    pub threshold_db: f32,
    /// How long the level must stay below the threshold, after speech has
    /// been heard, before the turn ends.
    pub silence_timeout: Duration,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold_db: DEFAULT_SILENCE_THRESHOLD_DB,
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SilenceElapsed,
}

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    settings: VadSettings,
    speaking: bool,
    heard_speech: bool,
    last_loud: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(settings: VadSettings) -> Self {
        Self {
            settings,
            speaking: false,
            heard_speech: false,
            last_loud: None,
        }
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.heard_speech = false;
        self.last_loud = None;
    }

    /// Whether any speech has been heard since the last reset.
    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    /// Feeds one level reading. Silence is only reported once per turn, and
    /// only after speech was heard.
    pub fn observe(&mut self, level_db: f32, now: Instant) -> Option<VadTransition> {
        if level_db > self.settings.threshold_db {
            self.last_loud = Some(now);
            if !self.speaking {
                self.speaking = true;
                self.heard_speech = true;
                return Some(VadTransition::SpeechStarted);
            }
            return None;
        }

        let last_loud = self.last_loud?;
        if self.speaking && now.duration_since(last_loud) >= self.settings.silence_timeout {
            self.speaking = false;
            self.last_loud = None;
            return Some(VadTransition::SilenceElapsed);
        }
        None
    }
}

/// Level in dB of a byte frequency spectrum (0..=255 per bin), relative to
/// full scale. Silence reads as negative infinity.
pub fn level_db(spectrum: &[u8]) -> f32 {
    if spectrum.is_empty() {
        return f32::NEG_INFINITY;
    }
    let sum: u32 = spectrum.iter().map(|&b| u32::from(b)).sum();
    let mean = sum as f32 / spectrum.len() as f32;
    if mean == 0.0 {
        return f32::NEG_INFINITY;
    }
    20.0 * (mean / 255.0).log10()
}
