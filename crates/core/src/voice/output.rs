//! Speech output capability and voice selection.

use super::VoiceGender;

/// A synthesis voice offered by the output engine.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceInfo {
    pub name: String,
    pub lang: String,
    /// Set when the engine reports a gender; otherwise inferred from the name.
    pub gender: Option<VoiceGender>,
}

impl VoiceInfo {
    pub fn new(name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: lang.into(),
            gender: None,
        }
    }

    pub fn with_gender(mut self, gender: VoiceGender) -> Self {
        self.gender = Some(gender);
        self
    }
}

/// One request to speak. `id` ties the engine's events back to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: u64,
    pub text: String,
    pub lang: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    /// `None` lets the engine use its default voice.
    pub voice: Option<VoiceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Started { id: u64 },
    Finished { id: u64 },
    Failed { id: u64, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("speech synthesis is not available")]
    Unavailable,
    #[error("{0}")]
    Engine(String),
}

/// A speech synthesizer. Playback progress is reported asynchronously as
/// [`OutputEvent`]s; `cancel` abandons the current utterance without a
/// `Finished` event.
#[cfg_attr(test, mockall::automock)]
pub trait SpeechOutput: Send {
    fn voices(&self) -> Vec<VoiceInfo>;
    fn speak(&mut self, utterance: Utterance) -> Result<(), OutputError>;
    fn cancel(&mut self);
}

const FEMALE_HINTS: [&str; 3] = ["female", "samantha", "victoria"];
const MALE_HINTS: [&str; 3] = ["male", "david", "james"];

fn primary_subtag(lang: &str) -> String {
    lang.split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn inferred_gender(voice: &VoiceInfo) -> Option<VoiceGender> {
    if voice.gender.is_some() {
        return voice.gender;
    }
    let words: Vec<String> = voice
        .name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let has_any = |hints: &[&str]| words.iter().any(|w| hints.contains(&w.as_str()));
    if has_any(&FEMALE_HINTS) {
        Some(VoiceGender::Female)
    } else if has_any(&MALE_HINTS) {
        Some(VoiceGender::Male)
    } else {
        None
    }
}

/// Picks a voice for `lang`, preferring `gender` when given. Falls back to the
/// first voice in the language, then to the engine default (`None`).
pub fn select_voice(
    voices: &[VoiceInfo],
    lang: &str,
    gender: Option<VoiceGender>,
) -> Option<VoiceInfo> {
    let wanted = primary_subtag(lang);
    let mut in_language = voices.iter().filter(|v| primary_subtag(&v.lang) == wanted);

    if let Some(gender) = gender {
        let matched = in_language
            .clone()
            .find(|v| inferred_gender(v) == Some(gender));
        if matched.is_some() {
            return matched.cloned();
        }
    }
    in_language.next().cloned()
}
