use clap::ValueEnum;
use std::{str::FromStr, time::Duration};
use tracing::Level;
use voicechat_core::{
    connection::{DEFAULT_RECONNECT_INTERVAL, DEFAULT_WS_URL},
    pipeline::ContextPrefix,
    transcribe::DEFAULT_BACKEND_URL,
    voice::{VadSettings, VoiceGender, VoiceSettings},
};

pub const DEFAULT_CAPTURE_COMMAND: &str = "arecord -q -f S16_LE -r 16000 -c 1 -t raw";
const DEFAULT_TOPIC: &str = "general";
const DEFAULT_LEVEL: &str = "B2";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// How spoken input is turned into text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InputMode {
    /// Typed lines stand in for a continuous recognition engine.
    Continuous,
    /// Record from the microphone and transcribe on the backend.
    Upload,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub ws_url: String,
    pub backend_url: String,
    pub reconnect_interval: Duration,
    pub voice: VoiceSettings,
    pub vad: VadSettings,
    pub input_mode: InputMode,
    pub capture_command: Vec<String>,
    pub context: Option<ContextPrefix>,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_in_range(name: &str, default: f32, min: f32, max: f32) -> Result<f32, ConfigError> {
    let value = parse_var(name, default)?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("{value} is outside {min}..={max}"),
        ));
    }
    Ok(value)
}

fn parse_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let ws_url = var_or("WS_URL", DEFAULT_WS_URL);
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "WS_URL".to_string(),
                format!("'{ws_url}' is not a ws:// or wss:// URL"),
            ));
        }

        let backend_url = var_or("BACKEND_URL", DEFAULT_BACKEND_URL);
        reqwest::Url::parse(&backend_url)
            .map_err(|e| ConfigError::InvalidValue("BACKEND_URL".to_string(), e.to_string()))?;

        let reconnect_interval = parse_millis("RECONNECT_INTERVAL_MS", DEFAULT_RECONNECT_INTERVAL)?;
        if reconnect_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "RECONNECT_INTERVAL_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let defaults = VoiceSettings::default();
        let gender = match var_or("VOICE_GENDER", "female").trim().to_lowercase().as_str() {
            "any" | "" => None,
            other => Some(
                other
                    .parse::<VoiceGender>()
                    .map_err(|e| ConfigError::InvalidValue("VOICE_GENDER".to_string(), e))?,
            ),
        };
        let voice = VoiceSettings {
            lang: var_or("SPEECH_LANG", &defaults.lang),
            rate: parse_in_range("SPEECH_RATE", defaults.rate, 0.1, 10.0)?,
            pitch: parse_in_range("SPEECH_PITCH", defaults.pitch, 0.0, 2.0)?,
            volume: parse_in_range("SPEECH_VOLUME", defaults.volume, 0.0, 1.0)?,
            gender,
            restart_delay: parse_millis("LISTEN_RESTART_DELAY_MS", defaults.restart_delay)?,
            speak_replies: parse_var("SPEAK_REPLIES", defaults.speak_replies)?,
        };

        let vad_defaults = VadSettings::default();
        let vad = VadSettings {
            threshold_db: parse_var("SILENCE_THRESHOLD_DB", vad_defaults.threshold_db)?,
            silence_timeout: parse_millis("SILENCE_TIMEOUT_MS", vad_defaults.silence_timeout)?,
        };

        let mode_str = var_or("INPUT_MODE", "continuous");
        let input_mode = <InputMode as ValueEnum>::from_str(mode_str.trim(), true)
            .map_err(|e| ConfigError::InvalidValue("INPUT_MODE".to_string(), e))?;

        let capture_command: Vec<String> = var_or("CAPTURE_COMMAND", DEFAULT_CAPTURE_COMMAND)
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if capture_command.is_empty() {
            return Err(ConfigError::InvalidValue(
                "CAPTURE_COMMAND".to_string(),
                "command is empty".to_string(),
            ));
        }

        let topic = std::env::var("CONVERSATION_TOPIC").ok();
        let level = std::env::var("ENGLISH_LEVEL").ok();
        let context = (topic.is_some() || level.is_some()).then(|| {
            ContextPrefix::new(
                topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
                level.unwrap_or_else(|| DEFAULT_LEVEL.to_string()),
            )
        });

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            ws_url,
            backend_url,
            reconnect_interval,
            voice,
            vad,
            input_mode,
            capture_command,
            context,
            log_level,
        })
    }
}
