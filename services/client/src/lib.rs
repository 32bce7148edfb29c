//! Voice Chat Terminal Client
//!
//! This library holds everything the `voicechat` binary wires together: the
//! environment configuration, the terminal front-end for chat and voice
//! sessions, and the local stand-ins for platform speech capabilities (a
//! recorder process for the microphone, console speech engines). The binary
//! itself is a thin wrapper around [`app`].

pub mod app;
pub mod audio_utils;
pub mod capture;
pub mod config;
pub mod console;
