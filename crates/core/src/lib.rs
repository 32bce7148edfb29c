//! Voice Chat Core
//!
//! The platform-independent half of the voice chat client: the chat message
//! model and its wire codec, the resilient connection to the chat backend,
//! and the voice session state machine that coordinates speech capture, the
//! network round-trip and speech playback.
//!
//! Platform capabilities (speech recognition engines, synthesizers, audio
//! capture devices, the WebSocket itself) are consumed through traits so the
//! same core runs behind a terminal, a test harness, or any other front-end.

pub mod chat;
pub mod connection;
pub mod message;
pub mod observer;
pub mod pipeline;
pub mod transcribe;
pub mod transcript;
pub mod voice;

pub use chat::{ChatSession, MessageSink, SendError};
pub use connection::{
    ConnectionManager, ConnectionSettings, ConnectionStatus, Connector, Transport,
    TransportError, TransportEvent,
};
pub use message::{ChatMessage, MessageKind, Sender, ValidationError};
