//! Terminal front-end for chat and voice sessions.

use crate::{
    capture::CommandCapture,
    config::{Config, InputMode},
    console::{ConsoleRecognizer, ConsoleSynthesizer},
};
use anyhow::Context;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use voicechat_core::{
    ChatSession, ConnectionManager, ConnectionSettings, ConnectionStatus, Connector, MessageKind,
    Sender,
    pipeline::OutboundPipeline,
    transcribe::HttpTranscriber,
    voice::{
        InputEvent, RecognitionInput, RecordingInput, SessionEvent, SpeechInput, VoiceController,
        VoiceEvent, VoiceState, event_channel, forward_replies,
    },
};
use voicechat_ws::WsConnector;

const DEFAULT_EXPORT_PATH: &str = "conversation.json";

const HELP: &str = "\
Commands:
  /mic             toggle the microphone (voice mode)
  /search <text>   find messages in this conversation
  /export [path]   save the conversation as JSON
  /clear           forget the conversation so far
  /status          show the connection state
  /quit            leave
Anything else is sent as a message.";

/// A line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    ToggleMic,
    Search(String),
    Export(PathBuf),
    Clear,
    Status,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name.to_ascii_lowercase().as_str() {
        "mic" => Command::ToggleMic,
        "search" => Command::Search(arg.to_string()),
        "export" if arg.is_empty() => Command::Export(PathBuf::from(DEFAULT_EXPORT_PATH)),
        "export" => Command::Export(PathBuf::from(arg)),
        "clear" => Command::Clear,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// Builds the chat session for `config` over `connector` and wires the
/// terminal printers to it. The connection is not opened yet.
pub fn build_session(config: &Config, connector: Arc<dyn Connector>) -> ChatSession {
    let connection = ConnectionManager::new(
        ConnectionSettings {
            url: config.ws_url.clone(),
            reconnect_interval: config.reconnect_interval,
        },
        connector,
    );
    connection.on_message(|message| match (message.kind(), message.sender()) {
        (MessageKind::Error, _) => eprintln!("⚠️  {}", message.content()),
        (_, Sender::Ai) => println!("🤖 {}", message.content()),
        (_, sender) => println!("[{sender}] {}", message.content()),
    });
    connection.on_status_change(|status| match status {
        ConnectionStatus::Connected => println!("✅ Connected"),
        ConnectionStatus::Connecting => println!("⏳ Connecting..."),
        ConnectionStatus::Disconnected => println!("❌ Disconnected"),
        ConnectionStatus::Error => println!("⚠️  Connection error"),
    });

    let mut pipeline = OutboundPipeline::new();
    if let Some(context) = &config.context {
        info!(topic = %context.topic, level = %context.level, "Context prefix enabled.");
        pipeline = pipeline.with(context.clone());
    }
    ChatSession::new(connection, pipeline)
}

fn print_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => println!("🎙️  [{state}]"),
        SessionEvent::SpeechDetected => {}
        SessionEvent::UserSpeech(text) => println!("🗣️  {text}"),
        SessionEvent::OutputEnded { interrupted: true } => println!("(interrupted)"),
        SessionEvent::OutputEnded { .. } => {}
        SessionEvent::Error(e) => eprintln!("⚠️  {e}"),
    }
}

fn send(chat: &ChatSession, text: &str) {
    if let Err(e) = chat.send_text(text) {
        eprintln!("⚠️  Message not sent: {e}");
    }
}

/// Handles the commands both modes share. Returns `false` on quit.
fn run_shared_command(chat: &ChatSession, command: Command) -> bool {
    match command {
        Command::Say(text) => send(chat, &text),
        Command::Search(query) => {
            let transcript = chat.transcript();
            let hits = transcript.search(&query);
            if hits.is_empty() {
                println!("No messages match '{query}'.");
            }
            for entry in hits {
                println!(
                    "{} [{}] {}",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.sender,
                    entry.text
                );
            }
        }
        Command::Export(path) => match export(chat, &path) {
            Ok(()) => println!("Saved the conversation to {}.", path.display()),
            Err(e) => eprintln!("⚠️  {e:#}"),
        },
        Command::Clear => {
            chat.transcript().clear();
            println!("Conversation cleared.");
        }
        Command::Status => println!("Connection: {:?}", chat.status()),
        Command::Help => println!("{HELP}"),
        Command::ToggleMic => println!("The microphone is only available in voice mode."),
        Command::Unknown(name) => println!("Unknown command '/{name}'. Try /help."),
        Command::Quit => return false,
        Command::Empty => {}
    }
    true
}

fn export(chat: &ChatSession, path: &Path) -> anyhow::Result<()> {
    let json = chat
        .transcript()
        .export_json()
        .context("Failed to serialize the conversation")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Reads prompt lines until stdin closes or Ctrl+C, passing each parsed
/// command to `on_command` until it returns `false`.
async fn prompt_loop(mut on_command: impl FnMut(Command) -> bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                if !on_command(parse_command(&line)) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C.");
                break;
            }
        }
    }
    Ok(())
}

/// Text chat over the WebSocket.
pub async fn run_chat(config: Config) -> anyhow::Result<()> {
    let chat = build_session(&config, Arc::new(WsConnector::new()));
    info!(url = %config.ws_url, "Starting chat session.");
    chat.connection().connect();
    println!("Type a message, or /help for commands.");

    prompt_loop(|command| run_shared_command(&chat, command)).await?;

    chat.connection().disconnect();
    Ok(())
}

/// Hands-free conversation: speech in, spoken replies out.
pub async fn run_voice(config: Config) -> anyhow::Result<()> {
    let chat = Arc::new(build_session(&config, Arc::new(WsConnector::new())));
    let (events, receiver) = event_channel();

    let input: Box<dyn SpeechInput> = match config.input_mode {
        InputMode::Continuous => Box::new(RecognitionInput::new(Box::new(
            ConsoleRecognizer::new(events.clone()),
        ))),
        InputMode::Upload => {
            let transcriber = HttpTranscriber::new(&config.backend_url)
                .context("Failed to set up the transcription client")?;
            info!(endpoint = %transcriber.endpoint(), "Using backend transcription.");
            Box::new(RecordingInput::new(
                Box::new(CommandCapture::new(&config.capture_command, events.clone())),
                Arc::new(transcriber),
                events.clone(),
                config.vad.clone(),
            ))
        }
    };
    let output = Box::new(ConsoleSynthesizer::new(events.clone()));

    let controller = VoiceController::new(config.voice.clone(), input, output, chat.clone());
    controller.subscribe(print_session_event);
    let state = controller.subscribe_state();
    forward_replies(chat.connection(), events.clone());

    info!(url = %config.ws_url, mode = ?config.input_mode, "Starting voice session.");
    chat.connection().connect();
    let session = tokio::spawn(controller.run(receiver));
    println!("Voice mode. /mic toggles the microphone, /help lists commands.");

    prompt_loop(|command| match command {
        Command::ToggleMic => {
            let _ = events.send(VoiceEvent::ToggleMic);
            true
        }
        // With a live recogniser, typed lines are what it "heard".
        Command::Say(text)
            if config.input_mode == InputMode::Continuous
                && *state.borrow() != VoiceState::Idle =>
        {
            let _ = events.send(VoiceEvent::Input(InputEvent::Recognized(text)));
            true
        }
        other => run_shared_command(&chat, other),
    })
    .await?;

    let _ = events.send(VoiceEvent::MicOff);
    tokio::task::yield_now().await;
    // Providers hold senders of their own, so the loop is stopped explicitly.
    session.abort();
    if let Err(e) = session.await {
        if !e.is_cancelled() {
            warn!(error = %e, "Voice session ended abnormally.");
        }
    }
    chat.connection().disconnect();
    Ok(())
}
