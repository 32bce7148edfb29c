//! Main Entrypoint for the Voice Chat Client
//!
//! This binary is responsible for:
//! 1. Parsing the command line.
//! 2. Loading configuration from the environment.
//! 3. Initializing logging on stderr, so it stays out of the conversation.
//! 4. Running a text chat or a hands-free voice session until the user quits.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use voicechat_client::{
    app::{run_chat, run_voice},
    config::{Config, InputMode},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Talk to the chat assistant from the terminal.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Type messages and read the replies.
    Chat,
    /// Speak to the assistant and hear its replies.
    Voice {
        /// Overrides INPUT_MODE.
        #[arg(long, value_enum)]
        input: Option<InputMode>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded.");

    // --- 3. Run the Selected Mode ---
    match cli.command.unwrap_or(Mode::Chat) {
        Mode::Chat => run_chat(config).await?,
        Mode::Voice { input } => {
            if let Some(input) = input {
                config.input_mode = input;
            }
            run_voice(config).await?
        }
    }

    info!("Client has shut down.");
    Ok(())
}
