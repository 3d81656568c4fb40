use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use duet::conversation::{Conversation, ConversationHandle};
use duet::notify::NotificationLayer;
use duet::{
    ConfigManager, ConversationTurn, CpalInput, DEFAULT_LOG_LEVEL, HttpBackend, RodioOutput,
    UiEvent, VERSION,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const HELP: &str = "\
Commands:
  /connect       open the voice channel
  /talk          start recording (stops by itself after a pause)
  /stop          stop recording and send it
  /file <path>   submit a document
  /config        show the config file location
  /quit          exit
Anything else is sent as a text request.";

fn main() -> Result<()> {
    // Initialize the logger
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DUET_LOG")
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .finish()
        .with(NotificationLayer::new())
        .init();

    // Load config
    let config_manager = ConfigManager::new()?;
    let config = config_manager.load()?;
    // save back the config to create the file if it doesn't exist
    config_manager.save(&config)?;

    // The conversation owns the input stream, which is tied to this thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create runtime")?;

    runtime.block_on(async {
        let output = RodioOutput::new().context("Failed to open audio output")?;
        let backend = HttpBackend::new(&config.server_url, config.request_timeout())
            .context("Failed to create HTTP client")?;

        let (conversation, handle, events) = Conversation::new(
            &config,
            Box::new(CpalInput::new()),
            Box::new(output),
            Arc::new(backend),
        );

        if config.connect_on_start {
            handle.connect();
        }

        info!(version = VERSION, server = %config.server_url, "Duet ready");
        println!("{}", HELP);

        let console = tokio::spawn(read_console(
            handle,
            config_manager.config_path().to_path_buf(),
        ));
        tokio::join!(conversation.run(), print_events(events));
        console.abort();

        Ok::<_, anyhow::Error>(())
    })
}

/// Turn console lines into conversation commands. End of input quits.
async fn read_console(handle: ConversationHandle, config_path: PathBuf) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read from console: {}", e);
                break;
            }
        };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {}
            ("/quit", _) => break,
            ("/help", _) => println!("{}", HELP),
            ("/config", _) => println!("{}", config_path.display()),
            ("/connect", _) => {
                handle.connect();
            }
            ("/talk", _) => {
                if !handle.start_recording() {
                    println!("Wait for the agent to finish speaking.");
                }
            }
            ("/stop", _) => {
                handle.stop_recording();
            }
            ("/file", path) => submit_file(&handle, Path::new(path.trim())).await,
            _ => {
                handle.submit_text(line);
            }
        }
    }

    handle.shutdown();
}

async fn submit_file(handle: &ConversationHandle, path: &Path) {
    let name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => {
            println!("Usage: /file <path>");
            return;
        }
    };
    match tokio::fs::read(path).await {
        Ok(contents) => {
            handle.submit_file(name, contents);
        }
        Err(e) => warn!(path = %path.display(), "Failed to read file: {}", e),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<UiEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::Message(message) => println!("{}", message),
            UiEvent::TurnChanged(turn) => {
                let label = match turn {
                    ConversationTurn::Idle => "ready",
                    ConversationTurn::UserRecording => "listening...",
                    ConversationTurn::AgentSpeaking => "agent speaking",
                };
                println!("[{}]", label);
            }
            // Notices are already logged and raised as notifications.
            UiEvent::Notice(notice) => println!("! {}", notice.message),
        }
    }
}
