//! CLI binary for Kairos live mode.

use clap::{Parser, Subcommand};
use kairos_live::audio::capture::CpalCapture;
use kairos_live::audio::output::CpalOutput;
use kairos_live::session::transport::WebSocketTransport;
use kairos_live::{LiveConfig, LiveEvent, spawn_live};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Kairos live: talk to the mentor in real time.
#[derive(Parser)]
#[command(name = "kairos-live", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live voice session.
    Live,

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => LiveConfig::from_file(path)?,
        None => {
            let path = LiveConfig::default_config_path();
            if path.exists() {
                LiveConfig::from_file(&path)?
            } else {
                LiveConfig::default()
            }
        }
    };
    config.validate()?;

    let _log_guard = kairos_live::logging::init(&config.logging);

    match cli.command.unwrap_or(Command::Live) {
        Command::Live => run_live(config).await,
        Command::Devices => list_devices(),
    }
}

async fn run_live(config: LiveConfig) -> anyhow::Result<()> {
    println!("Kairos live v{}", env!("CARGO_PKG_VERSION"));

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let output = CpalOutput::open(&config.audio, output_tx)?;
    let capture = CpalCapture::new(&config.audio);
    let transport = WebSocketTransport::new();

    let (handle, task) = spawn_live(config, transport, capture, output, output_rx);

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LiveEvent::AssistantSpeechStart => println!("[mentor speaking]"),
                LiveEvent::AssistantSpeechEnd { interrupted: true } => println!("[interrupted]"),
                LiveEvent::Error(message) => eprintln!("error: {message}"),
                _ => {}
            }
        }
    });

    handle.start_live_session().await?;
    println!("\nConnected. Speak into your microphone. Press Ctrl+C to stop.\n");

    let mut status = handle.watch_status();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                info!("received Ctrl+C, shutting down...");
            }
        }
        () = async {
            while status.changed().await.is_ok() {
                let now = *status.borrow();
                if !now.is_open && !now.is_connecting {
                    break;
                }
            }
        } => {
            warn!("live session ended");
        }
    }

    handle.stop_live_session().await?;
    handle.shutdown();
    task.await?;

    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalOutput::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
