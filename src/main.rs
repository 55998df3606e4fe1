mod client;
mod commands;
mod config;
mod download;
mod hearing;
mod input;
mod logging;
mod session;
mod shell;
mod similarity;
mod speech;
mod status;
mod ui;

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

use config::Settings;
use session::{Collaborators, Session};

#[derive(Parser, Debug)]
#[command(
    name = "isaac",
    version,
    about = "A voice and text assistant for the terminal",
    long_about = "A voice and text assistant for the terminal.\n\n\
        Type a question to ask the language model, or a command starting with ':'.\n\
        Run it and type :commands to see them all."
)]
struct Args {}

/// piper missing
const EXIT_NO_PIPER: u8 = 1;
/// no per-user config directory, or neither unix nor windows
const EXIT_UNSUPPORTED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let _args = Args::parse();

    // ── Environment checks ────────────────────────────────────────────────────
    let Some(settings_path) = config::settings_path().filter(|_| cfg!(any(unix, windows))) else {
        eprintln!("isaac does not support this platform");
        return ExitCode::from(EXIT_UNSUPPORTED);
    };
    if !speech::on_path(speech::PIPER) {
        eprintln!("isaac needs the `{}` text-to-speech binary on PATH.", speech::PIPER);
        eprintln!("Install it with `pip install piper-tts` or from https://github.com/rhasspy/piper/releases");
        return ExitCode::from(EXIT_NO_PIPER);
    }

    match run(settings_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            eprintln!("isaac: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings_path: std::path::PathBuf) -> Result<()> {
    let data_dir = config::data_dir();
    if let Err(e) = logging::init(&data_dir) {
        eprintln!("  logging disabled: {e:#}");
    }

    let settings = match Settings::load(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("{e:#}");
            eprintln!("  could not read settings, using defaults: {e:#}");
            Settings::default()
        }
    };
    tracing::info!(path = %settings_path.display(), provider = %settings.provider, "settings loaded");

    // model downloads can take minutes, so they get a client without the API timeout
    let downloads = reqwest::Client::new();
    let collaborators = Collaborators {
        lm: Box::new(client::Client::new()?),
        speaker: Box::new(speech::PiperSpeaker::new(downloads.clone(), data_dir.join("voices"))),
        hearing: Box::new(hearing::WhisperHearing::new(downloads, data_dir.join("whisper"))),
        shell: Box::new(shell::SystemShell::new(settings.shell.as_deref())),
    };

    let mut session = Session::new(settings, Some(settings_path), collaborators);

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    // At the prompt the line editor sees Ctrl-C itself; this only fires while a
    // request or download is running.
    let interrupt = session.interrupt_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupt.notify_waiters();
        }
    });

    let mut reader = input::LineReader::spawn()?;
    session.run(&mut reader).await
}
