mod commands;
mod console;
mod shell;

use agent_host::ConversationController;
use anyhow::Context;
use providers::CompletionWorker;
use services::{paths, JsonSettings, SettingsProvider, TranscriptStore};
use std::io::BufRead;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use console::ConsolePresenter;
use shell::Shell;

/// How long the loop waits for input before draining worker events.
const POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Read stdin on its own thread so the main loop can keep polling workers.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read input");
                    break;
                }
            }
        }
    });
    rx
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let transcript_path = paths::transcript_path();
    let store = TranscriptStore::open(&transcript_path)
        .with_context(|| format!("failed to load {}", transcript_path.display()))?;
    let settings = Arc::new(JsonSettings::open(paths::settings_path()));
    let settings_changes = settings.subscribe();
    tracing::info!(dir = %paths::config_root().display(), "traychat starting");

    let controller = ConversationController::new(
        store,
        settings.clone(),
        Box::new(ConsolePresenter::stdout()),
        Box::new(CompletionWorker),
    );
    let mut shell = Shell::new(controller, settings);
    if let Err(e) = shell.open_initial() {
        println!("! {}", e);
    }
    println!("Type /help for commands.");

    let lines = spawn_stdin_reader();
    loop {
        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                if !shell.handle_line(&line) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // input closed; let outstanding replies land first
                if !shell.is_busy() {
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        shell.poll();
        while let Ok(section) = settings_changes.try_recv() {
            tracing::info!(section = %section, "configuration changed");
        }
    }
    Ok(())
}
