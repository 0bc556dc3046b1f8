//! Interactive chat loop on stdin/stdout.

use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;
use tracing::{info, warn};

use colloquy_core::config::Config;
use colloquy_core::events::{EventBus, WidgetEvent};
use colloquy_core::prefs::JsonPrefsStore;
use colloquy_core::types::OpenParams;
use colloquy_dialog::{Collaborators, DialogSessionManager, ManagerSettings, OpenOutcome, entry};
use colloquy_providers::Translator;
use colloquy_providers::http::{HttpDialogEngine, HttpTranslator};
use colloquy_providers::recognition::UnavailableRecognizer;

/// One line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum ChatInput<'a> {
    Quit,
    Reopen,
    Mute,
    Unmute,
    Unknown(&'a str),
    Message(&'a str),
    Empty,
}

fn parse_input(line: &str) -> ChatInput<'_> {
    let line = line.trim();
    match line {
        "" => ChatInput::Empty,
        "/quit" | "/exit" => ChatInput::Quit,
        "/reopen" => ChatInput::Reopen,
        "/mute" => ChatInput::Mute,
        "/unmute" => ChatInput::Unmute,
        cmd if cmd.starts_with('/') => ChatInput::Unknown(cmd),
        text => ChatInput::Message(text),
    }
}

async fn print_events(mut rx: broadcast::Receiver<WidgetEvent>) {
    loop {
        match rx.recv().await {
            Ok(WidgetEvent::MessageAppended { message }) if !message.from_user => {
                println!("agent> {}", message.display_text());
            }
            Ok(WidgetEvent::Toast { level, message }) => eprintln!("[{level:?}] {message}"),
            Ok(WidgetEvent::SessionClosed) => eprintln!("(session closed)"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, label: &str) -> anyhow::Result<Option<String>> {
    eprint!("{label}: ");
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

pub async fn run(config: &Config, engine_id: Option<String>, lang: Option<String>) -> anyhow::Result<()> {
    let engine_config = config
        .engine
        .as_ref()
        .context("No dialog engine configured; add an `engine` section to the config file")?;
    let engine = Arc::new(HttpDialogEngine::new(
        &engine_config.base_url,
        engine_config.resolve_api_key(),
    ));

    let translator = config
        .translation
        .as_ref()
        .filter(|_| config.translation_enabled())
        .and_then(|t| {
            let base_url = t.base_url.as_deref()?;
            Some(Arc::new(HttpTranslator::new(base_url, t.resolve_api_key())) as Arc<dyn Translator>)
        });

    let mut settings = ManagerSettings::from_config(config);
    if let Some(id) = engine_id {
        settings.engine_id = id;
    }
    let params = OpenParams {
        engine_id: settings.engine_id.clone(),
        user_language: lang,
        ..Default::default()
    };

    let bus = EventBus::new();
    let printer = tokio::spawn(print_events(bus.subscribe()));

    let manager = DialogSessionManager::new(
        settings,
        Collaborators {
            engine,
            translator,
            prefs: Arc::new(JsonPrefsStore::new(config.prefs_path())),
            recognizer: Arc::new(UnavailableRecognizer),
            speech: None,
        },
        bus,
    );
    entry::install(&manager);
    let driver = manager.spawn_driver().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut outcome = manager.open(params).await?;
    loop {
        match outcome {
            OpenOutcome::Opened { session_id, .. } => {
                info!(%session_id, "Session opened");
                break;
            }
            OpenOutcome::AuthRequired => {
                let Some(token) = prompt(&mut lines, "This agent is private. Login token").await? else {
                    return Ok(());
                };
                outcome = manager.provide_credentials(None, Some(token)).await?;
            }
            OpenOutcome::AgeVerificationRequired => {
                let Some(raw) = prompt(&mut lines, "Birth date (YYYY-MM-DD)").await? else {
                    return Ok(());
                };
                let birth_date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .with_context(|| format!("Invalid birth date '{raw}'"))?;
                outcome = manager.provide_birth_date(birth_date).await?;
            }
        }
    }

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match parse_input(&line) {
            ChatInput::Empty => {}
            ChatInput::Quit => break,
            ChatInput::Reopen => {
                if let Err(e) = manager.reopen(true).await {
                    eprintln!("Reopen failed: {e}");
                }
            }
            ChatInput::Mute => manager.set_mute_speaker(true).await,
            ChatInput::Unmute => manager.set_mute_speaker(false).await,
            ChatInput::Unknown(cmd) => eprintln!("Unknown command {cmd} (try /quit, /reopen, /mute, /unmute)"),
            ChatInput::Message(text) => {
                // Failures are already reported as toasts.
                let _ = entry::type_message(text).await;
            }
        }
    }

    manager.close().await;
    entry::uninstall();
    if let Some(driver) = driver {
        driver.abort();
    }
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  "), ChatInput::Empty);
        assert_eq!(parse_input("/quit"), ChatInput::Quit);
        assert_eq!(parse_input(" /reopen "), ChatInput::Reopen);
        assert_eq!(parse_input("/mute"), ChatInput::Mute);
        assert_eq!(parse_input("/unmute"), ChatInput::Unmute);
        assert_eq!(parse_input("/dance"), ChatInput::Unknown("/dance"));
        assert_eq!(parse_input(" hello there "), ChatInput::Message("hello there"));
    }
}
