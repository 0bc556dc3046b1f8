mod chat;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use colloquy_core::config::{Config, LoggingConfig};
use colloquy_core::prefs::{JsonPrefsStore, PrefKey, PreferenceStore};

#[derive(Parser)]
#[command(
    name = "colloquy",
    about = "Talk to a conversational agent from the terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session and chat with the agent
    Chat {
        /// Agent to talk to (default: engine.engine_id from the config)
        #[arg(long)]
        engine_id: Option<String>,

        /// Your language, e.g. "it-IT"
        #[arg(long)]
        lang: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Stored user preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a config value by dotted path
    Get { path: String },
    /// Check the configuration for problems
    Validate,
}

#[derive(Subcommand)]
enum PrefsAction {
    /// Show all stored preferences
    Show,
    /// Store a preference
    Set { key: String, value: String },
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            config.level.as_deref().unwrap_or("info")
        };
        let mut directives = level.to_string();
        for extra in &config.filters {
            directives.push(',');
            directives.push_str(extra);
        }
        EnvFilter::new(directives)
    });

    let writer = if config.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if config.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Chat { engine_id, lang } => {
            chat::run(&config, engine_id, lang).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { path } => match config.get_path(&path) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{path}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config: {} OK", config_path.display());
            }
        },
        Commands::Prefs { action } => {
            let store = JsonPrefsStore::new(config.prefs_path());
            match action {
                PrefsAction::Show => {
                    let mut values = serde_json::Map::new();
                    for key in PrefKey::ALL {
                        if let Some(value) = store.get(key).await? {
                            values.insert(key.as_str().to_string(), value.into());
                        }
                    }
                    println!("{}", serde_json::to_string_pretty(&values)?);
                }
                PrefsAction::Set { key, value } => {
                    let Some(pref) = PrefKey::parse(&key) else {
                        let known: Vec<_> = PrefKey::ALL.iter().map(|k| k.as_str()).collect();
                        anyhow::bail!("Unknown preference '{key}' (expected one of: {})", known.join(", "));
                    };
                    store.set(pref, &value).await?;
                    tracing::info!(key = pref.as_str(), "Preference stored");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_chat_flags_parse() {
        let cli = Cli::try_parse_from([
            "colloquy", "--verbose", "chat", "--engine-id", "agent-7", "--lang", "it-IT",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Chat { engine_id, lang } => {
                assert_eq!(engine_id.as_deref(), Some("agent-7"));
                assert_eq!(lang.as_deref(), Some("it-IT"));
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn test_prefs_set_takes_key_and_value() {
        let cli = Cli::try_parse_from(["colloquy", "prefs", "set", "muteSpeaker", "true"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Prefs { action: PrefsAction::Set { ref key, ref value } }
                if key == "muteSpeaker" && value == "true"
        ));
    }
}
