//! Configuration loading and validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Colloquy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech: Option<SpeechConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub listening: Option<ListeningConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<TranslationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefs: Option<PrefsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Remote dialog engine and the agent it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub base_url: String,
    pub engine_id: String,
    /// Native language of the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Private agents need a secret or a login token to open a session.
    #[serde(default)]
    pub private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl EngineConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Voice name per language tag (e.g. `"it": "it-IT-ElsaNeural"`).
    #[serde(default)]
    pub voices: HashMap<String, String>,
    /// Terms rewritten to phonetic hints before synthesis.
    #[serde(default)]
    pub lexicon: HashMap<String, String>,
    /// Preview hosts never produce audio.
    #[serde(default)]
    pub preview: bool,
    /// Touch/mobile hosts where only compressed playback is reliable.
    #[serde(default)]
    pub constrained_platform: bool,
}

impl SpeechConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListeningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Seconds of silence before a continuous-mode transcript is sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuous_speech_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_min_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_max_seconds: Option<u64>,
    /// Fixed timeout replacing the randomized window and reading time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_chars_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl TranslationConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "colloquy_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::ColloquyError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Native language of the agent.
    pub fn agent_language(&self) -> String {
        self.engine
            .as_ref()
            .and_then(|e| e.language.clone())
            .unwrap_or_else(|| "en".to_string())
    }

    /// Key of the synthesis provider, if speech output is configured at all.
    pub fn speech_key(&self) -> Option<String> {
        self.speech.as_ref().and_then(|s| s.resolve_api_key())
    }

    pub fn continuous_speech_timeout(&self) -> Duration {
        Duration::from_secs(
            self.listening
                .as_ref()
                .and_then(|l| l.continuous_speech_timeout)
                .unwrap_or(2),
        )
    }

    /// Randomized base window of the interaction timeout, in seconds.
    pub fn timeout_window(&self) -> (u64, u64) {
        let t = self.timeout.as_ref();
        (
            t.and_then(|t| t.base_min_seconds).unwrap_or(25),
            t.and_then(|t| t.base_max_seconds).unwrap_or(40),
        )
    }

    pub fn forced_timeout(&self) -> Option<Duration> {
        self.timeout
            .as_ref()
            .and_then(|t| t.forced_seconds)
            .map(Duration::from_secs)
    }

    pub fn reading_chars_per_minute(&self) -> u32 {
        self.timeout
            .as_ref()
            .and_then(|t| t.reading_chars_per_minute)
            .filter(|c| *c > 0)
            .unwrap_or(1000)
    }

    pub fn translation_enabled(&self) -> bool {
        self.translation.as_ref().is_some_and(|t| t.enabled)
    }

    pub fn prefs_path(&self) -> PathBuf {
        self.prefs
            .as_ref()
            .and_then(|p| p.path.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("prefs.json"))
    }

    /// Get a config value by dotted path (e.g. "engine.base_url").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        match &self.engine {
            None => warnings.push("No dialog engine configured".to_string()),
            Some(engine) => {
                if engine.engine_id.trim().is_empty() {
                    errors.push("Engine id cannot be empty".to_string());
                }
                if engine.base_url.trim().is_empty() {
                    errors.push("Engine base_url cannot be empty".to_string());
                }
            }
        }

        if self.speech_key().is_none() {
            warnings.push("No speech provider key configured; speech output is disabled".to_string());
        }

        let (min, max) = self.timeout_window();
        if min > max {
            errors.push(format!(
                "Timeout window minimum ({min}s) exceeds maximum ({max}s)"
            ));
        }

        if self.translation_enabled()
            && self
                .translation
                .as_ref()
                .and_then(|t| t.base_url.as_ref())
                .is_none()
        {
            warnings.push("Translation enabled without a base_url; messages stay untranslated".to_string());
        }

        (warnings, errors)
    }

}

/// Base directory for Colloquy data: `~/.colloquy/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".colloquy")
}
