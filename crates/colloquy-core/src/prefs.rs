//! Local key-value store for user preferences.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ColloquyError, Result};
use crate::types::MicrophoneMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrefKey {
    MuteSpeaker,
    MicrophoneMode,
    ContinuousSpeechTimeout,
    BirthDate,
    LoginToken,
    Position,
}

impl PrefKey {
    pub const ALL: [PrefKey; 6] = [
        PrefKey::MuteSpeaker,
        PrefKey::MicrophoneMode,
        PrefKey::ContinuousSpeechTimeout,
        PrefKey::BirthDate,
        PrefKey::LoginToken,
        PrefKey::Position,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PrefKey::MuteSpeaker => "muteSpeaker",
            PrefKey::MicrophoneMode => "microphoneMode",
            PrefKey::ContinuousSpeechTimeout => "continuousSpeechTimeout",
            PrefKey::BirthDate => "birthDate",
            PrefKey::LoginToken => "loginToken",
            PrefKey::Position => "position",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn get(&self, key: PrefKey) -> Result<Option<String>>;
    async fn set(&self, key: PrefKey, value: &str) -> Result<()>;
    async fn remove(&self, key: PrefKey) -> Result<()>;
}

/// Preferences kept as a single JSON object on disk.
pub struct JsonPrefsStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonPrefsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: RwLock::new(()),
        }
    }

    async fn load_map(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        if data.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&data)
            .map_err(|e| ColloquyError::Prefs(format!("corrupt preference file: {e}")))
    }

    async fn save_map(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(map)?;
        // Atomic write: write to temp then rename
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for JsonPrefsStore {
    async fn get(&self, key: PrefKey) -> Result<Option<String>> {
        let _guard = self.lock.read().await;
        Ok(self.load_map().await?.remove(key.as_str()))
    }

    async fn set(&self, key: PrefKey, value: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut map = self.load_map().await?;
        map.insert(key.as_str().to_string(), value.to_string());
        self.save_map(&map).await?;
        debug!(key = key.as_str(), "Saved preference");
        Ok(())
    }

    async fn remove(&self, key: PrefKey) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut map = self.load_map().await?;
        if map.remove(key.as_str()).is_some() {
            self.save_map(&map).await?;
        }
        Ok(())
    }
}

/// In-memory store for ephemeral hosts and tests.
#[derive(Default)]
pub struct MemoryPrefsStore {
    values: RwLock<HashMap<PrefKey, String>>,
}

impl MemoryPrefsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreferenceStore for MemoryPrefsStore {
    async fn get(&self, key: PrefKey) -> Result<Option<String>> {
        Ok(self.values.read().await.get(&key).cloned())
    }

    async fn set(&self, key: PrefKey, value: &str) -> Result<()> {
        self.values.write().await.insert(key, value.to_string());
        Ok(())
    }

    async fn remove(&self, key: PrefKey) -> Result<()> {
        self.values.write().await.remove(&key);
        Ok(())
    }
}

/// Typed snapshot of the stored preferences, read at session start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preferences {
    pub mute_speaker: bool,
    pub microphone_mode: MicrophoneMode,
    pub continuous_speech_timeout: Option<Duration>,
    pub birth_date: Option<NaiveDate>,
    pub login_token: Option<String>,
    pub position: Option<String>,
}

impl Preferences {
    pub async fn load(store: &dyn PreferenceStore) -> Result<Self> {
        let mut prefs = Self::default();

        if let Some(raw) = store.get(PrefKey::MuteSpeaker).await? {
            prefs.mute_speaker = parse_or_warn(PrefKey::MuteSpeaker, &raw, |s| s.parse().ok())
                .unwrap_or(false);
        }
        if let Some(raw) = store.get(PrefKey::MicrophoneMode).await? {
            prefs.microphone_mode = parse_or_warn(PrefKey::MicrophoneMode, &raw, |s| {
                serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
            })
            .unwrap_or_default();
        }
        if let Some(raw) = store.get(PrefKey::ContinuousSpeechTimeout).await? {
            prefs.continuous_speech_timeout =
                parse_or_warn(PrefKey::ContinuousSpeechTimeout, &raw, |s| {
                    s.parse::<u64>().ok().map(Duration::from_secs)
                });
        }
        if let Some(raw) = store.get(PrefKey::BirthDate).await? {
            prefs.birth_date = parse_or_warn(PrefKey::BirthDate, &raw, |s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
            });
        }
        prefs.login_token = store
            .get(PrefKey::LoginToken)
            .await?
            .filter(|t| !t.is_empty());
        prefs.position = store.get(PrefKey::Position).await?;

        Ok(prefs)
    }
}

fn parse_or_warn<T>(key: PrefKey, raw: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(key = key.as_str(), value = raw, "Ignoring unparsable preference");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_store_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPrefsStore::new(dir.path().join("nested").join("prefs.json"));

        assert_eq!(store.get(PrefKey::MuteSpeaker).await.unwrap(), None);
        store.set(PrefKey::MuteSpeaker, "true").await.unwrap();
        store.set(PrefKey::Position, "Rome").await.unwrap();
        assert_eq!(
            store.get(PrefKey::MuteSpeaker).await.unwrap().as_deref(),
            Some("true")
        );

        store.remove(PrefKey::MuteSpeaker).await.unwrap();
        assert_eq!(store.get(PrefKey::MuteSpeaker).await.unwrap(), None);

        let reopened = JsonPrefsStore::new(dir.path().join("nested").join("prefs.json"));
        assert_eq!(
            reopened.get(PrefKey::Position).await.unwrap().as_deref(),
            Some("Rome")
        );
    }

    #[tokio::test]
    async fn test_json_store_keys_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let store = JsonPrefsStore::new(path.clone());
        store
            .set(PrefKey::ContinuousSpeechTimeout, "3")
            .await
            .unwrap();

        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("continuousSpeechTimeout"));
    }

    #[tokio::test]
    async fn test_preferences_snapshot() {
        let store = MemoryPrefsStore::new();
        store.set(PrefKey::MuteSpeaker, "true").await.unwrap();
        store.set(PrefKey::MicrophoneMode, "continuous").await.unwrap();
        store
            .set(PrefKey::ContinuousSpeechTimeout, "4")
            .await
            .unwrap();
        store.set(PrefKey::BirthDate, "1990-05-17").await.unwrap();
        store.set(PrefKey::LoginToken, "").await.unwrap();

        let prefs = Preferences::load(&store).await.unwrap();
        assert!(prefs.mute_speaker);
        assert_eq!(prefs.microphone_mode, MicrophoneMode::Continuous);
        assert_eq!(prefs.continuous_speech_timeout, Some(Duration::from_secs(4)));
        assert_eq!(prefs.birth_date, NaiveDate::from_ymd_opt(1990, 5, 17));
        assert!(prefs.login_token.is_none());
    }

    #[tokio::test]
    async fn test_unparsable_values_fall_back() {
        let store = MemoryPrefsStore::new();
        store.set(PrefKey::MuteSpeaker, "maybe").await.unwrap();
        store.set(PrefKey::BirthDate, "17/05/1990").await.unwrap();

        let prefs = Preferences::load(&store).await.unwrap();
        assert!(!prefs.mute_speaker);
        assert!(prefs.birth_date.is_none());
    }

    #[test]
    fn test_pref_key_parse() {
        assert_eq!(PrefKey::parse("loginToken"), Some(PrefKey::LoginToken));
        assert_eq!(PrefKey::parse("nope"), None);
    }
}
