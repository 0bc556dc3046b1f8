use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credentials and identity facts used when opening a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
}

impl AuthContext {
    pub fn has_credentials(&self) -> bool {
        self.secret.as_deref().is_some_and(|s| !s.is_empty())
            || self.login_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// The live conversation with the dialog engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub engine_id: String,
    /// Native language of the agent.
    pub language: String,
    /// Language the user reads and speaks, when different from the agent's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_language: Option<String>,
    #[serde(default)]
    pub auth: AuthContext,
    pub opened_at: DateTime<Utc>,
}

impl Session {
    /// Language used for display, speech, and recognition.
    pub fn effective_user_language(&self) -> &str {
        self.user_language.as_deref().unwrap_or(&self.language)
    }
}

/// Compare two language tags on their primary subtag (`it-IT` == `it`).
pub fn same_language(a: &str, b: &str) -> bool {
    let primary = |tag: &str| {
        tag.split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    };
    primary(a) == primary(b)
}

/// A hint string paired with its original, untranslated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedHint {
    pub text: String,
    pub original: String,
}

/// Media attached to a message, either by the user or by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Conversation state reported by the dialog engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogState {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_emission: Option<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub translated_hints: Vec<TranslatedHint>,
    #[serde(default)]
    pub accepts_timeout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub context_vars: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitter: Option<String>,
    #[serde(default)]
    pub media: Vec<Media>,
    #[serde(default)]
    pub generated_by_ai: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_answered: Option<String>,
}

impl DialogState {
    /// Emission as shown to the user: translated when available.
    pub fn display_emission(&self) -> Option<&str> {
        self.translated_emission
            .as_deref()
            .or(self.emission.as_deref())
    }
}

/// One entry of the append-only chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    pub from_user: bool,
    #[serde(default)]
    pub media: Vec<Media>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub generated_by_ai: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_answered: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emitter: Option<String>,
}

impl Message {
    pub fn from_user(text: impl Into<String>, media: Vec<Media>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            translated_text: None,
            from_user: true,
            media,
            timestamp: Utc::now(),
            generated_by_ai: false,
            question_answered: None,
            emitter: None,
        }
    }

    /// Build the agent message for a settled dialog state.
    pub fn from_agent(state: &DialogState) -> Self {
        let text = state.emission.clone().unwrap_or_default();
        let translated_text = state
            .translated_emission
            .clone()
            .filter(|t| t != &text);
        Self {
            id: Uuid::new_v4(),
            text,
            translated_text,
            from_user: false,
            media: state.media.clone(),
            timestamp: Utc::now(),
            generated_by_ai: state.generated_by_ai,
            question_answered: state.question_answered.clone(),
            emitter: state.emitter.clone(),
        }
    }

    pub fn display_text(&self) -> &str {
        self.translated_text.as_deref().unwrap_or(&self.text)
    }
}

/// Raw viseme event as delivered by the synthesis provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisemeEvent {
    pub viseme_id: u32,
    /// Audio offset in 100-ns ticks.
    pub audio_offset_ticks: u64,
}

/// A timed blend-shape target derived from consecutive viseme events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedViseme {
    pub blend_shape: String,
    pub start_seconds: f64,
    pub duration_seconds: f64,
    pub weight: f64,
}

impl ProcessedViseme {
    pub fn end_seconds(&self) -> f64 {
        self.start_seconds + self.duration_seconds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechJobStatus {
    Queued,
    Synthesizing,
    Decoding,
    Playing,
    Done,
    Failed,
}

/// One utterance being turned into audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechJob {
    pub id: u64,
    pub utterance_text: String,
    /// Voice name selected for the utterance language.
    pub language_voice: String,
    pub status: SpeechJobStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MicrophoneMode {
    #[default]
    HoldToTalk,
    Continuous,
}

/// Parameters for opening a dialog session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenParams {
    pub engine_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_language: Option<String>,
    #[serde(default)]
    pub auth: AuthContext,
    #[serde(default)]
    pub initial_context_vars: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_question: Option<String>,
    #[serde(default)]
    pub additional_info: HashMap<String, String>,
    /// Keep the chat history instead of clearing it on success.
    #[serde(default)]
    pub preserve_history: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_language_compares_primary_subtag() {
        assert!(same_language("it-IT", "it"));
        assert!(same_language("EN_us", "en-GB"));
        assert!(!same_language("en", "it"));
    }

    #[test]
    fn test_agent_message_keeps_original_text() {
        let state = DialogState {
            state: "R1".into(),
            emission: Some("Ciao!".into()),
            translated_emission: Some("Hello!".into()),
            ..Default::default()
        };
        let msg = Message::from_agent(&state);
        assert_eq!(msg.text, "Ciao!");
        assert_eq!(msg.translated_text.as_deref(), Some("Hello!"));
        assert_eq!(msg.display_text(), "Hello!");
        assert!(!msg.from_user);
    }

    #[test]
    fn test_agent_message_drops_identical_translation() {
        let state = DialogState {
            state: "R1".into(),
            emission: Some("Hi".into()),
            translated_emission: Some("Hi".into()),
            ..Default::default()
        };
        let msg = Message::from_agent(&state);
        assert!(msg.translated_text.is_none());
        assert_eq!(msg.display_text(), "Hi");
    }

    #[test]
    fn test_dialog_state_wire_names() {
        let json = r#"{
            "state": "R2",
            "previousState": "R1",
            "emission": "Anything else?",
            "hints": ["Yes", "No"],
            "acceptsTimeout": true,
            "timeoutSeconds": 30
        }"#;
        let state: DialogState = serde_json::from_str(json).unwrap();
        assert_eq!(state.previous_state.as_deref(), Some("R1"));
        assert!(state.accepts_timeout);
        assert_eq!(state.timeout_seconds, Some(30));
        assert_eq!(state.hints.len(), 2);
    }
}
