//! Dialog engine session API.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use colloquy_core::types::DialogState;

/// Request to open a new session on an engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub engine_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub initial_context_vars: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_question: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub additional_info: HashMap<String, String>,
}

/// Reply envelope shared by every engine call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineReply {
    pub result_code: i32,
    #[serde(default)]
    pub result_message: String,
    #[serde(default, rename = "sessionID", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, rename = "currentState", skip_serializing_if = "Option::is_none")]
    pub dialog_state: Option<DialogState>,
}

impl EngineReply {
    pub fn is_ok(&self) -> bool {
        self.result_code == 0
    }

    pub fn ok(dialog_state: DialogState) -> Self {
        Self {
            result_code: 0,
            result_message: "Ok".into(),
            session_id: None,
            dialog_state: Some(dialog_state),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            result_code: code,
            result_message: message.into(),
            session_id: None,
            dialog_state: None,
        }
    }
}

/// The remote conversational engine.
///
/// Transport failures are `Err`; engine-level failures come back as a reply
/// with a non-zero `result_code`.
#[async_trait]
pub trait DialogEngine: Send + Sync {
    /// Engine identifier used in logs.
    fn id(&self) -> &str;

    async fn open_session(&self, request: &OpenSessionRequest) -> anyhow::Result<EngineReply>;

    async fn post_text_entered(&self, session_id: &str, text: &str) -> anyhow::Result<EngineReply>;

    async fn post_timeout(&self, session_id: &str) -> anyhow::Result<EngineReply>;

    async fn get_session(&self, session_id: &str) -> anyhow::Result<EngineReply>;

    async fn close_session(&self, session_id: &str) -> anyhow::Result<()>;
}
