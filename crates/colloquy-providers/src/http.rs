//! HTTP clients for the dialog engine and the translation service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use crate::engine::{DialogEngine, EngineReply, OpenSessionRequest};
use crate::translate::Translator;

/// Dialog engine reached over its JSON session API.
pub struct HttpDialogEngine {
    pub base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpDialogEngine {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<EngineReply> {
        let resp = self.authorize(builder).send().await?;
        let status = resp.status();

        // An unknown session may surface as an HTTP 404 instead of a result code.
        if status == reqwest::StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Ok(serde_json::from_str(&body)
                .unwrap_or_else(|_| EngineReply::error(404, "Session not found")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Dialog engine error {status}: {body}");
        }

        let reply: EngineReply = resp.json().await?;
        trace!(code = reply.result_code, "Engine reply");
        Ok(reply)
    }
}

#[async_trait]
impl DialogEngine for HttpDialogEngine {
    fn id(&self) -> &str {
        "http"
    }

    async fn open_session(&self, request: &OpenSessionRequest) -> anyhow::Result<EngineReply> {
        debug!(engine_id = %request.engine_id, "Opening engine session");
        self.send(self.client.post(self.url("Session")).json(request))
            .await
    }

    async fn post_text_entered(&self, session_id: &str, text: &str) -> anyhow::Result<EngineReply> {
        self.send(
            self.client
                .post(self.url(&format!("TextEnteredEvent/{session_id}")))
                .json(&json!({ "text": text })),
        )
        .await
    }

    async fn post_timeout(&self, session_id: &str) -> anyhow::Result<EngineReply> {
        self.send(
            self.client
                .post(self.url(&format!("TimeoutEvent/{session_id}")))
                .json(&json!({})),
        )
        .await
    }

    async fn get_session(&self, session_id: &str) -> anyhow::Result<EngineReply> {
        self.send(self.client.get(self.url(&format!("Session/{session_id}"))))
            .await
    }

    async fn close_session(&self, session_id: &str) -> anyhow::Result<()> {
        let reply = self
            .send(self.client.delete(self.url(&format!("Session/{session_id}"))))
            .await?;
        if !reply.is_ok() {
            debug!(code = reply.result_code, "Engine refused session close");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

/// Translator speaking the LibreTranslate `/translate` protocol.
pub struct HttpTranslator {
    pub base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTranslator {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

/// Primary subtag, which is what translation backends expect.
fn primary_subtag(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or(tag)
        .to_ascii_lowercase()
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, from: &str, to: &str) -> anyhow::Result<String> {
        let source = primary_subtag(from);
        let target = primary_subtag(to);
        let body = TranslateRequest {
            q: text,
            source: &source,
            target: &target,
            format: "text",
            api_key: self.api_key.as_deref(),
        };

        let resp = self
            .client
            .post(format!("{}/translate", self.base_url))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Translation API error {status}: {body}");
        }

        let parsed: TranslateResponse = resp.json().await?;
        Ok(parsed.translated_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_urls() {
        let engine = HttpDialogEngine::new("https://engine.example/api/v2/", None);
        assert_eq!(engine.base_url, "https://engine.example/api/v2");
        assert_eq!(
            engine.url("TextEnteredEvent/s-1"),
            "https://engine.example/api/v2/TextEnteredEvent/s-1"
        );
    }

    #[test]
    fn test_translate_request_shape() {
        let body = TranslateRequest {
            q: "Ciao",
            source: "it",
            target: "en",
            format: "text",
            api_key: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["q"], "Ciao");
        assert_eq!(json["target"], "en");
        assert!(json.get("api_key").is_none());

        let resp: TranslateResponse =
            serde_json::from_str(r#"{ "translatedText": "Hello" }"#).unwrap();
        assert_eq!(resp.translated_text, "Hello");
    }

    #[test]
    fn test_primary_subtag() {
        assert_eq!(primary_subtag("it-IT"), "it");
        assert_eq!(primary_subtag("EN"), "en");
    }
}
