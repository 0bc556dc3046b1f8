use async_trait::async_trait;

/// Black-box text translation service.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, from: &str, to: &str) -> anyhow::Result<String>;
}
