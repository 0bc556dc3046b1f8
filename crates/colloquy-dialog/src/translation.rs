//! Translation between the user's language and the agent's.
//!
//! Translation never blocks a turn: any failure degrades to the original text.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use colloquy_core::types::{same_language, DialogState, TranslatedHint};
use colloquy_providers::translate::Translator;

pub struct TranslationPipeline {
    translator: Option<Arc<dyn Translator>>,
    agent_language: String,
}

impl TranslationPipeline {
    /// Without a translator every call passes text through unchanged.
    pub fn new(translator: Option<Arc<dyn Translator>>, agent_language: &str) -> Self {
        Self {
            translator,
            agent_language: agent_language.to_string(),
        }
    }

    pub fn agent_language(&self) -> &str {
        &self.agent_language
    }

    fn translator_for(&self, other_language: &str) -> Option<&Arc<dyn Translator>> {
        if same_language(other_language, &self.agent_language) {
            None
        } else {
            self.translator.as_ref()
        }
    }

    async fn translate_or_original(
        translator: &dyn Translator,
        text: &str,
        from: &str,
        to: &str,
    ) -> String {
        match translator.translate(text, from, to).await {
            Ok(translated) if !translated.trim().is_empty() => translated,
            Ok(_) => {
                warn!(%from, %to, "Empty translation; keeping original text");
                text.to_string()
            }
            Err(e) => {
                warn!(%from, %to, error = %e, "Translation failed; keeping original text");
                text.to_string()
            }
        }
    }

    /// Translate user text into the agent's language.
    pub async fn to_agent(&self, text: &str, user_language: &str) -> String {
        match self.translator_for(user_language) {
            Some(translator) if !text.trim().is_empty() => {
                Self::translate_or_original(translator.as_ref(), text, user_language, &self.agent_language)
                    .await
            }
            _ => text.to_string(),
        }
    }

    /// Fill in the translated emission and hints for `target_language`.
    ///
    /// The emission and every hint are translated concurrently; the returned
    /// state is complete only once all of them have settled.
    pub async fn translate_dialog_state(
        &self,
        mut state: DialogState,
        target_language: &str,
    ) -> DialogState {
        let Some(translator) = self.translator_for(target_language) else {
            state.translated_emission = None;
            state.translated_hints.clear();
            return state;
        };
        let translator = translator.as_ref();
        let from = self.agent_language.as_str();

        let emission = async {
            match state.emission.as_deref() {
                Some(text) if !text.trim().is_empty() => Some(
                    Self::translate_or_original(translator, text, from, target_language).await,
                ),
                _ => None,
            }
        };
        let hints = join_all(state.hints.iter().map(|hint| async move {
            TranslatedHint {
                text: Self::translate_or_original(translator, hint, from, target_language).await,
                original: hint.clone(),
            }
        }));

        let (emission, hints) = futures::join!(emission, hints);
        debug!(target = %target_language, hints = hints.len(), "Dialog state translated");

        state.translated_emission = emission;
        state.translated_hints = hints;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    /// Prefixes the target language; fails on any text containing "boom".
    struct TagTranslator;

    #[async_trait]
    impl Translator for TagTranslator {
        async fn translate(&self, text: &str, _from: &str, to: &str) -> anyhow::Result<String> {
            // Later hints finish first, so ordering must come from the input.
            let delay = 50u64.saturating_sub(text.len() as u64);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if text.contains("boom") {
                anyhow::bail!("translation backend down");
            }
            Ok(format!("[{to}] {text}"))
        }
    }

    fn state() -> DialogState {
        DialogState {
            state: "R1".into(),
            emission: Some("Hello".into()),
            hints: vec!["Yes".into(), "No thanks".into(), "boom".into()],
            ..Default::default()
        }
    }

    fn pipeline() -> TranslationPipeline {
        TranslationPipeline::new(Some(Arc::new(TagTranslator)), "en")
    }

    #[tokio::test(start_paused = true)]
    async fn test_translates_emission_and_hints_in_order() {
        let translated = pipeline().translate_dialog_state(state(), "it-IT").await;
        assert_eq!(translated.translated_emission.as_deref(), Some("[it-IT] Hello"));
        let texts: Vec<_> = translated.translated_hints.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, ["[it-IT] Yes", "[it-IT] No thanks", "boom"]);
        assert_eq!(translated.translated_hints[1].original, "No thanks");
        assert_eq!(translated.emission.as_deref(), Some("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_emission_keeps_original() {
        let mut failing = state();
        failing.emission = Some("boom goes the dynamite".into());
        let translated = pipeline().translate_dialog_state(failing, "it").await;
        assert_eq!(
            translated.translated_emission.as_deref(),
            Some("boom goes the dynamite")
        );
    }

    #[tokio::test]
    async fn test_same_language_passes_through() {
        let translated = pipeline().translate_dialog_state(state(), "en-GB").await;
        assert!(translated.translated_emission.is_none());
        assert!(translated.translated_hints.is_empty());
        assert_eq!(pipeline().to_agent("Hi", "en").await, "Hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_to_agent() {
        assert_eq!(pipeline().to_agent("Ciao", "it").await, "[en] Ciao");
        let disabled = TranslationPipeline::new(None, "en");
        assert_eq!(disabled.to_agent("Ciao", "it").await, "Ciao");
    }
}
