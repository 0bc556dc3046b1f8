use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Partial hypothesis while the user is still talking.
    Recognizing { text: String },
    /// Final transcript of one utterance.
    Recognized { text: String },
    Canceled { reason: String },
    SessionStopped,
}

/// Continuous speech recognition bound to a microphone stream.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Acquire the microphone and start continuous recognition.
    async fn start(&self, language: &str) -> anyhow::Result<mpsc::UnboundedReceiver<RecognitionEvent>>;

    /// Stop recognition and release the microphone.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Recognizer for hosts without a microphone.
pub struct UnavailableRecognizer;

#[async_trait]
impl SpeechRecognizer for UnavailableRecognizer {
    async fn start(&self, _language: &str) -> anyhow::Result<mpsc::UnboundedReceiver<RecognitionEvent>> {
        anyhow::bail!("speech recognition is not available on this host")
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
