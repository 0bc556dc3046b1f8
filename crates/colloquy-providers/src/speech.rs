//! Speech synthesis provider and platform audio abstractions.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use colloquy_core::types::VisemeEvent;

/// Output format requested from the synthesis provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    Riff24Khz16BitMonoPcm,
    Audio24Khz48KBitRateMonoMp3,
}

impl AudioFormat {
    /// Constrained platforms only play compressed audio reliably.
    pub fn for_platform(constrained: bool) -> Self {
        if constrained {
            Self::Audio24Khz48KBitRateMonoMp3
        } else {
            Self::Riff24Khz16BitMonoPcm
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Riff24Khz16BitMonoPcm => "riff-24khz-16bit-mono-pcm",
            Self::Audio24Khz48KBitRateMonoMp3 => "audio-24khz-48kbitrate-mono-mp3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub ssml: String,
    pub voice: String,
    pub format: AudioFormat,
}

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

/// Audio decoded by the platform audio context, ready to play.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub data: Vec<u8>,
    pub duration: Duration,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize an utterance.
    ///
    /// Viseme events are pushed to `visemes` while synthesis runs and may
    /// keep arriving alongside the returned audio. Drop the sender (and any
    /// clones) after the last event; the caller waits for that, up to a short
    /// grace period, before building the lip-sync timeline.
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        visemes: mpsc::UnboundedSender<VisemeEvent>,
    ) -> anyhow::Result<SynthesizedAudio>;

    /// Release provider-side resources held for the last utterance.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContextState {
    Running,
    Suspended,
    /// Interrupted by the platform (incoming call, backgrounded tab).
    Interrupted,
    Closed,
}

/// The platform audio context: decoding, playback, and the audio clock.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    fn state(&self) -> AudioContextState;

    async fn resume(&self) -> anyhow::Result<()>;

    /// Replace a closed or unrecoverable context with a fresh one.
    async fn recreate(&self) -> anyhow::Result<()>;

    async fn decode(&self, audio: &SynthesizedAudio) -> anyhow::Result<DecodedAudio>;

    /// Play until the audio ends or `cancel` fires.
    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Current position of the audio clock in seconds.
    fn current_time(&self) -> f64;
}

/// Platform text-to-speech used when provider synthesis fails.
#[async_trait]
pub trait NativeSpeech: Send + Sync {
    async fn speak(&self, text: &str, language: &str) -> anyhow::Result<()>;
}
