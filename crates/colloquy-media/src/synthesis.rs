//! Speech synthesis controller.
//!
//! Owns the single active speech job. Starting a job always cancels and
//! cleans up the previous one first; a superseded job may keep running until
//! its own task notices, but it no longer owns the audio, animation, or
//! speaking flag and its output is discarded.
//!
//! Everything that touches the shared pipeline (synthesizer, animation,
//! speaking flag, recognizer hand-off) happens while holding the
//! `resources` lock, so ownership cannot change halfway through a step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use colloquy_core::config::Config;
use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::events::{EventBus, WidgetEvent};
use colloquy_core::types::{SpeechJob, SpeechJobStatus, VisemeEvent};
use colloquy_providers::speech::{
    AudioContextState, AudioFormat, AudioOutput, NativeSpeech, SpeechSynthesizer,
    SynthesisRequest,
};

use crate::animation::{spawn_frame_loop, AnimationDriver, Clock, WeightSink};
use crate::listening::ListeningController;
use crate::text::{apply_lexicon, build_ssml, normalize_for_speech};
use crate::viseme::process_queue;

/// Job id reported in `SpeechEnded` when no job was started.
pub const NO_JOB: u64 = 0;

const DEFAULT_VOICE: &str = "en-US-JennyNeural";

/// How long to keep collecting visemes after the audio has been delivered.
const VISEME_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct SpeechSettings {
    /// False without a provider key or in preview mode.
    pub enabled: bool,
    pub voices: HashMap<String, String>,
    pub lexicon: HashMap<String, String>,
    pub constrained_platform: bool,
}

impl SpeechSettings {
    pub fn from_config(config: &Config) -> Self {
        let speech = config.speech.clone().unwrap_or_default();
        Self {
            enabled: config.speech_key().is_some() && !speech.preview,
            voices: speech.voices,
            lexicon: speech.lexicon,
            constrained_platform: speech.constrained_platform,
        }
    }

    /// Voice for a language: full tag, then primary subtag, then the default.
    pub fn voice_for(&self, language: &str) -> String {
        self.voices
            .get(language)
            .or_else(|| {
                let primary = language.split(['-', '_']).next()?;
                self.voices.get(primary)
            })
            .cloned()
            .unwrap_or_else(|| DEFAULT_VOICE.to_string())
    }
}

/// Platform collaborators needed to actually produce audio.
#[derive(Clone)]
pub struct SpeechBackend {
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub audio: Arc<dyn AudioOutput>,
    pub native: Option<Arc<dyn NativeSpeech>>,
    pub weights: Arc<dyn WeightSink>,
}

struct ActiveJob {
    job: SpeechJob,
    cancel: CancellationToken,
}

/// Single owner of the speech pipeline: at most one job holds it at a time.
#[derive(Default)]
pub struct SpeechResources {
    next_id: u64,
    current: Option<ActiveJob>,
}

impl SpeechResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership for a new job, cancelling the previous owner.
    ///
    /// Returns the new job and whether a previous job was displaced.
    pub fn acquire(&mut self, utterance_text: &str, language_voice: &str) -> (SpeechJob, CancellationToken, bool) {
        let displaced = self.cancel_current().is_some();
        self.next_id += 1;
        let job = SpeechJob {
            id: self.next_id,
            utterance_text: utterance_text.to_string(),
            language_voice: language_voice.to_string(),
            status: SpeechJobStatus::Queued,
        };
        let cancel = CancellationToken::new();
        self.current = Some(ActiveJob {
            job: job.clone(),
            cancel: cancel.clone(),
        });
        (job, cancel, displaced)
    }

    /// Release ownership. Only the current owner can release; repeated calls are no-ops.
    pub fn release(&mut self, job_id: u64) -> bool {
        if self.is_owner(job_id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    pub fn is_owner(&self, job_id: u64) -> bool {
        self.current.as_ref().is_some_and(|c| c.job.id == job_id)
    }

    pub fn set_status(&mut self, job_id: u64, status: SpeechJobStatus) {
        if let Some(current) = self.current.as_mut().filter(|c| c.job.id == job_id) {
            current.job.status = status;
        }
    }

    /// Cancel and drop the current job, returning its id.
    pub fn cancel_current(&mut self) -> Option<u64> {
        let current = self.current.take()?;
        current.cancel.cancel();
        Some(current.job.id)
    }

    pub fn current(&self) -> Option<SpeechJob> {
        self.current.as_ref().map(|c| c.job.clone())
    }
}

struct AudioClock(Arc<dyn AudioOutput>);

impl Clock for AudioClock {
    fn now(&self) -> f64 {
        self.0.current_time()
    }
}

enum JobEnd {
    Completed,
    Superseded,
}

pub struct SpeechController {
    settings: SpeechSettings,
    backend: Option<SpeechBackend>,
    animation: Option<Arc<Mutex<AnimationDriver>>>,
    listening: Arc<ListeningController>,
    bus: EventBus,
    resources: Mutex<SpeechResources>,
    language: RwLock<String>,
    muted: AtomicBool,
    speaking: watch::Sender<bool>,
}

impl SpeechController {
    pub fn new(
        settings: SpeechSettings,
        backend: Option<SpeechBackend>,
        listening: Arc<ListeningController>,
        bus: EventBus,
        language: &str,
    ) -> Self {
        let animation = backend
            .as_ref()
            .map(|b| Arc::new(Mutex::new(AnimationDriver::new(Arc::clone(&b.weights)))));
        let (speaking, _) = watch::channel(false);
        Self {
            settings,
            backend,
            animation,
            listening,
            bus,
            resources: Mutex::new(SpeechResources::new()),
            language: RwLock::new(language.to_string()),
            muted: AtomicBool::new(false),
            speaking,
        }
    }

    pub async fn set_language(&self, language: &str) {
        *self.language.write().await = language.to_string();
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Muting also silences the utterance currently playing.
    pub async fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        if muted {
            self.stop_audio().await;
        }
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    /// Resolve once no utterance is playing.
    pub async fn wait_idle(&self) {
        let mut rx = self.speaking.subscribe();
        let _ = rx.wait_for(|speaking| !*speaking).await;
    }

    pub async fn current_job(&self) -> Option<SpeechJob> {
        self.resources.lock().await.current()
    }

    /// Whether a lip-sync timeline is loaded.
    pub async fn is_animating(&self) -> bool {
        match &self.animation {
            Some(animation) => animation.lock().await.is_running(),
            None => false,
        }
    }

    /// Speak an agent utterance, replacing whatever is playing.
    ///
    /// Returns the id of the started job, or `None` when no audio is produced.
    pub async fn speak(self: &Arc<Self>, text: &str) -> Option<u64> {
        let backend = match &self.backend {
            Some(backend) if self.settings.enabled => backend.clone(),
            _ => {
                debug!("Speech output disabled");
                self.bus.emit(WidgetEvent::SpeechEnded { job: NO_JOB });
                return None;
            }
        };

        self.listening.stop().await;

        if self.is_muted() {
            debug!("Speaker muted; skipping synthesis");
            self.bus.emit(WidgetEvent::SpeechEnded { job: NO_JOB });
            self.rearm_listening().await;
            return None;
        }

        let text = apply_lexicon(&normalize_for_speech(text), &self.settings.lexicon);
        if text.is_empty() {
            self.bus.emit(WidgetEvent::SpeechEnded { job: NO_JOB });
            self.rearm_listening().await;
            return None;
        }

        let language = self.language.read().await.clone();
        let voice = self.settings.voice_for(&language);

        let (job, cancel) = {
            let mut resources = self.resources.lock().await;
            let (job, cancel, displaced) = resources.acquire(&text, &voice);
            if displaced {
                self.release_pipeline(&backend).await;
            }
            // A re-arm that raced the acquire may have restarted the recognizer.
            self.listening.stop().await;
            self.speaking.send_replace(true);
            (job, cancel)
        };
        let job_id = job.id;
        info!(job = job_id, %voice, chars = text.len(), "Speech job queued");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_job(backend, job, cancel, language).await;
        });
        Some(job_id)
    }

    /// Stop the current utterance, if any. Safe to call when idle.
    pub async fn stop_audio(&self) {
        let mut resources = self.resources.lock().await;
        let Some(job) = resources.cancel_current() else {
            return;
        };
        debug!(job, "Stopping speech");
        if let Some(backend) = &self.backend {
            self.release_pipeline(backend).await;
        }
        self.speaking.send_replace(false);
        self.bus.emit(WidgetEvent::SpeechEnded { job });
    }

    /// Hand the turn to the user: stop any utterance, then start listening.
    ///
    /// Both steps run under the pipeline lock, so a `speak` issued meanwhile
    /// either lands before (and is stopped) or after (and stops listening).
    pub async fn start_listening(&self) -> Result<()> {
        let mut resources = self.resources.lock().await;
        if let Some(job) = resources.cancel_current() {
            debug!(job, "Stopping speech for listening");
            if let Some(backend) = &self.backend {
                self.release_pipeline(backend).await;
            }
            self.speaking.send_replace(false);
            self.bus.emit(WidgetEvent::SpeechEnded { job });
        }
        self.listening.start().await
    }

    /// Unlock audio after a user gesture; constrained platforms refuse to
    /// start an audio context without one.
    pub async fn on_user_gesture(&self) -> Result<()> {
        match &self.backend {
            Some(backend) => ensure_audio_ready(backend.audio.as_ref()).await,
            None => Ok(()),
        }
    }

    async fn run_job(
        self: Arc<Self>,
        backend: SpeechBackend,
        job: SpeechJob,
        cancel: CancellationToken,
        language: String,
    ) {
        let outcome = self.play_job(&backend, &job, &cancel, &language).await;
        match outcome {
            Ok(JobEnd::Completed) => {
                self.set_status(job.id, SpeechJobStatus::Done).await;
                debug!(job = job.id, "Speech job completed");
            }
            Ok(JobEnd::Superseded) => {
                debug!(job = job.id, "Speech job superseded");
                return;
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!(job = job.id, error = %e, "Speech job failed; falling back to native speech");
                self.set_status(job.id, SpeechJobStatus::Failed).await;
                if let Some(native) = &backend.native {
                    if let Err(e) = native.speak(&job.utterance_text, &language).await {
                        warn!(job = job.id, error = %e, "Native speech failed");
                    }
                }
            }
        }
        self.finish_job(&backend, job.id).await;
    }

    async fn play_job(
        &self,
        backend: &SpeechBackend,
        job: &SpeechJob,
        cancel: &CancellationToken,
        language: &str,
    ) -> Result<JobEnd> {
        ensure_audio_ready(backend.audio.as_ref()).await?;

        self.set_status(job.id, SpeechJobStatus::Synthesizing).await;
        let request = SynthesisRequest {
            ssml: build_ssml(&job.utterance_text, &job.language_voice, language),
            voice: job.language_voice.clone(),
            format: AudioFormat::for_platform(self.settings.constrained_platform),
        };
        let (viseme_tx, mut viseme_rx) = mpsc::unbounded_channel();
        let audio = tokio::select! {
            _ = cancel.cancelled() => return Ok(JobEnd::Superseded),
            result = backend.synthesizer.synthesize(&request, viseme_tx) => {
                result.map_err(|e| ColloquyError::Synthesis(e.to_string()))?
            }
        };

        // Providers may still be delivering visemes alongside the audio;
        // collect until they drop the sender.
        let events = tokio::select! {
            _ = cancel.cancelled() => return Ok(JobEnd::Superseded),
            events = drain_visemes(&mut viseme_rx) => events,
        };
        let timeline = process_queue(&events);

        self.set_status(job.id, SpeechJobStatus::Decoding).await;
        let decoded = tokio::select! {
            _ = cancel.cancelled() => return Ok(JobEnd::Superseded),
            result = backend.audio.decode(&audio) => {
                result.map_err(|e| ColloquyError::Playback(e.to_string()))?
            }
        };

        {
            let mut resources = self.resources.lock().await;
            if !resources.is_owner(job.id) {
                return Ok(JobEnd::Superseded);
            }
            if let Some(animation) = &self.animation {
                let generation = animation
                    .lock()
                    .await
                    .start(timeline, backend.audio.current_time());
                spawn_frame_loop(
                    Arc::clone(animation),
                    generation,
                    Arc::new(AudioClock(Arc::clone(&backend.audio))),
                    cancel.clone(),
                );
            }
            resources.set_status(job.id, SpeechJobStatus::Playing);
        }
        info!(job = job.id, duration_ms = decoded.duration.as_millis() as u64, "Speech started");
        self.bus.emit(WidgetEvent::SpeechStarted { job: job.id });

        backend
            .audio
            .play(decoded, cancel.clone())
            .await
            .map_err(|e| ColloquyError::Playback(e.to_string()))?;

        if cancel.is_cancelled() {
            Ok(JobEnd::Superseded)
        } else {
            Ok(JobEnd::Completed)
        }
    }

    /// Runs at most once per job: only the owner gets past `release`, and it
    /// keeps the lock until the pipeline is torn down.
    async fn finish_job(&self, backend: &SpeechBackend, job_id: u64) {
        {
            let mut resources = self.resources.lock().await;
            if !resources.release(job_id) {
                return;
            }
            self.release_pipeline(backend).await;
            self.speaking.send_replace(false);
            self.bus.emit(WidgetEvent::SpeechEnded { job: job_id });
        }
        self.rearm_listening().await;
    }

    async fn release_pipeline(&self, backend: &SpeechBackend) {
        if let Err(e) = backend.synthesizer.close().await {
            warn!(error = %e, "Failed to close synthesizer");
        }
        if let Some(animation) = &self.animation {
            animation.lock().await.clear();
        }
    }

    async fn set_status(&self, job_id: u64, status: SpeechJobStatus) {
        self.resources.lock().await.set_status(job_id, status);
    }

    /// Restart continuous listening, unless a new utterance already owns the turn.
    async fn rearm_listening(&self) {
        if !self.listening.is_continuous().await {
            return;
        }
        let resources = self.resources.lock().await;
        if let Some(job) = resources.current() {
            debug!(job = job.id, "Speech in progress; listening stays off");
            return;
        }
        // The controller reports its own failures on the bus.
        if let Err(e) = self.listening.start().await {
            debug!(error = %e, "Continuous listening not re-armed");
        }
    }
}

async fn drain_visemes(rx: &mut mpsc::UnboundedReceiver<VisemeEvent>) -> Vec<VisemeEvent> {
    let mut events = Vec::new();
    let drained = tokio::time::timeout(VISEME_DRAIN_GRACE, async {
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
    })
    .await;
    if drained.is_err() {
        warn!(received = events.len(), "Viseme stream still open after audio delivery; using what arrived");
    }
    events
}

async fn ensure_audio_ready(audio: &dyn AudioOutput) -> Result<()> {
    match audio.state() {
        AudioContextState::Running => Ok(()),
        AudioContextState::Suspended | AudioContextState::Interrupted => {
            debug!("Resuming audio context");
            if let Err(e) = audio.resume().await {
                warn!(error = %e, "Resume failed; recreating audio context");
                audio
                    .recreate()
                    .await
                    .map_err(|e| ColloquyError::Playback(e.to_string()))?;
            }
            Ok(())
        }
        AudioContextState::Closed => {
            debug!("Recreating closed audio context");
            audio
                .recreate()
                .await
                .map_err(|e| ColloquyError::Playback(e.to_string()))
        }
    }
}
