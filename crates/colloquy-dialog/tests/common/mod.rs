//! Scripted collaborators shared by the orchestration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use colloquy_core::events::{EventBus, WidgetEvent};
use colloquy_core::prefs::MemoryPrefsStore;
use colloquy_core::types::{DialogState, OpenParams};
use colloquy_dialog::{Collaborators, DialogSessionManager, ManagerSettings, TimeoutSettings};
use colloquy_core::types::VisemeEvent;
use colloquy_media::animation::WeightSink;
use colloquy_media::synthesis::{SpeechBackend, SpeechSettings};
use colloquy_providers::engine::{DialogEngine, EngineReply, OpenSessionRequest};
use colloquy_providers::recognition::{RecognitionEvent, SpeechRecognizer, UnavailableRecognizer};
use colloquy_providers::speech::{
    AudioContextState, AudioOutput, DecodedAudio, SpeechSynthesizer, SynthesisRequest,
    SynthesizedAudio,
};
use colloquy_providers::translate::Translator;

pub fn state(emission: &str, accepts_timeout: bool) -> DialogState {
    DialogState {
        state: "R1".into(),
        emission: Some(emission.into()),
        accepts_timeout,
        ..Default::default()
    }
}

pub struct FakeEngine {
    pub opens: AtomicUsize,
    pub open_requests: Mutex<Vec<OpenSessionRequest>>,
    pub posts: Mutex<Vec<(String, String)>>,
    pub timeouts: AtomicUsize,
    pub closes: AtomicUsize,
    pub lookups: AtomicUsize,
    pub fail_open: AtomicBool,
    /// Session lookups report the session as expired.
    pub forget_sessions: AtomicBool,
    pub welcome: DialogState,
    pub timeout_reply: DialogState,
    pub post_replies: Mutex<VecDeque<EngineReply>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            open_requests: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
            timeouts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            forget_sessions: AtomicBool::new(false),
            welcome: state("Welcome!", false),
            timeout_reply: state("Are you still there?", false),
            post_replies: Mutex::new(VecDeque::new()),
        }
    }
}

impl FakeEngine {
    /// Queue a reply for the next `post_text_entered`; unqueued posts echo.
    pub fn script_post(&self, reply: EngineReply) {
        self.post_replies.lock().unwrap().push_back(reply);
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogEngine for FakeEngine {
    fn id(&self) -> &str {
        "fake"
    }

    async fn open_session(&self, request: &OpenSessionRequest) -> anyhow::Result<EngineReply> {
        if self.fail_open.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        self.open_requests.lock().unwrap().push(request.clone());
        let mut reply = EngineReply::ok(self.welcome.clone());
        reply.session_id = Some(format!("s-{n}"));
        Ok(reply)
    }

    async fn post_text_entered(&self, session_id: &str, text: &str) -> anyhow::Result<EngineReply> {
        self.posts
            .lock()
            .unwrap()
            .push((session_id.to_string(), text.to_string()));
        let scripted = self.post_replies.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| EngineReply::ok(state(&format!("You said: {text}"), false))))
    }

    async fn post_timeout(&self, _session_id: &str) -> anyhow::Result<EngineReply> {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        Ok(EngineReply::ok(self.timeout_reply.clone()))
    }

    async fn get_session(&self, _session_id: &str) -> anyhow::Result<EngineReply> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.forget_sessions.load(Ordering::SeqCst) {
            return Ok(EngineReply::error(404, "Session not found"));
        }
        Ok(EngineReply::ok(self.welcome.clone()))
    }

    async fn close_session(&self, _session_id: &str) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Prefixes the target language, or fails every call.
#[derive(Default)]
pub struct FakeTranslator {
    pub fail: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(&self, text: &str, _from: &str, to: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("translation backend down");
        }
        Ok(format!("[{to}] {text}"))
    }
}

pub fn settings() -> ManagerSettings {
    ManagerSettings {
        engine_id: "agent-1".into(),
        agent_language: "en".into(),
        private: false,
        min_age: None,
        speech: SpeechSettings::default(),
        listening_language: None,
        continuous_speech_timeout: Duration::from_secs(2),
        timeout: TimeoutSettings {
            forced: Some(Duration::from_secs(30)),
            ..Default::default()
        },
    }
}

pub struct Harness {
    pub manager: Arc<DialogSessionManager>,
    pub engine: Arc<FakeEngine>,
    pub prefs: Arc<MemoryPrefsStore>,
}

pub fn harness(
    settings: ManagerSettings,
    engine: FakeEngine,
    translator: Option<FakeTranslator>,
) -> Harness {
    let engine = Arc::new(engine);
    let prefs = Arc::new(MemoryPrefsStore::new());
    let manager = DialogSessionManager::new(
        settings,
        Collaborators {
            engine: engine.clone(),
            translator: translator.map(|t| Arc::new(t) as Arc<dyn Translator>),
            prefs: prefs.clone(),
            recognizer: Arc::new(UnavailableRecognizer),
            speech: None,
        },
        EventBus::new(),
    );
    Harness {
        manager,
        engine,
        prefs,
    }
}

/// Takes 100ms per utterance and reports two visemes.
#[derive(Default)]
pub struct FakeSynth {
    pub requests: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize(
        &self,
        request: &SynthesisRequest,
        visemes: mpsc::UnboundedSender<VisemeEvent>,
    ) -> anyhow::Result<SynthesizedAudio> {
        self.requests.lock().unwrap().push(request.ssml.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = visemes.send(VisemeEvent { viseme_id: 1, audio_offset_ticks: 0 });
        let _ = visemes.send(VisemeEvent { viseme_id: 21, audio_offset_ticks: 2_000_000 });
        Ok(SynthesizedAudio {
            data: request.ssml.clone().into_bytes(),
            format: request.format,
        })
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Every utterance plays for 500ms unless cancelled.
pub struct FakeAudio {
    pub played: Mutex<Vec<String>>,
    origin: tokio::time::Instant,
}

impl Default for FakeAudio {
    fn default() -> Self {
        Self {
            played: Mutex::new(Vec::new()),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl FakeAudio {
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioOutput for FakeAudio {
    fn state(&self) -> AudioContextState {
        AudioContextState::Running
    }

    async fn resume(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn recreate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn decode(&self, audio: &SynthesizedAudio) -> anyhow::Result<DecodedAudio> {
        Ok(DecodedAudio {
            data: audio.data.clone(),
            duration: Duration::from_millis(500),
        })
    }

    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> anyhow::Result<()> {
        self.played
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&audio.data).into_owned());
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(audio.duration) => {}
        }
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

pub struct NullSink;

impl WeightSink for NullSink {
    fn set_weight(&self, _blend_shape: &str, _weight: f64) {}
}

/// Tracks how many recognition sessions are live at once.
#[derive(Default)]
pub struct FakeRecognizer {
    pub starts: AtomicUsize,
    live: AtomicUsize,
    pub max_live: AtomicUsize,
    senders: Mutex<Vec<mpsc::UnboundedSender<RecognitionEvent>>>,
}

impl FakeRecognizer {
    pub fn emit(&self, event: RecognitionEvent) {
        if let Some(tx) = self.senders.lock().unwrap().last() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn start(&self, _language: &str) -> anyhow::Result<mpsc::UnboundedReceiver<RecognitionEvent>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(())
    }
}

pub struct SpeechHarness {
    pub manager: Arc<DialogSessionManager>,
    pub engine: Arc<FakeEngine>,
    pub synth: Arc<FakeSynth>,
    pub audio: Arc<FakeAudio>,
    pub recognizer: Arc<FakeRecognizer>,
}

/// Like [`harness`], with speech output and recognition backed by fakes.
pub fn speech_harness(mut settings: ManagerSettings, engine: FakeEngine) -> SpeechHarness {
    settings.speech.enabled = true;
    let engine = Arc::new(engine);
    let synth = Arc::new(FakeSynth::default());
    let audio = Arc::new(FakeAudio::default());
    let recognizer = Arc::new(FakeRecognizer::default());
    let manager = DialogSessionManager::new(
        settings,
        Collaborators {
            engine: engine.clone(),
            translator: None,
            prefs: Arc::new(MemoryPrefsStore::new()),
            recognizer: recognizer.clone(),
            speech: Some(SpeechBackend {
                synthesizer: synth.clone(),
                audio: audio.clone(),
                native: None,
                weights: Arc::new(NullSink),
            }),
        },
        EventBus::new(),
    );
    SpeechHarness {
        manager,
        engine,
        synth,
        audio,
        recognizer,
    }
}

pub fn params() -> OpenParams {
    OpenParams {
        engine_id: "agent-1".into(),
        ..Default::default()
    }
}

pub fn drain(rx: &mut broadcast::Receiver<WidgetEvent>) -> Vec<WidgetEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn toasts(events: &[WidgetEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, WidgetEvent::Toast { .. }))
        .count()
}
