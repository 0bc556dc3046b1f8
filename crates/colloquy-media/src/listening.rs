//! Listening controller: continuous recognition with silence-based submission.
//!
//! At most one recognition session is live. Recognized utterances accumulate
//! into a draft; in continuous mode a silence timer submits the draft through
//! the channel returned by [`ListeningController::new`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::events::{EventBus, ToastLevel, WidgetEvent};
use colloquy_providers::recognition::{RecognitionEvent, SpeechRecognizer};

use crate::text::dedupe_stutter;

#[derive(Debug, Clone)]
pub struct ListeningSettings {
    pub language: String,
    pub continuous: bool,
    pub silence_timeout: Duration,
}

#[derive(Default)]
struct ListeningState {
    active: bool,
    transcript: String,
    continuous: bool,
    silence_timeout: Duration,
    language: String,
    /// Bumped on every start/stop; stale tasks compare against it.
    generation: u64,
    session: Option<CancellationToken>,
    silence_timer: Option<CancellationToken>,
}

pub struct ListeningController {
    recognizer: Arc<dyn SpeechRecognizer>,
    bus: EventBus,
    state: Mutex<ListeningState>,
    /// Serializes start/stop so two recognizers never overlap.
    lifecycle: Mutex<()>,
    submit_tx: mpsc::UnboundedSender<String>,
}

impl ListeningController {
    /// Returns the controller and the receiver of transcripts submitted on silence.
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        bus: EventBus,
        settings: ListeningSettings,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let state = ListeningState {
            continuous: settings.continuous,
            silence_timeout: settings.silence_timeout,
            language: settings.language,
            ..Default::default()
        };
        (
            Self {
                recognizer,
                bus,
                state: Mutex::new(state),
                lifecycle: Mutex::new(()),
                submit_tx,
            },
            submit_rx,
        )
    }

    /// Tear down any previous recognizer, then start a fresh one.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;

        let language = self.state.lock().await.language.clone();
        let events = match self.recognizer.start(&language).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Failed to start speech recognition");
                self.bus
                    .toast(ToastLevel::Error, "Speech recognition is unavailable");
                return Err(ColloquyError::Recognition(e.to_string()));
            }
        };

        let cancel = CancellationToken::new();
        let generation = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            state.active = true;
            state.transcript.clear();
            state.session = Some(cancel.clone());
            state.generation
        };

        info!(%language, generation, "Listening started");
        self.bus.emit(WidgetEvent::ListeningStarted);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_session(events, cancel, generation).await;
        });
        Ok(())
    }

    /// Stop recognition and release the recognizer. Safe to call when idle.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    pub async fn is_continuous(&self) -> bool {
        self.state.lock().await.continuous
    }

    pub async fn set_continuous(&self, continuous: bool) {
        self.state.lock().await.continuous = continuous;
    }

    pub async fn set_silence_timeout(&self, timeout: Duration) {
        self.state.lock().await.silence_timeout = timeout;
    }

    /// Takes effect on the next `start`.
    pub async fn set_language(&self, language: &str) {
        self.state.lock().await.language = language.to_string();
    }

    /// Current accumulated draft.
    pub async fn transcript(&self) -> String {
        self.state.lock().await.transcript.clone()
    }

    async fn teardown(&self) {
        let was_active = {
            let mut state = self.state.lock().await;
            let was_active = state.active || state.session.is_some();
            if let Some(token) = state.session.take() {
                token.cancel();
            }
            if let Some(token) = state.silence_timer.take() {
                token.cancel();
            }
            state.active = false;
            state.transcript.clear();
            state.generation += 1;
            was_active
        };

        if was_active {
            if let Err(e) = self.recognizer.stop().await {
                warn!(error = %e, "Failed to stop recognizer");
            }
            debug!("Listening stopped");
            self.bus.emit(WidgetEvent::ListeningStopped);
        }
    }

    async fn run_session(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RecognitionEvent>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };

            match event {
                Some(RecognitionEvent::Recognizing { .. }) => {
                    self.on_recognizing(generation).await;
                }
                Some(RecognitionEvent::Recognized { text }) => {
                    self.on_recognized(generation, &text).await;
                }
                Some(RecognitionEvent::Canceled { reason }) => {
                    warn!(%reason, "Recognition canceled");
                    self.reset_if_current(generation).await;
                    self.bus
                        .toast(ToastLevel::Warning, "Speech recognition stopped unexpectedly");
                    return;
                }
                Some(RecognitionEvent::SessionStopped) | None => {
                    debug!(generation, "Recognition session ended");
                    self.reset_if_current(generation).await;
                    return;
                }
            }
        }
    }

    async fn on_recognized(self: &Arc<Self>, generation: u64, text: &str) {
        let utterance = dedupe_stutter(text);
        if utterance.is_empty() {
            return;
        }

        let (draft, continuous) = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            if !state.transcript.is_empty() {
                state.transcript.push(' ');
            }
            state.transcript.push_str(&utterance);
            (state.transcript.clone(), state.continuous)
        };

        debug!(chars = draft.len(), "Transcript draft updated");
        self.bus.emit(WidgetEvent::TranscriptDraft { text: draft });

        if continuous {
            self.arm_silence_timer(generation).await;
        }
    }

    /// Partial speech restarts the silence window; a pending draft must still
    /// be submitted if the partial never turns into a final result.
    async fn on_recognizing(self: &Arc<Self>, generation: u64) {
        let rearm = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            if let Some(token) = state.silence_timer.take() {
                token.cancel();
            }
            state.continuous && !state.transcript.is_empty()
        };

        if rearm {
            self.arm_silence_timer(generation).await;
        }
    }

    async fn arm_silence_timer(self: &Arc<Self>, generation: u64) {
        let token = CancellationToken::new();
        let timeout = {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                return;
            }
            if let Some(previous) = state.silence_timer.replace(token.clone()) {
                previous.cancel();
            }
            state.silence_timeout
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => this.on_silence(generation).await,
            }
        });
    }

    async fn on_silence(&self, generation: u64) {
        let _guard = self.lifecycle.lock().await;
        let transcript = {
            let mut state = self.state.lock().await;
            if state.generation != generation || !state.active {
                return;
            }
            std::mem::take(&mut state.transcript)
        };

        self.teardown().await;

        let transcript = transcript.trim().to_string();
        if !transcript.is_empty() {
            info!(chars = transcript.len(), "Submitting transcript after silence");
            let _ = self.submit_tx.send(transcript);
        }
    }

    async fn reset_if_current(&self, generation: u64) {
        let _guard = self.lifecycle.lock().await;
        if self.state.lock().await.generation == generation {
            self.teardown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeRecognizer {
        senders: StdMutex<Vec<mpsc::UnboundedSender<RecognitionEvent>>>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail: bool,
    }

    impl FakeRecognizer {
        fn emit(&self, event: RecognitionEvent) {
            let senders = self.senders.lock().unwrap();
            let _ = senders.last().unwrap().send(event);
        }

        fn emit_on(&self, index: usize, event: RecognitionEvent) {
            let _ = self.senders.lock().unwrap()[index].send(event);
        }
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn start(
            &self,
            _language: &str,
        ) -> anyhow::Result<mpsc::UnboundedReceiver<RecognitionEvent>> {
            if self.fail {
                anyhow::bail!("no microphone");
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            Ok(rx)
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(continuous: bool) -> ListeningSettings {
        ListeningSettings {
            language: "en-US".into(),
            continuous,
            silence_timeout: Duration::from_secs(2),
        }
    }

    fn controller(
        recognizer: Arc<FakeRecognizer>,
        continuous: bool,
    ) -> (Arc<ListeningController>, mpsc::UnboundedReceiver<String>, EventBus) {
        let bus = EventBus::new();
        let (controller, rx) = ListeningController::new(recognizer, bus.clone(), settings(continuous));
        (Arc::new(controller), rx, bus)
    }

    fn recognized(text: &str) -> RecognitionEvent {
        RecognitionEvent::Recognized { text: text.into() }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_tears_down_previous_session() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, _rx, _bus) = controller(recognizer.clone(), false);

        controller.start().await.unwrap();
        controller.start().await.unwrap();
        assert_eq!(recognizer.starts.load(Ordering::SeqCst), 2);
        assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);

        // Events from the superseded session are ignored.
        recognizer.emit_on(0, recognized("stale"));
        recognizer.emit_on(1, recognized("fresh"));
        settle().await;
        assert_eq!(controller.transcript().await, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuttered_utterance_is_deduplicated() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, _rx, bus) = controller(recognizer.clone(), false);
        let mut events = bus.subscribe();

        controller.start().await.unwrap();
        recognizer.emit(recognized("hello there hello there"));
        settle().await;

        assert_eq!(controller.transcript().await, "hello there");
        assert!(matches!(events.recv().await.unwrap(), WidgetEvent::ListeningStarted));
        match events.recv().await.unwrap() {
            WidgetEvent::TranscriptDraft { text } => assert_eq!(text, "hello there"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_submits_transcript() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, mut rx, _bus) = controller(recognizer.clone(), true);

        controller.start().await.unwrap();
        recognizer.emit(recognized("book a table"));
        settle().await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await.unwrap(), "book a table");
        assert!(!controller.is_active().await);
        assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_activity_rearms_silence_timer() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, mut rx, _bus) = controller(recognizer.clone(), true);

        controller.start().await.unwrap();
        recognizer.emit(recognized("book"));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        recognizer.emit(RecognitionEvent::Recognizing { text: "a t".into() });
        recognizer.emit(recognized("a table"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(rx.try_recv().is_err(), "timer must have been re-armed");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.recv().await.unwrap(), "book a table");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_partial_still_submits_draft() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, mut rx, _bus) = controller(recognizer.clone(), true);

        controller.start().await.unwrap();
        recognizer.emit(recognized("book a table"));
        settle().await;
        recognizer.emit(RecognitionEvent::Recognizing { text: "uh".into() });
        settle().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err(), "partial must restart the window");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rx.try_recv().unwrap(), "book a table");
        assert!(!controller.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_without_draft_keeps_listening() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, mut rx, _bus) = controller(recognizer.clone(), true);

        controller.start().await.unwrap();
        recognizer.emit(RecognitionEvent::Recognizing { text: "hm".into() });
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(rx.try_recv().is_err());
        assert!(controller.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_to_talk_never_auto_submits() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, mut rx, _bus) = controller(recognizer.clone(), false);

        controller.start().await.unwrap();
        recognizer.emit(recognized("hi"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert!(controller.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_resets_state() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, _rx, bus) = controller(recognizer.clone(), true);
        let mut events = bus.subscribe();

        controller.start().await.unwrap();
        recognizer.emit(recognized("partial"));
        recognizer.emit(RecognitionEvent::Canceled {
            reason: "network".into(),
        });
        settle().await;

        assert!(!controller.is_active().await);
        assert_eq!(controller.transcript().await, "");
        assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);

        let mut saw_toast = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, WidgetEvent::Toast { .. }) {
                saw_toast = true;
            }
        }
        assert!(saw_toast);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let recognizer = Arc::new(FakeRecognizer::default());
        let (controller, _rx, _bus) = controller(recognizer.clone(), false);

        controller.stop().await;
        controller.start().await.unwrap();
        controller.stop().await;
        controller.stop().await;
        assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);
        assert!(!controller.is_active().await);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let recognizer = Arc::new(FakeRecognizer {
            fail: true,
            ..Default::default()
        });
        let (controller, _rx, _bus) = controller(recognizer, false);
        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ColloquyError::Recognition(_)));
        assert!(!controller.is_active().await);
    }
}
