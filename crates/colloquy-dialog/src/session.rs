//! Dialog session manager.
//!
//! Owns the conversation with the dialog engine: opening and reopening the
//! session, sending user turns, translating agent turns, speaking them, and
//! reacting to the idle timeout and to transcripts submitted by the
//! listening controller.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use colloquy_core::config::Config;
use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::events::{EventBus, ToastLevel, WidgetEvent};
use colloquy_core::prefs::{PrefKey, PreferenceStore, Preferences};
use colloquy_core::types::{DialogState, Media, Message, MicrophoneMode, OpenParams, Session};
use colloquy_media::listening::{ListeningController, ListeningSettings};
use colloquy_media::synthesis::{SpeechBackend, SpeechController, SpeechSettings};
use colloquy_providers::engine::{DialogEngine, EngineReply, OpenSessionRequest};
use colloquy_providers::recognition::SpeechRecognizer;
use colloquy_providers::translate::Translator;

use crate::timeout::{Activity, InteractionTimeoutScheduler, TimeoutSettings, TimerFired};
use crate::translation::TranslationPipeline;

const BIRTH_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Closed,
    Opening,
    Open,
    Reopening,
}

/// Result of an open or reopen that did not fail outright.
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    Opened {
        session_id: String,
        dialog_state: DialogState,
    },
    AuthRequired,
    AgeVerificationRequired,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Post to the engine without adding a user message to the history.
    pub hidden: bool,
    /// Post the text as-is, even when the user and agent languages differ.
    pub skip_translation: bool,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub engine_id: String,
    pub agent_language: String,
    /// Private agents need a secret or login token.
    pub private: bool,
    pub min_age: Option<u32>,
    pub speech: SpeechSettings,
    /// Recognition language; defaults to the session's user language.
    pub listening_language: Option<String>,
    pub continuous_speech_timeout: Duration,
    pub timeout: TimeoutSettings,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        let engine = config.engine.as_ref();
        Self {
            engine_id: engine.map(|e| e.engine_id.clone()).unwrap_or_default(),
            agent_language: config.agent_language(),
            private: engine.is_some_and(|e| e.private),
            min_age: engine.and_then(|e| e.min_age),
            speech: SpeechSettings::from_config(config),
            listening_language: config.listening.as_ref().and_then(|l| l.language.clone()),
            continuous_speech_timeout: config.continuous_speech_timeout(),
            timeout: TimeoutSettings::from_config(config),
        }
    }
}

/// Everything the manager talks to.
pub struct Collaborators {
    pub engine: Arc<dyn DialogEngine>,
    pub translator: Option<Arc<dyn Translator>>,
    pub prefs: Arc<dyn PreferenceStore>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    /// `None` runs speech in its disabled fast path.
    pub speech: Option<SpeechBackend>,
}

struct SessionState {
    phase: SessionPhase,
    session: Option<Session>,
    /// Parameters of the last open, reused by reopen.
    last_params: Option<OpenParams>,
    dialog_state: Option<DialogState>,
    history: Vec<Message>,
    agent_typing: bool,
    user_message: String,
}

struct DriverInputs {
    timer: mpsc::UnboundedReceiver<TimerFired>,
    transcripts: mpsc::UnboundedReceiver<String>,
}

pub struct DialogSessionManager {
    settings: ManagerSettings,
    engine: Arc<dyn DialogEngine>,
    translation: TranslationPipeline,
    prefs: Arc<dyn PreferenceStore>,
    speech: Arc<SpeechController>,
    listening: Arc<ListeningController>,
    bus: EventBus,
    state: Mutex<SessionState>,
    timer: Mutex<InteractionTimeoutScheduler>,
    driver_inputs: Mutex<Option<DriverInputs>>,
}

fn age_on(birth_date: NaiveDate, today: NaiveDate) -> u32 {
    today.years_since(birth_date).unwrap_or(0)
}

/// Text posted to the engine: the user's words followed by attachment URLs.
fn compose_outbound(text: &str, media: &[Media]) -> String {
    let mut out = text.to_string();
    for item in media {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&item.url);
    }
    out
}

fn reply_state(reply: EngineReply) -> Result<DialogState> {
    if !reply.is_ok() {
        return Err(ColloquyError::from_result_code(
            reply.result_code,
            reply.result_message,
        ));
    }
    reply.dialog_state.ok_or_else(|| ColloquyError::Engine {
        code: reply.result_code,
        message: "reply carried no dialog state".into(),
    })
}

impl DialogSessionManager {
    pub fn new(settings: ManagerSettings, collaborators: Collaborators, bus: EventBus) -> Arc<Self> {
        let (listening, transcripts) = ListeningController::new(
            collaborators.recognizer,
            bus.clone(),
            ListeningSettings {
                language: settings
                    .listening_language
                    .clone()
                    .unwrap_or_else(|| settings.agent_language.clone()),
                continuous: false,
                silence_timeout: settings.continuous_speech_timeout,
            },
        );
        let listening = Arc::new(listening);
        let speech = Arc::new(SpeechController::new(
            settings.speech.clone(),
            collaborators.speech,
            Arc::clone(&listening),
            bus.clone(),
            &settings.agent_language,
        ));
        let (timer, timer_rx) = InteractionTimeoutScheduler::new(settings.timeout.clone());

        Arc::new(Self {
            translation: TranslationPipeline::new(collaborators.translator, &settings.agent_language),
            engine: collaborators.engine,
            prefs: collaborators.prefs,
            speech,
            listening,
            bus,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Closed,
                session: None,
                last_params: None,
                dialog_state: None,
                history: Vec::new(),
                agent_typing: false,
                user_message: String::new(),
            }),
            timer: Mutex::new(timer),
            driver_inputs: Mutex::new(Some(DriverInputs {
                timer: timer_rx,
                transcripts,
            })),
            settings,
        })
    }

    // --- Accessors ---

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn speech(&self) -> &Arc<SpeechController> {
        &self.speech
    }

    pub fn listening(&self) -> &Arc<ListeningController> {
        &self.listening
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    pub async fn dialog_state(&self) -> Option<DialogState> {
        self.state.lock().await.dialog_state.clone()
    }

    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.history.clone()
    }

    pub async fn is_agent_typing(&self) -> bool {
        self.state.lock().await.agent_typing
    }

    pub async fn user_message(&self) -> String {
        self.state.lock().await.user_message.clone()
    }

    pub async fn is_timer_armed(&self) -> bool {
        self.timer.lock().await.is_armed()
    }

    // --- Session lifecycle ---

    /// Open a new session, replacing the current one.
    ///
    /// Stored preferences fill in a missing birth date or login token and
    /// configure muting and the microphone mode. With `preserve_history` a
    /// held session the engine still knows is resumed instead.
    pub async fn open(&self, mut params: OpenParams) -> Result<OpenOutcome> {
        let prefs = match Preferences::load(self.prefs.as_ref()).await {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!(error = %e, "Failed to read preferences; using defaults");
                Preferences::default()
            }
        };
        self.apply_preferences(&prefs).await;

        if params.engine_id.is_empty() {
            params.engine_id = self.settings.engine_id.clone();
        }
        if params.auth.birth_date.is_none() {
            params.auth.birth_date = prefs.birth_date;
        }
        if params.auth.login_token.is_none() {
            params.auth.login_token = prefs.login_token;
        }

        if params.preserve_history {
            if let Some(outcome) = self.try_resume(&params).await {
                return Ok(outcome);
            }
        }

        {
            let mut state = self.state.lock().await;
            state.phase = SessionPhase::Opening;
            state.last_params = Some(params.clone());
        }

        let outcome = self.open_with(&params, false).await?;
        self.finish_open(outcome).await
    }

    /// Keep the held session if the engine still knows it, instead of
    /// opening a new one. Nothing is appended to the history or spoken.
    async fn try_resume(&self, params: &OpenParams) -> Option<OpenOutcome> {
        let (session_id, target) = {
            let state = self.state.lock().await;
            let session = state.session.as_ref().filter(|s| {
                state.phase == SessionPhase::Open
                    && s.engine_id == params.engine_id
                    && s.user_language == params.user_language
            })?;
            (
                session.session_id.clone(),
                session.effective_user_language().to_string(),
            )
        };

        let reply = match self.engine.get_session(&session_id).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%session_id, error = %e, "Session lookup failed; opening a new one");
                return None;
            }
        };
        let dialog_state = match reply_state(reply) {
            Ok(dialog_state) => dialog_state,
            Err(e) => {
                debug!(%session_id, error = %e, "Held session is gone; opening a new one");
                return None;
            }
        };
        let dialog_state = self
            .translation
            .translate_dialog_state(dialog_state, &target)
            .await;

        {
            let mut state = self.state.lock().await;
            if state.session.as_ref().map(|s| s.session_id.as_str()) != Some(session_id.as_str()) {
                return None;
            }
            state.last_params = Some(params.clone());
            state.dialog_state = Some(dialog_state.clone());
        }

        info!(%session_id, "Session resumed");
        self.bus.emit(WidgetEvent::DialogStateChanged {
            state: dialog_state.clone(),
        });
        self.reconcile_timer().await;
        Some(OpenOutcome::Opened {
            session_id,
            dialog_state,
        })
    }

    /// Reopen with the parameters of the last open, keeping the history.
    ///
    /// With `update_visible_state` the new dialog state is published and
    /// spoken like a regular agent turn.
    pub async fn reopen(&self, update_visible_state: bool) -> Result<OpenOutcome> {
        let params = {
            let mut state = self.state.lock().await;
            let params = state.last_params.clone().ok_or(ColloquyError::NoSession)?;
            state.phase = SessionPhase::Reopening;
            params
        };
        info!(engine_id = %params.engine_id, "Reopening session");

        let outcome = self.open_with(&params, true).await?;
        if update_visible_state {
            self.finish_open(outcome).await
        } else {
            Ok(outcome)
        }
    }

    /// Supply credentials after an `AuthRequired` outcome and retry the open.
    pub async fn provide_credentials(
        &self,
        secret: Option<String>,
        login_token: Option<String>,
    ) -> Result<OpenOutcome> {
        if let Some(token) = &login_token {
            self.persist(PrefKey::LoginToken, token).await;
        }
        let mut params = self.pending_params().await;
        if secret.is_some() {
            params.auth.secret = secret;
        }
        if login_token.is_some() {
            params.auth.login_token = login_token;
        }
        self.open(params).await
    }

    /// Supply a birth date after an `AgeVerificationRequired` outcome and retry the open.
    pub async fn provide_birth_date(&self, birth_date: NaiveDate) -> Result<OpenOutcome> {
        self.persist(PrefKey::BirthDate, &birth_date.format(BIRTH_DATE_FORMAT).to_string())
            .await;
        let mut params = self.pending_params().await;
        params.auth.birth_date = Some(birth_date);
        self.open(params).await
    }

    /// Tear down the session, audio, listening, and timer. Safe to call twice.
    pub async fn close(&self) {
        let session = {
            let mut state = self.state.lock().await;
            state.phase = SessionPhase::Closed;
            state.agent_typing = false;
            state.session.take()
        };

        self.timer.lock().await.clear();
        self.speech.stop_audio().await;
        self.listening.stop().await;

        if let Some(session) = session {
            if let Err(e) = self.engine.close_session(&session.session_id).await {
                warn!(session_id = %session.session_id, error = %e, "Failed to close remote session");
            }
            info!(session_id = %session.session_id, "Session closed");
            self.bus.emit(WidgetEvent::SessionClosed);
        }
    }

    async fn pending_params(&self) -> OpenParams {
        self.state
            .lock()
            .await
            .last_params
            .clone()
            .unwrap_or_else(|| OpenParams {
                engine_id: self.settings.engine_id.clone(),
                ..Default::default()
            })
    }

    /// A failed open leaves no session behind, so a later `close` has nothing
    /// to tear down remotely.
    async fn mark_closed(&self) {
        let stale = {
            let mut state = self.state.lock().await;
            state.phase = SessionPhase::Closed;
            state.session.take()
        };
        if let Some(session) = stale {
            debug!(session_id = %session.session_id, "Dropped session after failed open");
        }
    }

    async fn open_with(&self, params: &OpenParams, reopening: bool) -> Result<OpenOutcome> {
        if let Some(min_age) = self.settings.min_age {
            match params.auth.birth_date {
                None => {
                    info!(min_age, "Birth date required before opening");
                    self.mark_closed().await;
                    self.bus.emit(WidgetEvent::AgeVerificationRequired);
                    return Ok(OpenOutcome::AgeVerificationRequired);
                }
                Some(birth_date) if age_on(birth_date, Utc::now().date_naive()) < min_age => {
                    self.mark_closed().await;
                    self.bus.toast(
                        ToastLevel::Error,
                        format!("You must be at least {min_age} years old to talk to this agent"),
                    );
                    return Err(ColloquyError::Underage { min_age });
                }
                Some(_) => {}
            }
        }

        if self.settings.private && !params.auth.has_credentials() {
            info!(engine_id = %params.engine_id, "Credentials required for private agent");
            self.mark_closed().await;
            self.bus.emit(WidgetEvent::AuthRequired);
            return Ok(OpenOutcome::AuthRequired);
        }

        let request = OpenSessionRequest {
            engine_id: params.engine_id.clone(),
            secret: params.auth.secret.clone(),
            login_token: params.auth.login_token.clone(),
            birth_date: params.auth.birth_date,
            initial_context_vars: params.initial_context_vars.clone(),
            initial_question: params.initial_question.clone(),
            additional_info: params.additional_info.clone(),
        };

        let reply = match self.engine.open_session(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(engine = self.engine.id(), error = %e, "Failed to open session");
                self.mark_closed().await;
                self.bus
                    .toast(ToastLevel::Error, "Could not reach the dialog engine");
                return Err(ColloquyError::Other(e));
            }
        };

        let session_id = reply.session_id.clone();
        let dialog_state = match reply_state(reply) {
            Ok(state) => state,
            Err(ColloquyError::AuthRequired) => {
                self.mark_closed().await;
                self.bus.emit(WidgetEvent::AuthRequired);
                return Ok(OpenOutcome::AuthRequired);
            }
            Err(e) => {
                warn!(error = %e, "Engine refused to open session");
                self.mark_closed().await;
                self.bus.toast(ToastLevel::Error, e.to_string());
                return Err(e);
            }
        };
        let Some(session_id) = session_id else {
            self.mark_closed().await;
            self.bus.toast(ToastLevel::Error, "The dialog engine returned no session");
            return Err(ColloquyError::Engine {
                code: 0,
                message: "open reply carried no session id".into(),
            });
        };

        let session = Session {
            session_id: session_id.clone(),
            engine_id: params.engine_id.clone(),
            language: self.translation.agent_language().to_string(),
            user_language: params.user_language.clone(),
            auth: params.auth.clone(),
            opened_at: Utc::now(),
        };
        let user_language = session.effective_user_language().to_string();

        let cleared = {
            let mut state = self.state.lock().await;
            state.session = Some(session);
            state.phase = SessionPhase::Open;
            let clear = !reopening && !params.preserve_history;
            if clear {
                state.history.clear();
            }
            clear
        };

        self.speech.set_language(&user_language).await;
        let recognition_language = self
            .settings
            .listening_language
            .clone()
            .unwrap_or_else(|| user_language.clone());
        self.listening.set_language(&recognition_language).await;

        if cleared {
            self.bus.emit(WidgetEvent::HistoryCleared);
        }
        info!(%session_id, reopening, "Session opened");
        self.bus.emit(WidgetEvent::SessionOpened {
            session_id: session_id.clone(),
        });

        Ok(OpenOutcome::Opened {
            session_id,
            dialog_state,
        })
    }

    /// Publish the opening dialog state as the agent's first turn.
    async fn finish_open(&self, outcome: OpenOutcome) -> Result<OpenOutcome> {
        match outcome {
            OpenOutcome::Opened {
                session_id,
                dialog_state,
            } => {
                let dialog_state = self.complete_turn(dialog_state).await;
                self.reconcile_timer().await;
                Ok(OpenOutcome::Opened {
                    session_id,
                    dialog_state,
                })
            }
            other => Ok(other),
        }
    }

    // --- Turns ---

    /// Send a user turn to the engine.
    ///
    /// The user message is appended before the engine is called. An expired
    /// session is reopened and the same text resent once; a second expiry is
    /// reported like any other engine error.
    pub async fn send_message(&self, text: &str, media: Vec<Media>, options: SendOptions) -> Result<()> {
        let text = text.trim();
        if text.is_empty() && media.is_empty() {
            return Ok(());
        }

        let current = {
            let state = self.state.lock().await;
            state
                .session
                .as_ref()
                .filter(|_| state.phase == SessionPhase::Open)
                .map(|s| (s.session_id.clone(), s.effective_user_language().to_string()))
        };
        let Some((session_id, user_language)) = current else {
            self.bus
                .toast(ToastLevel::Warning, "No open session; start a conversation first");
            return Err(ColloquyError::NoSession);
        };

        let outbound = compose_outbound(text, &media);
        if !options.hidden {
            let message = Message::from_user(text, media);
            self.state.lock().await.history.push(message.clone());
            self.bus.emit(WidgetEvent::MessageAppended { message });
        }
        {
            let mut state = self.state.lock().await;
            state.user_message.clear();
        }

        self.timer.lock().await.clear();
        self.speech.stop_audio().await;
        self.listening.stop().await;
        self.set_agent_typing(true).await;

        let outbound = if options.skip_translation {
            outbound
        } else {
            self.translation.to_agent(&outbound, &user_language).await
        };
        debug!(%session_id, chars = outbound.len(), "Posting user turn");

        let result = self.post_with_reopen(&session_id, &outbound).await;
        self.set_agent_typing(false).await;

        let result = match result {
            Ok(dialog_state) => {
                self.complete_turn(dialog_state).await;
                Ok(())
            }
            Err(e) => {
                self.report_turn_error(&e);
                Err(e)
            }
        };
        self.reconcile_timer().await;
        result
    }

    async fn post_with_reopen(&self, session_id: &str, text: &str) -> Result<DialogState> {
        let reply = self.engine.post_text_entered(session_id, text).await?;
        match reply_state(reply) {
            Err(ColloquyError::SessionExpired) => {
                info!(%session_id, "Session expired; reopening and resending");
                match self.reopen(false).await? {
                    OpenOutcome::Opened { session_id, .. } => {
                        let reply = self.engine.post_text_entered(&session_id, text).await?;
                        reply_state(reply)
                    }
                    OpenOutcome::AuthRequired => Err(ColloquyError::AuthRequired),
                    OpenOutcome::AgeVerificationRequired => {
                        Err(ColloquyError::AgeVerificationRequired)
                    }
                }
            }
            other => other,
        }
    }

    fn report_turn_error(&self, error: &ColloquyError) {
        match error {
            ColloquyError::AuthRequired => self.bus.emit(WidgetEvent::AuthRequired),
            ColloquyError::AgeVerificationRequired => {
                self.bus.emit(WidgetEvent::AgeVerificationRequired)
            }
            // Already surfaced by the open path.
            ColloquyError::Underage { .. } => {}
            ColloquyError::Engine { code, message } => {
                warn!(code, %message, "Dialog engine error");
                self.bus.toast(ToastLevel::Error, message.clone());
            }
            other => {
                warn!(error = %other, "User turn failed");
                self.bus.toast(ToastLevel::Error, other.to_string());
            }
        }
    }

    /// Translate, record, publish, and speak an agent turn.
    async fn complete_turn(&self, dialog_state: DialogState) -> DialogState {
        let target = match self.state.lock().await.session.as_ref() {
            Some(session) => session.effective_user_language().to_string(),
            None => self.translation.agent_language().to_string(),
        };
        let dialog_state = self
            .translation
            .translate_dialog_state(dialog_state, &target)
            .await;

        let message = Message::from_agent(&dialog_state);
        let has_content = !message.text.trim().is_empty() || !message.media.is_empty();
        {
            let mut state = self.state.lock().await;
            state.dialog_state = Some(dialog_state.clone());
            if has_content {
                state.history.push(message.clone());
            }
        }

        debug!(state = %dialog_state.state, "Dialog state changed");
        self.bus.emit(WidgetEvent::DialogStateChanged {
            state: dialog_state.clone(),
        });
        if has_content {
            self.bus.emit(WidgetEvent::MessageAppended { message });
        }

        if let Some(emission) = dialog_state.display_emission().filter(|e| !e.trim().is_empty()) {
            self.speech.speak(emission).await;
        }
        dialog_state
    }

    /// Send a prompt as if the user had typed it.
    pub async fn simulate_user_prompt(&self, text: &str) -> Result<()> {
        self.on_change_user_message(text).await;
        self.send_message(text, Vec::new(), SendOptions::default()).await
    }

    /// Track the user's draft; a non-empty draft holds the idle timer.
    pub async fn on_change_user_message(&self, text: &str) {
        self.state.lock().await.user_message = text.to_string();
        self.reconcile_timer().await;
    }

    async fn set_agent_typing(&self, typing: bool) {
        self.state.lock().await.agent_typing = typing;
        self.bus.emit(WidgetEvent::TypingChanged { typing });
    }

    // --- Speech and listening ---

    /// Start listening; any playing audio is stopped first.
    pub async fn start_listening(&self) -> Result<()> {
        let result = self.speech.start_listening().await;
        self.reconcile_timer().await;
        result
    }

    pub async fn stop_listening(&self) {
        self.listening.stop().await;
        self.reconcile_timer().await;
    }

    pub async fn speak(&self, text: &str) -> Option<u64> {
        self.speech.speak(text).await
    }

    pub async fn stop_audio(&self) {
        self.speech.stop_audio().await;
        self.reconcile_timer().await;
    }

    /// Unlock audio after a user gesture on constrained platforms.
    pub async fn on_user_gesture(&self) -> Result<()> {
        self.speech.on_user_gesture().await
    }

    // --- Preferences ---

    async fn apply_preferences(&self, prefs: &Preferences) {
        self.speech.set_muted(prefs.mute_speaker).await;
        self.listening
            .set_continuous(prefs.microphone_mode == MicrophoneMode::Continuous)
            .await;
        self.listening
            .set_silence_timeout(
                prefs
                    .continuous_speech_timeout
                    .unwrap_or(self.settings.continuous_speech_timeout),
            )
            .await;
    }

    async fn persist(&self, key: PrefKey, value: &str) {
        if let Err(e) = self.prefs.set(key, value).await {
            warn!(key = key.as_str(), error = %e, "Failed to persist preference");
        }
    }

    pub async fn set_mute_speaker(&self, muted: bool) {
        self.speech.set_muted(muted).await;
        self.persist(PrefKey::MuteSpeaker, &muted.to_string()).await;
        self.reconcile_timer().await;
    }

    pub async fn set_microphone_mode(&self, mode: MicrophoneMode) {
        self.listening
            .set_continuous(mode == MicrophoneMode::Continuous)
            .await;
        let value = match mode {
            MicrophoneMode::HoldToTalk => "holdToTalk",
            MicrophoneMode::Continuous => "continuous",
        };
        self.persist(PrefKey::MicrophoneMode, value).await;
    }

    pub async fn set_continuous_speech_timeout(&self, timeout: Duration) {
        self.listening.set_silence_timeout(timeout).await;
        self.persist(PrefKey::ContinuousSpeechTimeout, &timeout.as_secs().to_string())
            .await;
    }

    pub async fn set_position(&self, position: &str) {
        self.persist(PrefKey::Position, position).await;
    }

    // --- Idle timeout ---

    /// Clear the idle timer and re-arm it if nobody is active.
    pub async fn reconcile_timer(&self) {
        let (open, user_typing, agent_typing, emission, engine_timeout) = {
            let state = self.state.lock().await;
            let dialog_state = state.dialog_state.as_ref();
            (
                state.phase == SessionPhase::Open,
                !state.user_message.trim().is_empty(),
                state.agent_typing,
                dialog_state
                    .and_then(|d| d.display_emission())
                    .map(str::to_string),
                dialog_state.and_then(|d| d.timeout_seconds),
            )
        };

        let mut timer = self.timer.lock().await;
        if !open {
            timer.clear();
            return;
        }
        let activity = Activity {
            user_typing,
            agent_typing,
            audio_playing: self.speech.is_speaking(),
            listening: self.listening.is_active().await,
        };
        timer.reconcile(activity, emission.as_deref(), engine_timeout);
    }

    async fn on_timer_fired(&self, fired: TimerFired) {
        if !self.timer.lock().await.take_fired(fired) {
            return;
        }

        let (session_id, accepts_timeout) = {
            let state = self.state.lock().await;
            match (&state.session, state.phase) {
                (Some(session), SessionPhase::Open) => (
                    session.session_id.clone(),
                    state
                        .dialog_state
                        .as_ref()
                        .is_some_and(|d| d.accepts_timeout),
                ),
                _ => return,
            }
        };

        if !accepts_timeout {
            debug!("Dialog state does not accept a timeout; re-arming");
            self.reconcile_timer().await;
            return;
        }

        info!(%session_id, "Interaction timeout; notifying engine");
        self.set_agent_typing(true).await;
        let result = match self.engine.post_timeout(&session_id).await {
            Ok(reply) => reply_state(reply),
            Err(e) => Err(ColloquyError::Other(e)),
        };
        self.set_agent_typing(false).await;

        match result {
            Ok(dialog_state) => {
                self.complete_turn(dialog_state).await;
            }
            Err(ColloquyError::SessionExpired) => {
                // Nothing to resend; the next user turn starts on a fresh session.
                if let Err(e) = self.reopen(false).await {
                    warn!(error = %e, "Reopen after timeout failed");
                }
            }
            Err(e) => warn!(error = %e, "Timeout event failed"),
        }
        self.reconcile_timer().await;
    }

    // --- Driver ---

    /// Spawn the loop reacting to timer fires, submitted transcripts, and
    /// activity changes on the bus. Only the first call starts a loop.
    pub async fn spawn_driver(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let inputs = self.driver_inputs.lock().await.take()?;
        let events = self.bus.subscribe();
        let weak = Arc::downgrade(self);
        Some(tokio::spawn(run_driver(weak, inputs, events)))
    }
}

async fn run_driver(
    manager: Weak<DialogSessionManager>,
    mut inputs: DriverInputs,
    mut events: broadcast::Receiver<WidgetEvent>,
) {
    enum Input {
        Fired(TimerFired),
        Transcript(String),
        Activity,
    }

    loop {
        let input = tokio::select! {
            Some(fired) = inputs.timer.recv() => Input::Fired(fired),
            Some(text) = inputs.transcripts.recv() => Input::Transcript(text),
            event = events.recv() => match event {
                Ok(
                    WidgetEvent::SpeechStarted { .. }
                    | WidgetEvent::SpeechEnded { .. }
                    | WidgetEvent::ListeningStarted
                    | WidgetEvent::ListeningStopped,
                ) => Input::Activity,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Driver lagged behind the event bus");
                    Input::Activity
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            else => break,
        };

        let Some(manager) = manager.upgrade() else {
            break;
        };
        match input {
            Input::Fired(fired) => manager.on_timer_fired(fired).await,
            Input::Transcript(text) => {
                if let Err(e) = manager
                    .send_message(&text, Vec::new(), SendOptions::default())
                    .await
                {
                    debug!(error = %e, "Transcript not sent");
                }
            }
            Input::Activity => manager.reconcile_timer().await,
        }
    }
    debug!("Dialog driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_on() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
        assert_eq!(age_on(NaiveDate::from_ymd_opt(2006, 6, 15).unwrap(), today), 18);
        assert_eq!(age_on(NaiveDate::from_ymd_opt(2006, 6, 16).unwrap(), today), 17);
        assert_eq!(age_on(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(), today), 0);
    }

    #[test]
    fn test_compose_outbound_appends_media() {
        let media = vec![Media {
            url: "https://cdn.example/cat.png".into(),
            mime_type: "image/png".into(),
            title: None,
        }];
        assert_eq!(
            compose_outbound("Look", &media),
            "Look\nhttps://cdn.example/cat.png"
        );
        assert_eq!(compose_outbound("", &media), "https://cdn.example/cat.png");
        assert_eq!(compose_outbound("Hi", &[]), "Hi");
    }

    #[test]
    fn test_reply_state_maps_codes() {
        assert!(matches!(
            reply_state(EngineReply::error(404, "gone")),
            Err(ColloquyError::SessionExpired)
        ));
        assert!(matches!(
            reply_state(EngineReply::error(500, "boom")),
            Err(ColloquyError::Engine { code: 500, .. })
        ));
        assert!(reply_state(EngineReply::ok(DialogState::default())).is_ok());
        assert!(reply_state(EngineReply::default()).is_err());
    }
}
