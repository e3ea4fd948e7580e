//! # Session Orchestrator
//!
//! Drives one client connection from the auth handshake to teardown.
//!
//! ## Lifecycle
//!
//! ```text
//! Authenticating ──► Initializing ──► Streaming ◄──► Reconnecting
//!        │                 │              │               │
//!        └─────────────────┴──────────────┴───────────────┴──► Closed
//! ```
//!
//! 1. **Authenticating**: the first client frame must be `auth` and must arrive
//!    within the auth timeout.
//! 2. **Initializing**: resolve the user and character, seed the emotion,
//!    gather memory and news context, build the instructions, open the upstream
//!    link and ask the character to speak first.
//! 3. **Streaming**: three routines run side by side over one [`SessionState`]:
//!    - `forward_client`: client frames to the upstream. This is the anchor;
//!      when it returns the session ends.
//!    - `relay_upstream`: upstream events to the client, relinking at every
//!      turn boundary, replaying recent context and firing emotional bursts.
//!    - `idle_prompter`: nudges the character when the conversation goes quiet.
//! 4. **Closed**: the link is closed and the transcript is handed to the
//!    long-term memory pipeline in the background.
//!
//! The transport is abstracted as a pair of channels: raw text frames in,
//! [`Outbound`] frames out. The WebSocket actor in `websocket.rs` owns the
//! other ends.

pub mod protocol;
pub mod retrieval;
pub mod state;

use crate::affect::{self, AffectContext};
use crate::config::{AppConfig, SessionConfig};
use crate::error::SessionError;
use crate::live::{LiveAdapter, LiveError};
use crate::services::prompt::DEFAULT_REGION;
use crate::services::{memory_namespace, Character, PromptContext, Services, TranscriptEntry, User};
use crate::state::AppState;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::StreamExt;
use protocol::{ClientMessage, ControlAction, EmotionStamp, ErrorCode, RetrievalTool, ServerMessage, StatusAction};
use state::{SessionPhase, SessionState};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sent right after the link opens so the character speaks first.
const GREETING: &str = "The user just joined the call. Greet them warmly in your own words, \
                        the way you naturally would, and give them something easy to reply to.";

/// What the session asks the transport to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close,
}

/// Who the session belongs to, resolved during the handshake.
#[derive(Debug, Clone)]
struct Identity {
    session_id: String,
    user: User,
    character: Option<Character>,
    namespace: String,
}

impl Identity {
    fn character_id(&self) -> Option<&str> {
        self.character.as_ref().map(|character| character.id.as_str())
    }

    fn region(&self) -> &str {
        self.character
            .as_ref()
            .and_then(|character| character.region.as_deref())
            .unwrap_or(DEFAULT_REGION)
    }
}

/// Entry point for one connection.
pub struct SessionOrchestrator {
    app: AppState,
}

impl SessionOrchestrator {
    pub fn new(app: AppState) -> Self {
        Self { app }
    }

    /// Run the session until it ends. Always finishes by sending [`Outbound::Close`].
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<String>, outbound: mpsc::UnboundedSender<Outbound>) {
        let config = self.app.get_config();

        let session = match self.start(&config, &mut inbound, &outbound).await {
            Ok(session) => session,
            Err(e) => {
                match &e {
                    SessionError::UpstreamDisconnected(_) | SessionError::Internal(_) => {
                        error!(code = ?e.code(), error = %e, "Session failed to start")
                    }
                    _ => warn!(code = ?e.code(), error = %e, "Session rejected"),
                }
                self.app.record_session_rejected();
                let _ = outbound.send(Outbound::Message(ServerMessage::Error {
                    code: e.code(),
                    message: e.to_string(),
                }));
                let _ = outbound.send(Outbound::Close);
                return;
            }
        };

        session.run(inbound).await;
    }

    async fn authenticate(
        &self,
        config: &SessionConfig,
        inbound: &mut mpsc::UnboundedReceiver<String>,
    ) -> Result<ClientMessage, SessionError> {
        let first = tokio::time::timeout(config.auth_timeout(), inbound.recv())
            .await
            .map_err(|_| SessionError::AuthTimeout)?
            .ok_or_else(|| SessionError::AuthRequired("Connection closed before auth".to_string()))?;

        match ClientMessage::parse(&first) {
            Ok(auth @ ClientMessage::Auth { .. }) => Ok(auth),
            _ => Err(SessionError::AuthRequired("First message must be auth".to_string())),
        }
    }

    async fn start(
        &self,
        config: &AppConfig,
        inbound: &mut mpsc::UnboundedReceiver<String>,
        outbound: &mpsc::UnboundedSender<Outbound>,
    ) -> Result<Arc<LiveSession>, SessionError> {
        let ClientMessage::Auth { device_id, display_name, location, character_id } =
            self.authenticate(&config.session, inbound).await?
        else {
            return Err(SessionError::AuthRequired("First message must be auth".to_string()));
        };

        let services = &self.app.services;
        let user = services
            .users
            .upsert_by_device_id(&device_id, display_name.as_deref(), location.as_deref())
            .await?;

        let character = match character_id {
            Some(character_id) => Some(
                services
                    .characters
                    .find_for_user(&character_id, &user.id)
                    .await?
                    .ok_or_else(|| SessionError::CharacterNotFound(character_id.clone()))?,
            ),
            None => None,
        };

        let identity = Identity {
            session_id: Uuid::new_v4().to_string(),
            namespace: memory_namespace(&user.id, character.as_ref().map(|c| c.id.as_str())),
            user,
            character,
        };
        info!(
            session_id = %identity.session_id,
            user_id = %identity.user.id,
            character_id = identity.character_id().unwrap_or("-"),
            "Client authenticated"
        );

        let emotion = self.initial_emotion(&identity).await;
        let memory_snippets = self.initial_memories(&identity, config.session.memory_top_k).await;
        let news = self.initial_news(&identity, config.session.news_max_results).await;

        let instructions = services.prompts.build(&PromptContext {
            user: &identity.user,
            character: identity.character.as_ref(),
            memory_snippets: &memory_snippets,
            news: &news,
        });

        let adapter = Arc::new(LiveAdapter::new(
            self.app.connector.clone(),
            instructions,
            config.session.retry_policy(),
        ));
        adapter.connect().await?;

        let mut session_state = SessionState::new(emotion, config.session.burst_policy());
        session_state.news = news;

        let session = Arc::new(LiveSession {
            app: self.app.clone(),
            services: services.clone(),
            settings: config.session.clone(),
            identity,
            adapter,
            state: Mutex::new(session_state),
            outbound: outbound.clone(),
            cancel: CancellationToken::new(),
            lost_reported: AtomicBool::new(false),
        });

        session.send(ServerMessage::AuthOk {
            user_id: session.identity.user.id.clone(),
            session_id: session.identity.session_id.clone(),
        });

        if let Err(e) = session.adapter.send_text(GREETING).await {
            session.adapter.close().await;
            return Err(e.into());
        }
        self.app.record_session_opened();

        Ok(session)
    }

    /// Last persisted AI emotion, else the relationship default, else neutral.
    async fn initial_emotion(&self, identity: &Identity) -> affect::EmotionState {
        let last_persisted = match identity.character_id() {
            Some(character_id) => self
                .app
                .services
                .messages
                .last_ai_emotion(character_id, &identity.user.id)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Emotion lookup failed");
                    None
                }),
            None => None,
        };
        let relationship = identity.character.as_ref().and_then(|c| c.relationship_type.as_deref());
        state::seed_emotion(last_persisted, relationship)
    }

    async fn initial_memories(&self, identity: &Identity, top_k: usize) -> Vec<String> {
        let Some(memory) = &self.app.services.memory else {
            return Vec::new();
        };
        let query = format!(
            "Recent conversation with {}",
            identity.user.display_name.as_deref().unwrap_or("user")
        );
        memory.recall(&identity.namespace, &query, top_k).await.unwrap_or_else(|e| {
            warn!(error = %e, "Memory recall failed");
            Vec::new()
        })
    }

    async fn initial_news(&self, identity: &Identity, max_results: usize) -> Vec<crate::services::SearchHit> {
        let Some(search) = &self.app.services.search else {
            return Vec::new();
        };
        search
            .search("local news", identity.user.location.as_deref(), max_results)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "News lookup failed");
                Vec::new()
            })
    }
}

/// An authenticated session with an open upstream link.
struct LiveSession {
    app: AppState,
    services: Services,
    settings: SessionConfig,
    identity: Identity,
    adapter: Arc<LiveAdapter>,
    state: Mutex<SessionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    lost_reported: AtomicBool,
}

impl LiveSession {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, message: ServerMessage) {
        // the transport is gone; the anchor notices on its next receive
        let _ = self.outbound.send(Outbound::Message(message));
    }

    fn affect_context(&self) -> AffectContext<'_> {
        match &self.identity.character {
            Some(character) => AffectContext {
                relationship_type: character.relationship_type.as_deref(),
                familiarity: character.familiarity_level,
                personality_code: character.personality_code.as_deref(),
            },
            None => AffectContext::default(),
        }
    }

    /// Tell the client the upstream is gone, once, and end the session.
    fn report_upstream_lost(&self, reason: &str) {
        if self.lost_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(session_id = %self.identity.session_id, reason, "Upstream lost");
        self.send(ServerMessage::Error {
            code: ErrorCode::UpstreamDisconnected,
            message: "Lost connection to the AI".to_string(),
        });
        self.cancel.cancel();
    }

    fn fail_send(&self, error: &LiveError) {
        if !self.cancel.is_cancelled() {
            self.report_upstream_lost(&error.to_string());
        }
    }

    /// Fire-and-forget transcript persistence; only sessions with a character have a log.
    fn persist(&self, entry: TranscriptEntry) {
        let Some(character_id) = self.identity.character_id() else {
            return;
        };
        let messages = self.services.messages.clone();
        let character_id = character_id.to_string();
        let user_id = self.identity.user.id.clone();
        tokio::spawn(async move {
            if let Err(e) = messages.append(&character_id, &user_id, entry).await {
                warn!(error = %e, "Failed to persist transcript entry");
            }
        });
    }

    /// Upstream send that is abandoned as soon as the session is cancelled.
    /// `None` means cancelled.
    async fn send_unless_cancelled<F>(&self, send: F) -> Option<Result<(), LiveError>>
    where
        F: Future<Output = Result<(), LiveError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            sent = send => Some(sent),
        }
    }

    /// A send relinked on its own: count it and replay context onto the new
    /// link. Returns `false` if the session should stop.
    async fn resync_after_send(&self) -> bool {
        if !self.adapter.take_relinked_by_send() {
            return true;
        }
        info!(session_id = %self.identity.session_id, "Upstream relinked during send, replaying context");
        self.app.record_reconnect();
        self.replay_context().await
    }

    async fn run(self: Arc<Self>, inbound: mpsc::UnboundedReceiver<String>) {
        self.state().phase = SessionPhase::Streaming;

        tokio::join!(self.forward_client(inbound), self.relay_upstream(), self.idle_prompter());

        self.teardown().await;
    }

    async fn forward_client(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => break,
                raw = inbound.recv() => match raw {
                    Some(raw) => raw,
                    None => {
                        debug!(session_id = %self.identity.session_id, "Client disconnected");
                        break;
                    }
                },
            };

            let message = match ClientMessage::parse(&raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed client frame");
                    continue;
                }
            };

            match message {
                ClientMessage::Audio { data, mime_type } => {
                    let bytes = match BASE64.decode(data.as_bytes()) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(error = %e, "Ignoring audio frame with invalid base64");
                            continue;
                        }
                    };
                    self.state().record_user_activity();
                    if let Err(e) = self.adapter.send_audio(bytes, &mime_type).await {
                        self.fail_send(&e);
                        break;
                    }
                    if !self.resync_after_send().await {
                        break;
                    }
                }
                ClientMessage::Text { text } => {
                    {
                        let mut state = self.state();
                        state.record_user_activity();
                        state.push_user(&text);
                    }
                    self.persist(TranscriptEntry::user(text.as_str()));
                    self.spawn_retrieval(&text);
                    if let Err(e) = self.adapter.send_text(&text).await {
                        self.fail_send(&e);
                        break;
                    }
                    if !self.resync_after_send().await {
                        break;
                    }
                }
                ClientMessage::Control { action: ControlAction::EndSession } => {
                    info!(session_id = %self.identity.session_id, "Client ended the session");
                    break;
                }
                ClientMessage::Control { action: ControlAction::Unknown } => {
                    debug!("Ignoring unknown control action");
                }
                ClientMessage::Auth { .. } => {
                    debug!("Ignoring repeated auth frame");
                }
            }
        }

        self.cancel.cancel();
    }

    async fn relay_upstream(self: &Arc<Self>) {
        loop {
            {
                let mut events = Box::pin(self.adapter.receive_responses());
                loop {
                    let event = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        event = events.next() => event,
                    };
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }

            self.state().phase = SessionPhase::Reconnecting;
            let relinked = tokio::select! {
                _ = self.cancel.cancelled() => return,
                relinked = self.adapter.reconnect() => relinked,
            };
            if !relinked {
                self.report_upstream_lost("reconnect attempts exhausted");
                return;
            }
            self.app.record_reconnect();
            self.state().phase = SessionPhase::Streaming;

            if !self.replay_context().await || !self.maybe_burst().await {
                return;
            }
        }
    }

    /// Re-inject recent history on the fresh link. Returns `false` if the session should stop.
    async fn replay_context(&self) -> bool {
        let replay = self
            .state()
            .replay_context(self.settings.context_window, self.settings.replay_entry_chars);
        let Some(replay) = replay else {
            return true;
        };

        match self.send_unless_cancelled(self.adapter.inject_context(&replay, false)).await {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                self.fail_send(&e);
                false
            }
            None => false,
        }
    }

    /// Emotional burst: keep talking while arousal stays high. Returns `false` if the session should stop.
    async fn maybe_burst(&self) -> bool {
        let (prompt, delay) = {
            let mut state = self.state();
            let emotion = state.emotion;
            let delay = state.burst.policy().delay;
            (state.burst.evaluate(emotion.arousal, Instant::now()), delay)
        };
        let Some(prompt) = prompt else {
            return true;
        };

        info!(session_id = %self.identity.session_id, "Burst follow-up");
        tokio::select! {
            _ = self.cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        match self.send_unless_cancelled(self.adapter.send_text(prompt)).await {
            Some(Ok(())) => {
                self.app.record_burst();
                self.resync_after_send().await
            }
            Some(Err(e)) => {
                self.fail_send(&e);
                false
            }
            None => false,
        }
    }

    fn handle_event(self: &Arc<Self>, event: crate::live::UpstreamEvent) {
        use crate::live::UpstreamEvent;

        match event {
            UpstreamEvent::Interrupted => self.send(ServerMessage::Interrupted {}),
            UpstreamEvent::TurnComplete => {
                let emotion = {
                    let mut state = self.state();
                    state.touch();
                    state.emotion
                };
                debug!(emotion = %emotion.label, "AI turn complete");
                self.send(ServerMessage::TurnComplete {});
            }
            UpstreamEvent::Audio { data, mime_type } => {
                let stamp = EmotionStamp::from(&self.state().emotion);
                self.send(ServerMessage::Audio {
                    data: BASE64.encode(data),
                    mime_type,
                    stamp,
                });
            }
            UpstreamEvent::OutputTranscript(text) => self.on_output_transcript(&text),
            UpstreamEvent::InputTranscript(text) => {
                if text.trim().is_empty() {
                    return;
                }
                {
                    let mut state = self.state();
                    state.push_user(&text);
                    state.interaction_pending = true;
                }
                self.persist(TranscriptEntry::user(text.as_str()));
                self.spawn_retrieval(&text);
            }
            // consumed by the adapter
            UpstreamEvent::ResumptionHandle(_) | UpstreamEvent::GoAway => {}
        }
    }

    fn on_output_transcript(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }

        let (emotion, reclassified) = {
            let mut state = self.state();
            let reclassified = state.interaction_pending;
            if reclassified {
                let previous = state.emotion;
                state.emotion = affect::classify(text, &self.affect_context(), Some(&previous));
                state.interaction_pending = false;
            }
            let emotion = state.emotion;
            state.push_model(text, emotion);
            (emotion, reclassified)
        };

        if reclassified {
            self.app.record_emotion_update();
            debug!(
                emotion = %emotion.label,
                valence = emotion.valence,
                arousal = emotion.arousal,
                "Emotion reclassified"
            );
        }

        self.persist(TranscriptEntry::model(text, emotion));
        self.send(ServerMessage::Text {
            text: text.to_string(),
            stamp: EmotionStamp::from(&emotion),
        });
    }

    /// Look for retrieval triggers without holding up the caller.
    fn spawn_retrieval(self: &Arc<Self>, text: &str) {
        let Some(tool) = retrieval::detect(text) else {
            return;
        };
        let session = Arc::clone(self);
        let query = text.to_string();
        tokio::spawn(async move { session.retrieve(tool, &query).await });
    }

    async fn retrieve(&self, tool: RetrievalTool, query: &str) {
        self.send(ServerMessage::Status { action: StatusAction::Searching, tool });

        let injection = match tool {
            RetrievalTool::RecallMemory => match &self.services.memory {
                Some(memory) => match memory.recall(&self.identity.namespace, query, self.settings.recall_top_k).await {
                    Ok(memories) if !memories.is_empty() => Some(retrieval::format_recall(&memories)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Memory recall failed");
                        None
                    }
                },
                None => None,
            },
            RetrievalTool::SearchWeb => match &self.services.search {
                Some(search) => match search
                    .search(query, self.identity.user.location.as_deref(), self.settings.search_max_results)
                    .await
                {
                    Ok(hits) if !hits.is_empty() => Some(retrieval::format_search(&hits)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Web search failed");
                        None
                    }
                },
                None => None,
            },
        };

        self.send(ServerMessage::Status { action: StatusAction::Done, tool });

        if let Some(injection) = injection {
            if let Err(e) = self.adapter.inject_context(&injection, false).await {
                warn!(error = %e, "Failed to inject retrieval results");
            }
        }
    }

    async fn idle_prompter(&self) {
        let threshold = self.settings.idle_threshold();
        let mut ticker = tokio::time::interval(self.settings.idle_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let prompt = {
                let mut state = self.state();
                if state.phase != SessionPhase::Streaming || state.idle_for() < threshold {
                    continue;
                }
                state.touch();
                let has_news = !state.news.is_empty();
                state.idle.next_prompt(has_news, self.identity.region())
            };

            info!(session_id = %self.identity.session_id, "Conversation idle, prompting the character");
            match self.send_unless_cancelled(self.adapter.send_text(&prompt)).await {
                Some(Ok(())) => self.app.record_idle_prompt(),
                Some(Err(e)) => {
                    self.fail_send(&e);
                    return;
                }
                None => return,
            }
            if !self.resync_after_send().await {
                return;
            }
        }
    }

    async fn teardown(&self) {
        let transcript = {
            let mut state = self.state();
            state.phase = SessionPhase::Closed;
            state.transcript.clone()
        };
        self.adapter.close().await;

        if let Some(pipeline) = self.services.memory_pipeline.clone() {
            if !transcript.is_empty() {
                let namespace = self.identity.namespace.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.process_session(&namespace, transcript).await {
                        warn!(namespace = %namespace, error = %e, "Memory pipeline failed");
                    }
                });
            }
        }

        let _ = self.outbound.send(Outbound::Close);
        info!(session_id = %self.identity.session_id, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::EmotionLabel;
    use crate::live::testing::{FakeConnector, FakeUpstream};
    use crate::live::{UpstreamEvent, UpstreamRequest};
    use crate::scheduler::burst::BURST_PROMPTS;
    use crate::services::{InMemoryStore, MemoryPipeline, SearchHit, UserDirectory, WebSearch};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const EXCITED: &str = "wow that's incredible, I'm so excited";

    /// Returns the same headline for every query and remembers what was asked.
    #[derive(Default)]
    struct StaticSearch {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WebSearch for StaticSearch {
        async fn search(&self, query: &str, _location: Option<&str>, _max_results: usize) -> anyhow::Result<Vec<SearchHit>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(vec![SearchHit {
                title: "Lantern festival".to_string(),
                summary: "Lanterns light up the river".to_string(),
                source: "Osaka Daily".to_string(),
            }])
        }
    }

    struct Harness {
        app: AppState,
        store: Arc<InMemoryStore>,
        connector: Arc<FakeConnector>,
        upstreams: mpsc::UnboundedReceiver<FakeUpstream>,
        client: mpsc::UnboundedSender<String>,
        frames: mpsc::UnboundedReceiver<Outbound>,
        session: JoinHandle<()>,
    }

    fn character(id: &str, relationship_type: Option<&str>) -> Character {
        Character {
            id: id.to_string(),
            owner_id: None,
            name: "Mika".to_string(),
            relationship_type: relationship_type.map(str::to_string),
            familiarity_level: 5,
            personality_code: None,
            region: Some("Osaka, Japan".to_string()),
            persona: None,
        }
    }

    fn harness() -> Harness {
        harness_with(|services| services)
    }

    fn harness_with(configure: impl FnOnce(Services) -> Services) -> Harness {
        let store = Arc::new(InMemoryStore::with_characters([character("c1", None)]));
        let (connector, upstreams) = FakeConnector::new();
        let services = configure(Services::in_memory(store.clone()));
        let app = AppState::new(AppConfig::default(), services, connector.clone());

        let (client, inbound) = mpsc::unbounded_channel();
        let (outbound, frames) = mpsc::unbounded_channel();
        let session = tokio::spawn(SessionOrchestrator::new(app.clone()).run(inbound, outbound));

        Harness { app, store, connector, upstreams, client, frames, session }
    }

    fn auth_frame(character_id: &str) -> String {
        format!(
            r#"{{"type":"auth","payload":{{"device_id":"dev-1","display_name":"Sam","character_id":"{}"}}}}"#,
            character_id
        )
    }

    async fn next_message(frames: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerMessage {
        match frames.recv().await {
            Some(Outbound::Message(message)) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    async fn next_text(upstream: &mut FakeUpstream) -> (String, bool) {
        match upstream.requests.recv().await {
            Some(UpstreamRequest::Text { text, turn_complete }) => (text, turn_complete),
            other => panic!("expected a text request, got {:?}", other),
        }
    }

    /// Drain frames up to the close and return the error codes seen.
    async fn errors_until_close(frames: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ErrorCode> {
        let mut errors = Vec::new();
        loop {
            match frames.recv().await {
                Some(Outbound::Message(ServerMessage::Error { code, .. })) => errors.push(code),
                Some(Outbound::Message(_)) => {}
                Some(Outbound::Close) | None => return errors,
            }
        }
    }

    async fn user_id(store: &InMemoryStore) -> String {
        store.upsert_by_device_id("dev-1", None, None).await.unwrap().id
    }

    /// Authenticate and return the first upstream with the greeting consumed.
    async fn connect(h: &mut Harness) -> FakeUpstream {
        h.client.send(auth_frame("c1")).unwrap();
        assert!(matches!(next_message(&mut h.frames).await, ServerMessage::AuthOk { .. }));

        let mut upstream = h.upstreams.recv().await.unwrap();
        assert_eq!(
            upstream.requests.recv().await,
            Some(UpstreamRequest::Text { text: GREETING.to_string(), turn_complete: true })
        );
        upstream
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_closes_with_timeout_error() {
        let mut h = harness();
        let started = Instant::now();

        assert_eq!(
            next_message(&mut h.frames).await,
            ServerMessage::Error { code: ErrorCode::Timeout, message: "Auth timeout".to_string() }
        );
        assert_eq!(h.frames.recv().await, Some(Outbound::Close));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(h.connector.opens(), 0);
        assert_eq!(h.app.get_metrics_snapshot().sessions_rejected, 1);
    }

    #[tokio::test]
    async fn test_first_frame_must_be_auth() {
        let mut h = harness();
        h.client.send(r#"{"type":"text","payload":{"text":"hi"}}"#.to_string()).unwrap();

        match next_message(&mut h.frames).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::AuthRequired),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.frames.recv().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn test_unknown_character_is_rejected() {
        let mut h = harness();
        h.client.send(auth_frame("nobody")).unwrap();

        match next_message(&mut h.frames).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::CharacterNotFound),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.frames.recv().await, Some(Outbound::Close));
        assert_eq!(h.connector.opens(), 0);
    }

    #[tokio::test]
    async fn test_greeting_turn_is_classified() {
        let mut h = harness();
        let upstream = connect(&mut h).await;

        upstream.emit(UpstreamEvent::OutputTranscript("haha awesome".into()));
        match next_message(&mut h.frames).await {
            ServerMessage::Text { stamp, .. } => {
                assert_eq!(stamp.emotion, EmotionLabel::Shy);
                assert_eq!(stamp.valence, 0.49);
                assert_eq!(stamp.arousal, 0.41);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.app.get_metrics_snapshot().emotion_updates, 1);
        assert_eq!(h.app.get_metrics_snapshot().sessions_opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_greeting_counts_as_rejected_only() {
        let mut h = harness();
        h.connector.refuse_requests(true);
        h.client.send(auth_frame("c1")).unwrap();

        assert!(matches!(next_message(&mut h.frames).await, ServerMessage::AuthOk { .. }));
        assert_eq!(errors_until_close(&mut h.frames).await, vec![ErrorCode::UpstreamDisconnected]);
        h.session.await.unwrap();

        let metrics = h.app.get_metrics_snapshot();
        assert_eq!(metrics.sessions_opened, 0);
        assert_eq!(metrics.sessions_rejected, 1);
    }

    #[tokio::test]
    async fn test_output_is_classified_once_per_user_turn_and_stamped() {
        let mut h = harness();
        let mut upstream = connect(&mut h).await;

        h.client.send(r#"{"type":"text","payload":{"text":"I got the job!"}}"#.to_string()).unwrap();
        assert!(matches!(upstream.requests.recv().await, Some(UpstreamRequest::Text { .. })));
        upstream.emit(UpstreamEvent::OutputTranscript("haha awesome".into()));
        upstream.emit(UpstreamEvent::OutputTranscript("so sad and sorry".into()));

        // neutral seed blended toward happy at (0.3, 0.7) lands closest to shy
        match next_message(&mut h.frames).await {
            ServerMessage::Text { text, stamp } => {
                assert_eq!(text, "haha awesome");
                assert_eq!(stamp.emotion, EmotionLabel::Shy);
                assert_eq!(stamp.valence, 0.49);
                assert_eq!(stamp.arousal, 0.41);
            }
            other => panic!("unexpected {:?}", other),
        }
        // no user activity in between: the second fragment keeps the emotion
        match next_message(&mut h.frames).await {
            ServerMessage::Text { stamp, .. } => assert_eq!(stamp.emotion, EmotionLabel::Shy),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.app.get_metrics_snapshot().emotion_updates, 1);

        upstream.emit(UpstreamEvent::Audio { data: vec![1, 2, 3], mime_type: "audio/pcm;rate=24000".into() });
        match next_message(&mut h.frames).await {
            ServerMessage::Audio { data, stamp, .. } => {
                assert_eq!(data, "AQID");
                assert_eq!(stamp.emotion, EmotionLabel::Shy);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_turn_boundary_relinks_and_replays_context() {
        let mut h = harness();
        let mut first = connect(&mut h).await;

        h.client.send(r#"{"type":"text","payload":{"text":"hello there"}}"#.to_string()).unwrap();
        assert!(matches!(first.requests.recv().await, Some(UpstreamRequest::Text { .. })));
        first.emit(UpstreamEvent::ResumptionHandle("h-7".into()));
        first.emit(UpstreamEvent::OutputTranscript("Hi Sam!".into()));
        first.emit(UpstreamEvent::TurnComplete);
        assert!(matches!(next_message(&mut h.frames).await, ServerMessage::Text { .. }));
        assert_eq!(next_message(&mut h.frames).await, ServerMessage::TurnComplete {});
        first.end_turn();

        let mut second = h.upstreams.recv().await.unwrap();
        assert_eq!(second.setup.resumption_handle.as_deref(), Some("h-7"));
        match second.requests.recv().await {
            Some(UpstreamRequest::Text { text, turn_complete }) => {
                assert!(!turn_complete);
                assert!(text.starts_with("[SYSTEM UPDATE]: Conversation so far:"));
                assert!(text.contains("User: hello there\nYou: Hi Sam!"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.app.get_metrics_snapshot().upstream_reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_reports_once_and_closes() {
        let mut h = harness();
        let mut upstream = connect(&mut h).await;

        h.connector.fail_always(true);
        upstream.end_turn();

        assert_eq!(errors_until_close(&mut h.frames).await, vec![ErrorCode::UpstreamDisconnected]);
        // one initial open plus three failed reconnects
        assert_eq!(h.connector.opens(), 4);
        h.session.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_link_on_send_reports_once_and_closes() {
        let mut h = harness();
        let mut upstream = connect(&mut h).await;

        // the link stays up for reading but refuses writes, and no redial succeeds
        upstream.requests.close();
        h.connector.fail_always(true);
        h.client.send(r#"{"type":"text","payload":{"text":"hi there"}}"#.to_string()).unwrap();

        assert_eq!(errors_until_close(&mut h.frames).await, vec![ErrorCode::UpstreamDisconnected]);
        assert_eq!(h.connector.opens(), 4);
        h.session.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relink_during_send_replays_context() {
        let mut h = harness();
        let mut first = connect(&mut h).await;

        h.client.send(r#"{"type":"text","payload":{"text":"hello there"}}"#.to_string()).unwrap();
        assert_eq!(next_text(&mut first).await, ("hello there".to_string(), true));

        first.requests.close();
        h.connector.fail_next(1);
        h.client.send(r#"{"type":"text","payload":{"text":"are you there?"}}"#.to_string()).unwrap();

        let mut second = h.upstreams.recv().await.unwrap();
        assert_eq!(next_text(&mut second).await, ("are you there?".to_string(), true));
        let (replay, turn_complete) = next_text(&mut second).await;
        assert!(!turn_complete);
        assert!(replay.starts_with("[SYSTEM UPDATE]: Conversation so far:"));
        assert!(replay.contains("User: hello there\nUser: are you there?"));

        // one failed dial plus the successful one
        assert_eq!(h.connector.opens(), 3);
        assert_eq!(h.app.get_metrics_snapshot().upstream_reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_arousal_bursts_across_relinks() {
        let mut h = harness();
        let mut first = connect(&mut h).await;

        // greeting lands at arousal 0.69, just under the burst threshold
        first.emit(UpstreamEvent::OutputTranscript(EXCITED.into()));
        assert!(matches!(next_message(&mut h.frames).await, ServerMessage::Text { .. }));

        h.client.send(r#"{"type":"text","payload":{"text":"tell me more"}}"#.to_string()).unwrap();
        assert_eq!(next_text(&mut first).await, ("tell me more".to_string(), true));
        // blended again from playful: arousal 0.795
        first.emit(UpstreamEvent::OutputTranscript(EXCITED.into()));
        first.emit(UpstreamEvent::TurnComplete);
        assert!(matches!(next_message(&mut h.frames).await, ServerMessage::Text { .. }));
        assert_eq!(next_message(&mut h.frames).await, ServerMessage::TurnComplete {});

        let started = Instant::now();
        first.end_turn();
        let mut second = h.upstreams.recv().await.unwrap();
        assert!(!next_text(&mut second).await.1);
        assert_eq!(next_text(&mut second).await, (BURST_PROMPTS[0].to_string(), true));
        assert!(started.elapsed() >= Duration::from_millis(800));
        assert_eq!(h.app.get_metrics_snapshot().burst_follow_ups, 1);

        second.end_turn();
        let mut third = h.upstreams.recv().await.unwrap();
        assert!(!next_text(&mut third).await.1);
        assert_eq!(next_text(&mut third).await, (BURST_PROMPTS[1].to_string(), true));
        assert_eq!(h.app.get_metrics_snapshot().burst_follow_ups, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_interrupts_stalled_replay() {
        let mut h = harness();
        let mut first = connect(&mut h).await;

        h.client.send(r#"{"type":"text","payload":{"text":"hello there"}}"#.to_string()).unwrap();
        assert_eq!(next_text(&mut first).await, ("hello there".to_string(), true));

        // the next link accepts the dial but every send on it fails
        h.connector.refuse_requests(true);
        first.end_turn();
        let _second = h.upstreams.recv().await.unwrap();

        let started = Instant::now();
        h.client
            .send(r#"{"type":"control","payload":{"action":"end_session"}}"#.to_string())
            .unwrap();
        assert!(errors_until_close(&mut h.frames).await.is_empty());
        h.session.await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_prompt_after_quiet_period() {
        let mut h = harness();
        let mut upstream = connect(&mut h).await;
        let started = Instant::now();

        match upstream.requests.recv().await {
            Some(UpstreamRequest::Text { text, turn_complete }) => {
                assert!(turn_complete);
                assert!(text.contains("light, easy question"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(h.app.get_metrics_snapshot().idle_prompts, 1);
    }

    #[tokio::test]
    async fn test_recall_trigger_injects_memories() {
        let mut h = harness();
        let mut upstream = connect(&mut h).await;

        let user_id = user_id(&h.store).await;
        h.store
            .process_session(&format!("{}:c1", user_id), vec![TranscriptEntry::user("my cat is called Miso")])
            .await
            .unwrap();

        h.client
            .send(r#"{"type":"text","payload":{"text":"do you remember my cat?"}}"#.to_string())
            .unwrap();

        assert_eq!(
            next_message(&mut h.frames).await,
            ServerMessage::Status { action: StatusAction::Searching, tool: RetrievalTool::RecallMemory }
        );
        assert_eq!(
            next_message(&mut h.frames).await,
            ServerMessage::Status { action: StatusAction::Done, tool: RetrievalTool::RecallMemory }
        );

        let mut texts = Vec::new();
        for _ in 0..2 {
            match upstream.requests.recv().await {
                Some(UpstreamRequest::Text { text, .. }) => texts.push(text),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(texts.contains(&"do you remember my cat?".to_string()));
        assert!(texts.iter().any(|text| text.starts_with("[SYSTEM UPDATE]: [You recall") && text.ends_with("- my cat is called Miso")));
    }

    #[tokio::test]
    async fn test_search_trigger_injects_results() {
        let search = Arc::new(StaticSearch::default());
        let mut h = harness_with({
            let search = search.clone();
            move |services| services.with_search(search)
        });
        let mut upstream = connect(&mut h).await;

        h.client
            .send(r#"{"type":"text","payload":{"text":"any news about the festival?"}}"#.to_string())
            .unwrap();
        assert_eq!(
            next_message(&mut h.frames).await,
            ServerMessage::Status { action: StatusAction::Searching, tool: RetrievalTool::SearchWeb }
        );
        assert_eq!(
            next_message(&mut h.frames).await,
            ServerMessage::Status { action: StatusAction::Done, tool: RetrievalTool::SearchWeb }
        );

        let mut texts = Vec::new();
        for _ in 0..2 {
            texts.push(next_text(&mut upstream).await.0);
        }
        assert!(texts.contains(&"any news about the festival?".to_string()));
        assert!(texts.iter().any(|text| text.starts_with("[SYSTEM UPDATE]: [Here is what you just looked up")
            && text.ends_with("- Lantern festival (Osaka Daily): Lanterns light up the river")));
        assert_eq!(
            *search.queries.lock().unwrap(),
            vec!["local news".to_string(), "any news about the festival?".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_prompt_is_topical_when_news_is_cached() {
        let mut h = harness_with(|services| services.with_search(Arc::new(StaticSearch::default())));
        let mut upstream = connect(&mut h).await;

        let (prompt, turn_complete) = next_text(&mut upstream).await;
        assert!(turn_complete);
        assert!(prompt.contains("recent news story"));
    }

    #[tokio::test]
    async fn test_end_session_hands_transcript_to_memory() {
        let mut h = harness();
        let mut upstream = connect(&mut h).await;

        h.client.send(r#"{"type":"text","payload":{"text":"I adopted a puppy"}}"#.to_string()).unwrap();
        h.client
            .send(r#"{"type":"control","payload":{"action":"end_session"}}"#.to_string())
            .unwrap();

        loop {
            match h.frames.recv().await {
                Some(Outbound::Close) | None => break,
                Some(Outbound::Message(_)) => {}
            }
        }
        h.session.await.unwrap();
        let user_id = user_id(&h.store).await;

        // the link was closed on teardown
        let mut saw_close = false;
        while let Some(request) = upstream.requests.recv().await {
            saw_close |= request == UpstreamRequest::Close;
        }
        assert!(saw_close);

        let namespace = format!("{}:c1", user_id);
        for _ in 0..20 {
            if !h.store.memories(&namespace).is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.store.memories(&namespace), vec!["I adopted a puppy".to_string()]);
    }
}
