//! # Streaming Session Adapter
//!
//! The upstream realtime API ends its response stream after every turn. That is
//! normal operation, not a failure: to hear the next turn the link has to be
//! re-established. [`LiveAdapter`] hides this behind a continuous duplex
//! abstraction:
//!
//! - `send_*` calls retry and relink transparently
//! - [`LiveAdapter::receive_responses`] yields one turn's worth of events and
//!   ends at the turn boundary; the caller relinks and asks again
//! - session-resumption handles seen mid-stream are presented on the next link
//!
//! ## Link state machine
//!
//! ```text
//! Connecting ──► Streaming ──► TurnBoundary ──► Reconnecting ──► Streaming
//!      │             │  └─────────────────────────────▲  │
//!      └──► Closed ◄─┴──────────────────────────────────┘
//! ```
//!
//! Transitions outside [`LinkPhase::can_transition_to`] are rejected.
//!
//! The wire protocol itself sits behind the [`Connector`] trait; [`gemini`]
//! provides the production implementation.

pub mod gemini;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

pub use gemini::GeminiConnector;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LiveError {
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream disconnected: {0}")]
    Disconnected(String),
    #[error("upstream link is closed")]
    Closed,
    #[error("invalid link transition {from:?} -> {to:?}")]
    InvalidTransition { from: LinkPhase, to: LinkPhase },
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

/// Frames sent toward the upstream model.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamRequest {
    Audio { data: Vec<u8>, mime_type: String },
    Text { text: String, turn_complete: bool },
    Close,
}

/// Events received from the upstream model.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Audio { data: Vec<u8>, mime_type: String },
    OutputTranscript(String),
    InputTranscript(String),
    Interrupted,
    TurnComplete,
    ResumptionHandle(String),
    GoAway,
}

/// Parameters for opening one upstream link.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub instructions: String,
    pub resumption_handle: Option<String>,
}

/// One open upstream link. The event receiver ends when the upstream ends its stream.
#[derive(Debug)]
pub struct Connection {
    pub requests: mpsc::UnboundedSender<UpstreamRequest>,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, setup: &SessionSetup) -> Result<Connection, LiveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Connecting,
    Streaming,
    TurnBoundary,
    Reconnecting,
    Closed,
}

impl LinkPhase {
    pub fn can_transition_to(self, next: LinkPhase) -> bool {
        use LinkPhase::*;
        matches!(
            (self, next),
            (Connecting, Streaming)
                | (Connecting, Closed)
                | (Streaming, TurnBoundary)
                | (Streaming, Reconnecting)
                | (Streaming, Closed)
                | (TurnBoundary, Reconnecting)
                | (TurnBoundary, Closed)
                | (Reconnecting, Streaming)
                | (Reconnecting, Closed)
        )
    }
}

/// Bounded retry settings for relinking and sending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub reconnect_attempts: u32,
    /// Attempt `n` waits `backoff * (n - 1)` before dialing
    pub reconnect_backoff: Duration,
    pub send_attempts: u32,
    pub send_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(500),
            send_attempts: 3,
            send_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.reconnect_backoff * attempt.saturating_sub(1)
    }
}

#[derive(Debug)]
struct Link {
    phase: LinkPhase,
    generation: u64,
    requests: Option<mpsc::UnboundedSender<UpstreamRequest>>,
    resumption_handle: Option<String>,
    /// Receiver of the newest link, waiting to be picked up by the reader
    fresh_events: Option<mpsc::UnboundedReceiver<UpstreamEvent>>,
    /// A send relinked on its own; the reader never sees that boundary
    relinked_by_send: bool,
}

impl Link {
    fn transition(&mut self, next: LinkPhase) -> Result<(), LiveError> {
        if !self.phase.can_transition_to(next) {
            return Err(LiveError::InvalidTransition { from: self.phase, to: next });
        }
        debug!(from = ?self.phase, to = ?next, generation = self.generation, "Link transition");
        self.phase = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relink {
    Performed,
    /// Someone else relinked while this caller waited
    Concurrent,
    Failed,
}

#[derive(Debug, Default)]
struct EventCursor {
    generation: u64,
    receiver: Option<mpsc::UnboundedReceiver<UpstreamEvent>>,
}

/// Resumable duplex link to the upstream realtime model.
pub struct LiveAdapter {
    connector: Arc<dyn Connector>,
    instructions: String,
    policy: RetryPolicy,
    link: Mutex<Link>,
    events: tokio::sync::Mutex<EventCursor>,
    relinked: Notify,
    reconnect_gate: tokio::sync::Mutex<()>,
}

impl LiveAdapter {
    pub fn new(connector: Arc<dyn Connector>, instructions: String, policy: RetryPolicy) -> Self {
        Self {
            connector,
            instructions,
            policy,
            link: Mutex::new(Link {
                phase: LinkPhase::Connecting,
                generation: 0,
                requests: None,
                resumption_handle: None,
                fresh_events: None,
                relinked_by_send: false,
            }),
            events: tokio::sync::Mutex::new(EventCursor::default()),
            relinked: Notify::new(),
            reconnect_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> LinkPhase {
        self.link().phase
    }

    pub fn resumption_handle(&self) -> Option<String> {
        self.link().resumption_handle.clone()
    }

    fn setup(&self) -> SessionSetup {
        SessionSetup {
            instructions: self.instructions.clone(),
            resumption_handle: self.link().resumption_handle.clone(),
        }
    }

    /// Install a freshly opened connection as the current link.
    fn install(&self, connection: Connection) -> Result<(), LiveError> {
        let mut link = self.link();
        if link.phase == LinkPhase::Closed {
            let _ = connection.requests.send(UpstreamRequest::Close);
            return Err(LiveError::Closed);
        }
        link.transition(LinkPhase::Streaming)?;
        link.generation += 1;
        link.requests = Some(connection.requests);
        link.fresh_events = Some(connection.events);
        drop(link);

        self.relinked.notify_one();
        Ok(())
    }

    /// Open the first link.
    pub async fn connect(&self) -> Result<(), LiveError> {
        let phase = self.phase();
        if phase != LinkPhase::Connecting {
            return Err(LiveError::InvalidTransition { from: phase, to: LinkPhase::Streaming });
        }

        let connection = self.connector.open(&self.setup()).await?;
        self.install(connection)?;
        info!("Upstream link established");
        Ok(())
    }

    /// Tear down the current link and dial again with bounded backoff.
    ///
    /// Returns `false` once every attempt has failed; the link is then closed.
    pub async fn reconnect(&self) -> bool {
        self.relink().await != Relink::Failed
    }

    /// True once after a send had to relink by itself. The caller should
    /// replay its context onto the new link.
    pub fn take_relinked_by_send(&self) -> bool {
        std::mem::take(&mut self.link().relinked_by_send)
    }

    async fn relink(&self) -> Relink {
        let seen_generation = self.link().generation;
        let _gate = self.reconnect_gate.lock().await;

        {
            let mut link = self.link();
            let phase = link.phase;
            match phase {
                LinkPhase::Closed => return Relink::Failed,
                // another caller relinked while we waited for the gate
                _ if link.generation != seen_generation => return Relink::Concurrent,
                LinkPhase::Connecting => {}
                _ => {
                    if link.transition(LinkPhase::Reconnecting).is_err() {
                        return Relink::Failed;
                    }
                    if let Some(requests) = link.requests.take() {
                        let _ = requests.send(UpstreamRequest::Close);
                    }
                }
            }
        }

        for attempt in 1..=self.policy.reconnect_attempts {
            let backoff = self.policy.backoff_for(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            if self.phase() == LinkPhase::Closed {
                return Relink::Failed;
            }

            match self.connector.open(&self.setup()).await {
                Ok(connection) => match self.install(connection) {
                    Ok(()) => {
                        debug!(attempt, "Upstream relinked");
                        return Relink::Performed;
                    }
                    Err(_) => return Relink::Failed,
                },
                Err(e) => warn!(attempt, error = %e, "Upstream reconnect attempt failed"),
            }
        }

        warn!(attempts = self.policy.reconnect_attempts, "Upstream reconnect exhausted");
        let mut link = self.link();
        if link.phase != LinkPhase::Closed {
            let _ = link.transition(LinkPhase::Closed);
        }
        drop(link);
        self.relinked.notify_one();
        Relink::Failed
    }

    fn try_send(&self, request: UpstreamRequest) -> Result<(), UpstreamRequest> {
        let link = self.link();
        match (link.phase, &link.requests) {
            (LinkPhase::Streaming | LinkPhase::TurnBoundary, Some(requests)) => {
                requests.send(request).map_err(|returned| returned.0)
            }
            _ => Err(request),
        }
    }

    async fn send(&self, request: UpstreamRequest) -> Result<(), LiveError> {
        let mut request = request;
        for attempt in 1..=self.policy.send_attempts {
            request = match self.try_send(request) {
                Ok(()) => return Ok(()),
                Err(returned) => returned,
            };
            if self.phase() == LinkPhase::Closed {
                return Err(LiveError::Closed);
            }

            warn!(attempt, "Upstream send failed, relinking");
            tokio::time::sleep(self.policy.send_delay).await;
            match self.relink().await {
                Relink::Performed => self.link().relinked_by_send = true,
                Relink::Concurrent => {}
                Relink::Failed => break,
            }
        }

        // a relink on the final attempt may have succeeded
        self.try_send(request)
            .map_err(|_| LiveError::Disconnected("send retries exhausted".to_string()))
    }

    pub async fn send_audio(&self, data: Vec<u8>, mime_type: &str) -> Result<(), LiveError> {
        self.send(UpstreamRequest::Audio { data, mime_type: mime_type.to_string() }).await
    }

    /// Send a user text turn.
    pub async fn send_text(&self, text: &str) -> Result<(), LiveError> {
        self.send(UpstreamRequest::Text { text: text.to_string(), turn_complete: true }).await
    }

    /// Send out-of-band context; with `turn_complete == false` the model does
    /// not answer it on its own.
    pub async fn inject_context(&self, text: &str, turn_complete: bool) -> Result<(), LiveError> {
        self.send(UpstreamRequest::Text {
            text: format!("[SYSTEM UPDATE]: {}", text),
            turn_complete,
        })
        .await
    }

    /// Move the cursor onto the newest link if one is waiting.
    fn adopt_fresh(&self, cursor: &mut EventCursor) {
        let mut link = self.link();
        if let Some(receiver) = link.fresh_events.take() {
            cursor.generation = link.generation;
            cursor.receiver = Some(receiver);
        }
    }

    fn has_fresh(&self) -> bool {
        self.link().fresh_events.is_some()
    }

    fn mark_turn_boundary(&self, generation: u64) {
        let mut link = self.link();
        if link.generation == generation && link.phase == LinkPhase::Streaming {
            let _ = link.transition(LinkPhase::TurnBoundary);
        }
    }

    async fn next_event(&self) -> Option<UpstreamEvent> {
        let mut cursor = self.events.lock().await;
        loop {
            if self.phase() == LinkPhase::Closed {
                cursor.receiver = None;
                return None;
            }
            self.adopt_fresh(&mut cursor);

            let generation = cursor.generation;
            let Some(receiver) = cursor.receiver.as_mut() else {
                return None;
            };

            tokio::select! {
                event = receiver.recv() => match event {
                    Some(UpstreamEvent::ResumptionHandle(handle)) => {
                        debug!("Captured session resumption handle");
                        self.link().resumption_handle = Some(handle);
                    }
                    Some(UpstreamEvent::GoAway) => {
                        info!(generation, "Upstream sent go-away");
                        cursor.receiver = None;
                        self.mark_turn_boundary(generation);
                        return None;
                    }
                    Some(event) => return Some(event),
                    None => {
                        cursor.receiver = None;
                        // a relink already replaced this link; keep reading from the new one
                        if self.has_fresh() {
                            continue;
                        }
                        self.mark_turn_boundary(generation);
                        return None;
                    }
                },
                _ = self.relinked.notified() => {}
            }
        }
    }

    /// Events of the current turn. Ends at the turn boundary or on close.
    pub fn receive_responses(&self) -> impl Stream<Item = UpstreamEvent> + '_ {
        stream::unfold(self, |adapter| async move { adapter.next_event().await.map(|event| (event, adapter)) })
    }

    pub async fn close(&self) {
        let requests = {
            let mut link = self.link();
            if link.phase == LinkPhase::Closed {
                return;
            }
            let _ = link.transition(LinkPhase::Closed);
            link.fresh_events = None;
            link.requests.take()
        };
        if let Some(requests) = requests {
            let _ = requests.send(UpstreamRequest::Close);
        }
        self.relinked.notify_one();
        info!("Upstream link closed");
    }
}
