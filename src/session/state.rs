//! Per-connection session state.
//!
//! One [`SessionState`] exists per live connection and is shared, behind a
//! single mutex, by the routines of that connection only.

use crate::affect::{lexicon, EmotionState};
use crate::scheduler::{BurstPolicy, BurstTracker, IdleRotation};
use crate::services::{Role, SearchHit, TranscriptEntry};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Authenticating,
    Initializing,
    Streaming,
    Reconnecting,
    Closed,
}

/// Starting emotion: last persisted AI emotion, else the relationship default, else neutral.
pub fn seed_emotion(last_persisted: Option<EmotionState>, relationship_type: Option<&str>) -> EmotionState {
    last_persisted
        .or_else(|| relationship_type.and_then(lexicon::relationship_seed))
        .unwrap_or_else(EmotionState::neutral)
}

#[derive(Debug)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub emotion: EmotionState,
    /// Append-only for the lifetime of the session
    pub transcript: Vec<TranscriptEntry>,
    pub last_activity: Instant,
    /// Set at start and by user activity; cleared when the next AI transcript is classified
    pub interaction_pending: bool,
    pub burst: BurstTracker,
    pub idle: IdleRotation,
    pub news: Vec<SearchHit>,
}

impl SessionState {
    pub fn new(emotion: EmotionState, burst_policy: BurstPolicy) -> Self {
        Self {
            phase: SessionPhase::Initializing,
            emotion,
            transcript: Vec::new(),
            last_activity: Instant::now(),
            // the opening greeting is classified like any answer
            interaction_pending: true,
            burst: BurstTracker::new(burst_policy),
            idle: IdleRotation::default(),
            news: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// The user sent audio or text.
    pub fn record_user_activity(&mut self) {
        self.touch();
        self.interaction_pending = true;
        self.burst.reset();
    }

    pub fn push_user(&mut self, text: &str) {
        self.transcript.push(TranscriptEntry::user(text));
    }

    pub fn push_model(&mut self, text: &str, emotion: EmotionState) {
        self.transcript.push(TranscriptEntry::model(text, emotion));
    }

    /// Condensed recent history to re-inject after a relink, or `None` if nothing was said yet.
    pub fn replay_context(&self, window: usize, max_chars: usize) -> Option<String> {
        if self.transcript.is_empty() {
            return None;
        }

        let start = self.transcript.len().saturating_sub(window);
        let lines: Vec<String> = self.transcript[start..]
            .iter()
            .map(|entry| {
                let speaker = match entry.role {
                    Role::User => "User",
                    Role::Model => "You",
                };
                let text: String = entry.text.chars().take(max_chars).collect();
                format!("{}: {}", speaker, text)
            })
            .collect();

        Some(format!(
            "Conversation so far:\n{}\n\nContinue naturally and wait for the user to speak.",
            lines.join("\n")
        ))
    }
}
