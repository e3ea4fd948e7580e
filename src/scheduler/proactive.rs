//! Delayed proactive messages.
//!
//! After a synchronous exchange leaves the character agitated, it sends one
//! more message on its own a little later. At most one such task exists per
//! (character, user) pair; triggers that arrive while one is pending are
//! dropped rather than queued.

use crate::affect::{self, AffectContext, EmotionState};
use crate::services::{memory_namespace, PromptContext, ReplyRequest, Services, TranscriptEntry};
use anyhow::Result;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type PairKey = (String, String);

/// Lazily created per-(character, user) locks.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockRegistry {
    fn locks(&self) -> MutexGuard<'_, HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_for(&self, character_id: &str, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks()
            .entry((character_id.to_string(), user_id.to_string()))
            .or_default()
            .clone()
    }

    /// Drop locks nobody holds or references. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut locks = self.locks();
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProactiveSettings {
    /// Strictly above this arousal a follow-up is scheduled
    pub arousal_threshold: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub history_limit: usize,
    pub memory_top_k: usize,
}

impl Default for ProactiveSettings {
    fn default() -> Self {
        Self {
            arousal_threshold: 0.65,
            min_delay: Duration::from_secs(8),
            max_delay: Duration::from_secs(25),
            history_limit: 20,
            memory_top_k: 5,
        }
    }
}

pub struct ProactiveScheduler {
    services: Services,
    locks: Arc<LockRegistry>,
    settings: ProactiveSettings,
    delivered: AtomicU64,
}

impl ProactiveScheduler {
    pub fn new(services: Services, locks: Arc<LockRegistry>, settings: ProactiveSettings) -> Self {
        Self {
            services,
            locks,
            settings,
            delivered: AtomicU64::new(0),
        }
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Proactive messages persisted since startup.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn pick_delay(&self) -> Duration {
        let (min, max) = (self.settings.min_delay, self.settings.max_delay);
        if max <= min {
            return min;
        }
        Duration::from_secs_f64(rand::rng().random_range(min.as_secs_f64()..=max.as_secs_f64()))
    }

    /// Called after every synchronous exchange with the emotion it produced.
    ///
    /// Returns the handle of the scheduled task, or `None` when arousal is too
    /// low or a task for this pair is already pending.
    pub fn on_exchange(self: &Arc<Self>, character_id: &str, user_id: &str, emotion: &EmotionState) -> Option<JoinHandle<()>> {
        if emotion.arousal <= self.settings.arousal_threshold {
            return None;
        }

        let Ok(guard) = self.locks.lock_for(character_id, user_id).try_lock_owned() else {
            debug!(character_id, user_id, "Proactive message already pending, trigger dropped");
            return None;
        };

        let delay = self.pick_delay();
        info!(
            character_id,
            user_id,
            delay_secs = delay.as_secs_f64(),
            emotion = %emotion.label,
            "Proactive message scheduled"
        );

        let scheduler = Arc::clone(self);
        let character_id = character_id.to_string();
        let user_id = user_id.to_string();
        let emotion = *emotion;
        Some(tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            if let Err(e) = scheduler.deliver(&character_id, &user_id, &emotion).await {
                warn!(character_id = %character_id, user_id = %user_id, error = %e, "Proactive message failed");
            }
        }))
    }

    async fn deliver(&self, character_id: &str, user_id: &str, emotion: &EmotionState) -> Result<()> {
        let Some(generator) = self.services.generator.as_ref() else {
            debug!("No reply generator configured, skipping proactive message");
            return Ok(());
        };
        let Some(character) = self.services.characters.find_for_user(character_id, user_id).await? else {
            return Ok(());
        };
        let Some(user) = self.services.users.get(user_id).await? else {
            return Ok(());
        };

        let mut memory_snippets = Vec::new();
        if let Some(memory) = &self.services.memory {
            let namespace = memory_namespace(user_id, Some(character_id));
            let query = format!("Recent conversation with {}", user.display_name.as_deref().unwrap_or("user"));
            match memory.recall(&namespace, &query, self.settings.memory_top_k).await {
                Ok(snippets) => memory_snippets = snippets,
                Err(e) => warn!(error = %e, "Memory recall failed"),
            }
        }

        let system_prompt = self.services.prompts.build(&PromptContext {
            user: &user,
            character: Some(&character),
            memory_snippets: &memory_snippets,
            news: &[],
        });
        let history = self
            .services
            .messages
            .recent(character_id, user_id, self.settings.history_limit)
            .await?;
        let instruction = format!(
            "You are feeling {} right now. Send the user a message on your own that expresses it. \
             Don't repeat anything you said before, and keep it natural.",
            emotion.label
        );

        let text = generator
            .generate(ReplyRequest {
                system_prompt: &system_prompt,
                history: &history,
                instruction: &instruction,
            })
            .await?;

        let context = AffectContext {
            relationship_type: character.relationship_type.as_deref(),
            familiarity: character.familiarity_level,
            personality_code: character.personality_code.as_deref(),
        };
        let new_emotion = affect::classify(&text, &context, Some(emotion));

        self.services
            .messages
            .append(character_id, user_id, TranscriptEntry::model(text, new_emotion))
            .await?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        info!(character_id, user_id, emotion = %new_emotion.label, "Proactive message sent");
        Ok(())
    }
}
