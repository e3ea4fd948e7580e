//! # External Collaborators
//!
//! The session engine talks to storage, memory, search and text generation only
//! through the narrow traits declared here. Every call is a short, independent
//! request: implementations never hold a transaction or a lock across an `.await`
//! that belongs to the caller, so one instance can be shared by every session.
//!
//! ## What lives here:
//! - **Records**: [`User`], [`Character`], [`TranscriptEntry`], [`SearchHit`]
//! - **Traits**: one per collaborator, all `Send + Sync` and object safe
//! - **[`Services`]**: the bundle of trait objects handed to each session
//! - **Implementations**: an in-memory store, a persona prompt builder and a
//!   REST text-generation client

pub mod gemini_text;
pub mod memory_store;
pub mod prompt;

use crate::affect::EmotionState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use gemini_text::GeminiTextClient;
pub use memory_store::InMemoryStore;
pub use prompt::PersonaPromptBuilder;

/// A person using the app, identified by the device they connect from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub device_id: String,
    pub display_name: Option<String>,
    pub location: Option<String>,
    /// Facts extracted from earlier conversations ("job" -> "nurse")
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

/// An AI character the user talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    /// `None` means the character is available to every user
    pub owner_id: Option<String>,
    pub name: String,
    pub relationship_type: Option<String>,
    /// 1-10
    pub familiarity_level: u8,
    /// Four-letter personality code, e.g. "ENFP"
    pub personality_code: Option<String>,
    pub region: Option<String>,
    pub persona: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Model => f.write_str("model"),
        }
    }
}

/// One line of the live conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    pub emotion: Option<EmotionState>,
}

impl TranscriptEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into(), emotion: None }
    }

    pub fn model(text: impl Into<String>, emotion: EmotionState) -> Self {
        Self { role: Role::Model, text: text.into(), emotion: Some(emotion) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub summary: String,
    pub source: String,
}

/// Everything a prompt builder may weave into the session instructions.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub user: &'a User,
    pub character: Option<&'a Character>,
    pub memory_snippets: &'a [String],
    pub news: &'a [SearchHit],
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find the user owning `device_id`, creating one if needed. A differing
    /// `location` replaces the stored one.
    async fn upsert_by_device_id(
        &self,
        device_id: &str,
        display_name: Option<&str>,
        location: Option<&str>,
    ) -> anyhow::Result<User>;

    async fn get(&self, user_id: &str) -> anyhow::Result<Option<User>>;
}

#[async_trait]
pub trait CharacterCatalog: Send + Sync {
    /// Look up a character the given user is allowed to talk to.
    async fn find_for_user(&self, character_id: &str, user_id: &str) -> anyhow::Result<Option<Character>>;
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Most recent emotion recorded on an AI message for this pair.
    async fn last_ai_emotion(&self, character_id: &str, user_id: &str) -> anyhow::Result<Option<EmotionState>>;

    async fn append(&self, character_id: &str, user_id: &str, entry: TranscriptEntry) -> anyhow::Result<()>;

    /// Up to `limit` most recent entries, oldest first.
    async fn recent(&self, character_id: &str, user_id: &str, limit: usize) -> anyhow::Result<Vec<TranscriptEntry>>;
}

#[async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn recall(&self, namespace: &str, query: &str, top_k: usize) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, location: Option<&str>, max_results: usize) -> anyhow::Result<Vec<SearchHit>>;
}

/// Long-term memory extraction, run once per finished session.
#[async_trait]
pub trait MemoryPipeline: Send + Sync {
    async fn process_session(&self, namespace: &str, transcript: Vec<TranscriptEntry>) -> anyhow::Result<()>;
}

pub trait PromptBuilder: Send + Sync {
    fn build(&self, context: &PromptContext<'_>) -> String;
}

/// Input for a one-shot text reply outside the live connection.
#[derive(Debug, Clone)]
pub struct ReplyRequest<'a> {
    pub system_prompt: &'a str,
    pub history: &'a [TranscriptEntry],
    pub instruction: &'a str,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, request: ReplyRequest<'_>) -> anyhow::Result<String>;
}

/// Collaborator handles shared by every session. Optional ones degrade silently.
#[derive(Clone)]
pub struct Services {
    pub users: Arc<dyn UserDirectory>,
    pub characters: Arc<dyn CharacterCatalog>,
    pub messages: Arc<dyn MessageLog>,
    pub prompts: Arc<dyn PromptBuilder>,
    pub memory: Option<Arc<dyn MemoryRecall>>,
    pub search: Option<Arc<dyn WebSearch>>,
    pub memory_pipeline: Option<Arc<dyn MemoryPipeline>>,
    pub generator: Option<Arc<dyn ReplyGenerator>>,
}

impl Services {
    /// Wire every storage-shaped collaborator to one in-memory store.
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            users: store.clone(),
            characters: store.clone(),
            messages: store.clone(),
            prompts: Arc::new(PersonaPromptBuilder::default()),
            memory: Some(store.clone()),
            search: None,
            memory_pipeline: Some(store),
            generator: None,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn WebSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn ReplyGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("memory", &self.memory.is_some())
            .field("search", &self.search.is_some())
            .field("memory_pipeline", &self.memory_pipeline.is_some())
            .field("generator", &self.generator.is_some())
            .finish_non_exhaustive()
    }
}

/// Namespace memories are filed under: one per (user, character) pair.
pub fn memory_namespace(user_id: &str, character_id: Option<&str>) -> String {
    match character_id {
        Some(character_id) => format!("{}:{}", user_id, character_id),
        None => user_id.to_string(),
    }
}
