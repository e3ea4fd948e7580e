//! In-process stand-in for the relational store and the memory index.
//!
//! Users, characters, chat messages and extracted memories are kept in plain
//! maps behind a `std::sync::RwLock`. Guards are only held inside each call.

use super::{
    Character, CharacterCatalog, MemoryPipeline, MemoryRecall, MessageLog, Role, TranscriptEntry, User,
    UserDirectory,
};
use crate::affect::EmotionState;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreInner {
    users: HashMap<String, User>,
    /// device_id -> user_id
    devices: HashMap<String, String>,
    characters: HashMap<String, Character>,
    /// (character_id, user_id) -> chronological messages
    messages: HashMap<(String, String), Vec<TranscriptEntry>>,
    /// memory namespace -> remembered lines, oldest first
    memories: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with characters.
    pub fn with_characters(characters: impl IntoIterator<Item = Character>) -> Self {
        let store = Self::new();
        for character in characters {
            store.insert_character(character);
        }
        store
    }

    pub fn insert_character(&self, character: Character) {
        self.write().characters.insert(character.id.clone(), character);
    }

    pub fn character_count(&self) -> usize {
        self.read().characters.len()
    }

    /// Everything remembered under a namespace, oldest first.
    pub fn memories(&self, namespace: &str) -> Vec<String> {
        self.read().memories.get(namespace).cloned().unwrap_or_default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UserDirectory for InMemoryStore {
    async fn upsert_by_device_id(
        &self,
        device_id: &str,
        display_name: Option<&str>,
        location: Option<&str>,
    ) -> anyhow::Result<User> {
        let mut inner = self.write();

        if let Some(user_id) = inner.devices.get(device_id).cloned() {
            if let Some(user) = inner.users.get_mut(&user_id) {
                if let Some(location) = location {
                    if user.location.as_deref() != Some(location) {
                        user.location = Some(location.to_string());
                    }
                }
                if user.display_name.is_none() {
                    user.display_name = display_name.map(str::to_string);
                }
                return Ok(user.clone());
            }
        }

        let user = User {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            display_name: display_name.map(str::to_string),
            location: location.map(str::to_string),
            facts: BTreeMap::new(),
            preferences: BTreeMap::new(),
        };
        inner.devices.insert(device_id.to_string(), user.id.clone());
        inner.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get(&self, user_id: &str) -> anyhow::Result<Option<User>> {
        Ok(self.read().users.get(user_id).cloned())
    }
}

#[async_trait]
impl CharacterCatalog for InMemoryStore {
    async fn find_for_user(&self, character_id: &str, user_id: &str) -> anyhow::Result<Option<Character>> {
        let inner = self.read();
        let character = inner
            .characters
            .get(character_id)
            .filter(|c| c.owner_id.as_deref().map_or(true, |owner| owner == user_id))
            .cloned();
        Ok(character)
    }
}

#[async_trait]
impl MessageLog for InMemoryStore {
    async fn last_ai_emotion(&self, character_id: &str, user_id: &str) -> anyhow::Result<Option<EmotionState>> {
        let inner = self.read();
        let key = (character_id.to_string(), user_id.to_string());
        let emotion = inner.messages.get(&key).and_then(|entries| {
            entries
                .iter()
                .rev()
                .filter(|entry| entry.role == Role::Model)
                .find_map(|entry| entry.emotion)
        });
        Ok(emotion)
    }

    async fn append(&self, character_id: &str, user_id: &str, entry: TranscriptEntry) -> anyhow::Result<()> {
        let key = (character_id.to_string(), user_id.to_string());
        self.write().messages.entry(key).or_default().push(entry);
        Ok(())
    }

    async fn recent(&self, character_id: &str, user_id: &str, limit: usize) -> anyhow::Result<Vec<TranscriptEntry>> {
        let inner = self.read();
        let key = (character_id.to_string(), user_id.to_string());
        let entries = inner
            .messages
            .get(&key)
            .map(|entries| {
                let start = entries.len().saturating_sub(limit);
                entries[start..].to_vec()
            })
            .unwrap_or_default();
        Ok(entries)
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemoryRecall for InMemoryStore {
    /// Rank remembered lines by words shared with the query, newest first on ties.
    async fn recall(&self, namespace: &str, query: &str, top_k: usize) -> anyhow::Result<Vec<String>> {
        let inner = self.read();
        let Some(lines) = inner.memories.get(namespace) else {
            return Ok(Vec::new());
        };

        let wanted = tokens(query);
        let mut ranked: Vec<(usize, usize, &String)> = lines
            .iter()
            .enumerate()
            .map(|(position, line)| (tokens(line).intersection(&wanted).count(), position, line))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(ranked.into_iter().take(top_k).map(|(_, _, line)| line.clone()).collect())
    }
}

#[async_trait]
impl MemoryPipeline for InMemoryStore {
    /// Keeps what the user said; the character's side is regenerated on demand.
    async fn process_session(&self, namespace: &str, transcript: Vec<TranscriptEntry>) -> anyhow::Result<()> {
        let lines: Vec<String> = transcript
            .into_iter()
            .filter(|entry| entry.role == Role::User && !entry.text.trim().is_empty())
            .map(|entry| entry.text.trim().to_string())
            .collect();

        if !lines.is_empty() {
            self.write().memories.entry(namespace.to_string()).or_default().extend(lines);
        }
        Ok(())
    }
}
