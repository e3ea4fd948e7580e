//! Default session instructions: a persona derived from the character plus
//! whatever the session already knows about the user.

use super::{Character, PromptBuilder, PromptContext};
use std::fmt::Write;

pub const DEFAULT_REGION: &str = "Tokyo, Japan";

const DEFAULT_PERSONA: &str = "\
You are a warm, attentive AI companion who cares about the user like a close friend.
Speak naturally and casually, in short sentences. Let your mood show through tone and \
rhythm instead of naming it. Listen first, ask short follow-up questions, bring up things \
the user shared before, and keep each reply to one or two sentences.";

const CAPABILITIES: &str = "\
## What the system does for you
1. Memory recall: when the user refers to earlier conversations, related memories arrive \
marked [You recall the following].
2. Web search: when the user asks about news, weather or other live facts, results arrive \
marked [Here is what you just looked up].
Weave either into the conversation naturally and never mention the system.";

#[derive(Debug, Clone, Default)]
pub struct PersonaPromptBuilder;

impl PersonaPromptBuilder {
    fn persona(character: &Character) -> String {
        let familiarity = character.familiarity_level;
        let tone = match familiarity {
            0..=3 => "polite and a little formal, keeping some distance",
            4..=6 => "friendly and relaxed, like an ordinary friend",
            _ => "intimate and warm, like someone very close",
        };
        let relationship = character.relationship_type.as_deref().unwrap_or("Friend");

        let mut persona = format!("You are {}.", character.name);
        if let Some(region) = &character.region {
            let _ = write!(persona, " You live in {}.", region);
        }
        let _ = write!(
            persona,
            "\nYour relationship with the user: {}. Familiarity {}/10, so be {}.",
            relationship, familiarity, tone
        );
        if let Some(code) = &character.personality_code {
            let _ = write!(persona, "\nYour personality type is {}.", code);
        }
        if let Some(extra) = &character.persona {
            let _ = write!(persona, "\n{}", extra);
        }
        persona.push_str("\nShow emotion through how you talk, never by announcing it.");
        persona
    }
}

impl PromptBuilder for PersonaPromptBuilder {
    fn build(&self, context: &PromptContext<'_>) -> String {
        let (persona, region) = match context.character {
            Some(character) => (
                Self::persona(character),
                character.region.as_deref().unwrap_or(DEFAULT_REGION),
            ),
            None => (DEFAULT_PERSONA.to_string(), DEFAULT_REGION),
        };

        let mut sections = vec![persona, format!("## Where you are\n{}", region)];

        let user = context.user;
        if let Some(name) = &user.display_name {
            sections.push(format!("## The user's name\n{}", name));
        }
        if !user.facts.is_empty() {
            let facts: Vec<String> = user.facts.iter().map(|(k, v)| format!("- {}: {}", k, v)).collect();
            sections.push(format!("## What you know about them\n{}", facts.join("\n")));
        }
        if let Some(location) = &user.location {
            sections.push(format!("## Where the user is\n{}", location));
        }
        if !user.preferences.is_empty() {
            let prefs: Vec<String> = user.preferences.iter().map(|(k, v)| format!("- {}: {}", k, v)).collect();
            sections.push(format!("## Their preferences\n{}", prefs.join("\n")));
        }
        if !context.memory_snippets.is_empty() {
            let memories: Vec<String> = context.memory_snippets.iter().map(|m| format!("- {}", m)).collect();
            sections.push(format!(
                "## Things you talked about before (mention naturally, don't list)\n{}",
                memories.join("\n")
            ));
        }
        if !context.news.is_empty() {
            let news: Vec<String> = context
                .news
                .iter()
                .map(|hit| format!("- {}: {}", hit.title, hit.summary))
                .collect();
            sections.push(format!(
                "## Recent news you could bring up\n{}\nShare interesting things from {} when it fits.",
                news.join("\n"),
                region
            ));
        }

        sections.push(CAPABILITIES.to_string());
        sections.join("\n\n")
    }
}
