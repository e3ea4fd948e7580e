//! Synchronous text exchange outside the live connection.
//!
//! The reply is generated in one request, stamped with the character's new
//! emotion and persisted. When that emotion is agitated enough, the proactive
//! scheduler may follow up on its own a little later.

use crate::affect::{self, AffectContext};
use crate::error::AppError;
use crate::services::{memory_namespace, PromptContext, ReplyRequest, TranscriptEntry};
use crate::session::protocol::EmotionStamp;
use crate::session::state::seed_emotion;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub device_id: String,
    pub character_id: String,
    pub text: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub user_id: String,
    pub text: String,
    #[serde(flatten)]
    pub stamp: EmotionStamp,
    /// A delayed follow-up was scheduled by this exchange
    pub proactive_scheduled: bool,
}

pub async fn chat(state: web::Data<AppState>, body: web::Json<ChatRequest>) -> Result<HttpResponse, AppError> {
    let request = body.into_inner();
    if request.text.trim().is_empty() {
        return Err(AppError::BadRequest("text must not be empty".to_string()));
    }

    let services = &state.services;
    let generator = services
        .generator
        .clone()
        .ok_or_else(|| AppError::ServiceUnavailable("Text generation is not configured".to_string()))?;

    let user = services
        .users
        .upsert_by_device_id(&request.device_id, request.display_name.as_deref(), request.location.as_deref())
        .await?;
    let character = services
        .characters
        .find_for_user(&request.character_id, &user.id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Character {}", request.character_id)))?;

    let config = state.get_config();
    let previous = seed_emotion(
        services.messages.last_ai_emotion(&character.id, &user.id).await?,
        character.relationship_type.as_deref(),
    );

    let memory_snippets = match &services.memory {
        Some(memory) => memory
            .recall(
                &memory_namespace(&user.id, Some(&character.id)),
                &request.text,
                config.session.memory_top_k,
            )
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Memory recall failed");
                Vec::new()
            }),
        None => Vec::new(),
    };

    let system_prompt = services.prompts.build(&PromptContext {
        user: &user,
        character: Some(&character),
        memory_snippets: &memory_snippets,
        news: &[],
    });
    let history = services
        .messages
        .recent(&character.id, &user.id, config.proactive.history_limit)
        .await?;

    let reply = generator
        .generate(ReplyRequest {
            system_prompt: &system_prompt,
            history: &history,
            instruction: &request.text,
        })
        .await?;

    let context = AffectContext {
        relationship_type: character.relationship_type.as_deref(),
        familiarity: character.familiarity_level,
        personality_code: character.personality_code.as_deref(),
    };
    let emotion = affect::classify(&reply, &context, Some(&previous));

    services
        .messages
        .append(&character.id, &user.id, TranscriptEntry::user(request.text.as_str()))
        .await?;
    services
        .messages
        .append(&character.id, &user.id, TranscriptEntry::model(reply.as_str(), emotion))
        .await?;
    state.record_emotion_update();

    let proactive_scheduled = state.proactive.on_exchange(&character.id, &user.id, &emotion).is_some();
    info!(
        user_id = %user.id,
        character_id = %character.id,
        emotion = %emotion.label,
        proactive_scheduled,
        "Chat exchange completed"
    );

    Ok(HttpResponse::Ok().json(ChatResponse {
        user_id: user.id,
        text: reply,
        stamp: EmotionStamp::from(&emotion),
        proactive_scheduled,
    }))
}
