// src/chat.rs
use crate::analysis;
use crate::auth::AuthUser;
use crate::billing;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::funnel;
use crate::llm::{self, LlmClient};
use crate::models::{
    Conversation, CreateConversationRequest, FunnelStage, Message, MessageRole,
    RelationshipStage, SendMessageRequest,
};
use crate::relationship;
use actix_web::{HttpResponse, get, post, web};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

pub const MAX_MESSAGE_CHARS: usize = 4_000;
const MAX_TITLE_CHARS: usize = 120;
const HISTORY_TURNS: i64 = 20;
const TOXICITY_LIMIT: f64 = 0.8;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(create_conversation);
    cfg.service(list_conversations);
    cfg.service(get_conversation);
    cfg.service(send_message);
}

pub fn validate_content(content: &str) -> ApiResult<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("message content is empty"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::validation(format!(
            "message content exceeds {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(trimmed)
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

/// Loads a conversation owned by `user_id`. Other users' conversations read as missing.
async fn owned_conversation(pool: &PgPool, id: Uuid, user_id: Uuid) -> ApiResult<Conversation> {
    match db::get_conversation(pool, id).await? {
        Some(conversation) if conversation.user_id == user_id => Ok(conversation),
        _ => Err(ApiError::NotFound("Conversation")),
    }
}

#[post("/conversations")]
pub async fn create_conversation(
    pool: web::Data<PgPool>,
    user: AuthUser,
    req: web::Json<CreateConversationRequest>,
) -> ApiResult<HttpResponse> {
    let title = req
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("New conversation");
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::validation("title is too long"));
    }

    let now = Utc::now();
    let conversation = Conversation {
        id: Uuid::new_v4(),
        user_id: user.id,
        title: title.to_string(),
        created_at: now,
        updated_at: now,
    };
    db::create_conversation(&pool, &conversation).await?;
    Ok(HttpResponse::Created().json(conversation))
}

#[get("/conversations")]
pub async fn list_conversations(
    pool: web::Data<PgPool>,
    user: AuthUser,
) -> ApiResult<HttpResponse> {
    let conversations = db::list_conversations(&pool, user.id).await?;
    Ok(HttpResponse::Ok().json(conversations))
}

#[get("/conversations/{id}")]
pub async fn get_conversation(
    pool: web::Data<PgPool>,
    user: AuthUser,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let conversation = owned_conversation(&pool, path.into_inner(), user.id).await?;
    let messages = db::get_conversation_messages(&pool, conversation.id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "conversation": conversation,
        "messages": messages,
    })))
}

#[post("/conversations/{id}/messages")]
pub async fn send_message(
    pool: web::Data<PgPool>,
    llm_client: web::Data<LlmClient>,
    user: AuthUser,
    path: web::Path<Uuid>,
    req: web::Json<SendMessageRequest>,
) -> ApiResult<HttpResponse> {
    let content = validate_content(&req.content)?;
    let conversation = owned_conversation(&pool, path.into_inner(), user.id).await?;

    let now = Utc::now();
    let plan = billing::effective_plan(&pool, user.id).await?;
    let sent_today = db::count_user_messages_since(&pool, user.id, start_of_day(now)).await?;
    if !plan.allows_message(sent_today) {
        return Err(ApiError::LimitExceeded(format!(
            "Daily message limit of {} reached for the {} plan",
            plan.messages_per_day().unwrap_or_default(),
            plan
        )));
    }

    let analysis = analysis::analyze(content);
    if analysis.toxicity >= TOXICITY_LIMIT {
        return Err(ApiError::validation("message was flagged as abusive"));
    }

    let user_message = Message {
        id: Uuid::new_v4(),
        conversation_id: conversation.id,
        user_id: user.id,
        role: MessageRole::User.as_str().to_string(),
        content: content.to_string(),
        sentiment: Some(analysis.sentiment),
        toxicity: Some(analysis.toxicity),
        created_at: now,
    };
    db::insert_message(&pool, &user_message).await?;

    let profile = db::get_profile(&pool, user.id)
        .await?
        .ok_or(ApiError::NotFound("Profile"))?;
    let stage: RelationshipStage = profile
        .relationship_stage
        .parse()
        .unwrap_or(RelationshipStage::Stranger);
    let history = db::get_conversation_tail(&pool, conversation.id, HISTORY_TURNS).await?;
    let turns = llm::build_turns(profile.archetype(), &profile.companion_name, stage, &history);
    let reply_text = llm_client.complete(&turns).await?;

    let reply = Message {
        id: Uuid::new_v4(),
        conversation_id: conversation.id,
        user_id: user.id,
        role: MessageRole::Assistant.as_str().to_string(),
        content: reply_text,
        sentiment: None,
        toxicity: None,
        created_at: Utc::now(),
    };
    db::insert_message(&pool, &reply).await?;

    match db::has_conversion_event(&pool, user.id, FunnelStage::FirstMessage.as_str()).await {
        Ok(false) => {
            let archetype = Some(profile.archetype());
            if let Err(e) =
                funnel::record(&pool, FunnelStage::FirstMessage, Some(user.id), None, archetype, json!({})).await
            {
                tracing::warn!("Failed to record first message event: {}", e);
            }
        }
        Ok(true) => {}
        Err(e) => tracing::warn!("Failed to check first message event: {}", e),
    }

    let relationship = match relationship::progress(&pool, user.id).await {
        Ok((breakdown, progression)) => json!({
            "trust": breakdown.score,
            "stage": breakdown.stage,
            "progression": progression,
        }),
        Err(e) => {
            tracing::warn!(user_id = %user.id, "Trust update failed: {}", e);
            serde_json::Value::Null
        }
    };

    Ok(HttpResponse::Created().json(json!({
        "message": user_message,
        "reply": reply,
        "relationship": relationship,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn content_is_trimmed_and_bounded() {
        assert_eq!(validate_content("  hi  ").unwrap(), "hi");
        assert!(validate_content("   ").is_err());
        assert!(validate_content(&"a".repeat(MAX_MESSAGE_CHARS)).is_ok());
        assert!(validate_content(&"a".repeat(MAX_MESSAGE_CHARS + 1)).is_err());
    }

    #[test]
    fn day_starts_at_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 17, 45, 12).unwrap();
        let start = start_of_day(now);
        assert_eq!(start.date_naive(), now.date_naive());
        assert_eq!((start.hour(), start.minute(), start.second()), (0, 0, 0));
    }
}
