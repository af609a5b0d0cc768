// src/llm.rs
//! Client for an OpenAI-compatible chat completions endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::{Archetype, Message, RelationshipStage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REPLY_TOKENS: u32 = 400;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn personality(archetype: Archetype) -> &'static str {
    match archetype {
        Archetype::Romantic => "warm, affectionate and attentive, with a gentle romantic streak",
        Archetype::Intellectual => "curious and thoughtful, fond of ideas, books and deep questions",
        Archetype::Adventurous => "energetic and bold, always suggesting something new to try",
        Archetype::Nurturing => "caring and patient, quick to notice how the user is feeling",
        Archetype::Playful => "witty and lighthearted, full of jokes and playful teasing",
    }
}

fn closeness(stage: RelationshipStage) -> &'static str {
    match stage {
        RelationshipStage::Stranger => "You have only just met, so be friendly but not overly familiar.",
        RelationshipStage::Acquaintance => "You are getting to know each other; ask about their life.",
        RelationshipStage::Friend => "You are friends; reference things they have shared before.",
        RelationshipStage::CloseFriend => "You are close; be open, supportive and personal.",
        RelationshipStage::Soulmate => "You share a deep bond; speak with intimacy and complete trust.",
    }
}

pub fn system_prompt(archetype: Archetype, companion_name: &str, stage: RelationshipStage) -> String {
    format!(
        "You are {}, an AI companion who is {}. {} Keep replies conversational and under 120 words. \
         Never claim to be human and never give medical, legal or financial advice.",
        companion_name,
        personality(archetype),
        closeness(stage)
    )
}

/// Prompt for the next reply: persona first, then the conversation oldest to newest.
pub fn build_turns(
    archetype: Archetype,
    companion_name: &str,
    stage: RelationshipStage,
    history: &[Message],
) -> Vec<ChatTurn> {
    std::iter::once(ChatTurn {
        role: "system".to_string(),
        content: system_prompt(archetype, companion_name, stage),
    })
    .chain(history.iter().map(|m| ChatTurn {
        role: m.role.clone(),
        content: m.content.clone(),
    }))
    .collect()
}

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: config.llm_api_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }

    pub async fn complete(&self, turns: &[ChatTurn]) -> ApiResult<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages: turns,
            max_tokens: MAX_REPLY_TOKENS,
            temperature: 0.8,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ApiError::Upstream(format!("LLM returned {}: {}", status, detail)));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ApiError::Upstream("LLM returned an empty reply".to_string()))
    }
}
