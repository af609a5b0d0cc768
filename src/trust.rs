// src/trust.rs
//! Trust scoring: ten engagement signals folded into a 0-100 score.
//!
//! Each signal is normalized against a "perfect" observation and clamped to
//! `[0, 1]`. The weighted sum, scaled to 100, picks the relationship stage.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::analysis;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{Activity, Message, RelationshipStage};

pub const MESSAGE_WINDOW: i64 = 100;
pub const ACTIVITY_WINDOW: i64 = 500;

const PERFECT_WEEKLY_MESSAGES: f64 = 70.0;
const PERFECT_EMOTIONAL_SHARE: f64 = 0.30;
const PERFECT_MESSAGE_LENGTH: f64 = 100.0;
const PERFECT_RESPONSE_SECS: f64 = 120.0;
const MAX_REPLY_GAP_SECS: i64 = 3_600;
const PERFECT_TOPICS: f64 = 6.0;
const PERFECT_POSITIVE_SHARE: f64 = 0.60;
const PERFECT_WEEKLY_MINUTES: f64 = 300.0;
const PERFECT_PHOTO_EVENTS: f64 = 10.0;
const PERFECT_VOICE_EVENTS: f64 = 10.0;
const PERFECT_ACTIVE_DAYS: f64 = 10.0;
const CONSISTENCY_WINDOW_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SubScores {
    pub frequency: f64,
    pub emotional_depth: f64,
    pub message_length: f64,
    pub response_time: f64,
    pub topic_diversity: f64,
    pub sentiment: f64,
    pub time_spent: f64,
    pub photo_usage: f64,
    pub voice_usage: f64,
    pub consistency: f64,
}

/// Weights in the same order as [`SubScores::as_array`]. They sum to 1.0.
pub const WEIGHTS: [f64; 10] = [0.15, 0.15, 0.10, 0.10, 0.10, 0.10, 0.10, 0.05, 0.05, 0.10];

impl SubScores {
    pub fn as_array(&self) -> [f64; 10] {
        [
            self.frequency,
            self.emotional_depth,
            self.message_length,
            self.response_time,
            self.topic_diversity,
            self.sentiment,
            self.time_spent,
            self.photo_usage,
            self.voice_usage,
            self.consistency,
        ]
    }

    pub fn weighted_score(&self) -> i32 {
        let total: f64 = self
            .as_array()
            .iter()
            .zip(WEIGHTS.iter())
            .map(|(s, w)| s.clamp(0.0, 1.0) * w)
            .sum();
        ((total * 100.0).round() as i32).clamp(0, 100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustBreakdown {
    pub score: i32,
    pub stage: RelationshipStage,
    pub sub_scores: SubScores,
    pub conversations: i64,
}

/// Everything the scorer looks at for one user.
#[derive(Debug, Clone, Copy)]
pub struct TrustInputs<'a> {
    pub messages: &'a [Message],
    pub activities: &'a [Activity],
    /// User-authored messages in the last 7 days, counted without the row window.
    pub weekly_user_messages: i64,
    pub conversations: i64,
}

impl<'a> TrustInputs<'a> {
    /// Derives the counts from the rows themselves.
    pub fn from_rows(messages: &'a [Message], activities: &'a [Activity], now: DateTime<Utc>) -> Self {
        let week_ago = now - Duration::days(7);
        let weekly_user_messages = messages
            .iter()
            .filter(|m| m.is_from_user() && m.created_at >= week_ago)
            .count() as i64;
        let conversations = messages
            .iter()
            .map(|m| m.conversation_id)
            .collect::<HashSet<_>>()
            .len() as i64;
        Self {
            messages,
            activities,
            weekly_user_messages,
            conversations,
        }
    }
}

pub fn stage_for(score: i32) -> RelationshipStage {
    match score {
        i32::MIN..=20 => RelationshipStage::Stranger,
        21..=40 => RelationshipStage::Acquaintance,
        41..=60 => RelationshipStage::Friend,
        61..=80 => RelationshipStage::CloseFriend,
        _ => RelationshipStage::Soulmate,
    }
}

fn ratio(observed: f64, perfect: f64) -> f64 {
    if perfect <= 0.0 || !observed.is_finite() {
        return 0.0;
    }
    (observed / perfect).clamp(0.0, 1.0)
}

/// Scores already-fetched inputs. Order of the rows does not matter.
pub fn compute(inputs: &TrustInputs<'_>, now: DateTime<Utc>) -> TrustBreakdown {
    let TrustInputs {
        messages,
        activities,
        weekly_user_messages,
        conversations,
    } = *inputs;
    let week_ago = now - Duration::days(7);
    let user_messages: Vec<&Message> = messages.iter().filter(|m| m.is_from_user()).collect();

    let (emotional_depth, message_length, topic_diversity, sentiment) = if user_messages.is_empty() {
        (0.0, 0.0, 0.0, 0.0)
    } else {
        let n = user_messages.len() as f64;
        let emotional = user_messages
            .iter()
            .filter(|m| analysis::is_emotional(&m.content))
            .count() as f64;
        let total_len: usize = user_messages.iter().map(|m| m.content.chars().count()).sum();
        let topics: HashSet<&'static str> = user_messages
            .iter()
            .flat_map(|m| analysis::topics(&m.content))
            .collect();
        let scored: Vec<f64> = user_messages.iter().filter_map(|m| m.sentiment).collect();
        let positive_share = if scored.is_empty() {
            0.0
        } else {
            scored.iter().filter(|s| **s > 0.0).count() as f64 / scored.len() as f64
        };
        (
            ratio(emotional / n, PERFECT_EMOTIONAL_SHARE),
            ratio(total_len as f64 / n, PERFECT_MESSAGE_LENGTH),
            ratio(topics.len() as f64, PERFECT_TOPICS),
            ratio(positive_share, PERFECT_POSITIVE_SHARE),
        )
    };

    let session_minutes: f64 = activities
        .iter()
        .filter(|a| a.activity_type == "session" && a.created_at >= week_ago)
        .filter_map(|a| a.metadata.get("duration_seconds").and_then(|d| d.as_f64()))
        .sum::<f64>()
        / 60.0;

    let count_of = |kinds: &[&str]| {
        activities
            .iter()
            .filter(|a| kinds.contains(&a.activity_type.as_str()))
            .count() as f64
    };

    let sub_scores = SubScores {
        frequency: ratio(weekly_user_messages as f64, PERFECT_WEEKLY_MESSAGES),
        emotional_depth,
        message_length,
        response_time: response_time_score(messages),
        topic_diversity,
        sentiment,
        time_spent: ratio(session_minutes, PERFECT_WEEKLY_MINUTES),
        photo_usage: ratio(count_of(&["photo_shared", "photo_requested"]), PERFECT_PHOTO_EVENTS),
        voice_usage: ratio(count_of(&["voice_message", "voice_played"]), PERFECT_VOICE_EVENTS),
        consistency: consistency_score(messages, activities, now),
    };

    let score = sub_scores.weighted_score();
    TrustBreakdown {
        score,
        stage: stage_for(score),
        sub_scores,
        conversations,
    }
}

/// Mean delay between a companion reply and the user's next message, inverted.
fn response_time_score(messages: &[Message]) -> f64 {
    let mut ordered: Vec<&Message> = messages.iter().collect();
    ordered.sort_by_key(|m| (m.conversation_id, m.created_at));

    let gaps: Vec<i64> = ordered
        .windows(2)
        .filter(|w| w[0].conversation_id == w[1].conversation_id)
        .filter(|w| !w[0].is_from_user() && w[1].is_from_user())
        .map(|w| (w[1].created_at - w[0].created_at).num_seconds())
        .filter(|gap| (0..=MAX_REPLY_GAP_SECS).contains(gap))
        .collect();

    if gaps.is_empty() {
        return 0.0;
    }
    let mean = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
    if mean <= PERFECT_RESPONSE_SECS {
        1.0
    } else {
        ratio(PERFECT_RESPONSE_SECS, mean)
    }
}

fn consistency_score(messages: &[Message], activities: &[Activity], now: DateTime<Utc>) -> f64 {
    let since = now - Duration::days(CONSISTENCY_WINDOW_DAYS);
    let days: HashSet<_> = messages
        .iter()
        .filter(|m| m.is_from_user())
        .map(|m| m.created_at)
        .chain(activities.iter().map(|a| a.created_at))
        .filter(|t| *t >= since && *t <= now)
        .map(|t| t.date_naive())
        .collect();
    ratio(days.len() as f64, PERFECT_ACTIVE_DAYS)
}

/// Recomputes a user's trust from their recent history and stores it on the profile.
pub async fn calculate(pool: &PgPool, user_id: Uuid) -> ApiResult<TrustBreakdown> {
    if db::get_profile(pool, user_id).await?.is_none() {
        return Err(ApiError::NotFound("Profile"));
    }

    let messages = db::get_recent_messages(pool, user_id, MESSAGE_WINDOW).await?;
    let activities = db::get_recent_activities(pool, user_id, ACTIVITY_WINDOW).await?;

    let now = Utc::now();
    let weekly_user_messages =
        db::count_user_messages_since(pool, user_id, now - Duration::days(7)).await?;
    let conversations = db::count_conversations(pool, user_id).await?;
    let inputs = TrustInputs {
        messages: &messages,
        activities: &activities,
        weekly_user_messages,
        conversations,
    };

    let breakdown = compute(&inputs, now);
    db::update_trust(pool, user_id, breakdown.score, breakdown.stage).await?;

    tracing::debug!(
        user_id = %user_id,
        score = breakdown.score,
        stage = %breakdown.stage,
        "Trust recalculated"
    );
    Ok(breakdown)
}
