// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::ApiError;

/// Declares a closed set of lowercase string labels stored as TEXT columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ApiError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err(ApiError::Validation(format!(
                        "invalid {}: {}",
                        stringify!($name).to_lowercase(),
                        other
                    ))),
                }
            }
        }
    };
}

text_enum!(
    Role {
        User => "user",
        Admin => "admin",
    }
);

text_enum!(
    /// Personality category chosen for the companion.
    Archetype {
        Romantic => "romantic",
        Intellectual => "intellectual",
        Adventurous => "adventurous",
        Nurturing => "nurturing",
        Playful => "playful",
    }
);

text_enum!(
    /// Named trust bands, lowest first.
    RelationshipStage {
        Stranger => "stranger",
        Acquaintance => "acquaintance",
        Friend => "friend",
        CloseFriend => "close_friend",
        Soulmate => "soulmate",
    }
);

text_enum!(
    MessageRole {
        User => "user",
        Assistant => "assistant",
    }
);

text_enum!(
    /// Acquisition checkpoints, in funnel order.
    FunnelStage {
        LandingVisit => "landing_visit",
        TestStarted => "test_started",
        TestCompleted => "test_completed",
        Signup => "signup",
        FirstMessage => "first_message",
        SubscriptionStarted => "subscription_started",
    }
);

impl Archetype {
    pub const fn default_companion_name(&self) -> &'static str {
        match self {
            Self::Romantic => "Aria",
            Self::Intellectual => "Sage",
            Self::Adventurous => "Nova",
            Self::Nurturing => "Mira",
            Self::Playful => "Pip",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub subscription_status: String,
    pub stripe_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Profile {
    pub user_id: Uuid,
    pub archetype: String,
    pub companion_name: String,
    pub trust_level: i32,
    pub relationship_stage: String,
    pub milestones: Vec<String>,
    pub trust_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn archetype(&self) -> Archetype {
        self.archetype.parse().unwrap_or(Archetype::Romantic)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub content: String,
    pub sentiment: Option<f64>,
    pub toxicity: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_from_user(&self) -> bool {
        self.role == MessageRole::User.as_str()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: String,
    pub status: String,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub stripe_invoice_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Activity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub activity_type: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct ConversionEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub stage: String,
    pub archetype: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Variant {
    pub name: String,
    /// Share of traffic in percent.
    pub allocation: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub description: String,
    pub variants: Json<Vec<Variant>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, FromRow)]
pub struct EmailJob {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub to_address: String,
    pub template: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    pub sub: String, // user_id
    pub role: String,
    pub exp: usize,
}

#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: String,
    pub archetype: Option<Archetype>,
    pub companion_name: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    pub archetype: Option<Archetype>,
    pub companion_name: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Serialize, Deserialize)]
pub struct TrackActivityRequest {
    pub activity_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
pub struct FunnelEventRequest {
    pub stage: String,
    pub session_id: Option<String>,
    pub archetype: Option<Archetype>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
pub struct ConversionRequest {
    pub goal: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateExperimentRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub variants: Vec<Variant>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip_through_from_str() {
        for stage in RelationshipStage::ALL {
            assert_eq!(stage.as_str().parse::<RelationshipStage>().unwrap(), *stage);
        }
        assert_eq!("close_friend".parse::<RelationshipStage>().unwrap(), RelationshipStage::CloseFriend);
        assert!("bestie".parse::<RelationshipStage>().is_err());
    }

    #[test]
    fn stages_order_from_stranger_to_soulmate() {
        assert!(RelationshipStage::Soulmate > RelationshipStage::Friend);
        assert!(RelationshipStage::ALL.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn archetype_serializes_snake_case() {
        let value = serde_json::to_value(Archetype::Adventurous).unwrap();
        assert_eq!(value, "adventurous");
        assert_eq!(Archetype::ALL.len(), 5);
    }
}
