// src/plans.rs
//! Subscription plans and the limits attached to them.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Basic,
    Premium,
    Ultimate,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Free, Plan::Basic, Plan::Premium, Plan::Ultimate];

    /// Messages a user may send per UTC day. `None` means unlimited.
    pub const fn messages_per_day(&self) -> Option<i64> {
        match self {
            Self::Free => Some(20),
            Self::Basic => Some(200),
            Self::Premium => Some(1_000),
            Self::Ultimate => None,
        }
    }

    /// Monthly price in cents.
    pub const fn price_cents(&self) -> i64 {
        match self {
            Self::Free => 0,
            Self::Basic => 999,
            Self::Premium => 1_999,
            Self::Ultimate => 3_999,
        }
    }

    pub const fn voice_enabled(&self) -> bool {
        matches!(self, Self::Premium | Self::Ultimate)
    }

    pub const fn photos_enabled(&self) -> bool {
        !matches!(self, Self::Free)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Ultimate => "ultimate",
        }
    }

    /// Whether a user who already sent `sent_today` messages may send another.
    pub fn allows_message(&self, sent_today: i64) -> bool {
        self.messages_per_day().is_none_or(|limit| sent_today < limit)
    }

    pub fn limits_json(&self) -> serde_json::Value {
        serde_json::json!({
            "messages_per_day": self.messages_per_day(),
            "voice": self.voice_enabled(),
            "photos": self.photos_enabled(),
            "price_cents": self.price_cents(),
        })
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Plan {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "premium" => Ok(Self::Premium),
            "ultimate" => Ok(Self::Ultimate),
            _ => Err(ApiError::Validation(format!("invalid plan: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_plan_allows_two_hundred_messages() {
        assert_eq!(Plan::Basic.messages_per_day(), Some(200));
        assert!(Plan::Basic.allows_message(199));
        assert!(!Plan::Basic.allows_message(200));
    }

    #[test]
    fn ultimate_is_unlimited() {
        assert!(Plan::Ultimate.allows_message(1_000_000));
    }

    #[test]
    fn prices_increase_with_tier() {
        let prices: Vec<i64> = Plan::ALL.iter().map(Plan::price_cents).collect();
        assert!(prices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Premium".parse::<Plan>().unwrap(), Plan::Premium);
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn features_by_plan() {
        assert!(!Plan::Free.photos_enabled());
        assert!(Plan::Basic.photos_enabled());
        assert!(!Plan::Basic.voice_enabled());
        assert!(Plan::Premium.voice_enabled());
    }
}
