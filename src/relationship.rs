// src/relationship.rs
//! Stage transitions and milestones layered on top of trust recalculation.

use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::email::{self, EmailTemplate};
use crate::error::{ApiError, ApiResult};
use crate::models::{Profile, RelationshipStage};
use crate::trust::{self, TrustBreakdown};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Milestone {
    pub id: &'static str,
    pub trust_required: i32,
}

/// Sorted by `trust_required`.
pub const MILESTONES: &[Milestone] = &[
    Milestone { id: "first_hello", trust_required: 1 },
    Milestone { id: "getting_to_know", trust_required: 10 },
    Milestone { id: "shared_laugh", trust_required: 25 },
    Milestone { id: "opening_up", trust_required: 40 },
    Milestone { id: "deep_connection", trust_required: 55 },
    Milestone { id: "trusted_confidant", trust_required: 70 },
    Milestone { id: "soul_bond", trust_required: 90 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTransition {
    pub from: RelationshipStage,
    pub to: RelationshipStage,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progression {
    pub previous_trust: i32,
    pub trust: i32,
    pub stage: RelationshipStage,
    pub transition: Option<StageTransition>,
    pub new_milestones: Vec<&'static str>,
}

/// Compares a profile's stored trust with a fresh score. Every milestone at or
/// below the new score that is not yet recorded is reported, so one missed by
/// an earlier failed run is caught up.
pub fn evaluate(
    before_trust: i32,
    before_stage: RelationshipStage,
    after: &TrustBreakdown,
    recorded: &[String],
) -> Progression {
    let transition = (before_stage != after.stage).then(|| StageTransition {
        from: before_stage,
        to: after.stage,
        direction: if after.stage > before_stage {
            Direction::Up
        } else {
            Direction::Down
        },
    });

    let new_milestones = MILESTONES
        .iter()
        .filter(|m| m.trust_required <= after.score)
        .filter(|m| !recorded.iter().any(|r| r == m.id))
        .map(|m| m.id)
        .collect();

    Progression {
        previous_trust: before_trust,
        trust: after.score,
        stage: after.stage,
        transition,
        new_milestones,
    }
}

fn stored_stage(profile: &Profile) -> RelationshipStage {
    profile
        .relationship_stage
        .parse()
        .unwrap_or_else(|_| trust::stage_for(profile.trust_level))
}

/// Recomputes trust for a user and applies every consequence of the change.
pub async fn progress(pool: &PgPool, user_id: Uuid) -> ApiResult<(TrustBreakdown, Progression)> {
    let before = db::get_profile(pool, user_id)
        .await?
        .ok_or(ApiError::NotFound("Profile"))?;

    let breakdown = trust::calculate(pool, user_id).await?;
    let progression = evaluate(
        before.trust_level,
        stored_stage(&before),
        &breakdown,
        &before.milestones,
    );

    if progression.transition.is_some() || !progression.new_milestones.is_empty() {
        apply(pool, user_id, &before, &progression).await?;
    }
    Ok((breakdown, progression))
}

async fn apply(
    pool: &PgPool,
    user_id: Uuid,
    profile: &Profile,
    progression: &Progression,
) -> ApiResult<()> {
    let name = db::get_user_by_id(pool, user_id)
        .await?
        .map(|u| u.name)
        .unwrap_or_default();

    if !progression.new_milestones.is_empty() {
        let ids: Vec<String> = progression.new_milestones.iter().map(|m| m.to_string()).collect();
        db::add_milestones(pool, user_id, &ids).await?;
    }

    if let Some(transition) = &progression.transition {
        tracing::info!(
            user_id = %user_id,
            from = %transition.from,
            to = %transition.to,
            "Relationship stage changed"
        );
        let metadata = json!({
            "from": transition.from,
            "to": transition.to,
            "direction": transition.direction,
            "trust": progression.trust,
        });
        if let Err(e) = db::insert_activity(pool, user_id, "stage_changed", &metadata).await {
            tracing::warn!("Failed to record stage change: {}", e);
        }
        if transition.direction == Direction::Up {
            let payload = json!({
                "name": name,
                "companion_name": profile.companion_name,
                "from": transition.from,
                "to": transition.to,
            });
            if let Err(e) = email::enqueue(pool, user_id, EmailTemplate::StageUp, payload).await {
                tracing::warn!("Failed to queue stage email: {}", e);
            }
        }
    }

    for milestone in &progression.new_milestones {
        tracing::info!(user_id = %user_id, milestone = milestone, "Milestone reached");
        let metadata = json!({ "milestone": milestone, "trust": progression.trust });
        if let Err(e) = db::insert_activity(pool, user_id, "milestone_reached", &metadata).await {
            tracing::warn!("Failed to record milestone: {}", e);
        }
        let payload = json!({
            "name": name,
            "companion_name": profile.companion_name,
            "milestone": milestone,
        });
        if let Err(e) = email::enqueue(pool, user_id, EmailTemplate::MilestoneReached, payload).await {
            tracing::warn!("Failed to queue milestone email: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{SubScores, stage_for};

    fn breakdown(score: i32) -> TrustBreakdown {
        TrustBreakdown {
            score,
            stage: stage_for(score),
            sub_scores: SubScores::default(),
            conversations: 0,
        }
    }

    fn reached(trust: i32) -> Vec<String> {
        MILESTONES
            .iter()
            .filter(|m| m.trust_required <= trust)
            .map(|m| m.id.to_string())
            .collect()
    }

    #[test]
    fn milestones_are_sorted() {
        assert!(MILESTONES.windows(2).all(|w| w[0].trust_required < w[1].trust_required));
    }

    #[test]
    fn upward_move_crosses_stage_and_milestones() {
        let p = evaluate(18, RelationshipStage::Stranger, &breakdown(45), &reached(18));
        let t = p.transition.unwrap();
        assert_eq!(t.from, RelationshipStage::Stranger);
        assert_eq!(t.to, RelationshipStage::Friend);
        assert_eq!(t.direction, Direction::Up);
        assert_eq!(p.new_milestones, vec!["shared_laugh", "opening_up"]);
    }

    #[test]
    fn already_recorded_milestones_are_not_repeated() {
        let mut recorded = reached(18);
        recorded.push("shared_laugh".to_string());
        let p = evaluate(18, RelationshipStage::Stranger, &breakdown(30), &recorded);
        assert!(p.new_milestones.is_empty());
    }

    #[test]
    fn exact_threshold_counts_as_crossed() {
        let p = evaluate(9, RelationshipStage::Stranger, &breakdown(10), &reached(9));
        assert_eq!(p.new_milestones, vec!["getting_to_know"]);
        assert!(p.transition.is_none());
    }

    #[test]
    fn downward_move_has_no_milestones() {
        let p = evaluate(75, RelationshipStage::CloseFriend, &breakdown(35), &reached(75));
        assert_eq!(p.transition.unwrap().direction, Direction::Down);
        assert!(p.new_milestones.is_empty());
    }

    #[test]
    fn steady_score_changes_nothing() {
        let p = evaluate(50, RelationshipStage::Friend, &breakdown(50), &reached(50));
        assert!(p.transition.is_none());
        assert!(p.new_milestones.is_empty());
    }

    #[test]
    fn unrecorded_milestones_below_stored_trust_are_caught_up() {
        // trust was saved at 30 but the milestones never made it to the profile
        let p = evaluate(30, RelationshipStage::Acquaintance, &breakdown(30), &["first_hello".to_string()]);
        assert!(p.transition.is_none());
        assert_eq!(p.new_milestones, vec!["getting_to_know", "shared_laugh"]);
    }
}
