// src/profile.rs
use crate::auth::AuthUser;
use crate::billing;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{TrackActivityRequest, UpdateProfileRequest};
use crate::relationship::{self, MILESTONES};
use actix_web::{HttpResponse, get, post, put, web};
use serde_json::json;
use sqlx::PgPool;

/// Activity types written by the server itself and never accepted from clients.
const RESERVED_ACTIVITIES: &[&str] = &[
    "stage_changed",
    "milestone_reached",
    "experiment_exposure",
    "experiment_conversion",
];

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_profile);
    cfg.service(update_profile);
    cfg.service(get_trust);
    cfg.service(track_activity);
}

pub fn validate_activity_type(activity_type: &str) -> ApiResult<()> {
    let well_formed = !activity_type.is_empty()
        && activity_type.len() <= 64
        && activity_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c == '_');
    if !well_formed {
        return Err(ApiError::validation("activity_type must be lowercase snake_case"));
    }
    if RESERVED_ACTIVITIES.contains(&activity_type) {
        return Err(ApiError::validation(format!(
            "activity_type {} is reserved",
            activity_type
        )));
    }
    Ok(())
}

#[get("/profile")]
pub async fn get_profile(pool: web::Data<PgPool>, user: AuthUser) -> ApiResult<HttpResponse> {
    let profile = db::get_profile(&pool, user.id)
        .await?
        .ok_or(ApiError::NotFound("Profile"))?;
    let plan = billing::effective_plan(&pool, user.id).await?;

    let next_milestone = MILESTONES
        .iter()
        .find(|m| !profile.milestones.iter().any(|r| r == m.id));
    Ok(HttpResponse::Ok().json(json!({
        "profile": profile,
        "plan": plan,
        "next_milestone": next_milestone,
    })))
}

#[put("/profile")]
pub async fn update_profile(
    pool: web::Data<PgPool>,
    user: AuthUser,
    req: web::Json<UpdateProfileRequest>,
) -> ApiResult<HttpResponse> {
    let companion_name = req.companion_name.as_deref().map(str::trim);
    if let Some(name) = companion_name {
        if name.is_empty() || name.chars().count() > 40 {
            return Err(ApiError::validation("companion name must be 1-40 characters"));
        }
    }

    let profile = db::update_profile(
        &pool,
        user.id,
        req.archetype.map(|a| a.as_str()),
        companion_name,
    )
    .await?
    .ok_or(ApiError::NotFound("Profile"))?;
    Ok(HttpResponse::Ok().json(profile))
}

#[get("/trust")]
pub async fn get_trust(pool: web::Data<PgPool>, user: AuthUser) -> ApiResult<HttpResponse> {
    let (breakdown, progression) = relationship::progress(&pool, user.id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "trust": breakdown,
        "progression": progression,
    })))
}

#[post("/activities")]
pub async fn track_activity(
    pool: web::Data<PgPool>,
    user: AuthUser,
    req: web::Json<TrackActivityRequest>,
) -> ApiResult<HttpResponse> {
    validate_activity_type(&req.activity_type)?;
    let metadata = if req.metadata.is_null() {
        json!({})
    } else if req.metadata.is_object() {
        req.metadata.clone()
    } else {
        return Err(ApiError::validation("metadata must be an object"));
    };

    db::insert_activity(&pool, user.id, &req.activity_type, &metadata).await?;
    Ok(HttpResponse::Created().json(json!({ "recorded": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_types_are_snake_case() {
        assert!(validate_activity_type("voice_message").is_ok());
        assert!(validate_activity_type("session").is_ok());
        assert!(validate_activity_type("Voice Message").is_err());
        assert!(validate_activity_type("").is_err());
        assert!(validate_activity_type(&"a".repeat(65)).is_err());
    }

    #[test]
    fn server_owned_activity_types_are_rejected() {
        let err = validate_activity_type("milestone_reached").unwrap_err();
        assert!(err.to_string().contains("reserved"));
        assert!(validate_activity_type("experiment_conversion").is_err());
    }
}
