// src/funnel.rs
//! Acquisition funnel: stage events in, per-stage conversion out.

use std::collections::{BTreeMap, HashSet};

use actix_web::{HttpResponse, post, web};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{Archetype, ConversionEvent, FunnelEventRequest, FunnelStage};

const MAX_SESSION_ID_LEN: usize = 128;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(track_event);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: FunnelStage,
    pub count: u64,
    /// Share of the previous stage that reached this one.
    pub step_conversion: f64,
    /// Share of the first stage that reached this one.
    pub overall_conversion: f64,
    pub drop_off: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelReport {
    pub stages: Vec<StageStats>,
}

fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Who an event belongs to: the user when known, else the anonymous session.
fn subject_of(event: &ConversionEvent) -> String {
    match (&event.user_id, &event.session_id) {
        (Some(user), _) => format!("u:{}", user),
        (None, Some(session)) => format!("s:{}", session),
        (None, None) => format!("e:{}", event.id),
    }
}

pub fn build_report<'a>(events: impl IntoIterator<Item = &'a ConversionEvent>) -> FunnelReport {
    let mut subjects: BTreeMap<FunnelStage, HashSet<String>> = BTreeMap::new();
    for event in events {
        let Ok(stage) = event.stage.parse::<FunnelStage>() else {
            continue;
        };
        subjects.entry(stage).or_default().insert(subject_of(event));
    }

    let counts: Vec<u64> = FunnelStage::ALL
        .iter()
        .map(|stage| subjects.get(stage).map_or(0, |s| s.len() as u64))
        .collect();
    let first = counts.first().copied().unwrap_or(0);

    let stages = FunnelStage::ALL
        .iter()
        .enumerate()
        .map(|(i, stage)| {
            let count = counts[i];
            let (step_conversion, drop_off) = if i == 0 {
                (if count > 0 { 1.0 } else { 0.0 }, 0)
            } else {
                let previous = counts[i - 1];
                (rate(count, previous), previous.saturating_sub(count))
            };
            StageStats {
                stage: *stage,
                count,
                step_conversion,
                overall_conversion: rate(count, first),
                drop_off,
            }
        })
        .collect();

    FunnelReport { stages }
}

pub fn report_by_archetype(events: &[ConversionEvent]) -> BTreeMap<String, FunnelReport> {
    let mut groups: BTreeMap<String, Vec<&ConversionEvent>> = BTreeMap::new();
    for event in events {
        let key = event.archetype.clone().unwrap_or_else(|| "unknown".to_string());
        groups.entry(key).or_default().push(event);
    }
    groups
        .into_iter()
        .map(|(archetype, group)| (archetype, build_report(group)))
        .collect()
}

pub fn report_by_day(events: &[ConversionEvent]) -> BTreeMap<NaiveDate, FunnelReport> {
    let mut groups: BTreeMap<NaiveDate, Vec<&ConversionEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(event.created_at.date_naive()).or_default().push(event);
    }
    groups
        .into_iter()
        .map(|(day, group)| (day, build_report(group)))
        .collect()
}

pub async fn record(
    pool: &PgPool,
    stage: FunnelStage,
    user_id: Option<Uuid>,
    session_id: Option<String>,
    archetype: Option<Archetype>,
    metadata: serde_json::Value,
) -> ApiResult<()> {
    let event = ConversionEvent {
        id: Uuid::new_v4(),
        user_id,
        session_id,
        stage: stage.as_str().to_string(),
        archetype: archetype.map(|a| a.as_str().to_string()),
        metadata: if metadata.is_null() { json!({}) } else { metadata },
        created_at: Utc::now(),
    };
    db::insert_conversion_event(pool, &event).await?;
    tracing::debug!(stage = %stage, "Funnel event recorded");
    Ok(())
}

/// Resolves who a funnel event belongs to. A signed-in caller is identified by
/// their token; anonymous callers must send a session id.
pub fn event_subject(
    user: Option<AuthUser>,
    session_id: Option<String>,
) -> ApiResult<(Option<Uuid>, Option<String>)> {
    let session_id = session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if session_id.as_ref().is_some_and(|s| s.len() > MAX_SESSION_ID_LEN) {
        return Err(ApiError::validation("session_id is too long"));
    }
    match (user, session_id) {
        (None, None) => Err(ApiError::validation(
            "a bearer token or session_id is required",
        )),
        (user, session_id) => Ok((user.map(|u| u.id), session_id)),
    }
}

#[post("/funnel/events")]
pub async fn track_event(
    pool: web::Data<PgPool>,
    user: Option<AuthUser>,
    req: web::Json<FunnelEventRequest>,
) -> ApiResult<HttpResponse> {
    let req = req.into_inner();
    let stage: FunnelStage = req.stage.parse()?;
    let (user_id, session_id) = event_subject(user, req.session_id)?;

    record(&pool, stage, user_id, session_id, req.archetype, req.metadata).await?;
    Ok(HttpResponse::Created().json(json!({ "recorded": true })))
}
