// src/admin.rs
//! Admin dashboard: experiments, funnel, metrics and data exports.

use std::time::Duration as StdDuration;

use actix_web::{HttpResponse, get, http::header, patch, post, web};
use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;

use crate::auth::AdminUser;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::experiments::{self, ExperimentCache};
use crate::funnel;
use crate::metrics;
use crate::models::{ConversionEvent, CreateExperimentRequest, Experiment, Subscription, User};

pub type ReportCache = Cache<String, serde_json::Value>;

const REPORT_TTL: StdDuration = StdDuration::from_secs(60);
const DEFAULT_RANGE_DAYS: i64 = 30;
const MAX_RANGE_DAYS: i64 = 366;

pub fn new_report_cache() -> ReportCache {
    Cache::builder()
        .max_capacity(256)
        .time_to_live(REPORT_TTL)
        .build()
}

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .service(list_experiments)
            .service(create_experiment)
            .service(set_experiment_active)
            .service(experiment_results)
            .service(funnel_report)
            .service(metrics_overview)
            .service(metrics_cohorts)
            .service(export),
    );
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub group_by: Option<String>,
}

impl RangeQuery {
    /// Resolves the half-open range `[from, to)`, defaulting to the last 30 days.
    pub fn resolve(&self, now: DateTime<Utc>) -> ApiResult<(DateTime<Utc>, DateTime<Utc>)> {
        let to = self.to.unwrap_or(now);
        let from = self.from.unwrap_or(to - Duration::days(DEFAULT_RANGE_DAYS));
        if from >= to {
            return Err(ApiError::validation("from must be before to"));
        }
        if to - from > Duration::days(MAX_RANGE_DAYS) {
            return Err(ApiError::validation(format!(
                "range may not exceed {} days",
                MAX_RANGE_DAYS
            )));
        }
        Ok((from, to))
    }
}

#[get("/experiments")]
pub async fn list_experiments(
    pool: web::Data<PgPool>,
    _admin: AdminUser,
) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(db::list_experiments(&pool).await?))
}

#[post("/experiments")]
pub async fn create_experiment(
    pool: web::Data<PgPool>,
    cache: web::Data<ExperimentCache>,
    admin: AdminUser,
    req: web::Json<CreateExperimentRequest>,
) -> ApiResult<HttpResponse> {
    let req = req.into_inner();
    experiments::validate(&req.id, &req.variants)?;
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if db::get_experiment(&pool, &req.id).await?.is_some() {
        return Err(ApiError::Conflict(format!("Experiment {} already exists", req.id)));
    }

    let experiment = Experiment {
        id: req.id,
        name: req.name.trim().to_string(),
        description: req.description,
        variants: sqlx::types::Json(req.variants),
        active: req.active,
        created_at: Utc::now(),
    };
    db::create_experiment(&pool, &experiment).await?;
    cache.invalidate(&experiment.id).await;
    tracing::info!(experiment = %experiment.id, admin = %admin.0.id, "Experiment created");
    Ok(HttpResponse::Created().json(experiment))
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub active: bool,
}

#[patch("/experiments/{id}")]
pub async fn set_experiment_active(
    pool: web::Data<PgPool>,
    cache: web::Data<ExperimentCache>,
    _admin: AdminUser,
    path: web::Path<String>,
    req: web::Json<SetActiveRequest>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let experiment = db::set_experiment_active(&pool, &id, req.active)
        .await?
        .ok_or(ApiError::NotFound("Experiment"))?;
    cache.invalidate(&id).await;
    Ok(HttpResponse::Ok().json(experiment))
}

#[get("/experiments/{id}/results")]
pub async fn experiment_results(
    pool: web::Data<PgPool>,
    _admin: AdminUser,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let experiment = db::get_experiment(&pool, &path)
        .await?
        .ok_or(ApiError::NotFound("Experiment"))?;
    let rows = db::get_experiment_activity(&pool, &experiment.id).await?;
    let results = experiments::compute_results(&experiment.variants, &rows);
    Ok(HttpResponse::Ok().json(json!({
        "experiment": experiment,
        "results": results,
    })))
}

#[get("/funnel")]
pub async fn funnel_report(
    pool: web::Data<PgPool>,
    _admin: AdminUser,
    query: web::Query<RangeQuery>,
) -> ApiResult<HttpResponse> {
    let (from, to) = query.resolve(Utc::now())?;
    let events = db::get_conversion_events(&pool, from, to).await?;

    let report = match query.group_by.as_deref() {
        None | Some("") => json!(funnel::build_report(&events)),
        Some("archetype") => json!(funnel::report_by_archetype(&events)),
        Some("day") => json!(funnel::report_by_day(&events)),
        Some(other) => {
            return Err(ApiError::validation(format!("cannot group funnel by {}", other)));
        }
    };
    Ok(HttpResponse::Ok().json(json!({
        "from": from,
        "to": to,
        "report": report,
    })))
}

#[get("/metrics/overview")]
pub async fn metrics_overview(
    pool: web::Data<PgPool>,
    cache: web::Data<ReportCache>,
    _admin: AdminUser,
) -> ApiResult<HttpResponse> {
    let cache_key = "metrics_overview".to_string();
    if let Some(cached) = cache.get(&cache_key).await {
        tracing::debug!("Cache hit for key: {}", cache_key);
        return Ok(HttpResponse::Ok().json(cached));
    }

    let overview = json!(metrics::overview(&pool).await?);
    cache.insert(cache_key, overview.clone()).await;
    Ok(HttpResponse::Ok().json(overview))
}

fn cohort_cache_key(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!("cohorts_{}_{}", from.to_rfc3339(), to.to_rfc3339())
}

#[get("/metrics/cohorts")]
pub async fn metrics_cohorts(
    pool: web::Data<PgPool>,
    cache: web::Data<ReportCache>,
    _admin: AdminUser,
    query: web::Query<RangeQuery>,
) -> ApiResult<HttpResponse> {
    let (from, to) = query.resolve(Utc::now())?;
    let cache_key = cohort_cache_key(from, to);
    if let Some(cached) = cache.get(&cache_key).await {
        return Ok(HttpResponse::Ok().json(cached));
    }

    let cohorts = json!({
        "from": from,
        "to": to,
        "offsets": metrics::RETENTION_OFFSETS,
        "cohorts": metrics::cohorts(&pool, from, to).await?,
    });
    cache.insert(cache_key, cohorts.clone()).await;
    Ok(HttpResponse::Ok().json(cohorts))
}

/// A row in a CSV export.
pub trait ExportRow {
    fn headers() -> &'static [&'static str];
    fn record(&self) -> Vec<String>;
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

impl ExportRow for User {
    fn headers() -> &'static [&'static str] {
        &["id", "email", "name", "role", "subscription_status", "created_at"]
    }

    fn record(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.email.clone(),
            self.name.clone(),
            self.role.clone(),
            self.subscription_status.clone(),
            self.created_at.to_rfc3339(),
        ]
    }
}

impl ExportRow for Subscription {
    fn headers() -> &'static [&'static str] {
        &[
            "id",
            "user_id",
            "plan",
            "status",
            "current_period_start",
            "current_period_end",
            "cancel_at_period_end",
            "canceled_at",
            "created_at",
        ]
    }

    fn record(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.user_id.to_string(),
            self.plan.clone(),
            self.status.clone(),
            self.current_period_start.to_rfc3339(),
            self.current_period_end.to_rfc3339(),
            self.cancel_at_period_end.to_string(),
            self.canceled_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            self.created_at.to_rfc3339(),
        ]
    }
}

impl ExportRow for ConversionEvent {
    fn headers() -> &'static [&'static str] {
        &["id", "user_id", "session_id", "stage", "archetype", "metadata", "created_at"]
    }

    fn record(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            opt(&self.user_id),
            opt(&self.session_id),
            self.stage.clone(),
            opt(&self.archetype),
            self.metadata.to_string(),
            self.created_at.to_rfc3339(),
        ]
    }
}

pub fn to_csv<T: ExportRow>(rows: &[T]) -> ApiResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(T::headers()).map_err(ApiError::internal)?;
    for row in rows {
        writer.write_record(row.record()).map_err(ApiError::internal)?;
    }
    writer.into_inner().map_err(ApiError::internal)
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

fn export_response<T: ExportRow + serde::Serialize>(
    name: &str,
    rows: &[T],
    csv_format: bool,
) -> ApiResult<HttpResponse> {
    if !csv_format {
        return Ok(HttpResponse::Ok().json(rows));
    }
    let body = to_csv(rows)?;
    Ok(HttpResponse::Ok()
        .content_type("text/csv; charset=utf-8")
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.csv\"", name),
        ))
        .body(body))
}

#[get("/export/{kind}")]
pub async fn export(
    pool: web::Data<PgPool>,
    admin: AdminUser,
    path: web::Path<String>,
    query: web::Query<ExportQuery>,
) -> ApiResult<HttpResponse> {
    let csv_format = match query.format.as_deref() {
        None | Some("csv") => true,
        Some("json") => false,
        Some(other) => return Err(ApiError::validation(format!("unsupported format: {}", other))),
    };

    let kind = path.into_inner();
    tracing::info!(admin = %admin.0.id, kind = %kind, "Admin export");
    match kind.as_str() {
        "users" => export_response(&kind, &db::list_users(&pool).await?, csv_format),
        "subscriptions" => export_response(&kind, &db::list_subscriptions(&pool).await?, csv_format),
        "conversion_events" => {
            let range = RangeQuery {
                from: query.from,
                to: query.to,
                group_by: None,
            };
            let (from, to) = range.resolve(Utc::now())?;
            let events = db::get_conversion_events(&pool, from, to).await?;
            export_response(&kind, &events, csv_format)
        }
        _ => Err(ApiError::NotFound("Export")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn range_defaults_to_last_thirty_days() {
        let now = Utc.with_ymd_and_hms(2026, 6, 30, 0, 0, 0).unwrap();
        let q = RangeQuery { from: None, to: None, group_by: None };
        let (from, to) = q.resolve(now).unwrap();
        assert_eq!(to, now);
        assert_eq!(to - from, Duration::days(30));
    }

    #[test]
    fn range_rejects_inverted_and_oversized_windows() {
        let now = Utc::now();
        let inverted = RangeQuery { from: Some(now), to: Some(now - Duration::days(1)), group_by: None };
        assert!(inverted.resolve(now).is_err());
        let huge = RangeQuery { from: Some(now - Duration::days(400)), to: Some(now), group_by: None };
        assert!(huge.resolve(now).is_err());
    }

    #[test]
    fn cohort_cache_key_distinguishes_ranges_on_the_same_days() {
        let day = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 6, 20, 0, 0, 0).unwrap();
        let later = day + Duration::hours(6);
        assert_ne!(cohort_cache_key(day, to), cohort_cache_key(later, to));
        assert_eq!(cohort_cache_key(day, to), cohort_cache_key(day, to));
    }

    #[test]
    fn csv_export_escapes_fields_and_omits_password() {
        let user = User {
            id: Uuid::nil(),
            email: "sam@example.com".to_string(),
            name: "Sam, \"the\" tester".to_string(),
            password_hash: "$2b$12$secret".to_string(),
            role: "user".to_string(),
            subscription_status: "none".to_string(),
            stripe_customer_id: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        };
        let csv = String::from_utf8(to_csv(&[user]).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("id,email,name,role,subscription_status,created_at"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"Sam, \"\"the\"\" tester\""));
        assert!(!csv.contains("secret"));
    }

    #[test]
    fn conversion_event_rows_flatten_metadata() {
        let event = ConversionEvent {
            id: Uuid::nil(),
            user_id: None,
            session_id: Some("sess".to_string()),
            stage: "landing_visit".to_string(),
            archetype: None,
            metadata: json!({"utm": "ads"}),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        };
        let record = event.record();
        assert_eq!(record.len(), ConversionEvent::headers().len());
        assert_eq!(record[1], "");
        assert_eq!(record[5], r#"{"utm":"ads"}"#);
    }
}
