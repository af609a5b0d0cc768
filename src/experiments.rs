// src/experiments.rs
//! A/B testing: deterministic bucketing, exposure/conversion tracking, and results.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use actix_web::{HttpResponse, get, post, web};
use moka::future::Cache;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::{ConversionRequest, Experiment, Variant};

pub type ExperimentCache = Cache<String, Experiment>;

const CACHE_TTL: Duration = Duration::from_secs(60);
const SIGNIFICANCE_LEVEL: f64 = 0.05;

pub fn new_cache() -> ExperimentCache {
    Cache::builder()
        .max_capacity(1_000)
        .time_to_live(CACHE_TTL)
        .build()
}

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_assignment);
    cfg.service(record_conversion);
}

/// Maps a user onto `[0, 100)` for an experiment. Stable across processes.
pub fn bucket(user_id: &str, experiment_id: &str) -> u32 {
    let hash = user_id
        .bytes()
        .chain(experiment_id.bytes())
        .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(i32::from(b)));
    hash.unsigned_abs() % 100
}

/// Picks the variant whose cumulative allocation covers the user's bucket.
/// Unallocated traffic and inactive experiments fall back to the first variant.
pub fn assign<'a>(experiment_id: &str, variants: &'a [Variant], active: bool, user_id: &str) -> Option<&'a Variant> {
    let control = variants.first()?;
    if !active {
        return Some(control);
    }
    let point = bucket(user_id, experiment_id);
    let mut cumulative = 0u32;
    for variant in variants {
        cumulative += variant.allocation;
        if point < cumulative {
            return Some(variant);
        }
    }
    Some(control)
}

pub fn validate(id: &str, variants: &[Variant]) -> ApiResult<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(ApiError::validation(
            "experiment id must be a lowercase slug of [a-z0-9_-]",
        ));
    }
    if variants.len() < 2 {
        return Err(ApiError::validation("an experiment needs at least two variants"));
    }
    let names: HashSet<&str> = variants.iter().map(|v| v.name.as_str()).collect();
    if names.len() != variants.len() || names.contains("") {
        return Err(ApiError::validation("variant names must be unique and non-empty"));
    }
    if variants.iter().any(|v| v.allocation > 100) {
        return Err(ApiError::validation("allocation must be between 0 and 100"));
    }
    let total: u32 = variants.iter().map(|v| v.allocation).sum();
    if total != 100 {
        return Err(ApiError::validation(format!(
            "allocations must sum to 100, got {}",
            total
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantResult {
    pub name: String,
    pub exposures: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Relative change against the control rate.
    pub lift: Option<f64>,
    pub z_score: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: bool,
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation (|error| < 1.5e-7).
fn normal_cdf(x: f64) -> f64 {
    let z = x.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + 0.327_591_1 * z);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let erf = 1.0 - poly * (-z * z).exp();
    if x >= 0.0 {
        0.5 * (1.0 + erf)
    } else {
        0.5 * (1.0 - erf)
    }
}

/// Two-proportion z-test. Returns `(z, two-sided p)`.
pub fn z_test(control: (u64, u64), treatment: (u64, u64)) -> Option<(f64, f64)> {
    let (c_conv, c_n) = control;
    let (t_conv, t_n) = treatment;
    if c_n == 0 || t_n == 0 {
        return None;
    }
    let p1 = c_conv as f64 / c_n as f64;
    let p2 = t_conv as f64 / t_n as f64;
    let pooled = (c_conv + t_conv) as f64 / (c_n + t_n) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / c_n as f64 + 1.0 / t_n as f64)).sqrt();
    if se == 0.0 || !se.is_finite() {
        return None;
    }
    let z = (p2 - p1) / se;
    Some((z, 2.0 * (1.0 - normal_cdf(z.abs()))))
}

/// Aggregates tracked `(user, activity type, variant)` rows per variant.
pub fn compute_results(
    variants: &[Variant],
    rows: &[(Uuid, String, Option<String>)],
) -> Vec<VariantResult> {
    let mut exposed: HashMap<&str, HashSet<Uuid>> = HashMap::new();
    let mut converted: HashMap<&str, HashSet<Uuid>> = HashMap::new();
    for (user, kind, variant) in rows {
        let Some(variant) = variant.as_deref() else {
            continue;
        };
        let target = match kind.as_str() {
            "experiment_exposure" => &mut exposed,
            "experiment_conversion" => &mut converted,
            _ => continue,
        };
        target.entry(variant).or_default().insert(*user);
    }

    // A conversion only counts for a user exposed to the same variant.
    let tally = |name: &str| match exposed.get(name) {
        Some(seen) => {
            let c = converted
                .get(name)
                .map_or(0, |s| s.intersection(seen).count() as u64);
            (c, seen.len() as u64)
        }
        None => (0, 0),
    };
    let control = variants.first().map(|v| tally(&v.name)).unwrap_or((0, 0));
    let control_rate = if control.1 == 0 { 0.0 } else { control.0 as f64 / control.1 as f64 };

    variants
        .iter()
        .enumerate()
        .map(|(i, variant)| {
            let (conversions, exposures) = tally(&variant.name);
            let conversion_rate = if exposures == 0 {
                0.0
            } else {
                conversions as f64 / exposures as f64
            };
            let (lift, test) = if i == 0 {
                (None, None)
            } else {
                let lift = (control_rate > 0.0).then(|| (conversion_rate - control_rate) / control_rate);
                (lift, z_test(control, (conversions, exposures)))
            };
            VariantResult {
                name: variant.name.clone(),
                exposures,
                conversions,
                conversion_rate,
                lift,
                z_score: test.map(|(z, _)| z),
                p_value: test.map(|(_, p)| p),
                significant: test.is_some_and(|(_, p)| p < SIGNIFICANCE_LEVEL),
            }
        })
        .collect()
}

pub async fn load(pool: &PgPool, cache: &ExperimentCache, id: &str) -> ApiResult<Experiment> {
    if let Some(experiment) = cache.get(id).await {
        return Ok(experiment);
    }
    let experiment = db::get_experiment(pool, id)
        .await?
        .ok_or(ApiError::NotFound("Experiment"))?;
    cache.insert(id.to_string(), experiment.clone()).await;
    Ok(experiment)
}

async fn assigned_variant(
    pool: &PgPool,
    cache: &ExperimentCache,
    experiment_id: &str,
    user: &AuthUser,
) -> ApiResult<(Experiment, String)> {
    let experiment = load(pool, cache, experiment_id).await?;
    let variant = assign(
        &experiment.id,
        &experiment.variants,
        experiment.active,
        &user.id.to_string(),
    )
    .map(|v| v.name.clone())
    .ok_or_else(|| ApiError::internal(format!("experiment {} has no variants", experiment.id)))?;
    Ok((experiment, variant))
}

#[get("/experiments/{id}/assignment")]
pub async fn get_assignment(
    pool: web::Data<PgPool>,
    cache: web::Data<ExperimentCache>,
    user: AuthUser,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let (experiment, variant) = assigned_variant(&pool, &cache, &path, &user).await?;

    if experiment.active {
        let metadata = json!({ "experiment_id": experiment.id, "variant": variant });
        if let Err(e) = db::insert_activity(&pool, user.id, "experiment_exposure", &metadata).await {
            tracing::warn!("Failed to record exposure: {}", e);
        }
    }

    Ok(HttpResponse::Ok().json(json!({
        "experiment_id": experiment.id,
        "variant": variant,
        "active": experiment.active,
    })))
}

#[post("/experiments/{id}/conversions")]
pub async fn record_conversion(
    pool: web::Data<PgPool>,
    cache: web::Data<ExperimentCache>,
    user: AuthUser,
    path: web::Path<String>,
    req: web::Json<ConversionRequest>,
) -> ApiResult<HttpResponse> {
    let (experiment, variant) = assigned_variant(&pool, &cache, &path, &user).await?;
    if !experiment.active {
        return Err(ApiError::Conflict("Experiment is not running".to_string()));
    }

    let metadata = json!({
        "experiment_id": experiment.id,
        "variant": variant,
        "goal": req.goal,
    });
    db::insert_activity(&pool, user.id, "experiment_conversion", &metadata).await?;
    Ok(HttpResponse::Created().json(json!({ "variant": variant, "recorded": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn variants(allocations: &[(&str, u32)]) -> Vec<Variant> {
        allocations
            .iter()
            .map(|(name, allocation)| Variant {
                name: name.to_string(),
                allocation: *allocation,
            })
            .collect()
    }

    #[test]
    fn bucket_is_a_base_31_rolling_hash() {
        // "ab": 97 * 31 + 98
        assert_eq!(bucket("a", "b"), (97 * 31 + 98) % 100);
        assert_eq!(bucket("", ""), 0);
    }

    #[test]
    fn inactive_experiment_returns_control() {
        let vs = variants(&[("control", 0), ("treatment", 100)]);
        assert_eq!(assign("exp", &vs, false, "user-1").unwrap().name, "control");
        assert_eq!(assign("exp", &vs, true, "user-1").unwrap().name, "treatment");
    }

    #[test]
    fn unallocated_remainder_goes_to_control() {
        let vs = variants(&[("control", 0), ("treatment", 0)]);
        assert_eq!(assign("exp", &vs, true, "anyone").unwrap().name, "control");
        assert!(assign("exp", &[], true, "anyone").is_none());
    }

    #[test]
    fn split_is_roughly_even() {
        let vs = variants(&[("a", 50), ("b", 50)]);
        let a = (0..2_000)
            .filter(|_| assign("homepage-cta", &vs, true, &Uuid::new_v4().to_string()).unwrap().name == "a")
            .count();
        assert!((800..1_200).contains(&a), "a got {}", a);
    }

    #[test]
    fn validation_rules() {
        assert!(validate("pricing-test", &variants(&[("control", 50), ("b", 50)])).is_ok());
        assert!(validate("Pricing Test", &variants(&[("control", 50), ("b", 50)])).is_err());
        assert!(validate("x", &variants(&[("control", 100)])).is_err());
        assert!(validate("x", &variants(&[("a", 50), ("a", 50)])).is_err());
        assert!(validate("x", &variants(&[("a", 60), ("b", 50)])).is_err());
    }

    #[test]
    fn normal_cdf_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn z_test_detects_large_difference() {
        let (z, p) = z_test((100, 1_000), (150, 1_000)).unwrap();
        assert!(z > 3.0);
        assert!(p < 0.01);
        assert!(z_test((0, 0), (10, 100)).is_none());
        assert!(z_test((0, 100), (0, 100)).is_none());
    }

    #[test]
    fn results_count_distinct_users_per_variant() {
        let vs = variants(&[("control", 50), ("treatment", 50)]);
        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let exposure = "experiment_exposure".to_string();
        let conversion = "experiment_conversion".to_string();
        let control = Some("control".to_string());
        let treatment = Some("treatment".to_string());
        let rows = vec![
            (u1, exposure.clone(), control.clone()),
            (u2, exposure.clone(), control.clone()),
            (u1, conversion.clone(), control.clone()),
            (u3, exposure.clone(), treatment.clone()),
            (u3, conversion.clone(), treatment.clone()),
            (u3, exposure.clone(), None),
        ];

        let results = compute_results(&vs, &rows);
        assert_eq!(results[0].exposures, 2);
        assert_eq!(results[0].conversions, 1);
        assert_eq!(results[0].conversion_rate, 0.5);
        assert!(results[0].lift.is_none());
        assert_eq!(results[1].conversion_rate, 1.0);
        assert_eq!(results[1].lift, Some(1.0));
        assert!(!results[1].significant);
    }

    #[test]
    fn conversions_without_exposure_are_ignored() {
        let vs = variants(&[("control", 50), ("treatment", 50)]);
        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let control = Some("control".to_string());
        let rows = vec![
            (u1, "experiment_exposure".to_string(), control.clone()),
            (u1, "experiment_conversion".to_string(), control.clone()),
            (u2, "experiment_conversion".to_string(), control.clone()),
            (u3, "experiment_conversion".to_string(), control.clone()),
            (u2, "experiment_conversion".to_string(), Some("treatment".to_string())),
        ];

        let results = compute_results(&vs, &rows);
        assert_eq!(results[0].exposures, 1);
        assert_eq!(results[0].conversions, 1);
        assert_eq!(results[0].conversion_rate, 1.0);
        assert_eq!((results[1].exposures, results[1].conversions), (0, 0));
        assert!(results.iter().all(|r| r.conversion_rate <= 1.0));
    }

    proptest! {
        #[test]
        fn bucket_is_in_range_and_deterministic(user in "[a-z0-9-]{0,40}", exp in "[a-z0-9_-]{1,20}") {
            let b = bucket(&user, &exp);
            prop_assert!(b < 100);
            prop_assert_eq!(b, bucket(&user, &exp));
        }

        #[test]
        fn full_allocation_always_assigns_by_bucket(user in "[a-z0-9-]{1,40}", split in 0u32..=100) {
            let vs = variants(&[("a", split), ("b", 100 - split)]);
            let chosen = assign("exp", &vs, true, &user).unwrap();
            let expected = if bucket(&user, "exp") < split { "a" } else { "b" };
            prop_assert_eq!(chosen.name.as_str(), expected);
        }

        #[test]
        fn conversion_rate_never_exceeds_one(
            raw in prop::collection::vec((0u128..6, any::<bool>(), any::<bool>()), 0..40),
        ) {
            let vs = variants(&[("control", 50), ("treatment", 50)]);
            let rows: Vec<(Uuid, String, Option<String>)> = raw
                .iter()
                .map(|(user, converted, treated)| {
                    let kind = if *converted { "experiment_conversion" } else { "experiment_exposure" };
                    let variant = if *treated { "treatment" } else { "control" };
                    (Uuid::from_u128(*user), kind.to_string(), Some(variant.to_string()))
                })
                .collect();
            for result in compute_results(&vs, &rows) {
                prop_assert!(result.conversions <= result.exposures);
                prop_assert!((0.0..=1.0).contains(&result.conversion_rate));
            }
        }
    }
}
