// src/metrics.rs
//! Engagement, retention and revenue aggregates for the admin dashboard.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::error::ApiResult;
use crate::plans::Plan;

pub const RETENTION_OFFSETS: [u32; 4] = [1, 7, 14, 30];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveUsers {
    pub dau: i64,
    pub wau: i64,
    pub mau: i64,
    pub stickiness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionPoint {
    pub day_offset: u32,
    /// `None` while the window has not closed yet.
    pub retained: Option<u64>,
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortRow {
    pub cohort: NaiveDate,
    pub size: u64,
    pub retention: Vec<RetentionPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRevenue {
    pub subscribers: i64,
    pub mrr_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Revenue {
    pub mrr_cents: i64,
    pub paying_subscribers: i64,
    pub arppu_cents: f64,
    pub by_plan: BTreeMap<String, PlanRevenue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub active_users: ActiveUsers,
    pub revenue: Revenue,
    /// Churn over the trailing 30 days.
    pub churn_rate: f64,
    pub generated_at: DateTime<Utc>,
}

pub fn stickiness(dau: i64, mau: i64) -> f64 {
    if mau <= 0 { 0.0 } else { dau as f64 / mau as f64 }
}

pub fn churn_rate(canceled: i64, active_at_start: i64) -> f64 {
    if active_at_start <= 0 {
        0.0
    } else {
        canceled as f64 / active_at_start as f64
    }
}

pub fn cohort_retention(
    signups: &[(Uuid, DateTime<Utc>)],
    active_days: &[(Uuid, NaiveDate)],
    offsets: &[u32],
    today: NaiveDate,
) -> Vec<CohortRow> {
    let mut activity: HashMap<Uuid, HashSet<NaiveDate>> = HashMap::new();
    for (user, day) in active_days {
        activity.entry(*user).or_default().insert(*day);
    }

    let mut cohorts: BTreeMap<NaiveDate, Vec<Uuid>> = BTreeMap::new();
    for (user, joined) in signups {
        cohorts.entry(joined.date_naive()).or_default().push(*user);
    }

    cohorts
        .into_iter()
        .map(|(cohort, members)| {
            let size = members.len() as u64;
            let retention = offsets
                .iter()
                .map(|offset| {
                    let day = cohort + Duration::days(i64::from(*offset));
                    if day >= today {
                        return RetentionPoint {
                            day_offset: *offset,
                            retained: None,
                            rate: None,
                        };
                    }
                    let retained = members
                        .iter()
                        .filter(|m| activity.get(*m).is_some_and(|days| days.contains(&day)))
                        .count() as u64;
                    RetentionPoint {
                        day_offset: *offset,
                        retained: Some(retained),
                        rate: Some(retained as f64 / size as f64),
                    }
                })
                .collect();
            CohortRow {
                cohort,
                size,
                retention,
            }
        })
        .collect()
}

pub fn revenue(plan_counts: &[(String, i64)]) -> Revenue {
    let mut by_plan = BTreeMap::new();
    let mut mrr_cents = 0;
    let mut paying_subscribers = 0;
    for (name, count) in plan_counts {
        let Ok(plan) = name.parse::<Plan>() else {
            tracing::warn!(plan = %name, "Skipping subscriptions with unknown plan");
            continue;
        };
        let plan_mrr = plan.price_cents() * count;
        mrr_cents += plan_mrr;
        if plan != Plan::Free {
            paying_subscribers += count;
        }
        by_plan.insert(
            plan.as_str().to_string(),
            PlanRevenue {
                subscribers: *count,
                mrr_cents: plan_mrr,
            },
        );
    }
    let arppu_cents = if paying_subscribers > 0 {
        mrr_cents as f64 / paying_subscribers as f64
    } else {
        0.0
    };
    Revenue {
        mrr_cents,
        paying_subscribers,
        arppu_cents,
        by_plan,
    }
}

pub async fn active_users(pool: &PgPool, now: DateTime<Utc>) -> ApiResult<ActiveUsers> {
    let dau = db::count_users_active_since(pool, now - Duration::days(1)).await?;
    let wau = db::count_users_active_since(pool, now - Duration::days(7)).await?;
    let mau = db::count_users_active_since(pool, now - Duration::days(30)).await?;
    Ok(ActiveUsers {
        dau,
        wau,
        mau,
        stickiness: stickiness(dau, mau),
    })
}

pub async fn overview(pool: &PgPool) -> ApiResult<Overview> {
    let now = Utc::now();
    let period_start = now - Duration::days(30);

    let active_users = active_users(pool, now).await?;
    let revenue = revenue(&db::count_active_subscriptions_by_plan(pool).await?);
    let canceled = db::count_subscriptions_canceled_between(pool, period_start, now).await?;
    let active_at_start = db::count_subscriptions_active_at(pool, period_start).await?;

    Ok(Overview {
        active_users,
        revenue,
        churn_rate: churn_rate(canceled, active_at_start),
        generated_at: now,
    })
}

pub async fn cohorts(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> ApiResult<Vec<CohortRow>> {
    let signups = db::get_signups(pool, from, to).await?;
    let active_days = db::get_active_days_for_signups(pool, from, to).await?;
    Ok(cohort_retention(
        &signups,
        &active_days,
        &RETENTION_OFFSETS,
        Utc::now().date_naive(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    #[test]
    fn ratios_guard_against_zero() {
        assert_eq!(stickiness(5, 0), 0.0);
        assert_eq!(stickiness(5, 20), 0.25);
        assert_eq!(churn_rate(3, 0), 0.0);
        assert_eq!(churn_rate(3, 30), 0.1);
    }

    #[test]
    fn retention_checks_the_exact_offset_day() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let joined = Utc.with_ymd_and_hms(2026, 1, 1, 18, 30, 0).unwrap();
        let signups = vec![(a, joined), (b, joined), (c, joined)];
        let active = vec![(a, day(2)), (b, day(2)), (a, day(8)), (c, day(5))];

        let rows = cohort_retention(&signups, &active, &[1, 7], day(31));
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.cohort, day(1));
        assert_eq!(row.size, 3);
        assert_eq!(row.retention[0].retained, Some(2));
        assert!((row.retention[0].rate.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(row.retention[1].retained, Some(1));
    }

    #[test]
    fn open_windows_are_not_reported() {
        let user = Uuid::new_v4();
        let signups = vec![(user, Utc.with_ymd_and_hms(2026, 1, 10, 9, 0, 0).unwrap())];
        let rows = cohort_retention(&signups, &[], &[1, 7], day(12));
        assert_eq!(rows[0].retention[0].retained, Some(0));
        assert_eq!(rows[0].retention[1].retained, None);
        assert_eq!(rows[0].retention[1].rate, None);
    }

    #[test]
    fn cohorts_split_by_signup_day() {
        let signups = vec![
            (Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            (Uuid::new_v4(), Utc.with_ymd_and_hms(2026, 1, 2, 23, 59, 0).unwrap()),
        ];
        let rows = cohort_retention(&signups, &[], &RETENTION_OFFSETS, day(31));
        assert_eq!(rows.iter().map(|r| r.cohort).collect::<Vec<_>>(), vec![day(1), day(2)]);
    }

    #[test]
    fn revenue_sums_plan_prices() {
        let counts = vec![
            ("basic".to_string(), 10),
            ("premium".to_string(), 5),
            ("free".to_string(), 100),
            ("legacy".to_string(), 3),
        ];
        let r = revenue(&counts);
        assert_eq!(r.mrr_cents, 10 * 999 + 5 * 1_999);
        assert_eq!(r.paying_subscribers, 15);
        assert_eq!(r.by_plan["premium"].mrr_cents, 9_995);
        assert!(!r.by_plan.contains_key("legacy"));
        assert!((r.arppu_cents - r.mrr_cents as f64 / 15.0).abs() < 1e-9);
    }
}
