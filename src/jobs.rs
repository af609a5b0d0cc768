// src/jobs.rs
//! Periodic trust recomputation for recently active users.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sqlx::PgPool;

use crate::db;
use crate::relationship;

const ACTIVE_WINDOW_HOURS: i64 = 24;

/// Recomputes trust for every user active in the last day. Returns how many succeeded.
pub async fn recalculate_active(pool: &PgPool) -> Result<usize, sqlx::Error> {
    let since = Utc::now() - Duration::hours(ACTIVE_WINDOW_HOURS);
    let users = db::get_users_active_since(pool, since).await?;

    let mut updated = 0;
    for user_id in users {
        match relationship::progress(pool, user_id).await {
            Ok(_) => updated += 1,
            Err(e) => tracing::warn!(user_id = %user_id, "Trust recalculation failed: {}", e),
        }
    }
    Ok(updated)
}

pub async fn run_trust_recalculation(pool: PgPool, interval_secs: u64) {
    tracing::info!(interval_secs, "Trust recalculation job started");
    let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));
    // The first tick completes immediately; skip it so startup stays quiet.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match recalculate_active(&pool).await {
            Ok(n) => tracing::info!(updated = n, "Trust recalculation finished"),
            Err(e) => tracing::error!("Trust recalculation database error: {}", e),
        }
    }
}
