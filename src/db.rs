// src/db.rs
use crate::models::{
    Activity, Conversation, ConversionEvent, EmailJob, Experiment, Message, Payment, Profile,
    RelationshipStage, Subscription, User,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const USER_COLUMNS: &str =
    "id, email, name, password_hash, role, subscription_status, stripe_customer_id, created_at";
const PROFILE_COLUMNS: &str = "user_id, archetype, companion_name, trust_level, relationship_stage, milestones, trust_updated_at, created_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, user_id, role, content, sentiment, toxicity, created_at";
const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan, status, stripe_subscription_id, current_period_start, current_period_end, cancel_at_period_end, canceled_at, created_at";
const EMAIL_JOB_COLUMNS: &str = "id, user_id, to_address, template, payload, status, attempts, next_attempt_at, last_error, created_at, sent_at";

// ---------------------------------------------------------------------------
// Users and profiles
// ---------------------------------------------------------------------------

pub async fn get_user_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
    ))
    .bind(email)
    .fetch_optional(pool)
    .await
}

pub async fn get_user_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_users(pool: &PgPool) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY created_at"
    ))
    .fetch_all(pool)
    .await
}

/// Inserts the account and its companion profile atomically.
pub async fn create_user_with_profile(
    pool: &PgPool,
    user: &User,
    profile: &Profile,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO users (id, email, name, password_hash, role, subscription_status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)")
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(&user.role)
        .bind(&user.subscription_status)
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO profiles (user_id, archetype, companion_name, trust_level, relationship_stage, milestones, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)")
        .bind(profile.user_id)
        .bind(&profile.archetype)
        .bind(&profile.companion_name)
        .bind(profile.trust_level)
        .bind(&profile.relationship_stage)
        .bind(&profile.milestones)
        .bind(profile.created_at)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

pub async fn get_user_by_stripe_customer(
    pool: &PgPool,
    customer_id: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE stripe_customer_id = $1"
    ))
    .bind(customer_id)
    .fetch_optional(pool)
    .await
}

pub async fn set_stripe_customer(
    pool: &PgPool,
    user_id: Uuid,
    customer_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET stripe_customer_id = $1 WHERE id = $2")
        .bind(customer_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_subscription_status(
    pool: &PgPool,
    user_id: Uuid,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET subscription_status = $1 WHERE id = $2")
        .bind(status)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_profile(pool: &PgPool, user_id: Uuid) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!(
        "SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = $1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn update_profile(
    pool: &PgPool,
    user_id: Uuid,
    archetype: Option<&str>,
    companion_name: Option<&str>,
) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(&format!(
        "UPDATE profiles SET archetype = COALESCE($2, archetype), companion_name = COALESCE($3, companion_name) \
         WHERE user_id = $1 RETURNING {PROFILE_COLUMNS}"
    ))
    .bind(user_id)
    .bind(archetype)
    .bind(companion_name)
    .fetch_optional(pool)
    .await
}

pub async fn update_trust(
    pool: &PgPool,
    user_id: Uuid,
    trust_level: i32,
    stage: RelationshipStage,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE profiles SET trust_level = $1, relationship_stage = $2, trust_updated_at = NOW() WHERE user_id = $3")
        .bind(trust_level.clamp(0, 100))
        .bind(stage.as_str())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Appends milestone ids that are not recorded yet.
pub async fn add_milestones(
    pool: &PgPool,
    user_id: Uuid,
    milestones: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE profiles SET milestones = milestones || ARRAY(SELECT m FROM UNNEST($1::text[]) AS m WHERE m <> ALL(milestones)) WHERE user_id = $2",
    )
    .bind(milestones)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Conversations and messages
// ---------------------------------------------------------------------------

pub async fn create_conversation(
    pool: &PgPool,
    conversation: &Conversation,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO conversations (id, user_id, title, created_at, updated_at) VALUES ($1, $2, $3, $4, $5)")
        .bind(conversation.id)
        .bind(conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_conversations(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(
        "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE user_id = $1 ORDER BY updated_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

pub async fn count_conversations(pool: &PgPool, user_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
}

pub async fn get_conversation(
    pool: &PgPool,
    conversation_id: Uuid,
) -> Result<Option<Conversation>, sqlx::Error> {
    sqlx::query_as::<_, Conversation>(
        "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_conversation_messages(
    pool: &PgPool,
    conversation_id: Uuid,
) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 ORDER BY created_at"
    ))
    .bind(conversation_id)
    .fetch_all(pool)
    .await
}

/// The last `limit` messages of a conversation, oldest first.
pub async fn get_conversation_tail(
    pool: &PgPool,
    conversation_id: Uuid,
    limit: i64,
) -> Result<Vec<Message>, sqlx::Error> {
    let mut messages = sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT $2"
    ))
    .bind(conversation_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    messages.reverse();
    Ok(messages)
}

/// A user's most recent messages across all conversations, newest first.
pub async fn get_recent_messages(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<Message>, sqlx::Error> {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
    ))
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn insert_message(pool: &PgPool, message: &Message) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO messages (id, conversation_id, user_id, role, content, sentiment, toxicity, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.user_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(message.sentiment)
        .bind(message.toxicity)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
        .bind(message.created_at)
        .bind(message.conversation_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

pub async fn count_user_messages_since(
    pool: &PgPool,
    user_id: Uuid,
    since: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE user_id = $1 AND role = 'user' AND created_at >= $2",
    )
    .bind(user_id)
    .bind(since)
    .fetch_one(pool)
    .await
}

// ---------------------------------------------------------------------------
// Activities
// ---------------------------------------------------------------------------

pub async fn insert_activity(
    pool: &PgPool,
    user_id: Uuid,
    activity_type: &str,
    metadata: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO activities (id, user_id, activity_type, metadata, created_at) VALUES ($1, $2, $3, $4, NOW())")
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(activity_type)
        .bind(metadata)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_recent_activities(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<Activity>, sqlx::Error> {
    sqlx::query_as::<_, Activity>(
        "SELECT id, user_id, activity_type, metadata, created_at FROM activities WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Users with a message or activity at or after `since`.
pub async fn get_users_active_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT user_id FROM messages WHERE role = 'user' AND created_at >= $1 \
         UNION SELECT user_id FROM activities WHERE created_at >= $1",
    )
    .bind(since)
    .fetch_all(pool)
    .await
}

pub async fn count_users_active_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM (SELECT user_id FROM messages WHERE role = 'user' AND created_at >= $1 \
         UNION SELECT user_id FROM activities WHERE created_at >= $1) active",
    )
    .bind(since)
    .fetch_one(pool)
    .await
}

// ---------------------------------------------------------------------------
// Conversion funnel
// ---------------------------------------------------------------------------

pub async fn insert_conversion_event(
    pool: &PgPool,
    event: &ConversionEvent,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO conversion_events (id, user_id, session_id, stage, archetype, metadata, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)")
        .bind(event.id)
        .bind(event.user_id)
        .bind(&event.session_id)
        .bind(&event.stage)
        .bind(&event.archetype)
        .bind(&event.metadata)
        .bind(event.created_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn has_conversion_event(
    pool: &PgPool,
    user_id: Uuid,
    stage: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM conversion_events WHERE user_id = $1 AND stage = $2)",
    )
    .bind(user_id)
    .bind(stage)
    .fetch_one(pool)
    .await
}

pub async fn get_conversion_events(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<ConversionEvent>, sqlx::Error> {
    sqlx::query_as::<_, ConversionEvent>(
        "SELECT id, user_id, session_id, stage, archetype, metadata, created_at FROM conversion_events \
         WHERE created_at >= $1 AND created_at < $2 ORDER BY created_at",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}

// ---------------------------------------------------------------------------
// Experiments
// ---------------------------------------------------------------------------

pub async fn create_experiment(pool: &PgPool, experiment: &Experiment) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO experiments (id, name, description, variants, active, created_at) VALUES ($1, $2, $3, $4, $5, $6)")
        .bind(&experiment.id)
        .bind(&experiment.name)
        .bind(&experiment.description)
        .bind(&experiment.variants)
        .bind(experiment.active)
        .bind(experiment.created_at)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_experiment(pool: &PgPool, id: &str) -> Result<Option<Experiment>, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(
        "SELECT id, name, description, variants, active, created_at FROM experiments WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn list_experiments(pool: &PgPool) -> Result<Vec<Experiment>, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(
        "SELECT id, name, description, variants, active, created_at FROM experiments ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
}

pub async fn set_experiment_active(
    pool: &PgPool,
    id: &str,
    active: bool,
) -> Result<Option<Experiment>, sqlx::Error> {
    sqlx::query_as::<_, Experiment>(
        "UPDATE experiments SET active = $2 WHERE id = $1 RETURNING id, name, description, variants, active, created_at",
    )
    .bind(id)
    .bind(active)
    .fetch_optional(pool)
    .await
}

/// Distinct (user, activity type, variant) rows tracked for an experiment.
pub async fn get_experiment_activity(
    pool: &PgPool,
    experiment_id: &str,
) -> Result<Vec<(Uuid, String, Option<String>)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT DISTINCT user_id, activity_type, metadata->>'variant' FROM activities \
         WHERE activity_type IN ('experiment_exposure', 'experiment_conversion') \
         AND metadata->>'experiment_id' = $1",
    )
    .bind(experiment_id)
    .fetch_all(pool)
    .await
}

// ---------------------------------------------------------------------------
// Billing
// ---------------------------------------------------------------------------

pub async fn get_active_subscription(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE user_id = $1 AND status IN ('active', 'trialing') AND current_period_end > NOW() \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_subscription_by_stripe_id(
    pool: &PgPool,
    stripe_id: &str,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
    ))
    .bind(stripe_id)
    .fetch_optional(pool)
    .await
}

pub async fn list_subscriptions(pool: &PgPool) -> Result<Vec<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY created_at"
    ))
    .fetch_all(pool)
    .await
}

/// Inserts a subscription, or refreshes it when the Stripe id is already known.
pub async fn upsert_subscription(
    pool: &PgPool,
    subscription: &Subscription,
) -> Result<Subscription, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "INSERT INTO subscriptions (id, user_id, plan, status, stripe_subscription_id, current_period_start, current_period_end, cancel_at_period_end, canceled_at, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (stripe_subscription_id) DO UPDATE SET plan = EXCLUDED.plan, status = EXCLUDED.status, \
         current_period_start = EXCLUDED.current_period_start, current_period_end = EXCLUDED.current_period_end \
         RETURNING {SUBSCRIPTION_COLUMNS}"
    ))
    .bind(subscription.id)
    .bind(subscription.user_id)
    .bind(&subscription.plan)
    .bind(&subscription.status)
    .bind(&subscription.stripe_subscription_id)
    .bind(subscription.current_period_start)
    .bind(subscription.current_period_end)
    .bind(subscription.cancel_at_period_end)
    .bind(subscription.canceled_at)
    .bind(subscription.created_at)
    .fetch_one(pool)
    .await
}

pub async fn update_subscription_state(
    pool: &PgPool,
    stripe_id: &str,
    status: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    cancel_at_period_end: bool,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "UPDATE subscriptions SET status = $2, current_period_start = $3, current_period_end = $4, \
         cancel_at_period_end = $5, \
         canceled_at = CASE WHEN $2 = 'canceled' THEN COALESCE(canceled_at, NOW()) ELSE canceled_at END \
         WHERE stripe_subscription_id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
    ))
    .bind(stripe_id)
    .bind(status)
    .bind(period_start)
    .bind(period_end)
    .bind(cancel_at_period_end)
    .fetch_optional(pool)
    .await
}

pub async fn set_subscription_row_status(
    pool: &PgPool,
    stripe_id: &str,
    status: &str,
) -> Result<Option<Subscription>, sqlx::Error> {
    sqlx::query_as::<_, Subscription>(&format!(
        "UPDATE subscriptions SET status = $2 WHERE stripe_subscription_id = $1 RETURNING {SUBSCRIPTION_COLUMNS}"
    ))
    .bind(stripe_id)
    .bind(status)
    .fetch_optional(pool)
    .await
}

/// Records an invoice once; replays of the same invoice are ignored.
pub async fn insert_payment(pool: &PgPool, payment: &Payment) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("INSERT INTO payments (id, user_id, subscription_id, stripe_invoice_id, amount_cents, currency, status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (stripe_invoice_id) DO NOTHING")
        .bind(payment.id)
        .bind(payment.user_id)
        .bind(payment.subscription_id)
        .bind(&payment.stripe_invoice_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(&payment.status)
        .bind(payment.created_at)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Signup time of every user who joined in `[from, to)`.
pub async fn get_signups(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<(Uuid, DateTime<Utc>)>, sqlx::Error> {
    sqlx::query_as("SELECT id, created_at FROM users WHERE created_at >= $1 AND created_at < $2")
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await
}

/// Distinct UTC days on which users who joined in `[from, to)` were active.
pub async fn get_active_days_for_signups(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<(Uuid, NaiveDate)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT DISTINCT t.user_id, (t.created_at AT TIME ZONE 'UTC')::date FROM ( \
             SELECT user_id, created_at FROM messages WHERE role = 'user' \
             UNION ALL SELECT user_id, created_at FROM activities \
         ) t JOIN users u ON u.id = t.user_id \
         WHERE u.created_at >= $1 AND u.created_at < $2",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}

/// Active subscription counts per plan.
pub async fn count_active_subscriptions_by_plan(
    pool: &PgPool,
) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT plan, COUNT(*) FROM subscriptions \
         WHERE status IN ('active', 'trialing') AND current_period_end > NOW() GROUP BY plan",
    )
    .fetch_all(pool)
    .await
}

pub async fn count_subscriptions_active_at(
    pool: &PgPool,
    at: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM subscriptions WHERE created_at < $1 AND (canceled_at IS NULL OR canceled_at >= $1)",
    )
    .bind(at)
    .fetch_one(pool)
    .await
}

pub async fn count_subscriptions_canceled_between(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM subscriptions WHERE canceled_at >= $1 AND canceled_at < $2 AND created_at < $1",
    )
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await
}

// ---------------------------------------------------------------------------
// Email jobs
// ---------------------------------------------------------------------------

/// Queues an email to the user's address. Returns false when the user is unknown.
pub async fn enqueue_email_for_user(
    pool: &PgPool,
    user_id: Uuid,
    template: &str,
    payload: &serde_json::Value,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO email_jobs (id, user_id, to_address, template, payload) \
         SELECT $1, id, email, $3, $4 FROM users WHERE id = $2",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(template)
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Leases up to `limit` due jobs. A claimed job becomes due again after `lease_secs`
/// if the worker never reports back.
pub async fn claim_email_jobs(
    pool: &PgPool,
    limit: i64,
    lease_secs: i64,
) -> Result<Vec<EmailJob>, sqlx::Error> {
    sqlx::query_as::<_, EmailJob>(&format!(
        "UPDATE email_jobs SET status = 'sending', attempts = attempts + 1, \
         next_attempt_at = NOW() + make_interval(secs => $2) \
         WHERE id IN ( \
             SELECT id FROM email_jobs WHERE status IN ('pending', 'sending') AND next_attempt_at <= NOW() \
             ORDER BY next_attempt_at LIMIT $1 FOR UPDATE SKIP LOCKED \
         ) RETURNING {EMAIL_JOB_COLUMNS}"
    ))
    .bind(limit)
    .bind(lease_secs as f64)
    .fetch_all(pool)
    .await
}

pub async fn mark_email_sent(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE email_jobs SET status = 'sent', sent_at = NOW(), last_error = NULL WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn reschedule_email(
    pool: &PgPool,
    job_id: Uuid,
    next_attempt_at: DateTime<Utc>,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE email_jobs SET status = 'pending', next_attempt_at = $2, last_error = $3 WHERE id = $1")
        .bind(job_id)
        .bind(next_attempt_at)
        .bind(error)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_email_failed(pool: &PgPool, job_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE email_jobs SET status = 'failed', last_error = $2 WHERE id = $1")
        .bind(job_id)
        .bind(error)
        .execute(pool)
        .await?;
    Ok(())
}
