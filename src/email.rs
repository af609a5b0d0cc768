// src/email.rs
//! Templated transactional email, queued in Postgres and drained by a worker.

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::{Value, json};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::EmailJob;

pub const MAX_ATTEMPTS: i32 = 5;
const BATCH_SIZE: i64 = 10;
const LEASE_SECS: i64 = 300;
const POLL_INTERVAL: StdDuration = StdDuration::from_secs(5);
const BASE_BACKOFF_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    Welcome,
    StageUp,
    MilestoneReached,
}

impl EmailTemplate {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::StageUp => "stage_up",
            Self::MilestoneReached => "milestone_reached",
        }
    }
}

impl std::str::FromStr for EmailTemplate {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome" => Ok(Self::Welcome),
            "stage_up" => Ok(Self::StageUp),
            "milestone_reached" => Ok(Self::MilestoneReached),
            other => Err(ApiError::Validation(format!("unknown email template: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

fn field<'a>(payload: &'a Value, key: &str, fallback: &'a str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or(fallback)
}

fn humanize(label: &str) -> String {
    label.replace('_', " ")
}

pub fn render(template: EmailTemplate, payload: &Value) -> RenderedEmail {
    let name = field(payload, "name", "there");
    let companion = field(payload, "companion_name", "your companion");
    match template {
        EmailTemplate::Welcome => RenderedEmail {
            subject: format!("Welcome to SoulBond, {}!", name),
            body: format!(
                "Hi {},\n\n{} is excited to meet you. Say hello whenever you're ready.\n\nThe SoulBond team",
                name, companion
            ),
        },
        EmailTemplate::StageUp => {
            let stage = humanize(field(payload, "to", "closer"));
            RenderedEmail {
                subject: format!("You and {} are now {}", companion, stage),
                body: format!(
                    "Hi {},\n\nYour bond with {} has grown. You've reached the \"{}\" stage.\n\nThe SoulBond team",
                    name, companion, stage
                ),
            }
        }
        EmailTemplate::MilestoneReached => {
            let milestone = humanize(field(payload, "milestone", "a new milestone"));
            RenderedEmail {
                subject: format!("Milestone unlocked: {}", milestone),
                body: format!(
                    "Hi {},\n\nYou and {} just reached \"{}\". Keep the conversation going!\n\nThe SoulBond team",
                    name, companion, milestone
                ),
            }
        }
    }
}

/// Delay before retrying a job that has failed `attempts` times: 30s, 60s, 120s, ...
pub fn backoff(attempts: i32, jitter_secs: i64) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 10) as u32;
    Duration::seconds(BASE_BACKOFF_SECS * 2i64.pow(exponent) + jitter_secs)
}

pub async fn enqueue(
    pool: &PgPool,
    user_id: Uuid,
    template: EmailTemplate,
    payload: Value,
) -> ApiResult<()> {
    if !db::enqueue_email_for_user(pool, user_id, template.as_str(), &payload).await? {
        return Err(ApiError::NotFound("User"));
    }
    tracing::debug!(user_id = %user_id, template = template.as_str(), "Email queued");
    Ok(())
}

#[derive(Clone)]
pub struct Mailer {
    client: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
    from: String,
}

impl Mailer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.email_api_url.clone(),
            api_key: config.email_api_key.clone(),
            from: config.email_from.clone(),
        }
    }

    pub async fn send(&self, to: &str, email: &RenderedEmail) -> Result<(), String> {
        let Some(url) = &self.api_url else {
            tracing::info!(to = to, subject = %email.subject, "Email provider not configured, logging email");
            return Ok(());
        };

        let mut request = self.client.post(url).json(&json!({
            "from": self.from,
            "to": to,
            "subject": email.subject,
            "text": email.body,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("email provider returned {}", response.status()));
        }
        Ok(())
    }
}

async fn deliver(pool: &PgPool, mailer: &Mailer, job: &EmailJob) -> Result<(), sqlx::Error> {
    let outcome = match job.template.parse::<EmailTemplate>() {
        Ok(template) => mailer.send(&job.to_address, &render(template, &job.payload)).await,
        Err(e) => {
            db::mark_email_failed(pool, job.id, &e.to_string()).await?;
            return Ok(());
        }
    };

    match outcome {
        Ok(()) => db::mark_email_sent(pool, job.id).await,
        Err(e) if job.attempts >= MAX_ATTEMPTS => {
            tracing::error!(job_id = %job.id, attempts = job.attempts, "Email permanently failed: {}", e);
            db::mark_email_failed(pool, job.id, &e).await
        }
        Err(e) => {
            let jitter = rand::thread_rng().gen_range(0..10);
            let next = Utc::now() + backoff(job.attempts, jitter);
            tracing::warn!(job_id = %job.id, attempts = job.attempts, "Email send failed, retrying: {}", e);
            db::reschedule_email(pool, job.id, next, &e).await
        }
    }
}

/// Claims one batch of due jobs and attempts each. Returns how many were claimed.
pub async fn process_due(pool: &PgPool, mailer: &Mailer) -> Result<usize, sqlx::Error> {
    let jobs = db::claim_email_jobs(pool, BATCH_SIZE, LEASE_SECS).await?;
    for job in &jobs {
        deliver(pool, mailer, job).await?;
    }
    Ok(jobs.len())
}

pub async fn run_worker(pool: PgPool, mailer: Mailer) {
    tracing::info!("Email worker started");
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        match process_due(&pool, &mailer).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(count = n, "Processed email jobs"),
            Err(e) => tracing::error!("Email worker database error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_stage_up_with_payload_fields() {
        let email = render(
            EmailTemplate::StageUp,
            &json!({"name": "Sam", "companion_name": "Aria", "to": "close_friend"}),
        );
        assert_eq!(email.subject, "You and Aria are now close friend");
        assert!(email.body.starts_with("Hi Sam,"));
    }

    #[test]
    fn missing_fields_fall_back() {
        let email = render(EmailTemplate::MilestoneReached, &json!({}));
        assert_eq!(email.subject, "Milestone unlocked: a new milestone");
        assert!(email.body.contains("your companion"));
    }

    #[test]
    fn template_names_parse() {
        for t in [EmailTemplate::Welcome, EmailTemplate::StageUp, EmailTemplate::MilestoneReached] {
            assert_eq!(t.as_str().parse::<EmailTemplate>().unwrap(), t);
        }
        assert!("newsletter".parse::<EmailTemplate>().is_err());
    }

    #[test]
    fn retry_schedule_before_giving_up() {
        let delays: Vec<i64> = (1..MAX_ATTEMPTS).map(|n| backoff(n, 0).num_seconds()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240]);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff(1, 0), Duration::seconds(30));
        assert_eq!(backoff(2, 0), Duration::seconds(60));
        assert_eq!(backoff(4, 5), Duration::seconds(245));
        // never negative, even for a job that was never attempted
        assert_eq!(backoff(0, 0), Duration::seconds(30));
    }

    #[actix_web::test]
    async fn unconfigured_mailer_logs_instead_of_sending() {
        let mailer = Mailer::from_config(&Config::for_tests());
        let email = render(EmailTemplate::Welcome, &json!({"name": "Kai"}));
        assert!(mailer.send("kai@example.com", &email).await.is_ok());
    }
}
