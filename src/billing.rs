// src/billing.rs
//! Plan lookup and the Stripe webhook that keeps subscriptions in sync.

use actix_web::{HttpRequest, HttpResponse, get, post, web};
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::Config;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::funnel;
use crate::models::{FunnelStage, Payment, Subscription};
use crate::plans::Plan;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;
const DEFAULT_PERIOD_DAYS: i64 = 30;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(get_subscription);
    cfg.service(webhook);
}

/// Paid limits apply only while the subscription is in good standing and inside its period.
pub fn entitled_plan(subscription: Option<&Subscription>, now: DateTime<Utc>) -> Plan {
    subscription
        .filter(|s| matches!(s.status.as_str(), "active" | "trialing"))
        .filter(|s| s.current_period_end > now)
        .and_then(|s| s.plan.parse().ok())
        .unwrap_or(Plan::Free)
}

/// The plan a user is currently entitled to.
pub async fn effective_plan(pool: &PgPool, user_id: Uuid) -> ApiResult<Plan> {
    let subscription = db::get_active_subscription(pool, user_id).await?;
    Ok(entitled_plan(subscription.as_ref(), Utc::now()))
}

#[get("/billing/subscription")]
pub async fn get_subscription(
    pool: web::Data<PgPool>,
    user: AuthUser,
) -> ApiResult<HttpResponse> {
    let subscription = db::get_active_subscription(&pool, user.id).await?;
    let plan = entitled_plan(subscription.as_ref(), Utc::now());
    Ok(HttpResponse::Ok().json(json!({
        "plan": plan,
        "limits": plan.limits_json(),
        "subscription": subscription,
    })))
}

/// Verifies a `Stripe-Signature` header (`t=<unix>,v1=<hex hmac>`) against the raw body.
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    now: i64,
) -> ApiResult<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| ApiError::validation("missing signature timestamp"))?;
    if signatures.is_empty() {
        return Err(ApiError::validation("missing v1 signature"));
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(ApiError::internal)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    if !signatures
        .iter()
        .any(|sig| constant_time_eq(sig.as_bytes(), expected.as_bytes()))
    {
        tracing::warn!("Webhook signature verification failed");
        return Err(ApiError::validation("signature verification failed"));
    }

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| ApiError::validation("invalid signature timestamp"))?;
    if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(ApiError::validation("signature timestamp outside tolerance"));
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CheckoutSession {
    customer: Option<String>,
    subscription: Option<String>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    status: String,
    current_period_start: i64,
    current_period_end: i64,
    #[serde(default)]
    cancel_at_period_end: bool,
}

#[derive(Debug, Deserialize)]
struct StripeInvoice {
    id: String,
    customer: Option<String>,
    subscription: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    currency: String,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

/// User-level status for a Stripe subscription status.
pub fn account_status(stripe_status: &str) -> &'static str {
    match stripe_status {
        "active" | "trialing" => "active",
        "past_due" | "unpaid" | "incomplete" => "past_due",
        "canceled" | "incomplete_expired" => "canceled",
        _ => "none",
    }
}

fn parse<T: for<'de> Deserialize<'de>>(object: serde_json::Value) -> ApiResult<T> {
    serde_json::from_value(object).map_err(|e| ApiError::validation(format!("malformed event: {}", e)))
}

async fn on_checkout_completed(pool: &PgPool, session: CheckoutSession) -> ApiResult<()> {
    let user = match session.client_reference_id.as_deref().map(Uuid::parse_str) {
        Some(Ok(id)) => db::get_user_by_id(pool, id).await?,
        _ => match session.customer.as_deref() {
            Some(customer) => db::get_user_by_stripe_customer(pool, customer).await?,
            None => None,
        },
    };
    let Some(user) = user else {
        tracing::warn!("Checkout completed for an unknown user");
        return Ok(());
    };

    if let Some(customer) = &session.customer {
        db::set_stripe_customer(pool, user.id, customer).await?;
    }

    let plan: Plan = session
        .metadata
        .get("plan")
        .and_then(|p| p.as_str())
        .and_then(|p| p.parse().ok())
        .unwrap_or(Plan::Basic);
    let now = Utc::now();
    let subscription = db::upsert_subscription(
        pool,
        &Subscription {
            id: Uuid::new_v4(),
            user_id: user.id,
            plan: plan.as_str().to_string(),
            status: "active".to_string(),
            stripe_subscription_id: session.subscription,
            current_period_start: now,
            current_period_end: now + Duration::days(DEFAULT_PERIOD_DAYS),
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now,
        },
    )
    .await?;
    db::set_subscription_status(pool, user.id, "active").await?;
    tracing::info!(user_id = %user.id, plan = %plan, subscription_id = %subscription.id, "Subscription started");

    let archetype = db::get_profile(pool, user.id).await?.map(|p| p.archetype());
    if let Err(e) = funnel::record(
        pool,
        FunnelStage::SubscriptionStarted,
        Some(user.id),
        None,
        archetype,
        json!({ "plan": plan }),
    )
    .await
    {
        tracing::warn!("Failed to record subscription funnel event: {}", e);
    }
    Ok(())
}

async fn on_subscription_changed(
    pool: &PgPool,
    sub: StripeSubscription,
    deleted: bool,
) -> ApiResult<()> {
    let status = if deleted { "canceled" } else { sub.status.as_str() };
    let updated = db::update_subscription_state(
        pool,
        &sub.id,
        status,
        timestamp(sub.current_period_start),
        timestamp(sub.current_period_end),
        sub.cancel_at_period_end,
    )
    .await?;

    match updated {
        Some(subscription) => {
            db::set_subscription_status(pool, subscription.user_id, account_status(status)).await?;
            tracing::info!(user_id = %subscription.user_id, status = status, "Subscription updated");
        }
        None => tracing::warn!(stripe_subscription = %sub.id, "Update for unknown subscription"),
    }
    Ok(())
}

async fn on_invoice(pool: &PgPool, invoice: StripeInvoice, paid: bool) -> ApiResult<()> {
    let user = match invoice.customer.as_deref() {
        Some(customer) => db::get_user_by_stripe_customer(pool, customer).await?,
        None => None,
    };
    let Some(user) = user else {
        tracing::warn!(invoice = %invoice.id, "Invoice for unknown customer");
        return Ok(());
    };

    if !paid {
        db::set_subscription_status(pool, user.id, "past_due").await?;
        if let Some(stripe_id) = invoice.subscription.as_deref() {
            if db::set_subscription_row_status(pool, stripe_id, "past_due").await?.is_none() {
                tracing::warn!(stripe_subscription = %stripe_id, "Failed invoice for unknown subscription");
            }
        }
        tracing::warn!(user_id = %user.id, invoice = %invoice.id, "Invoice payment failed");
        return Ok(());
    }

    let subscription_id = match invoice.subscription.as_deref() {
        Some(stripe_id) => db::get_subscription_by_stripe_id(pool, stripe_id)
            .await?
            .map(|s| s.id),
        None => None,
    };
    let payment = Payment {
        id: Uuid::new_v4(),
        user_id: user.id,
        subscription_id,
        stripe_invoice_id: invoice.id,
        amount_cents: invoice.amount_paid,
        currency: invoice.currency,
        status: "paid".to_string(),
        created_at: Utc::now(),
    };
    if !db::insert_payment(pool, &payment).await? {
        tracing::debug!(invoice = %payment.stripe_invoice_id, "Duplicate invoice ignored");
    }
    Ok(())
}

#[post("/billing/webhook")]
pub async fn webhook(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    req: HttpRequest,
    body: web::Bytes,
) -> ApiResult<HttpResponse> {
    let signature = req
        .headers()
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("missing Stripe-Signature header"))?;
    verify_signature(&config.stripe_webhook_secret, &body, signature, Utc::now().timestamp())?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation(format!("malformed event: {}", e)))?;
    tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Webhook received");

    let object = event.data.object;
    match event.event_type.as_str() {
        "checkout.session.completed" => on_checkout_completed(&pool, parse(object)?).await?,
        "customer.subscription.updated" => {
            on_subscription_changed(&pool, parse(object)?, false).await?
        }
        "customer.subscription.deleted" => {
            on_subscription_changed(&pool, parse(object)?, true).await?
        }
        "invoice.paid" => on_invoice(&pool, parse(object)?, true).await?,
        "invoice.payment_failed" => on_invoice(&pool, parse(object)?, false).await?,
        other => tracing::debug!(event_type = other, "Ignoring webhook event"),
    }

    Ok(HttpResponse::Ok().json(json!({ "received": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, ts: i64, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", ts).as_bytes());
        mac.update(payload);
        format!("t={},v1={}", ts, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", 1_700_000_000, payload);
        assert!(verify_signature("whsec_test", payload, &header, 1_700_000_100).is_ok());
    }

    #[test]
    fn accepts_any_matching_v1_among_several() {
        let payload = b"{}";
        let valid = sign("whsec_test", 1_700_000_000, payload);
        let header = format!("{},v1=deadbeef", valid);
        assert!(verify_signature("whsec_test", payload, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let header = sign("whsec_test", 1_700_000_000, b"original");
        assert!(verify_signature("whsec_test", b"tampered", &header, 1_700_000_000).is_err());
        assert!(verify_signature("whsec_other", b"original", &header, 1_700_000_000).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let header = sign("whsec_test", 1_700_000_000, b"{}");
        let err = verify_signature("whsec_test", b"{}", &header, 1_700_000_301).unwrap_err();
        assert!(err.to_string().contains("tolerance"));
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(verify_signature("s", b"{}", "v1=abc", 0).is_err());
        assert!(verify_signature("s", b"{}", "t=1", 0).is_err());
    }

    #[test]
    fn maps_stripe_status_to_account_status() {
        assert_eq!(account_status("trialing"), "active");
        assert_eq!(account_status("unpaid"), "past_due");
        assert_eq!(account_status("canceled"), "canceled");
        assert_eq!(account_status("paused"), "none");
    }

    #[test]
    fn parses_subscription_objects() {
        let object = json!({
            "id": "sub_1",
            "status": "active",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
        });
        let sub: StripeSubscription = parse(object).unwrap();
        assert_eq!(sub.id, "sub_1");
        assert!(!sub.cancel_at_period_end);
        assert_eq!(timestamp(sub.current_period_start).timestamp(), 1_700_000_000);
    }

    fn subscription(plan: &str, status: &str, ends_in_days: i64) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan: plan.to_string(),
            status: status.to_string(),
            stripe_subscription_id: Some("sub_1".to_string()),
            current_period_start: now - Duration::days(30),
            current_period_end: now + Duration::days(ends_in_days),
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: now - Duration::days(30),
        }
    }

    #[test]
    fn past_due_subscription_falls_back_to_free_limits() {
        let now = Utc::now();
        assert_eq!(entitled_plan(Some(&subscription("premium", "active", 5)), now), Plan::Premium);
        assert_eq!(entitled_plan(Some(&subscription("premium", "trialing", 5)), now), Plan::Premium);
        assert_eq!(entitled_plan(Some(&subscription("premium", "past_due", 5)), now), Plan::Free);
        assert_eq!(entitled_plan(Some(&subscription("premium", "active", -1)), now), Plan::Free);
        assert_eq!(entitled_plan(None, now), Plan::Free);
    }

    #[test]
    fn parses_failed_invoice_with_subscription() {
        let invoice: StripeInvoice = parse(json!({
            "id": "in_1",
            "customer": "cus_1",
            "subscription": "sub_1",
        }))
        .unwrap();
        assert_eq!(invoice.subscription.as_deref(), Some("sub_1"));
        assert_eq!(invoice.amount_paid, 0);
    }
}
