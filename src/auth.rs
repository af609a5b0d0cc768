// src/auth.rs
use std::future::{Ready, ready};

use crate::config::Config;
use crate::db;
use crate::email::{self, EmailTemplate};
use crate::error::{ApiError, ApiResult};
use crate::funnel;
use crate::models::{
    Archetype, Claims, FunnelStage, LoginRequest, Profile, RegisterRequest, RelationshipStage,
    Role, User,
};
use actix_web::{FromRequest, HttpRequest, HttpResponse, dev::Payload, http::header, post, web};
use bcrypt::{DEFAULT_COST, hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

const TOKEN_TTL_HOURS: i64 = 24;
const MIN_PASSWORD_LEN: usize = 8;

pub fn init_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(login);
    cfg.service(register);
}

/// The caller identified by a valid bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: Role,
}

/// An authenticated caller holding the admin role.
#[derive(Debug, Clone, Copy)]
pub struct AdminUser(pub AuthUser);

pub fn issue_token(secret: &str, user_id: Uuid, role: Role) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = Utc::now() + Duration::hours(TOKEN_TTL_HOURS);
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.as_str().to_string(),
        exp: expiration.timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
}

pub fn verify_token(secret: &str, token: &str) -> ApiResult<AuthUser> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!("Rejected token: {}", e);
        ApiError::Unauthorized
    })?;

    let id = Uuid::parse_str(&data.claims.sub).map_err(|_| ApiError::Unauthorized)?;
    let role = data.claims.role.parse().map_err(|_| ApiError::Unauthorized)?;
    Ok(AuthUser { id, role })
}

fn authenticate(req: &HttpRequest) -> ApiResult<AuthUser> {
    let config = req
        .app_data::<web::Data<Config>>()
        .ok_or_else(|| ApiError::internal("config not registered"))?;

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    verify_token(&config.jwt_secret, token.trim())
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req))
    }
}

impl FromRequest for AdminUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(authenticate(req).and_then(|user| match user.role {
            Role::Admin => Ok(AdminUser(user)),
            Role::User => Err(ApiError::Forbidden),
        }))
    }
}

fn validate_registration(req: &RegisterRequest) -> ApiResult<()> {
    let email = req.email.trim();
    if email.len() < 3 || !email.contains('@') {
        return Err(ApiError::validation("a valid email is required"));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if let Some(name) = &req.companion_name {
        if name.trim().is_empty() || name.chars().count() > 40 {
            return Err(ApiError::validation("companion name must be 1-40 characters"));
        }
    }
    Ok(())
}

#[post("/auth/login")]
pub async fn login(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    req: web::Json<LoginRequest>,
) -> ApiResult<HttpResponse> {
    let email = req.email.trim().to_lowercase();
    let user = db::get_user_by_email(&pool, &email)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if !verify(&req.password, &user.password_hash).unwrap_or(false) {
        return Err(ApiError::Unauthorized);
    }

    let role: Role = user.role.parse().unwrap_or(Role::User);
    let token = issue_token(&config.jwt_secret, user.id, role).map_err(ApiError::internal)?;
    Ok(HttpResponse::Ok().json(json!({
        "token": token,
        "user_id": user.id,
        "role": role,
    })))
}

#[post("/auth/register")]
pub async fn register(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    req: web::Json<RegisterRequest>,
) -> ApiResult<HttpResponse> {
    let req = req.into_inner();
    validate_registration(&req)?;

    let email = req.email.trim().to_lowercase();
    if db::get_user_by_email(&pool, &email).await?.is_some() {
        return Err(ApiError::Conflict("Email already registered".to_string()));
    }

    let password_hash = hash(&req.password, DEFAULT_COST).map_err(ApiError::internal)?;
    let archetype = req.archetype.unwrap_or(Archetype::Romantic);
    let now = Utc::now();

    let user = User {
        id: Uuid::new_v4(),
        email,
        name: req.name.trim().to_string(),
        password_hash,
        role: Role::User.as_str().to_string(),
        subscription_status: "none".to_string(),
        stripe_customer_id: None,
        created_at: now,
    };
    let profile = Profile {
        user_id: user.id,
        archetype: archetype.as_str().to_string(),
        companion_name: req
            .companion_name
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|| archetype.default_companion_name().to_string()),
        trust_level: 0,
        relationship_stage: RelationshipStage::Stranger.as_str().to_string(),
        milestones: Vec::new(),
        trust_updated_at: None,
        created_at: now,
    };

    db::create_user_with_profile(&pool, &user, &profile).await?;
    tracing::info!(user_id = %user.id, archetype = %archetype, "User registered");

    let welcome = json!({ "name": user.name, "companion_name": profile.companion_name });
    if let Err(e) = email::enqueue(&pool, user.id, EmailTemplate::Welcome, welcome).await {
        tracing::warn!("Failed to queue welcome email: {}", e);
    }
    if let Err(e) = funnel::record(
        &pool,
        FunnelStage::Signup,
        Some(user.id),
        req.session_id,
        Some(archetype),
        json!({}),
    )
    .await
    {
        tracing::warn!("Failed to record signup event: {}", e);
    }

    let token = issue_token(&config.jwt_secret, user.id, Role::User).map_err(ApiError::internal)?;
    Ok(HttpResponse::Created().json(json!({
        "message": "User created successfully",
        "user_id": user.id,
        "token": token,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, get, test as actix_test};

    #[get("/whoami")]
    async fn whoami(user: AuthUser) -> HttpResponse {
        HttpResponse::Ok().json(json!({ "id": user.id, "role": user.role }))
    }

    #[get("/admin-only")]
    async fn admin_only(_admin: AdminUser) -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    fn registration(password: &str) -> RegisterRequest {
        RegisterRequest {
            email: "sam@example.com".to_string(),
            name: "Sam".to_string(),
            password: password.to_string(),
            archetype: None,
            companion_name: None,
            session_id: None,
        }
    }

    #[test]
    fn token_round_trip_keeps_identity_and_role() {
        let id = Uuid::new_v4();
        let token = issue_token("secret", id, Role::Admin).unwrap();
        let user = verify_token("secret", &token).unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.role, Role::Admin);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = issue_token("secret", Uuid::new_v4(), Role::User).unwrap();
        assert!(matches!(verify_token("other", &token), Err(ApiError::Unauthorized)));
    }

    #[test]
    fn registration_rules() {
        assert!(validate_registration(&registration("longenough")).is_ok());
        assert!(validate_registration(&registration("short")).is_err());

        let mut bad_email = registration("longenough");
        bad_email.email = "nope".to_string();
        assert!(validate_registration(&bad_email).is_err());

        let mut blank_companion = registration("longenough");
        blank_companion.companion_name = Some("  ".to_string());
        assert!(validate_registration(&blank_companion).is_err());
    }

    #[actix_web::test]
    async fn extractor_requires_bearer_token() {
        let config = Config::for_tests();
        let token = issue_token(&config.jwt_secret, Uuid::new_v4(), Role::User).unwrap();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(config))
                .service(whoami)
                .service(admin_only),
        )
        .await;

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/whoami").to_request()).await;
        assert_eq!(resp.status(), 401);

        let req = actix_test::TestRequest::get()
            .uri("/whoami")
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);

        let req = actix_test::TestRequest::get()
            .uri("/admin-only")
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), 403);
    }
}
