// src/main.rs
use actix_web::{App, HttpResponse, HttpServer, get, middleware::Logger, web};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod admin;
mod analysis;
mod auth;
mod billing;
mod chat;
mod config;
mod db;
mod email;
mod error;
mod experiments;
mod funnel;
mod jobs;
mod llm;
mod metrics;
mod models;
mod plans;
mod profile;
mod relationship;
mod trust;

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Body, query and path parse failures render through `ApiError` like every other failure.
fn extractor_errors(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| error::ApiError::validation(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _req| error::ApiError::validation(err.to_string()).into()),
    )
    .app_data(
        web::PathConfig::default()
            .error_handler(|err, _req| error::ApiError::validation(err.to_string()).into()),
    );
}

fn api_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health);
    auth::init_routes(cfg);
    profile::init_routes(cfg);
    chat::init_routes(cfg);
    funnel::init_routes(cfg);
    experiments::init_routes(cfg);
    billing::init_routes(cfg);
    admin::init_routes(cfg);
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    tracing::info!("Starting SoulBond backend");

    dotenv::dotenv().ok();
    let config = config::Config::from_env().expect("Failed to load config from environment");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    let experiment_cache = experiments::new_cache();
    let report_cache = admin::new_report_cache();
    let llm_client = llm::LlmClient::from_config(&config).expect("Failed to build LLM client");
    let mailer = email::Mailer::from_config(&config);

    tokio::spawn(email::run_worker(pool.clone(), mailer));
    tokio::spawn(jobs::run_trust_recalculation(
        pool.clone(),
        config.trust_recalc_interval_secs,
    ));

    let bind = (config.bind_addr.clone(), config.port);
    tracing::info!(addr = %bind.0, port = bind.1, "Listening");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::new(experiment_cache.clone()))
            .app_data(web::Data::new(report_cache.clone()))
            .app_data(web::Data::new(llm_client.clone()))
            .app_data(web::Data::new(config.clone()))
            .wrap(Logger::default())
            .configure(extractor_errors)
            .service(web::scope("/api").configure(api_routes))
    })
    .bind(bind)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::header::ContentType, post, test as actix_test};
    use uuid::Uuid;

    #[derive(serde::Deserialize)]
    struct Window {
        #[allow(dead_code)]
        from: chrono::DateTime<chrono::Utc>,
    }

    #[post("/things/{id}")]
    async fn create_thing(
        _id: web::Path<Uuid>,
        _body: web::Json<models::FunnelEventRequest>,
    ) -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[get("/window")]
    async fn window(_q: web::Query<Window>) -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    async fn error_body(req: actix_test::TestRequest) -> (u16, serde_json::Value) {
        let app = actix_test::init_service(
            App::new()
                .configure(extractor_errors)
                .service(create_thing)
                .service(window),
        )
        .await;
        let resp = actix_test::call_service(&app, req.to_request()).await;
        let status = resp.status().as_u16();
        (status, actix_test::read_body_json(resp).await)
    }

    #[actix_web::test]
    async fn health_responds_under_api_scope() {
        let app = actix_test::init_service(App::new().service(web::scope("/api").service(health))).await;
        let req = actix_test::TestRequest::get().uri("/api/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
    }

    #[actix_web::test]
    async fn bad_json_body_renders_error_object() {
        let uri = format!("/things/{}", Uuid::new_v4());
        let req = actix_test::TestRequest::post()
            .uri(&uri)
            .insert_header(ContentType::json())
            .set_payload(r#"{"stage":"signup","archetype":"grumpy"}"#);
        let (status, body) = error_body(req).await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("grumpy"));
    }

    #[actix_web::test]
    async fn bad_path_and_query_render_error_object() {
        let req = actix_test::TestRequest::post()
            .uri("/things/not-a-uuid")
            .insert_header(ContentType::json())
            .set_payload(r#"{"stage":"signup"}"#);
        let (status, body) = error_body(req).await;
        assert_eq!(status, 400);
        assert!(body["error"].is_string());

        let req = actix_test::TestRequest::get().uri("/window?from=yesterday");
        let (status, body) = error_body(req).await;
        assert_eq!(status, 400);
        assert!(body["error"].is_string());
    }
}
