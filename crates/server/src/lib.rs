pub mod auth;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod git;
pub mod handlers;
pub mod k8s;
pub mod models;
pub mod recipe;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod util;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use config::Settings;
use docker::ImageBuilder;
use git::GitService;
use k8s::DeployController;
use relay::SessionRelay;
use sqlx::{Pool, Postgres};
use std::sync::Arc;

/// Shared handler state. Collaborators are optional so the router can be
/// exercised without a database, container engine, or cluster; handlers
/// answer 503 for whatever is missing.
#[derive(Clone)]
pub struct AppState {
    pub db: Option<Pool<Postgres>>,
    pub relay: Arc<SessionRelay>,
    pub builder: Option<Arc<ImageBuilder>>,
    pub cluster: Option<Arc<DeployController>>,
    pub git: Option<Arc<GitService>>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn disconnected(settings: Settings) -> Self {
        Self {
            db: None,
            relay: Arc::new(SessionRelay::new()),
            builder: None,
            cluster: None,
            git: None,
            settings: Arc::new(settings),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let account_routes = Router::new()
        .route("/new", post(handlers::accounts::create_account))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_master))
        .route("/authenticate", post(handlers::accounts::authenticate));
    let app_routes = Router::new()
        .route("/new", post(handlers::apps::create_app))
        .route("/logs", get(handlers::apps::app_logs))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_user));
    let db_routes = Router::new()
        .route("/new", post(handlers::apps::provision_db))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_user));
    Router::new()
        .nest("/api/account", account_routes)
        .nest("/api/app", app_routes)
        .nest("/api/db", db_routes)
        .route("/api/build", post(handlers::build::build_app))
        .route("/metrics", get(telemetry::metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    fn app() -> Router {
        build_router(AppState::disconnected(Settings::default()))
    }

    #[tokio::test]
    async fn metrics_endpoint_responds() {
        let res = app()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn app_routes_require_token() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/app/new")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn account_creation_requires_master_key() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/account/new")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"j","email":"j@example.com","password":"pw"}"#))
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authenticate_without_database_is_unavailable() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/account/authenticate")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"email":"j@example.com","password":"pw"}"#))
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn build_reports_failure_in_ok_envelope() {
        // The push has already happened by the time the pipeline runs, so
        // even a dead backend answers 200 with an error envelope.
        let body = r#"{
            "repo_name": "ghost.git",
            "repo_path": "/mnt/repos/jane/ghost.git",
            "old_rev": "0000",
            "new_rev": "abcd",
            "ref": "refs/heads/master",
            "ref_type": "heads",
            "ref_name": "master",
            "key": "key1"
        }"#;
        let req = Request::builder()
            .method("POST")
            .uri("/api/build")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), 64 * 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"], true);
    }

    #[tokio::test]
    async fn build_rejects_malformed_body() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/build")
            .header("content-type", "application/json")
            .body(Body::from("{invalid"))
            .unwrap();
        let res = app().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
