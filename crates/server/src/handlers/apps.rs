use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::models::{CreateAppOpts, ProvisionDatabaseRequest, User};
use crate::registry::AppRegistry;
use crate::AppState;
use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;

fn app_registry(state: &AppState) -> ApiResult<AppRegistry> {
    let pool = state.db.as_ref().ok_or_else(ApiError::service_unavailable)?;
    let git = state.git.as_ref().ok_or_else(ApiError::service_unavailable)?;
    let cluster = state.cluster.as_ref().ok_or_else(ApiError::service_unavailable)?;
    Ok(AppRegistry::new(
        pool.clone(),
        git.clone(),
        cluster.clone(),
        state.settings.repo_base_url.clone(),
    ))
}

pub async fn create_app(
    State(state): State<AppState>,
    Extension(user): Extension<User>,
    Json(opt): Json<CreateAppOpts>,
) -> ApiResult<Json<ApiResponse>> {
    let registry = app_registry(&state)?;
    let app = registry
        .create_app(&user, &opt.name)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let data = serde_json::to_value(&app).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(ApiResponse::ok("app created", Some(data))))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub name: String,
}

pub async fn app_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<ApiResponse>> {
    let registry = app_registry(&state)?;
    let logs = registry
        .logs(&query.name)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(ApiResponse::ok("logs", Some(serde_json::Value::String(logs)))))
}

pub async fn provision_db(
    State(state): State<AppState>,
    Json(req): Json<ProvisionDatabaseRequest>,
) -> ApiResult<Json<ApiResponse>> {
    let registry = app_registry(&state)?;
    let credential = registry
        .provision_database(&req.name, &req.database_type)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let data = serde_json::to_value(&credential).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(ApiResponse::ok("database provisioned", Some(data))))
}
