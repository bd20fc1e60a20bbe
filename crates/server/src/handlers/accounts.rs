use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::models::{AuthenticateOpts, CreateAccountOpts};
use crate::registry::UserStore;
use crate::AppState;
use axum::{extract::State, Json};

fn user_store(state: &AppState) -> ApiResult<UserStore> {
    let pool = state.db.as_ref().ok_or_else(ApiError::service_unavailable)?;
    Ok(UserStore::new(pool.clone(), state.settings.jwt_secret.clone()))
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(opt): Json<CreateAccountOpts>,
) -> ApiResult<Json<ApiResponse>> {
    let store = user_store(&state)?;
    let user = store
        .create_user(&opt)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let data = serde_json::to_value(&user).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(ApiResponse::ok("account created", Some(data))))
}

pub async fn authenticate(
    State(state): State<AppState>,
    Json(opt): Json<AuthenticateOpts>,
) -> ApiResult<Json<ApiResponse>> {
    let store = user_store(&state)?;
    let user = store
        .authenticate(&opt)
        .await
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;
    let data = serde_json::to_value(&user).map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(ApiResponse::ok("authentication successful", Some(data))))
}
