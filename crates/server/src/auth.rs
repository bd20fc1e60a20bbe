use crate::{error::ApiError, models::User, AppState};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token lifetime: 30 days.
const TOKEN_EXPIRY_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

pub fn generate_token(user: &User, secret: &str) -> Option<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user.id,
        email: user.email.clone(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(TOKEN_EXPIRY_SECS)).timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).ok()
}

pub fn verify_token(token: &str, secret: &str) -> Option<Claims> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    decode::<Claims>(token, &key, &Validation::default()).ok().map(|d| d.claims)
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

fn extract_bearer(req: &Request) -> Option<String> {
    let header = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() == 2 && parts[0].eq_ignore_ascii_case("Bearer") {
        Some(parts[1].trim().to_string())
    } else {
        None
    }
}

/// Bearer-token guard: verifies the JWT and loads the user record into the
/// request extensions.
pub async fn require_user(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(token) = extract_bearer(&req) else {
        return Err(ApiError::unauthorized("authentication token is missing").into_response());
    };
    let Some(claims) = verify_token(&token, &state.settings.jwt_secret) else {
        return Err(ApiError::unauthorized("invalid token supplied").into_response());
    };
    let Some(pool) = state.db.as_ref() else {
        return Err(ApiError::service_unavailable().into_response());
    };
    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, name, password_hash, created_at FROM users WHERE email = $1",
    )
    .bind(&claims.email)
    .fetch_optional(pool)
    .await
    .map_err(|e| ApiError::internal(format!("user lookup error: {e}")).into_response())?;
    let Some(user) = user else {
        return Err(ApiError::unauthorized("token user not found").into_response());
    };
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Admin guard: `X-Master-Authorization` must equal the configured master key.
pub async fn require_master(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, Response> {
    let supplied = req
        .headers()
        .get("X-Master-Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.settings.master_key.is_empty() || supplied != state.settings.master_key {
        return Err(ApiError::unauthorized("master authorization required").into_response());
    }
    Ok(next.run(req).await)
}
