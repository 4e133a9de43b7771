use std::time::Duration;

use axum::{extract::Extension, http::HeaderMap, Json};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::auth::{normalize_email, session_response, TokenResponse, UserRow, UserSchema};
use crate::config;
use crate::error::{AppError, AppResult};

#[derive(Deserialize)]
pub struct SocialLoginRequest {
    pub credential: String,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "google".to_string()
}

/// Claims returned by the tokeninfo endpoint for a valid ID token.
#[derive(Debug, Deserialize)]
pub struct GoogleProfile {
    pub aud: String,
    pub sub: String,
    pub email: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// key: social-google -> id token verification
pub async fn verify_google_token(
    tokeninfo_url: &str,
    client_id: &str,
    credential: &str,
) -> AppResult<GoogleProfile> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AppError::Message(format!("http client error: {e}")))?;
    let response = client
        .get(tokeninfo_url)
        .query(&[("id_token", credential)])
        .send()
        .await
        .map_err(|e| {
            warn!(?e, "google tokeninfo request failed");
            AppError::BadRequest("Invalid Google token".into())
        })?;
    if !response.status().is_success() {
        warn!(status = %response.status(), "google rejected id token");
        return Err(AppError::BadRequest("Invalid Google token".into()));
    }
    let profile: GoogleProfile = response
        .json()
        .await
        .map_err(|_| AppError::BadRequest("Invalid Google token".into()))?;
    if profile.aud != client_id {
        warn!(aud = %profile.aud, "google token issued for another client");
        return Err(AppError::BadRequest("Invalid Google token audience".into()));
    }
    if profile.email.as_deref().map_or(true, str::is_empty) {
        return Err(AppError::BadRequest("Google account has no email".into()));
    }
    Ok(profile)
}

async fn get_or_create_user(pool: &PgPool, profile: &GoogleProfile, email: &str) -> AppResult<UserRow> {
    let inserted = sqlx::query_as::<_, UserRow>(
        "INSERT INTO users (email, first_name, last_name) VALUES ($1, $2, $3) \
         ON CONFLICT (email) DO NOTHING \
         RETURNING id, email, password_hash, first_name, last_name, is_active",
    )
    .bind(email)
    .bind(profile.given_name.as_deref().unwrap_or_default())
    .bind(profile.family_name.as_deref().unwrap_or_default())
    .fetch_optional(pool)
    .await?;
    if let Some(user) = inserted {
        info!(user_id = user.id, "user created from google sign-in");
        return Ok(user);
    }
    Ok(sqlx::query_as::<_, UserRow>(
        "SELECT id, email, password_hash, first_name, last_name, is_active FROM users WHERE email = $1",
    )
    .bind(email)
    .fetch_one(pool)
    .await?)
}

pub async fn social_login(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<SocialLoginRequest>,
) -> AppResult<(HeaderMap, Json<TokenResponse>)> {
    if payload.provider != "google" {
        return Err(AppError::BadRequest(format!(
            "Unsupported provider: {}",
            payload.provider
        )));
    }
    let client_id = config::GOOGLE_OAUTH2_CLIENT_ID
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("Google sign-in is not configured".into()))?;
    let profile = verify_google_token(
        config::GOOGLE_TOKENINFO_URL.as_str(),
        client_id,
        &payload.credential,
    )
    .await?;
    let email = normalize_email(profile.email.as_deref().unwrap_or_default());

    let user = get_or_create_user(&pool, &profile, &email).await?;
    if !user.is_active {
        return Err(AppError::Unauthorized);
    }
    sqlx::query(
        "INSERT INTO social_accounts (user_id, provider, uid, extra_data) VALUES ($1, 'google', $2, $3) \
         ON CONFLICT (provider, uid) DO UPDATE SET extra_data = EXCLUDED.extra_data",
    )
    .bind(user.id)
    .bind(&profile.sub)
    .bind(Value::Object(profile.extra.clone()))
    .execute(&pool)
    .await?;

    info!(user_id = user.id, "google sign-in");
    session_response(
        user.id,
        UserSchema {
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
        },
    )
}
