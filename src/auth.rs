use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::{cookie_value, decode_claims, AuthUser, Claims, TokenKind};
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{error, info};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub re_password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct UserSchema {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Serialize, Deserialize)]
pub struct TokenResponse {
    pub access: String,
    pub refresh: String,
    pub user: UserSchema,
}

#[derive(Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct UserRow {
    pub id: i32,
    pub email: String,
    pub password_hash: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
}

impl UserRow {
    fn schema(&self) -> UserSchema {
        UserSchema {
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// key: auth-tokens -> signed access and refresh tokens
pub fn issue_token(user_id: i32, kind: TokenKind) -> AppResult<String> {
    let now = Utc::now();
    let ttl = match kind {
        TokenKind::Access => Duration::minutes(*config::ACCESS_TOKEN_TTL_MINUTES),
        TokenKind::Refresh => Duration::days(*config::REFRESH_TOKEN_TTL_DAYS),
    };
    let claims = Claims {
        sub: user_id,
        token_type: kind,
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp() as usize,
    };
    let secret = config::JWT_SECRET.as_str();
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        error!(?e, "Token encoding error");
        AppError::Message("Token error".into())
    })
}

fn cookie(name: &str, value: &str, max_age: i64) -> AppResult<HeaderValue> {
    let mut cookie = format!(
        "{name}={value}; HttpOnly; Path=/; SameSite={}; Max-Age={max_age}",
        config::AUTH_COOKIE_SAMESITE.as_str()
    );
    if *config::AUTH_COOKIE_SECURE {
        cookie.push_str("; Secure");
    }
    cookie
        .parse()
        .map_err(|_| AppError::Message("invalid cookie value".into()))
}

fn refresh_cookie_max_age() -> i64 {
    *config::REFRESH_TOKEN_TTL_DAYS * 24 * 60 * 60
}

/// Issues both tokens for `user` and sets them as cookies.
pub(crate) fn session_response(
    user_id: i32,
    user: UserSchema,
) -> AppResult<(HeaderMap, Json<TokenResponse>)> {
    let access = issue_token(user_id, TokenKind::Access)?;
    let refresh = issue_token(user_id, TokenKind::Refresh)?;
    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        cookie(
            config::AUTH_COOKIE.as_str(),
            &access,
            *config::AUTH_COOKIE_MAX_AGE,
        )?,
    );
    headers.append(
        SET_COOKIE,
        cookie(
            config::REFRESH_COOKIE.as_str(),
            &refresh,
            refresh_cookie_max_age(),
        )?,
    );
    Ok((
        headers,
        Json(TokenResponse {
            access,
            refresh,
            user,
        }),
    ))
}

pub async fn register_user(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<UserSchema>)> {
    let email = normalize_email(&payload.email);
    if !email.contains('@') {
        return Err(AppError::BadRequest("Enter a valid email address".into()));
    }
    if payload.password != payload.re_password {
        return Err(AppError::BadRequest("Passwords do not match".into()));
    }
    if payload.password.len() < 8 {
        return Err(AppError::BadRequest("Password too short".into()));
    }
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(payload.password.as_bytes(), &salt)
        .map_err(|e| AppError::Message(format!("Hashing failed: {}", e)))?;
    let result = sqlx::query(
        "INSERT INTO users (email, password_hash, first_name, last_name) VALUES ($1, $2, $3, $4)",
    )
    .bind(&email)
    .bind(hash.to_string())
    .bind(payload.first_name.trim())
    .bind(payload.last_name.trim())
    .execute(&pool)
    .await;
    match result {
        Ok(_) => {
            info!(email = %email, "user registered");
            Ok((
                StatusCode::CREATED,
                Json(UserSchema {
                    email,
                    first_name: payload.first_name.trim().to_string(),
                    last_name: payload.last_name.trim().to_string(),
                }),
            ))
        }
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("users_email_key") {
                    return Err(AppError::Conflict("Email already registered".into()));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

pub async fn login_user(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<(HeaderMap, Json<TokenResponse>)> {
    let rec = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, password_hash, first_name, last_name, is_active FROM users WHERE email = $1",
    )
    .bind(normalize_email(&payload.email))
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error while fetching user");
        AppError::Db(e)
    })?;
    let user = rec
        .filter(|user| user.is_active)
        .ok_or(AppError::Unauthorized)?;
    // Social-only accounts have no password to check against.
    let pass_hash = user.password_hash.as_deref().ok_or(AppError::Unauthorized)?;
    let parsed = PasswordHash::new(pass_hash).map_err(|e| {
        error!(?e, "Hash parse error");
        AppError::Message(format!("Hash error: {}", e))
    })?;
    if Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(AppError::Unauthorized);
    }
    info!(user_id = user.id, "user logged in");
    session_response(user.id, user.schema())
}

pub async fn refresh_token(headers: HeaderMap) -> AppResult<(HeaderMap, Json<RefreshResponse>)> {
    let token = cookie_value(&headers, config::REFRESH_COOKIE.as_str())
        .ok_or(AppError::Unauthorized)?;
    let claims = decode_claims(&token, TokenKind::Refresh).ok_or(AppError::Unauthorized)?;
    let access = issue_token(claims.sub, TokenKind::Access)?;
    let mut out = HeaderMap::new();
    out.append(
        SET_COOKIE,
        cookie(
            config::AUTH_COOKIE.as_str(),
            &access,
            *config::AUTH_COOKIE_MAX_AGE,
        )?,
    );
    Ok((out, Json(RefreshResponse { access })))
}

pub async fn logout_user(_user: AuthUser) -> AppResult<(StatusCode, HeaderMap)> {
    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, cookie(config::AUTH_COOKIE.as_str(), "", 0)?);
    headers.append(SET_COOKIE, cookie(config::REFRESH_COOKIE.as_str(), "", 0)?);
    Ok((StatusCode::NO_CONTENT, headers))
}

pub async fn current_user(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<UserSchema>> {
    let rec = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, password_hash, first_name, last_name, is_active FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        error!(?e, "DB error while fetching user");
        AppError::Db(e)
    })?;
    let Some(user) = rec else {
        return Err(AppError::NotFound);
    };
    Ok(Json(user.schema()))
}
