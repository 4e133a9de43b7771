use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i32,
    pub token_type: TokenKind,
    pub iat: usize,
    pub exp: usize,
}

/// Validates signature and expiry, then checks the token is of the expected kind.
pub fn decode_claims(token: &str, expected: TokenKind) -> Option<Claims> {
    let secret = crate::config::JWT_SECRET.as_str();
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    (decoded.claims.token_type == expected).then_some(decoded.claims)
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|c| {
        let (key, value) = c.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

pub struct AuthUser {
    pub user_id: i32,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token_opt = cookie_value(&parts.headers, crate::config::AUTH_COOKIE.as_str()).or_else(
            || {
                parts
                    .headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|authz| authz.to_str().ok())
                    .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
            },
        );
        let token = token_opt.ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let claims = decode_claims(&token, TokenKind::Access)
            .ok_or((StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        Ok(AuthUser {
            user_id: claims.sub,
        })
    }
}
