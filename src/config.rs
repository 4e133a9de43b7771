use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use std::fs;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| parse_env("BIND_PORT").unwrap_or(3000));

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> =
    Lazy::new(|| read_flag("ALLOW_MIGRATION_FAILURE").unwrap_or(false));

/// Lifetime of access tokens in minutes.
pub static ACCESS_TOKEN_TTL_MINUTES: Lazy<i64> = Lazy::new(|| {
    parse_env::<i64>("ACCESS_TOKEN_TTL_MINUTES")
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

/// Lifetime of refresh tokens in days.
pub static REFRESH_TOKEN_TTL_DAYS: Lazy<i64> = Lazy::new(|| {
    parse_env::<i64>("REFRESH_TOKEN_TTL_DAYS")
        .filter(|value| *value > 0)
        .unwrap_or(7)
});

pub static AUTH_COOKIE: Lazy<String> =
    Lazy::new(|| read_optional_env("AUTH_COOKIE").unwrap_or_else(|| "access_token".to_string()));

pub static REFRESH_COOKIE: Lazy<String> = Lazy::new(|| {
    read_optional_env("REFRESH_COOKIE").unwrap_or_else(|| "refresh_token".to_string())
});

pub static AUTH_COOKIE_SECURE: Lazy<bool> =
    Lazy::new(|| read_flag("AUTH_COOKIE_SECURE").unwrap_or(true));

pub static AUTH_COOKIE_SAMESITE: Lazy<String> =
    Lazy::new(|| read_optional_env("AUTH_COOKIE_SAMESITE").unwrap_or_else(|| "Lax".to_string()));

pub static AUTH_COOKIE_MAX_AGE: Lazy<i64> = Lazy::new(|| {
    parse_env::<i64>("AUTH_COOKIE_MAX_AGE")
        .filter(|value| *value > 0)
        .unwrap_or(86_400)
});

/// OAuth client id that Google ID tokens must be issued for. Google sign-in is disabled
/// when unset.
pub static GOOGLE_OAUTH2_CLIENT_ID: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("GOOGLE_OAUTH2_CLIENT_ID"));

pub static GOOGLE_TOKENINFO_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("GOOGLE_TOKENINFO_URL")
        .unwrap_or_else(|| "https://www.googleapis.com/oauth2/v3/tokeninfo".to_string())
});

/// key: billing-config -> provider credentials
///
/// Passed explicitly to the provider client and the webhook verifier.
#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub webhook_tolerance_secs: i64,
    pub request_timeout_secs: u64,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            api_base: "https://api.stripe.com".to_string(),
            webhook_tolerance_secs: 300,
            request_timeout_secs: 30,
        }
    }

    pub fn from_env() -> Result<Self> {
        let secret_key = read_secret_env("STRIPE_SECRET_KEY", "STRIPE_SECRET_KEY_FILE")?
            .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY must be set"))?;
        let webhook_secret = read_secret_env("STRIPE_WEBHOOK_SECRET", "STRIPE_WEBHOOK_SECRET_FILE")?
            .ok_or_else(|| anyhow!("STRIPE_WEBHOOK_SECRET must be set"))?;

        let mut config = Self::new(secret_key, webhook_secret);
        if let Some(api_base) = read_optional_env("STRIPE_API_BASE") {
            config.api_base = api_base;
        }
        if let Some(tolerance) =
            parse_env::<i64>("STRIPE_WEBHOOK_TOLERANCE_SECS").filter(|value| *value > 0)
        {
            config.webhook_tolerance_secs = tolerance;
        }
        if let Some(timeout) =
            parse_env::<u64>("STRIPE_REQUEST_TIMEOUT_SECS").filter(|value| *value > 0)
        {
            config.request_timeout_secs = timeout;
        }
        Ok(config)
    }
}

pub fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    read_optional_env(key).and_then(|value| value.parse::<T>().ok())
}

fn read_flag(key: &str) -> Option<bool> {
    read_optional_env(key).map(|value| {
        let normalized = value.to_ascii_lowercase();
        matches!(normalized.as_str(), "1" | "true" | "yes")
    })
}

fn read_secret_env(value_key: &str, file_key: &str) -> Result<Option<String>> {
    if let Some(path) = read_optional_env(file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {file_key} from {path}"))?;
        let trimmed = contents.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed));
        }
    }

    Ok(read_optional_env(value_key))
}
