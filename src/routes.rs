use axum::{
    routing::{get, post},
    Router,
};

use crate::{auth, billing, social};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/auth/register", post(auth::register_user))
        .route("/api/auth/login", post(auth::login_user))
        .route("/api/auth/refresh", post(auth::refresh_token))
        .route("/api/auth/logout", post(auth::logout_user))
        .route("/api/auth/me", get(auth::current_user))
        .route("/api/auth/google", post(social::social_login))
        .merge(billing_routes())
}

/// Billing endpoints only; needs the engine and webhook verifier extensions.
pub fn billing_routes() -> Router {
    Router::new()
        .route("/api/payments/plans", get(billing::billing_list_plans))
        .route(
            "/api/payments/subscription",
            get(billing::billing_get_subscription),
        )
        .route(
            "/api/payments/checkout",
            post(billing::billing_create_checkout_session),
        )
        .route(
            "/api/payments/cancel",
            post(billing::billing_cancel_subscription),
        )
        .route(
            "/api/payments/portal",
            post(billing::billing_create_customer_portal),
        )
        .route(
            "/api/payments/webhooks/stripe",
            post(billing::billing_stripe_webhook),
        )
}
