use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::engine::{CancelOutcome, ReconciliationEngine};
use super::events::WebhookVerifier;
use super::models::{Plan, Subscription};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PlanView {
    pub id: i32,
    pub name: String,
    pub price: String,
    pub currency: String,
    pub description: String,
    pub features: Vec<String>,
    pub is_active: bool,
}

impl From<&Plan> for PlanView {
    fn from(plan: &Plan) -> Self {
        PlanView {
            id: plan.id,
            name: plan.name.clone(),
            price: plan.price(),
            currency: plan.currency.clone(),
            description: plan.description.clone(),
            features: plan.features.clone(),
            is_active: plan.is_active,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub plan: PlanView,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionView {
    fn new(subscription: &Subscription, plan: &Plan) -> Self {
        SubscriptionView {
            id: subscription.id,
            stripe_subscription_id: subscription.stripe_subscription_id.clone(),
            plan: PlanView::from(plan),
            status: subscription.status.to_string(),
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct UserSubscriptionResponse {
    pub has_active_subscription: bool,
    pub subscription: Option<SubscriptionView>,
    pub plan_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutSessionRequest {
    pub plan_id: i32,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckoutSessionResponse {
    pub session_id: String,
    pub session_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelSubscriptionRequest {
    pub subscription_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CustomerPortalRequest {
    pub return_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CustomerPortalResponse {
    pub session_url: String,
}

fn require_absolute_url(field: &str, value: &str) -> AppResult<()> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(AppError::BadRequest(format!("{field} must be an absolute http(s) URL"))),
    }
}

/// key: billing-api -> rest endpoints
pub async fn list_plans(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
) -> AppResult<Json<Vec<PlanView>>> {
    let plans = engine.list_active_plans().await?;
    Ok(Json(plans.iter().map(PlanView::from).collect()))
}

pub async fn get_subscription(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    AuthUser { user_id }: AuthUser,
) -> AppResult<Json<UserSubscriptionResponse>> {
    let response = match engine.current_subscription(user_id).await? {
        Some((subscription, plan)) => UserSubscriptionResponse {
            has_active_subscription: true,
            plan_name: Some(plan.name.clone()),
            subscription: Some(SubscriptionView::new(&subscription, &plan)),
        },
        None => UserSubscriptionResponse {
            has_active_subscription: false,
            subscription: None,
            plan_name: None,
        },
    };
    Ok(Json(response))
}

pub async fn create_checkout_session(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<CreateCheckoutSessionRequest>,
) -> AppResult<Json<CheckoutSessionResponse>> {
    require_absolute_url("success_url", &payload.success_url)?;
    require_absolute_url("cancel_url", &payload.cancel_url)?;
    let session = engine
        .create_checkout_session(
            user_id,
            payload.plan_id,
            &payload.success_url,
            &payload.cancel_url,
        )
        .await?;
    Ok(Json(CheckoutSessionResponse {
        session_id: session.session_id,
        session_url: session.session_url,
    }))
}

pub async fn cancel_subscription(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<CancelSubscriptionRequest>,
) -> AppResult<Json<CancelOutcome>> {
    let outcome = engine
        .cancel_subscription(user_id, &payload.subscription_id)
        .await;
    if outcome.success {
        Ok(Json(outcome))
    } else {
        Err(AppError::BadRequest(outcome.message))
    }
}

pub async fn create_customer_portal(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<CustomerPortalRequest>,
) -> AppResult<Json<CustomerPortalResponse>> {
    require_absolute_url("return_url", &payload.return_url)?;
    let session_url = engine
        .create_customer_portal_session(user_id, &payload.return_url)
        .await?;
    Ok(Json(CustomerPortalResponse { session_url }))
}

/// key: webhooks-billing -> signed provider events
///
/// 400 for a bad signature or payload, 500 when applying the event fails (the
/// provider retries), 200 otherwise, including event types we do not act on.
pub async fn stripe_webhook(
    Extension(engine): Extension<Arc<ReconciliationEngine>>,
    Extension(verifier): Extension<WebhookVerifier>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok());
    let event = match verifier.construct_event(&body, signature) {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "rejected billing webhook");
            return StatusCode::BAD_REQUEST;
        }
    };

    match engine.apply_event(&event).await {
        Ok(outcome) => {
            info!(event = %event.id, event_type = %event.event_type, ?outcome, "billing webhook handled");
            StatusCode::OK
        }
        Err(err) => {
            error!(?err, event = %event.id, event_type = %event.event_type, "error handling billing webhook");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
