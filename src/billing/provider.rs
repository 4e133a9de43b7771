use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::StripeConfig;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("billing provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("billing provider rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("unexpected billing provider response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer {
    pub user_id: i32,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub user_id: i32,
    pub plan_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub session_url: String,
}

/// key: billing-provider -> external billing API
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Creates a provider customer. `idempotency_key` lets the provider collapse retries.
    async fn create_customer(
        &self,
        customer: &NewCustomer,
        idempotency_key: &str,
    ) -> Result<String, ProviderError>;
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError>;
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, ProviderError>;
    async fn cancel_at_period_end(&self, subscription_id: &str) -> Result<(), ProviderError>;
}

/// key: billing-provider-stripe -> form-encoded REST client
#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    api_base: String,
    secret_key: String,
}

#[derive(Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
}

#[derive(Deserialize)]
struct StripePortalSession {
    url: String,
}

#[derive(Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl StripeClient {
    pub fn new(config: &StripeConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, ProviderError> {
        let response = request.send().await.map_err(|err| {
            error!(?err, operation, "billing provider request failed");
            ProviderError::Transport(err)
        })?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = provider_message(status, &body);
            error!(operation, status = status.as_u16(), %message, "billing provider returned error");
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        debug!(operation, status = status.as_u16(), "billing provider call succeeded");
        serde_json::from_str(&body).map_err(|err| ProviderError::Decode(err.to_string()))
    }
}

fn provider_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<StripeErrorEnvelope>(body) {
        Ok(envelope) => envelope
            .error
            .message
            .or(envelope.error.kind)
            .unwrap_or_else(|| status.to_string()),
        Err(_) => status.to_string(),
    }
}

fn checkout_form(request: &CheckoutRequest) -> Vec<(&'static str, String)> {
    let user_id = request.user_id.to_string();
    let plan_id = request.plan_id.to_string();
    vec![
        ("customer", request.customer_id.clone()),
        ("mode", "subscription".to_string()),
        ("payment_method_types[0]", "card".to_string()),
        ("line_items[0][price]", request.price_id.clone()),
        ("line_items[0][quantity]", "1".to_string()),
        ("success_url", request.success_url.clone()),
        ("cancel_url", request.cancel_url.clone()),
        ("metadata[user_id]", user_id.clone()),
        ("metadata[plan_id]", plan_id.clone()),
        // Session metadata is not copied onto the subscription; the created event needs it there.
        ("subscription_data[metadata][user_id]", user_id),
        ("subscription_data[metadata][plan_id]", plan_id),
    ]
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn create_customer(
        &self,
        customer: &NewCustomer,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let form = [
            ("email", customer.email.clone()),
            ("name", customer.name.clone()),
            ("metadata[user_id]", customer.user_id.to_string()),
        ];
        let request = self
            .post("/v1/customers")
            .header("Idempotency-Key", idempotency_key)
            .form(&form);
        let created: IdObject = self.send("create_customer", request).await?;
        Ok(created.id)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let builder = self
            .post("/v1/checkout/sessions")
            .form(&checkout_form(request));
        let session: StripeCheckoutSession = self.send("create_checkout_session", builder).await?;
        let session_url = session
            .url
            .ok_or_else(|| ProviderError::Decode("checkout session has no url".into()))?;
        Ok(CheckoutSession {
            session_id: session.id,
            session_url,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, ProviderError> {
        let form = [("customer", customer_id), ("return_url", return_url)];
        let request = self.post("/v1/billing_portal/sessions").form(&form);
        let session: StripePortalSession = self.send("create_portal_session", request).await?;
        Ok(session.url)
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> Result<(), ProviderError> {
        let form = [("cancel_at_period_end", "true")];
        let request = self
            .post(&format!("/v1/subscriptions/{subscription_id}"))
            .form(&form);
        let _: IdObject = self.send("cancel_at_period_end", request).await?;
        Ok(())
    }
}
