use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

use super::models::{SubscriptionStatus, SubscriptionUpdate};
use crate::config::StripeConfig;

type HmacSha256 = Hmac<Sha256>;

pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("signature header is not in t=...,v1=... form")]
    InvalidSignatureHeader,
    #[error("no signature matches the payload")]
    SignatureMismatch,
    #[error("signature timestamp outside tolerance")]
    TimestampOutOfTolerance,
    #[error("malformed event payload: {0}")]
    Malformed(String),
}

/// key: billing-webhook-verifier -> signed payload check
///
/// Header format: `t=<unix seconds>,v1=<hex hmac-sha256 of "<t>.<body>">`, where
/// several `v1` entries may be present during secret rotation.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            secret: config.webhook_secret.clone(),
            tolerance_secs: config.webhook_tolerance_secs,
        }
    }

    fn mac(&self, timestamp: &str, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can use any key length");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }

    /// Produces a header value the verifier accepts, for local tooling and tests.
    pub fn signature_header(&self, payload: &[u8], timestamp: i64) -> String {
        let timestamp = timestamp.to_string();
        let signature = hex::encode(self.mac(&timestamp, payload).finalize().into_bytes());
        format!("t={timestamp},v1={signature}")
    }

    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            let mut kv = part.trim().splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("t"), Some(value)) => timestamp = Some(value),
                (Some("v1"), Some(value)) => signatures.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(WebhookError::InvalidSignatureHeader)?;
        let seconds: i64 = timestamp
            .parse()
            .map_err(|_| WebhookError::InvalidSignatureHeader)?;
        if signatures.is_empty() {
            return Err(WebhookError::InvalidSignatureHeader);
        }

        let expected = self.mac(timestamp, payload);
        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| expected.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if !matched {
            return Err(WebhookError::SignatureMismatch);
        }

        if (now.timestamp() - seconds).abs() > self.tolerance_secs {
            return Err(WebhookError::TimestampOutOfTolerance);
        }
        Ok(())
    }

    /// Verifies the signature, then parses the payload. Nothing is parsed from an
    /// unverified body.
    pub fn construct_event(
        &self,
        payload: &[u8],
        header: Option<&str>,
    ) -> Result<WebhookEvent, WebhookError> {
        let header = header.ok_or(WebhookError::MissingSignature)?;
        self.verify(payload, header, Utc::now())?;
        WebhookEvent::parse(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: DateTime<Utc>,
    pub payload: ProviderEvent,
}

/// key: billing-events -> typed provider events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    CheckoutSessionCompleted(CheckoutObject),
    InvoicePaymentSucceeded(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    Unhandled,
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    /// `(user_id, plan_id)` tagged onto the subscription at checkout.
    pub fn tagged_ids(&self) -> Result<(i32, i32), String> {
        Ok((self.metadata_id("user_id")?, self.metadata_id("plan_id")?))
    }

    fn metadata_id(&self, key: &str) -> Result<i32, String> {
        let raw = self
            .metadata
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| format!("subscription {} missing {key} metadata", self.id))?;
        raw.parse()
            .map_err(|_| format!("subscription {} has non-numeric {key} metadata", self.id))
    }

    pub fn update(&self) -> Result<SubscriptionUpdate, String> {
        Ok(SubscriptionUpdate {
            status: self.status,
            current_period_start: epoch(self.current_period_start)?,
            current_period_end: epoch(self.current_period_end)?,
            cancel_at_period_end: self.cancel_at_period_end,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

pub fn epoch(seconds: i64) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| format!("timestamp {seconds} out of range"))
}

fn object<T: DeserializeOwned>(event_type: &str, value: Value) -> Result<T, WebhookError> {
    serde_json::from_value(value)
        .map_err(|err| WebhookError::Malformed(format!("{event_type}: {err}")))
}

/// A status string the ledger has no variant for, e.g. `paused`.
fn unknown_status(object: &Value) -> Option<&str> {
    object
        .get("status")
        .and_then(Value::as_str)
        .filter(|status| status.parse::<SubscriptionStatus>().is_err())
}

impl WebhookEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, WebhookError> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|err| WebhookError::Malformed(err.to_string()))?;
        let created = epoch(envelope.created).map_err(WebhookError::Malformed)?;
        let event_type = envelope.event_type;
        let object_value = envelope.data.object;

        let payload = match event_type.as_str() {
            SUBSCRIPTION_CREATED | SUBSCRIPTION_UPDATED | SUBSCRIPTION_DELETED
                if unknown_status(&object_value).is_some() =>
            {
                warn!(
                    event = %envelope.id,
                    event_type = %event_type,
                    status = unknown_status(&object_value).unwrap_or_default(),
                    "subscription event with unrecognised status ignored"
                );
                ProviderEvent::Unhandled
            }
            SUBSCRIPTION_CREATED => {
                ProviderEvent::SubscriptionCreated(object(&event_type, object_value)?)
            }
            SUBSCRIPTION_UPDATED => {
                ProviderEvent::SubscriptionUpdated(object(&event_type, object_value)?)
            }
            SUBSCRIPTION_DELETED => {
                ProviderEvent::SubscriptionDeleted(object(&event_type, object_value)?)
            }
            CHECKOUT_SESSION_COMPLETED => {
                ProviderEvent::CheckoutSessionCompleted(object(&event_type, object_value)?)
            }
            INVOICE_PAYMENT_SUCCEEDED => {
                ProviderEvent::InvoicePaymentSucceeded(object(&event_type, object_value)?)
            }
            INVOICE_PAYMENT_FAILED => {
                ProviderEvent::InvoicePaymentFailed(object(&event_type, object_value)?)
            }
            _ => ProviderEvent::Unhandled,
        };

        Ok(WebhookEvent {
            id: envelope.id,
            event_type,
            created,
            payload,
        })
    }
}
