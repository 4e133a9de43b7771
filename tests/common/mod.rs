#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use billing_backend::billing::{
    BillingProvider, BillingUser, CheckoutRequest, CheckoutSession, MemoryLedgerStore,
    NewCustomer, Plan, ProviderError, ReconciliationEngine,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Fake provider that records every call it receives.
#[derive(Default)]
pub struct RecordingProvider {
    customers_created: AtomicUsize,
    pub idempotency_keys: Mutex<Vec<String>>,
    pub checkouts: Mutex<Vec<CheckoutRequest>>,
    pub portal_sessions: Mutex<Vec<(String, String)>>,
    pub cancellations: Mutex<Vec<String>>,
    pub fail_cancellation: bool,
}

impl RecordingProvider {
    pub fn refusing_cancellation() -> Self {
        Self {
            fail_cancellation: true,
            ..Default::default()
        }
    }

    pub fn customers_created(&self) -> usize {
        self.customers_created.load(Ordering::SeqCst)
    }

    pub async fn call_count(&self) -> usize {
        self.customers_created()
            + self.checkouts.lock().await.len()
            + self.portal_sessions.lock().await.len()
            + self.cancellations.lock().await.len()
    }
}

#[async_trait]
impl BillingProvider for RecordingProvider {
    async fn create_customer(
        &self,
        customer: &NewCustomer,
        idempotency_key: &str,
    ) -> Result<String, ProviderError> {
        let n = self.customers_created.fetch_add(1, Ordering::SeqCst) + 1;
        self.idempotency_keys
            .lock()
            .await
            .push(idempotency_key.to_string());
        // Widen the window in which a racing caller could slip through.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(format!("cus_{}_{n}", customer.user_id))
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let mut checkouts = self.checkouts.lock().await;
        checkouts.push(request.clone());
        Ok(CheckoutSession {
            session_id: format!("cs_test_{}", checkouts.len()),
            session_url: format!("https://checkout.example.com/cs_test_{}", checkouts.len()),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, ProviderError> {
        self.portal_sessions
            .lock()
            .await
            .push((customer_id.to_string(), return_url.to_string()));
        Ok(format!("https://billing.example.com/p/{customer_id}"))
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> Result<(), ProviderError> {
        self.cancellations
            .lock()
            .await
            .push(subscription_id.to_string());
        if self.fail_cancellation {
            return Err(ProviderError::Api {
                status: 404,
                message: format!("No such subscription: '{subscription_id}'"),
            });
        }
        Ok(())
    }
}

pub fn plan(id: i32, name: &str, price_cents: i64) -> Plan {
    let now = Utc::now();
    Plan {
        id,
        name: name.to_string(),
        stripe_price_id: format!("price_{name}"),
        price_cents,
        currency: "USD".to_string(),
        description: format!("{name} plan"),
        features: vec![format!("{name} features")],
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn user(id: i32) -> BillingUser {
    BillingUser {
        id,
        email: format!("user{id}@example.com"),
        first_name: "Test".to_string(),
        last_name: format!("User{id}"),
    }
}

/// Users 1 and 2 plus the free (1), pro (2) and enterprise (3) plans.
pub async fn seeded_store() -> Arc<MemoryLedgerStore> {
    let store = Arc::new(MemoryLedgerStore::new());
    store.add_user(user(1)).await;
    store.add_user(user(2)).await;
    store.add_plan(plan(1, "free", 0)).await;
    store.add_plan(plan(2, "pro", 999)).await;
    store.add_plan(plan(3, "enterprise", 2999)).await;
    store
}

pub fn engine(
    store: &Arc<MemoryLedgerStore>,
    provider: &Arc<RecordingProvider>,
) -> Arc<ReconciliationEngine> {
    Arc::new(ReconciliationEngine::new(store.clone(), provider.clone()))
}

pub fn subscription_object(
    external_id: &str,
    status: &str,
    metadata: Value,
    cancel_at_period_end: bool,
) -> Value {
    json!({
        "id": external_id,
        "object": "subscription",
        "status": status,
        "current_period_start": 1_700_000_000,
        "current_period_end": 1_702_592_000,
        "cancel_at_period_end": cancel_at_period_end,
        "customer": "cus_1_1",
        "metadata": metadata,
    })
}

pub fn event(id: &str, event_type: &str, created: i64, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "object": "event",
        "type": event_type,
        "created": created,
        "data": { "object": object },
    }))
    .unwrap()
}
