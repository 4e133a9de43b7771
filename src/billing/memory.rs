use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    BillingUser, CustomerLink, GuardedWrite, NewPayment, NewSubscription, Payment, Plan,
    Subscription, SubscriptionStatus, SubscriptionUpdate,
};
use super::store::LedgerStore;

/// key: billing-ledger-store-memory -> in-process ledger
///
/// Holds the whole ledger behind one lock so each trait call is atomic, and
/// enforces the same uniqueness rules as the Postgres schema.
#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: Mutex<Ledger>,
}

#[derive(Default)]
struct Ledger {
    users: HashMap<i32, BillingUser>,
    links: HashMap<i32, CustomerLink>,
    plans: Vec<Plan>,
    subscriptions: Vec<Subscription>,
    payments: Vec<Payment>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, user: BillingUser) {
        self.inner.lock().await.users.insert(user.id, user);
    }

    /// Inserts or replaces a plan by id.
    pub async fn add_plan(&self, plan: Plan) {
        let mut ledger = self.inner.lock().await;
        ledger.plans.retain(|existing| existing.id != plan.id);
        ledger.plans.push(plan);
    }

    /// Seeds a subscription row directly, bypassing event handling.
    pub async fn add_subscription(&self, subscription: Subscription) {
        self.inner.lock().await.subscriptions.push(subscription);
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().await.subscriptions.clone()
    }

    pub async fn customer_links(&self) -> Vec<CustomerLink> {
        self.inner.lock().await.links.values().cloned().collect()
    }

    pub async fn payments(&self) -> Vec<Payment> {
        self.inner.lock().await.payments.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_user(&self, user_id: i32) -> sqlx::Result<Option<BillingUser>> {
        Ok(self.inner.lock().await.users.get(&user_id).cloned())
    }

    async fn customer_link(&self, user_id: i32) -> sqlx::Result<Option<CustomerLink>> {
        Ok(self.inner.lock().await.links.get(&user_id).cloned())
    }

    async fn customer_link_by_customer_id(
        &self,
        customer_id: &str,
    ) -> sqlx::Result<Option<CustomerLink>> {
        let ledger = self.inner.lock().await;
        Ok(ledger
            .links
            .values()
            .find(|link| link.customer_id == customer_id)
            .cloned())
    }

    async fn insert_customer_link(
        &self,
        user_id: i32,
        customer_id: &str,
    ) -> sqlx::Result<CustomerLink> {
        let mut ledger = self.inner.lock().await;
        if let Some(taken) = ledger
            .links
            .values()
            .find(|link| link.customer_id == customer_id && link.user_id != user_id)
        {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate key value violates unique constraint \"customer_links_customer_id_key\" (customer {} belongs to user {})",
                customer_id, taken.user_id
            )));
        }
        let link = ledger
            .links
            .entry(user_id)
            .or_insert_with(|| CustomerLink {
                id: Uuid::new_v4(),
                user_id,
                customer_id: customer_id.to_string(),
                created_at: Utc::now(),
            })
            .clone();
        Ok(link)
    }

    async fn list_active_plans(&self) -> sqlx::Result<Vec<Plan>> {
        let ledger = self.inner.lock().await;
        let mut plans: Vec<Plan> = ledger.plans.iter().filter(|p| p.is_active).cloned().collect();
        plans.sort_by_key(|p| (p.price_cents, p.id));
        Ok(plans)
    }

    async fn find_plan(&self, plan_id: i32) -> sqlx::Result<Option<Plan>> {
        let ledger = self.inner.lock().await;
        Ok(ledger.plans.iter().find(|p| p.id == plan_id).cloned())
    }

    async fn active_subscriptions(&self, user_id: i32) -> sqlx::Result<Vec<Subscription>> {
        let ledger = self.inner.lock().await;
        let mut rows: Vec<Subscription> = ledger
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status.is_active_equivalent())
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(rows)
    }

    async fn find_subscription(&self, external_id: &str) -> sqlx::Result<Option<Subscription>> {
        let ledger = self.inner.lock().await;
        Ok(ledger
            .subscriptions
            .iter()
            .find(|s| s.stripe_subscription_id == external_id)
            .cloned())
    }

    async fn find_user_subscription(
        &self,
        user_id: i32,
        external_id: &str,
    ) -> sqlx::Result<Option<Subscription>> {
        let ledger = self.inner.lock().await;
        Ok(ledger
            .subscriptions
            .iter()
            .find(|s| s.user_id == user_id && s.stripe_subscription_id == external_id)
            .cloned())
    }

    async fn insert_subscription_if_absent(
        &self,
        new: &NewSubscription,
    ) -> sqlx::Result<(Subscription, bool)> {
        let mut ledger = self.inner.lock().await;
        if let Some(existing) = ledger
            .subscriptions
            .iter()
            .find(|s| s.stripe_subscription_id == new.stripe_subscription_id)
        {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let row = Subscription {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            plan_id: new.plan_id,
            stripe_subscription_id: new.stripe_subscription_id.clone(),
            status: new.status,
            current_period_start: new.current_period_start,
            current_period_end: new.current_period_end,
            cancel_at_period_end: new.cancel_at_period_end,
            last_event_at: Some(new.event_at),
            created_at: now,
            updated_at: now,
        };
        ledger.subscriptions.push(row.clone());
        Ok((row, true))
    }

    async fn apply_subscription_update(
        &self,
        external_id: &str,
        update: &SubscriptionUpdate,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<GuardedWrite> {
        let mut ledger = self.inner.lock().await;
        let Some(row) = ledger
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == external_id)
        else {
            return Ok(GuardedWrite::Missing);
        };
        // Canceled is terminal regardless of event time.
        if row.status == SubscriptionStatus::Canceled
            || matches!(row.last_event_at, Some(last) if last > event_at)
        {
            return Ok(GuardedWrite::Stale(row.clone()));
        }
        row.status = update.status;
        row.current_period_start = update.current_period_start;
        row.current_period_end = update.current_period_end;
        row.cancel_at_period_end = update.cancel_at_period_end;
        row.last_event_at = Some(event_at);
        row.updated_at = Utc::now();
        Ok(GuardedWrite::Applied(row.clone()))
    }

    async fn mark_subscription_canceled(
        &self,
        external_id: &str,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<Option<Subscription>> {
        let mut ledger = self.inner.lock().await;
        let Some(row) = ledger
            .subscriptions
            .iter_mut()
            .find(|s| s.stripe_subscription_id == external_id)
        else {
            return Ok(None);
        };
        row.status = SubscriptionStatus::Canceled;
        row.last_event_at = Some(row.last_event_at.map_or(event_at, |last| last.max(event_at)));
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
    ) -> sqlx::Result<Option<Subscription>> {
        let mut ledger = self.inner.lock().await;
        let Some(row) = ledger
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
        else {
            return Ok(None);
        };
        row.cancel_at_period_end = cancel_at_period_end;
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn upsert_payment(&self, payment: &NewPayment) -> sqlx::Result<Payment> {
        let mut ledger = self.inner.lock().await;
        let now = Utc::now();
        if let Some(row) = ledger
            .payments
            .iter_mut()
            .find(|p| p.stripe_payment_intent_id == payment.stripe_payment_intent_id)
        {
            if payment.subscription_id.is_some() {
                row.subscription_id = payment.subscription_id;
            }
            row.amount_cents = payment.amount_cents;
            row.currency = payment.currency.clone();
            row.status = payment.status;
            row.updated_at = now;
            return Ok(row.clone());
        }
        let row = Payment {
            id: Uuid::new_v4(),
            user_id: payment.user_id,
            subscription_id: payment.subscription_id,
            stripe_payment_intent_id: payment.stripe_payment_intent_id.clone(),
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            status: payment.status,
            created_at: now,
            updated_at: now,
        };
        ledger.payments.push(row.clone());
        Ok(row)
    }
}
