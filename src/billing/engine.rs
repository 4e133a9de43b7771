use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::events::{
    CheckoutObject, InvoiceObject, ProviderEvent, SubscriptionObject, WebhookEvent,
};
use super::models::{
    BillingUser, CustomerLink, GuardedWrite, NewPayment, NewSubscription, Payment, PaymentStatus,
    Plan, Subscription,
};
use super::provider::{BillingProvider, CheckoutRequest, CheckoutSession, NewCustomer, ProviderError};
use super::store::LedgerStore;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("ledger store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub message: String,
}

impl CancelOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// What a webhook delivery did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    SubscriptionCreated(Subscription),
    SubscriptionDuplicate(Subscription),
    SubscriptionUpdated(Subscription),
    SubscriptionStale(Subscription),
    SubscriptionCanceled(Subscription),
    PaymentRecorded(Payment),
    Ignored,
}

/// key: billing-engine -> reconciliation core
///
/// The only writer of customer links, subscriptions and payments. Holds no ledger
/// state of its own: every operation reads the store, decides, and writes back.
pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn BillingProvider>,
    link_locks: DashMap<i32, Arc<Mutex<()>>>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LedgerStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self {
            store,
            provider,
            link_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn link_lock(&self, user_id: i32) -> Arc<Mutex<()>> {
        self.link_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get_or_create_customer_link(
        &self,
        user: &BillingUser,
    ) -> BillingResult<CustomerLink> {
        if let Some(link) = self.store.customer_link(user.id).await? {
            return Ok(link);
        }

        let lock = self.link_lock(user.id);
        let guard = lock.lock().await;
        let result = self.create_customer_link(user).await;
        drop(guard);
        drop(lock);
        // Only the map still holds the lock once no other caller is waiting on it.
        self.link_locks
            .remove_if(&user.id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn create_customer_link(&self, user: &BillingUser) -> BillingResult<CustomerLink> {
        if let Some(link) = self.store.customer_link(user.id).await? {
            return Ok(link);
        }

        let customer = NewCustomer {
            user_id: user.id,
            email: user.email.clone(),
            name: user.display_name(),
        };
        let idempotency_key = format!("customer-link-{}", user.id);
        let customer_id = self
            .provider
            .create_customer(&customer, &idempotency_key)
            .await?;
        let link = self.store.insert_customer_link(user.id, &customer_id).await?;
        if link.customer_id != customer_id {
            warn!(
                user_id = user.id,
                kept = %link.customer_id,
                discarded = %customer_id,
                "customer link already existed; provider customer left unlinked"
            );
        } else {
            info!(user_id = user.id, customer = %customer_id, "customer link created");
        }
        Ok(link)
    }

    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        Ok(self.store.list_active_plans().await?)
    }

    /// The user's current subscription: the active or trialing row, if any.
    pub async fn get_user_subscription(&self, user_id: i32) -> BillingResult<Option<Subscription>> {
        let mut rows = self.store.active_subscriptions(user_id).await?;
        if rows.len() > 1 {
            warn!(
                user_id,
                count = rows.len(),
                chosen = %rows[0].stripe_subscription_id,
                "multiple active subscriptions; using most recently updated"
            );
        }
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    pub async fn current_subscription(
        &self,
        user_id: i32,
    ) -> BillingResult<Option<(Subscription, Plan)>> {
        let Some(subscription) = self.get_user_subscription(user_id).await? else {
            return Ok(None);
        };
        let plan = self
            .store
            .find_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", subscription.plan_id)))?;
        Ok(Some((subscription, plan)))
    }

    pub async fn create_checkout_session(
        &self,
        user_id: i32,
        plan_id: i32,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSession> {
        let plan = self
            .store
            .find_plan(plan_id)
            .await?
            .filter(|plan| plan.is_active)
            .ok_or_else(|| BillingError::NotFound(format!("plan {plan_id}")))?;

        if let Some(existing) = self.get_user_subscription(user_id).await? {
            info!(
                user_id,
                subscription = %existing.stripe_subscription_id,
                "checkout refused: subscription already active"
            );
            return Err(BillingError::Conflict(
                "User already has an active subscription".into(),
            ));
        }

        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        let link = self.get_or_create_customer_link(&user).await?;

        let session = self
            .provider
            .create_checkout_session(&CheckoutRequest {
                customer_id: link.customer_id,
                price_id: plan.stripe_price_id.clone(),
                success_url: success_url.to_string(),
                cancel_url: cancel_url.to_string(),
                user_id,
                plan_id: plan.id,
            })
            .await?;
        info!(user_id, plan = %plan.name, session = %session.session_id, "checkout session created");
        Ok(session)
    }

    pub async fn create_customer_portal_session(
        &self,
        user_id: i32,
        return_url: &str,
    ) -> BillingResult<String> {
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {user_id}")))?;
        let link = self.get_or_create_customer_link(&user).await?;
        Ok(self
            .provider
            .create_portal_session(&link.customer_id, return_url)
            .await?)
    }

    /// Schedules cancellation at period end. Failures come back as `success: false`.
    pub async fn cancel_subscription(&self, user_id: i32, subscription_id: &str) -> CancelOutcome {
        let subscription = match self.store.find_user_subscription(user_id, subscription_id).await
        {
            Ok(Some(subscription)) => subscription,
            Ok(None) => return CancelOutcome::failed("Subscription not found"),
            Err(err) => {
                error!(?err, user_id, subscription = subscription_id, "failed to load subscription");
                return CancelOutcome::failed(format!("Error canceling subscription: {err}"));
            }
        };

        if let Err(err) = self.provider.cancel_at_period_end(subscription_id).await {
            warn!(?err, user_id, subscription = subscription_id, "provider refused cancellation");
            return CancelOutcome::failed(format!("Error canceling subscription: {err}"));
        }

        match self
            .store
            .set_cancel_at_period_end(subscription.id, true)
            .await
        {
            Ok(_) => {
                info!(user_id, subscription = subscription_id, "cancellation scheduled");
                CancelOutcome {
                    success: true,
                    message: "Subscription will be canceled at the end of the current period"
                        .into(),
                }
            }
            Err(err) => {
                // No compensation: the provider's next updated event carries the flag.
                error!(
                    ?err,
                    user_id,
                    subscription = subscription_id,
                    "cancellation accepted by provider but local write failed"
                );
                CancelOutcome::failed(format!("Error canceling subscription: {err}"))
            }
        }
    }

    pub async fn handle_subscription_created(
        &self,
        object: &SubscriptionObject,
        event_at: chrono::DateTime<chrono::Utc>,
    ) -> BillingResult<(Subscription, bool)> {
        let (user_id, plan_id) = object.tagged_ids().map_err(BillingError::MalformedEvent)?;
        let update = object.update().map_err(BillingError::MalformedEvent)?;

        if self.store.find_user(user_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("user {user_id}")));
        }
        if self.store.find_plan(plan_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("plan {plan_id}")));
        }

        let new = NewSubscription {
            user_id,
            plan_id,
            stripe_subscription_id: object.id.clone(),
            status: update.status,
            current_period_start: update.current_period_start,
            current_period_end: update.current_period_end,
            cancel_at_period_end: update.cancel_at_period_end,
            event_at,
        };
        let (subscription, inserted) = self.store.insert_subscription_if_absent(&new).await?;
        if inserted {
            info!(
                user_id,
                plan_id,
                subscription = %subscription.stripe_subscription_id,
                status = %subscription.status,
                "subscription created"
            );
        } else {
            info!(
                subscription = %subscription.stripe_subscription_id,
                "duplicate subscription created delivery ignored"
            );
        }
        Ok((subscription, inserted))
    }

    pub async fn handle_subscription_updated(
        &self,
        object: &SubscriptionObject,
        event_at: chrono::DateTime<chrono::Utc>,
    ) -> BillingResult<GuardedWrite> {
        let update = object.update().map_err(BillingError::MalformedEvent)?;
        match self
            .store
            .apply_subscription_update(&object.id, &update, event_at)
            .await?
        {
            GuardedWrite::Missing => {
                warn!(subscription = %object.id, "update for unknown subscription");
                Err(BillingError::NotFound(format!("subscription {}", object.id)))
            }
            GuardedWrite::Stale(current) => {
                warn!(
                    subscription = %object.id,
                    event_at = %event_at,
                    last_event_at = ?current.last_event_at,
                    "stale subscription update skipped"
                );
                Ok(GuardedWrite::Stale(current))
            }
            GuardedWrite::Applied(subscription) => {
                info!(
                    subscription = %subscription.stripe_subscription_id,
                    status = %subscription.status,
                    cancel_at_period_end = subscription.cancel_at_period_end,
                    "subscription updated"
                );
                Ok(GuardedWrite::Applied(subscription))
            }
        }
    }

    pub async fn handle_subscription_deleted(
        &self,
        object: &SubscriptionObject,
        event_at: chrono::DateTime<chrono::Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .mark_subscription_canceled(&object.id, event_at)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", object.id)))?;
        info!(subscription = %subscription.stripe_subscription_id, "subscription canceled");
        Ok(subscription)
    }

    async fn record_invoice_payment(
        &self,
        invoice: &InvoiceObject,
        status: PaymentStatus,
    ) -> BillingResult<Option<Payment>> {
        let Some(payment_intent) = invoice.payment_intent.as_deref() else {
            debug!(invoice = %invoice.id, "invoice without payment intent; nothing to record");
            return Ok(None);
        };
        let Some(customer_id) = invoice.customer.as_deref() else {
            warn!(invoice = %invoice.id, "invoice without customer; payment not recorded");
            return Ok(None);
        };
        let Some(link) = self.store.customer_link_by_customer_id(customer_id).await? else {
            warn!(invoice = %invoice.id, customer = customer_id, "invoice for unknown customer");
            return Ok(None);
        };

        let subscription_id = match invoice.subscription.as_deref() {
            Some(external_id) => self
                .store
                .find_subscription(external_id)
                .await?
                .map(|subscription| subscription.id),
            None => None,
        };
        let amount_cents = match status {
            PaymentStatus::Succeeded => invoice.amount_paid,
            _ => invoice.amount_due,
        };

        let payment = self
            .store
            .upsert_payment(&NewPayment {
                user_id: link.user_id,
                subscription_id,
                stripe_payment_intent_id: payment_intent.to_string(),
                amount_cents,
                currency: invoice.currency.to_ascii_uppercase(),
                status,
            })
            .await?;
        info!(
            user_id = payment.user_id,
            payment_intent = %payment.stripe_payment_intent_id,
            status = payment.status.as_str(),
            amount_cents = payment.amount_cents,
            "payment recorded"
        );
        Ok(Some(payment))
    }

    fn checkout_completed(&self, session: &CheckoutObject) {
        // The subscription row arrives with customer.subscription.created.
        info!(
            session = %session.id,
            subscription = ?session.subscription,
            customer = ?session.customer,
            "checkout session completed"
        );
    }

    /// key: billing-dispatch -> event type to engine operation
    pub async fn apply_event(&self, event: &WebhookEvent) -> BillingResult<EventOutcome> {
        info!(event = %event.id, event_type = %event.event_type, "applying billing event");
        let outcome = match &event.payload {
            ProviderEvent::SubscriptionCreated(object) => {
                match self.handle_subscription_created(object, event.created).await? {
                    (subscription, true) => EventOutcome::SubscriptionCreated(subscription),
                    (subscription, false) => EventOutcome::SubscriptionDuplicate(subscription),
                }
            }
            ProviderEvent::SubscriptionUpdated(object) => {
                match self.handle_subscription_updated(object, event.created).await? {
                    GuardedWrite::Applied(subscription) => {
                        EventOutcome::SubscriptionUpdated(subscription)
                    }
                    GuardedWrite::Stale(subscription) => EventOutcome::SubscriptionStale(subscription),
                    GuardedWrite::Missing => {
                        return Err(BillingError::NotFound(format!("subscription {}", object.id)))
                    }
                }
            }
            ProviderEvent::SubscriptionDeleted(object) => EventOutcome::SubscriptionCanceled(
                self.handle_subscription_deleted(object, event.created).await?,
            ),
            ProviderEvent::CheckoutSessionCompleted(session) => {
                self.checkout_completed(session);
                EventOutcome::Ignored
            }
            ProviderEvent::InvoicePaymentSucceeded(invoice) => self
                .record_invoice_payment(invoice, PaymentStatus::Succeeded)
                .await?
                .map_or(EventOutcome::Ignored, EventOutcome::PaymentRecorded),
            ProviderEvent::InvoicePaymentFailed(invoice) => self
                .record_invoice_payment(invoice, PaymentStatus::Failed)
                .await?
                .map_or(EventOutcome::Ignored, EventOutcome::PaymentRecorded),
            ProviderEvent::Unhandled => {
                info!(event_type = %event.event_type, "unhandled billing event type");
                EventOutcome::Ignored
            }
        };
        Ok(outcome)
    }
}
