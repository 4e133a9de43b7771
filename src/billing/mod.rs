pub mod api;
pub mod engine;
pub mod events;
pub mod memory;
pub mod models;
pub mod provider;
pub mod store;

pub use api::{
    cancel_subscription as billing_cancel_subscription,
    create_checkout_session as billing_create_checkout_session,
    create_customer_portal as billing_create_customer_portal,
    get_subscription as billing_get_subscription, list_plans as billing_list_plans,
    stripe_webhook as billing_stripe_webhook, PlanView, SubscriptionView,
    UserSubscriptionResponse,
};
pub use engine::{BillingError, BillingResult, CancelOutcome, EventOutcome, ReconciliationEngine};
pub use events::{ProviderEvent, WebhookError, WebhookEvent, WebhookVerifier};
pub use memory::MemoryLedgerStore;
pub use models::{
    BillingUser, CustomerLink, GuardedWrite, NewPayment, NewSubscription, Payment, PaymentStatus,
    Plan, Subscription, SubscriptionStatus, SubscriptionUpdate,
};
pub use provider::{
    BillingProvider, CheckoutRequest, CheckoutSession, NewCustomer, ProviderError, StripeClient,
};
pub use store::{LedgerStore, PgLedgerStore};
