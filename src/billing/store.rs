use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::{
    BillingUser, CustomerLink, GuardedWrite, NewPayment, NewSubscription, Payment, Plan,
    Subscription, SubscriptionUpdate,
};

/// key: billing-ledger-store -> durable subscription/payment ledger
///
/// Every write is a single atomic statement keyed by one of the unique columns,
/// so concurrent requests and duplicate webhook deliveries converge on one row.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_user(&self, user_id: i32) -> sqlx::Result<Option<BillingUser>>;

    async fn customer_link(&self, user_id: i32) -> sqlx::Result<Option<CustomerLink>>;
    async fn customer_link_by_customer_id(
        &self,
        customer_id: &str,
    ) -> sqlx::Result<Option<CustomerLink>>;
    /// Compare-and-create keyed by user. Returns the row that won.
    async fn insert_customer_link(
        &self,
        user_id: i32,
        customer_id: &str,
    ) -> sqlx::Result<CustomerLink>;

    async fn list_active_plans(&self) -> sqlx::Result<Vec<Plan>>;
    async fn find_plan(&self, plan_id: i32) -> sqlx::Result<Option<Plan>>;

    /// Rows in an active-equivalent status, most recently updated first.
    async fn active_subscriptions(&self, user_id: i32) -> sqlx::Result<Vec<Subscription>>;
    async fn find_subscription(&self, external_id: &str) -> sqlx::Result<Option<Subscription>>;
    async fn find_user_subscription(
        &self,
        user_id: i32,
        external_id: &str,
    ) -> sqlx::Result<Option<Subscription>>;
    /// Insert-or-ignore keyed by external id. The flag reports whether this call inserted.
    async fn insert_subscription_if_absent(
        &self,
        new: &NewSubscription,
    ) -> sqlx::Result<(Subscription, bool)>;
    /// Overwrites provider fields unless the row is canceled or `event_at` predates the
    /// last applied event.
    async fn apply_subscription_update(
        &self,
        external_id: &str,
        update: &SubscriptionUpdate,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<GuardedWrite>;
    async fn mark_subscription_canceled(
        &self,
        external_id: &str,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<Option<Subscription>>;
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
    ) -> sqlx::Result<Option<Subscription>>;

    async fn upsert_payment(&self, payment: &NewPayment) -> sqlx::Result<Payment>;
}

/// key: billing-ledger-store-pg -> sqlx implementation
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct CustomerLinkRow {
    id: Uuid,
    user_id: i32,
    customer_id: String,
    created_at: DateTime<Utc>,
}

impl From<CustomerLinkRow> for CustomerLink {
    fn from(row: CustomerLinkRow) -> Self {
        CustomerLink {
            id: row.id,
            user_id: row.user_id,
            customer_id: row.customer_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct PlanRow {
    id: i32,
    name: String,
    stripe_price_id: String,
    price_cents: i64,
    currency: String,
    description: String,
    features: sqlx::types::Json<Vec<String>>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            name: row.name,
            stripe_price_id: row.stripe_price_id,
            price_cents: row.price_cents,
            currency: row.currency,
            description: row.description,
            features: row.features.0,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: i32,
    plan_id: i32,
    stripe_subscription_id: String,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    cancel_at_period_end: bool,
    last_event_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = sqlx::Error;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|err: String| sqlx::Error::Decode(err.into()))?;
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            stripe_subscription_id: row.stripe_subscription_id,
            status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: i32,
    subscription_id: Option<Uuid>,
    stripe_payment_intent_id: String,
    amount_cents: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = sqlx::Error;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|err: String| sqlx::Error::Decode(err.into()))?;
        Ok(Payment {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            stripe_payment_intent_id: row.stripe_payment_intent_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn subscription_from(row: Option<SubscriptionRow>) -> sqlx::Result<Option<Subscription>> {
    row.map(Subscription::try_from).transpose()
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn find_user(&self, user_id: i32) -> sqlx::Result<Option<BillingUser>> {
        let row = sqlx::query_as::<_, (i32, String, String, String)>(
            "SELECT id, email, first_name, last_name FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, email, first_name, last_name)| BillingUser {
            id,
            email,
            first_name,
            last_name,
        }))
    }

    async fn customer_link(&self, user_id: i32) -> sqlx::Result<Option<CustomerLink>> {
        let row = sqlx::query_as::<_, CustomerLinkRow>(
            "SELECT id, user_id, customer_id, created_at FROM customer_links WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CustomerLink::from))
    }

    async fn customer_link_by_customer_id(
        &self,
        customer_id: &str,
    ) -> sqlx::Result<Option<CustomerLink>> {
        let row = sqlx::query_as::<_, CustomerLinkRow>(
            "SELECT id, user_id, customer_id, created_at FROM customer_links WHERE customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CustomerLink::from))
    }

    async fn insert_customer_link(
        &self,
        user_id: i32,
        customer_id: &str,
    ) -> sqlx::Result<CustomerLink> {
        let inserted = sqlx::query_as::<_, CustomerLinkRow>(
            r#"
            INSERT INTO customer_links (id, user_id, customer_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING id, user_id, customer_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        // Lost the race; the winner's row is authoritative.
        self.customer_link(user_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    async fn list_active_plans(&self) -> sqlx::Result<Vec<Plan>> {
        let rows = sqlx::query_as::<_, PlanRow>(
            "SELECT * FROM plans WHERE is_active = TRUE ORDER BY price_cents ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn find_plan(&self, plan_id: i32) -> sqlx::Result<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Plan::from))
    }

    async fn active_subscriptions(&self, user_id: i32) -> sqlx::Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            ORDER BY updated_at DESC, created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn find_subscription(&self, external_id: &str) -> sqlx::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        subscription_from(row)
    }

    async fn find_user_subscription(
        &self,
        user_id: i32,
        external_id: &str,
    ) -> sqlx::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND stripe_subscription_id = $2",
        )
        .bind(user_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        subscription_from(row)
    }

    async fn insert_subscription_if_absent(
        &self,
        new: &NewSubscription,
    ) -> sqlx::Result<(Subscription, bool)> {
        let inserted = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO subscriptions (
                id,
                user_id,
                plan_id,
                stripe_subscription_id,
                status,
                current_period_start,
                current_period_end,
                cancel_at_period_end,
                last_event_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (stripe_subscription_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(new.plan_id)
        .bind(&new.stripe_subscription_id)
        .bind(new.status.as_str())
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .bind(new.cancel_at_period_end)
        .bind(new.event_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.try_into()?, true));
        }

        let existing = self
            .find_subscription(&new.stripe_subscription_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        Ok((existing, false))
    }

    async fn apply_subscription_update(
        &self,
        external_id: &str,
        update: &SubscriptionUpdate,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<GuardedWrite> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions SET
                status = $2,
                current_period_start = $3,
                current_period_end = $4,
                cancel_at_period_end = $5,
                last_event_at = $6,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND status <> 'canceled'
              AND (last_event_at IS NULL OR last_event_at <= $6)
            RETURNING *
            "#,
        )
        .bind(external_id)
        .bind(update.status.as_str())
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(update.cancel_at_period_end)
        .bind(event_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(GuardedWrite::Applied(row.try_into()?));
        }

        Ok(match self.find_subscription(external_id).await? {
            Some(current) => GuardedWrite::Stale(current),
            None => GuardedWrite::Missing,
        })
    }

    async fn mark_subscription_canceled(
        &self,
        external_id: &str,
        event_at: DateTime<Utc>,
    ) -> sqlx::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions SET
                status = 'canceled',
                last_event_at = GREATEST(COALESCE(last_event_at, $2), $2),
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING *
            "#,
        )
        .bind(external_id)
        .bind(event_at)
        .fetch_optional(&self.pool)
        .await?;
        subscription_from(row)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: Uuid,
        cancel_at_period_end: bool,
    ) -> sqlx::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE subscriptions SET
                cancel_at_period_end = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(cancel_at_period_end)
        .fetch_optional(&self.pool)
        .await?;
        subscription_from(row)
    }

    async fn upsert_payment(&self, payment: &NewPayment) -> sqlx::Result<Payment> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            INSERT INTO payments (
                id,
                user_id,
                subscription_id,
                stripe_payment_intent_id,
                amount_cents,
                currency,
                status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (stripe_payment_intent_id)
            DO UPDATE SET
                subscription_id = COALESCE(EXCLUDED.subscription_id, payments.subscription_id),
                amount_cents = EXCLUDED.amount_cents,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(payment.subscription_id)
        .bind(&payment.stripe_payment_intent_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }
}
