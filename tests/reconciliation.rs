mod common;

use std::sync::Arc;

use billing_backend::billing::{
    BillingError, EventOutcome, PaymentStatus, Subscription, SubscriptionStatus, WebhookEvent,
};
use chrono::{Duration, TimeZone, Utc};
use common::{engine, event, seeded_store, subscription_object, user, RecordingProvider};
use serde_json::json;
use uuid::Uuid;

fn seeded_subscription(user_id: i32, external_id: &str, status: SubscriptionStatus) -> Subscription {
    let now = Utc::now();
    Subscription {
        id: Uuid::new_v4(),
        user_id,
        plan_id: 2,
        stripe_subscription_id: external_id.to_string(),
        status,
        current_period_start: now,
        current_period_end: now + Duration::days(30),
        cancel_at_period_end: false,
        last_event_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn parsed(bytes: Vec<u8>) -> WebhookEvent {
    WebhookEvent::parse(&bytes).unwrap()
}

fn tagged(user_id: i32, plan_id: i32) -> serde_json::Value {
    json!({ "user_id": user_id.to_string(), "plan_id": plan_id.to_string() })
}

// key: billing-tests -> customer link, checkout, lifecycle, cancel, payments
#[tokio::test]
async fn concurrent_link_requests_create_one_customer() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let first = user(1);
    let second = user(1);
    let (a, b) = tokio::join!(
        engine.get_or_create_customer_link(&first),
        engine.get_or_create_customer_link(&second)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.customer_id, b.customer_id);
    assert_eq!(provider.customers_created(), 1);
    assert_eq!(store.customer_links().await.len(), 1);
    assert_eq!(
        provider.idempotency_keys.lock().await.as_slice(),
        ["customer-link-1".to_string()]
    );

    // A later call reuses the stored link.
    let again = engine.get_or_create_customer_link(&user(1)).await.unwrap();
    assert_eq!(again.id, a.id);
    assert_eq!(provider.customers_created(), 1);
}

#[tokio::test]
async fn checkout_refused_while_subscription_active() {
    let store = seeded_store().await;
    store
        .add_subscription(seeded_subscription(1, "sub_existing", SubscriptionStatus::Trialing))
        .await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let err = engine
        .create_checkout_session(1, 3, "https://app.example.com/ok", "https://app.example.com/no")
        .await
        .unwrap_err();
    match err {
        BillingError::Conflict(message) => {
            assert_eq!(message, "User already has an active subscription")
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(provider.call_count().await, 0);
    assert!(store.customer_links().await.is_empty());
}

#[tokio::test]
async fn checkout_for_unknown_or_inactive_plan_is_not_found() {
    let store = seeded_store().await;
    let mut retired = common::plan(4, "legacy", 499);
    retired.is_active = false;
    store.add_plan(retired).await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    for plan_id in [4, 99] {
        let err = engine
            .create_checkout_session(1, plan_id, "https://a.example/ok", "https://a.example/no")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
    assert_eq!(provider.call_count().await, 0);
}

#[tokio::test]
async fn pro_plan_checkout_to_cancellation() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let session = engine
        .create_checkout_session(1, 2, "https://app.example.com/ok", "https://app.example.com/no")
        .await
        .unwrap();
    assert_eq!(session.session_id, "cs_test_1");
    {
        let checkouts = provider.checkouts.lock().await;
        assert_eq!(checkouts.len(), 1);
        assert_eq!(checkouts[0].user_id, 1);
        assert_eq!(checkouts[0].plan_id, 2);
        assert_eq!(checkouts[0].price_id, "price_pro");
        assert_eq!(checkouts[0].customer_id, "cus_1_1");
    }
    assert!(engine.get_user_subscription(1).await.unwrap().is_none());

    let created = engine
        .apply_event(&parsed(event(
            "evt_1",
            "customer.subscription.created",
            1_700_000_100,
            subscription_object("sub_pro", "active", tagged(1, 2), false),
        )))
        .await
        .unwrap();
    assert!(matches!(created, EventOutcome::SubscriptionCreated(_)));

    let (subscription, plan) = engine.current_subscription(1).await.unwrap().unwrap();
    assert_eq!(plan.name, "pro");
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(
        subscription.current_period_end,
        Utc.timestamp_opt(1_702_592_000, 0).unwrap()
    );

    let outcome = engine.cancel_subscription(1, "sub_pro").await;
    assert!(outcome.success);
    assert_eq!(
        outcome.message,
        "Subscription will be canceled at the end of the current period"
    );
    assert_eq!(
        provider.cancellations.lock().await.as_slice(),
        ["sub_pro".to_string()]
    );
    let after_cancel = engine.get_user_subscription(1).await.unwrap().unwrap();
    assert!(after_cancel.cancel_at_period_end);
    assert_eq!(after_cancel.status, SubscriptionStatus::Active);

    let deleted = engine
        .apply_event(&parsed(event(
            "evt_2",
            "customer.subscription.deleted",
            1_702_592_001,
            subscription_object("sub_pro", "canceled", tagged(1, 2), true),
        )))
        .await
        .unwrap();
    assert!(matches!(deleted, EventOutcome::SubscriptionCanceled(_)));
    assert!(engine.get_user_subscription(1).await.unwrap().is_none());

    let rows = store.subscriptions().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Canceled);
}

#[tokio::test]
async fn duplicate_created_delivery_keeps_first_values() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let first = parsed(event(
        "evt_1",
        "customer.subscription.created",
        1_700_000_100,
        subscription_object("sub_dup", "active", tagged(1, 2), false),
    ));
    engine.apply_event(&first).await.unwrap();
    let second = parsed(event(
        "evt_1b",
        "customer.subscription.created",
        1_700_000_200,
        subscription_object("sub_dup", "incomplete", tagged(1, 3), false),
    ));
    let outcome = engine.apply_event(&second).await.unwrap();

    match outcome {
        EventOutcome::SubscriptionDuplicate(existing) => {
            assert_eq!(existing.plan_id, 2);
            assert_eq!(existing.status, SubscriptionStatus::Active);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(store.subscriptions().await.len(), 1);
}

#[tokio::test]
async fn created_event_without_metadata_is_malformed() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let err = engine
        .apply_event(&parsed(event(
            "evt_1",
            "customer.subscription.created",
            1_700_000_100,
            subscription_object("sub_x", "active", json!({}), false),
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::MalformedEvent(_)));
    assert!(store.subscriptions().await.is_empty());
}

#[tokio::test]
async fn update_for_unknown_subscription_writes_nothing() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let err = engine
        .apply_event(&parsed(event(
            "evt_1",
            "customer.subscription.updated",
            1_700_000_100,
            subscription_object("sub_unknown", "active", json!({}), false),
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));

    let err = engine
        .apply_event(&parsed(event(
            "evt_2",
            "customer.subscription.deleted",
            1_700_000_200,
            subscription_object("sub_unknown", "canceled", json!({}), false),
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
    assert!(store.subscriptions().await.is_empty());
}

#[tokio::test]
async fn out_of_order_update_is_skipped() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    engine
        .apply_event(&parsed(event(
            "evt_1",
            "customer.subscription.created",
            100,
            subscription_object("sub_1", "active", tagged(1, 2), false),
        )))
        .await
        .unwrap();
    let newer = engine
        .apply_event(&parsed(event(
            "evt_3",
            "customer.subscription.updated",
            300,
            subscription_object("sub_1", "past_due", json!({}), false),
        )))
        .await
        .unwrap();
    assert!(matches!(newer, EventOutcome::SubscriptionUpdated(_)));

    let older = engine
        .apply_event(&parsed(event(
            "evt_2",
            "customer.subscription.updated",
            200,
            subscription_object("sub_1", "active", json!({}), true),
        )))
        .await
        .unwrap();
    match older {
        EventOutcome::SubscriptionStale(current) => {
            assert_eq!(current.status, SubscriptionStatus::PastDue)
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let rows = store.subscriptions().await;
    assert_eq!(rows[0].status, SubscriptionStatus::PastDue);
    assert!(!rows[0].cancel_at_period_end);
    assert!(engine.get_user_subscription(1).await.unwrap().is_none());

    // Deletion is terminal even when it predates the last applied update.
    engine
        .apply_event(&parsed(event(
            "evt_0",
            "customer.subscription.deleted",
            150,
            subscription_object("sub_1", "canceled", json!({}), false),
        )))
        .await
        .unwrap();
    let rows = store.subscriptions().await;
    assert_eq!(rows[0].status, SubscriptionStatus::Canceled);
    assert_eq!(rows[0].last_event_at, Some(Utc.timestamp_opt(300, 0).unwrap()));
}

#[tokio::test]
async fn update_delivered_after_deletion_cannot_revive_subscription() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    engine
        .apply_event(&parsed(event(
            "evt_1",
            "customer.subscription.created",
            100,
            subscription_object("sub_1", "active", tagged(1, 2), false),
        )))
        .await
        .unwrap();
    engine
        .apply_event(&parsed(event(
            "evt_2",
            "customer.subscription.deleted",
            200,
            subscription_object("sub_1", "canceled", json!({}), false),
        )))
        .await
        .unwrap();

    // Same second as the deletion, delivered after it.
    let late = engine
        .apply_event(&parsed(event(
            "evt_3",
            "customer.subscription.updated",
            200,
            subscription_object("sub_1", "active", json!({}), false),
        )))
        .await
        .unwrap();
    match late {
        EventOutcome::SubscriptionStale(current) => {
            assert_eq!(current.status, SubscriptionStatus::Canceled)
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let rows = store.subscriptions().await;
    assert_eq!(rows[0].status, SubscriptionStatus::Canceled);
    assert!(engine.get_user_subscription(1).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_of_another_users_subscription_is_refused() {
    let store = seeded_store().await;
    store
        .add_subscription(seeded_subscription(2, "sub_theirs", SubscriptionStatus::Active))
        .await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let outcome = engine.cancel_subscription(1, "sub_theirs").await;
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Subscription not found");
    assert!(provider.cancellations.lock().await.is_empty());
    assert!(!store.subscriptions().await[0].cancel_at_period_end);
}

#[tokio::test]
async fn provider_refusal_leaves_subscription_untouched() {
    let store = seeded_store().await;
    store
        .add_subscription(seeded_subscription(1, "sub_mine", SubscriptionStatus::Active))
        .await;
    let provider = Arc::new(RecordingProvider::refusing_cancellation());
    let engine = engine(&store, &provider);

    let outcome = engine.cancel_subscription(1, "sub_mine").await;
    assert!(!outcome.success);
    assert!(outcome.message.starts_with("Error canceling subscription:"));
    assert!(!store.subscriptions().await[0].cancel_at_period_end);
}

#[tokio::test]
async fn most_recently_updated_active_subscription_wins() {
    let store = seeded_store().await;
    let mut older = seeded_subscription(1, "sub_old", SubscriptionStatus::Active);
    older.updated_at = Utc::now() - Duration::days(2);
    let newer = seeded_subscription(1, "sub_new", SubscriptionStatus::Trialing);
    store.add_subscription(older).await;
    store.add_subscription(newer).await;
    store
        .add_subscription(seeded_subscription(1, "sub_gone", SubscriptionStatus::Canceled))
        .await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let chosen = engine.get_user_subscription(1).await.unwrap().unwrap();
    assert_eq!(chosen.stripe_subscription_id, "sub_new");
}

#[tokio::test]
async fn invoice_events_record_payments() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);
    let link = engine.get_or_create_customer_link(&user(1)).await.unwrap();
    engine
        .apply_event(&parsed(event(
            "evt_1",
            "customer.subscription.created",
            100,
            subscription_object("sub_1", "active", tagged(1, 2), false),
        )))
        .await
        .unwrap();

    let invoice = |amount_paid: i64| {
        json!({
            "id": "in_1",
            "object": "invoice",
            "customer": link.customer_id,
            "subscription": "sub_1",
            "payment_intent": "pi_1",
            "amount_paid": amount_paid,
            "amount_due": 999,
            "currency": "usd",
        })
    };

    let failed = engine
        .apply_event(&parsed(event("evt_2", "invoice.payment_failed", 110, invoice(0))))
        .await
        .unwrap();
    match failed {
        EventOutcome::PaymentRecorded(payment) => {
            assert_eq!(payment.status, PaymentStatus::Failed);
            assert_eq!(payment.amount_cents, 999);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let paid = engine
        .apply_event(&parsed(event("evt_3", "invoice.payment_succeeded", 120, invoice(999))))
        .await
        .unwrap();
    let subscription_id = store.subscriptions().await[0].id;
    match paid {
        EventOutcome::PaymentRecorded(payment) => {
            assert_eq!(payment.user_id, 1);
            assert_eq!(payment.status, PaymentStatus::Succeeded);
            assert_eq!(payment.currency, "USD");
            assert_eq!(payment.subscription_id, Some(subscription_id));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(store.payments().await.len(), 1);
}

#[tokio::test]
async fn invoices_for_unknown_customers_are_ignored() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let outcome = engine
        .apply_event(&parsed(event(
            "evt_1",
            "invoice.payment_succeeded",
            100,
            json!({
                "id": "in_9",
                "customer": "cus_stranger",
                "payment_intent": "pi_9",
                "amount_paid": 500,
            }),
        )))
        .await
        .unwrap();
    assert_eq!(outcome, EventOutcome::Ignored);
    assert!(store.payments().await.is_empty());
}

#[tokio::test]
async fn checkout_completed_and_unknown_events_change_nothing() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let completed = engine
        .apply_event(&parsed(event(
            "evt_1",
            "checkout.session.completed",
            100,
            json!({ "id": "cs_1", "customer": "cus_1_1", "subscription": "sub_1" }),
        )))
        .await
        .unwrap();
    assert_eq!(completed, EventOutcome::Ignored);

    let unknown = engine
        .apply_event(&parsed(event(
            "evt_2",
            "customer.created",
            100,
            json!({ "id": "cus_1_1" }),
        )))
        .await
        .unwrap();
    assert_eq!(unknown, EventOutcome::Ignored);
    assert!(store.subscriptions().await.is_empty());
    assert!(store.payments().await.is_empty());
}

#[tokio::test]
async fn portal_session_links_customer_first() {
    let store = seeded_store().await;
    let provider = Arc::new(RecordingProvider::default());
    let engine = engine(&store, &provider);

    let url = engine
        .create_customer_portal_session(2, "https://app.example.com/account")
        .await
        .unwrap();
    assert_eq!(url, "https://billing.example.com/p/cus_2_1");
    assert_eq!(store.customer_links().await.len(), 1);

    let err = engine
        .create_customer_portal_session(42, "https://app.example.com/account")
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound(_)));
}
