// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Exercises the reconciliation flows end to end against the in-memory store
//! and a scripted provider:
//! - Webhook lifecycle dispatch (BILL-W01 to BILL-W17)
//! - Founder seats (BILL-F01 to BILL-F05)
//! - Billing portal customer repair (BILL-P01 to BILL-P06)

#[cfg(test)]
mod support {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use time::OffsetDateTime;

    use crate::client::StripeConfig;
    use crate::error::{BillingError, BillingResult};
    use crate::payloads::{ExpandableId, SubscriptionObject, WebhookEvent};
    use crate::plans::{BillingInterval, Plan, SubscriptionStatus};
    use crate::provider::BillingProvider;
    use crate::store::{InMemoryBillingStore, SubscriptionRecord};
    use crate::BillingService;

    pub const WEBHOOK_SECRET: &str = "whsec_edge_case_secret";
    pub const APP_BASE_URL: &str = "https://app.glowdesk.test";

    /// Provider double with scripted subscriptions and customers
    #[derive(Default)]
    pub struct MockProvider {
        subscriptions: Mutex<HashMap<String, SubscriptionObject>>,
        customers: Mutex<HashSet<String>>,
        pub fail_retrieve: AtomicBool,
        pub fail_portal: AtomicBool,
        pub portal_calls: Mutex<Vec<(String, String)>>,
        pub retrieve_calls: Mutex<Vec<String>>,
    }

    impl MockProvider {
        pub fn add_subscription(
            &self,
            id: &str,
            customer: &str,
            status: &str,
            period_end: Option<i64>,
            metadata: &[(&str, &str)],
        ) {
            let sub = SubscriptionObject {
                id: id.to_string(),
                customer: Some(ExpandableId::Id(customer.to_string())),
                status: status.to_string(),
                current_period_end: period_end,
                metadata: metadata
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                tier: None,
                items: None,
            };
            self.subscriptions
                .lock()
                .unwrap()
                .insert(id.to_string(), sub);
        }

        pub fn add_customer(&self, id: &str) {
            self.customers.lock().unwrap().insert(id.to_string());
        }

        pub fn set_fail_retrieve(&self, fail: bool) {
            self.fail_retrieve.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BillingProvider for MockProvider {
        async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionObject> {
            self.retrieve_calls
                .lock()
                .unwrap()
                .push(subscription_id.to_string());

            if self.fail_retrieve.load(Ordering::SeqCst) {
                return Err(BillingError::StripeApi("connection reset by peer".to_string()));
            }

            self.subscriptions
                .lock()
                .unwrap()
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| {
                    BillingError::StripeApi(format!("No such subscription: {}", subscription_id))
                })
        }

        async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> BillingResult<String> {
            self.portal_calls
                .lock()
                .unwrap()
                .push((customer_id.to_string(), return_url.to_string()));

            if self.fail_portal.load(Ordering::SeqCst) {
                return Err(BillingError::StripeApi("503 Service Unavailable".to_string()));
            }

            if self.customers.lock().unwrap().contains(customer_id) {
                Ok(format!("https://billing.stripe.test/p/session/{}", customer_id))
            } else {
                Err(BillingError::CustomerMissing(customer_id.to_string()))
            }
        }
    }

    pub struct Harness {
        pub store: Arc<InMemoryBillingStore>,
        pub provider: Arc<MockProvider>,
        pub billing: BillingService,
    }

    pub fn harness(founder_spots: u32) -> Harness {
        let store = Arc::new(InMemoryBillingStore::new(founder_spots));
        let provider = Arc::new(MockProvider::default());
        let config = StripeConfig {
            secret_key: "sk_test_edge".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            app_base_url: APP_BASE_URL.to_string(),
            webhook_tolerance_secs: 300,
        };
        let billing = BillingService::new(&config, store.clone(), provider.clone());
        Harness {
            store,
            provider,
            billing,
        }
    }

    pub fn event(id: &str, event_type: &str, created: i64, object: Value) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": event_type,
            "created": created,
            "data": { "object": object }
        }))
        .unwrap()
    }

    pub fn record(user_id: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: user_id.to_string(),
            stripe_customer_id: None,
            stripe_subscription_id: None,
            plan: Plan::Founder,
            interval: BillingInterval::Annual,
            status: SubscriptionStatus::Active,
            current_period_end: None,
            is_founder_annual: false,
            founder_claimed_at: None,
            last_event_at: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod webhook_tests {
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;
    use time::macros::datetime;
    use time::OffsetDateTime;

    use super::support::*;
    use crate::error::BillingError;
    use crate::plans::{BillingInterval, Plan, SubscriptionStatus};
    use crate::store::{EventResult, SubscriptionStore};
    use crate::webhooks::{IgnoreReason, WebhookOutcome};

    const T0: i64 = 1_730_000_000;

    // =========================================================================
    // BILL-W01: Founder tier checkout lands on founder/annual and takes a seat
    // =========================================================================
    #[tokio::test]
    async fn test_founder_tier_checkout() {
        let h = harness(10);
        h.provider
            .add_subscription("sub_f", "cus_f", "active", Some(T0 + 31_536_000), &[]);

        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w01",
                "checkout.session.completed",
                T0,
                json!({
                    "id": "cs_1",
                    "customer": "cus_f",
                    "subscription": "sub_f",
                    "metadata": { "user_id": "u_founder", "tier": "founder_annual" }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                user_id: "u_founder".to_string(),
                founder_claimed: true
            }
        );

        let record = h.store.get("u_founder").await.unwrap().unwrap();
        assert_eq!(record.plan, Plan::Founder);
        assert_eq!(record.interval, BillingInterval::Annual);
        assert!(record.is_founder_annual);
        assert!(record.founder_claimed_at.is_some());
        assert_eq!(h.store.founder_counts().unwrap(), (1, 10));
    }

    // =========================================================================
    // BILL-W02: Checkout fetches live status and period end from the provider
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_uses_live_subscription_state() {
        let h = harness(10);
        h.provider
            .add_subscription("sub_1", "cus_1", "active", Some(1_735_689_600), &[]);

        h.billing
            .webhooks
            .handle_event(event(
                "evt_w02",
                "checkout.session.completed",
                T0,
                json!({
                    "id": "cs_2",
                    "customer": "cus_1",
                    "subscription": "sub_1",
                    "metadata": { "user_id": "u1", "tier": "pro_monthly" }
                }),
            ))
            .await
            .unwrap();

        let record = h.store.get("u1").await.unwrap().unwrap();
        assert_eq!(record.plan, Plan::Pro);
        assert_eq!(record.interval, BillingInterval::Monthly);
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.current_period_end, Some(datetime!(2025-01-01 00:00 UTC)));
        assert_eq!(record.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(record.stripe_subscription_id.as_deref(), Some("sub_1"));
        assert!(!record.is_founder_annual);
    }

    // =========================================================================
    // BILL-W03: Update for an unknown subscription is ignored with no writes
    // =========================================================================
    #[tokio::test]
    async fn test_update_for_unknown_user_ignored() {
        let h = harness(10);

        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w03",
                "customer.subscription.updated",
                T0,
                json!({
                    "id": "sub_unknown",
                    "customer": "cus_unknown",
                    "status": "active",
                    "current_period_end": T0 + 86_400,
                    "metadata": {}
                }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Ignored(IgnoreReason::MissingUser));
        assert!(h
            .store
            .find_user_by_billing_ids(Some("sub_unknown"), Some("cus_unknown"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            h.store.event_result("evt_w03").unwrap().map(|(r, _)| r),
            Some(EventResult::Ignored)
        );
    }

    // =========================================================================
    // BILL-W04: Delivering the same update twice yields the same record
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_update_is_idempotent() {
        let h = harness(10);
        let update = event(
            "evt_w04",
            "customer.subscription.updated",
            T0,
            json!({
                "id": "sub_4",
                "customer": "cus_4",
                "status": "past_due",
                "current_period_end": T0 + 86_400,
                "metadata": { "user_id": "u4", "plan": "elite", "interval": "annual" }
            }),
        );

        let first = h.billing.webhooks.handle_event(update.clone()).await.unwrap();
        assert!(matches!(first, WebhookOutcome::Processed { .. }));
        let after_first = h.store.get("u4").await.unwrap().unwrap();

        let second = h.billing.webhooks.handle_event(update.clone()).await.unwrap();
        assert_eq!(second, WebhookOutcome::Ignored(IgnoreReason::Duplicate));

        // Re-applying without the ledger is also harmless
        h.billing.webhooks.dispatch(&update).await.unwrap();
        let after_replay = h.store.get("u4").await.unwrap().unwrap();

        assert_eq!(after_first.status, after_replay.status);
        assert_eq!(after_first.plan, after_replay.plan);
        assert_eq!(after_first.interval, after_replay.interval);
        assert_eq!(after_first.current_period_end, after_replay.current_period_end);
        assert_eq!(after_replay.plan, Plan::Elite);
        assert_eq!(after_replay.status, SubscriptionStatus::PastDue);
    }

    // =========================================================================
    // BILL-W05: Deletion clears period end and founder status
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_is_terminal() {
        let h = harness(10);
        h.provider
            .add_subscription("sub_5", "cus_5", "active", Some(T0 + 31_536_000), &[]);

        h.billing
            .webhooks
            .handle_event(event(
                "evt_w05a",
                "checkout.session.completed",
                T0,
                json!({
                    "id": "cs_5",
                    "customer": "cus_5",
                    "subscription": "sub_5",
                    "metadata": { "user_id": "u5", "tier": "founder_annual" }
                }),
            ))
            .await
            .unwrap();
        assert!(h.store.get("u5").await.unwrap().unwrap().is_founder_annual);

        // No user_id in metadata: resolved through the stored subscription id
        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w05b",
                "customer.subscription.deleted",
                T0 + 60,
                json!({
                    "id": "sub_5",
                    "customer": "cus_5",
                    "status": "canceled",
                    "current_period_end": T0 + 31_536_000,
                    "metadata": {}
                }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

        let record = h.store.get("u5").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(record.current_period_end, None);
        assert!(!record.is_founder_annual);
        assert_eq!(record.founder_claimed_at, None);
    }

    // =========================================================================
    // BILL-W06: Deletion without a user or without a record is acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_without_user_or_record() {
        let h = harness(10);
        let deleted = |id: &str, metadata: serde_json::Value| {
            event(
                id,
                "customer.subscription.deleted",
                T0,
                json!({
                    "id": "sub_6",
                    "customer": "cus_6",
                    "status": "canceled",
                    "metadata": metadata
                }),
            )
        };

        let outcome = h
            .billing
            .webhooks
            .handle_event(deleted("evt_w06a", json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored(IgnoreReason::MissingUser));

        let outcome = h
            .billing
            .webhooks
            .handle_event(deleted("evt_w06b", json!({ "user_id": "u6" })))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored(IgnoreReason::NoRecord));
        assert!(h.store.get("u6").await.unwrap().is_none());
    }

    // =========================================================================
    // BILL-W07: Unknown event types are acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_event_type_ignored() {
        let h = harness(10);

        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w07",
                "invoice.payment_succeeded",
                T0,
                json!({ "id": "in_1" }),
            ))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Ignored(IgnoreReason::UnhandledEventType(
                "invoice.payment_succeeded".to_string()
            ))
        );
    }

    // =========================================================================
    // BILL-W08: An older update arriving late does not regress the record
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_update_skipped() {
        let h = harness(10);
        let update = |id: &str, created: i64, status: &str| {
            event(
                id,
                "customer.subscription.updated",
                created,
                json!({
                    "id": "sub_8",
                    "customer": "cus_8",
                    "status": status,
                    "current_period_end": T0 + 86_400,
                    "metadata": { "user_id": "u8", "tier": "studio_monthly" }
                }),
            )
        };

        h.billing
            .webhooks
            .handle_event(update("evt_w08_new", T0 + 100, "past_due"))
            .await
            .unwrap();

        let outcome = h
            .billing
            .webhooks
            .handle_event(update("evt_w08_old", T0, "active"))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored(IgnoreReason::StaleEvent));

        let record = h.store.get("u8").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.plan, Plan::Studio);
    }

    // =========================================================================
    // BILL-W09: Provider failure surfaces as an error and redelivery recovers
    // =========================================================================
    #[tokio::test]
    async fn test_provider_failure_then_redelivery() {
        let h = harness(10);
        h.provider
            .add_subscription("sub_9", "cus_9", "trialing", Some(T0 + 86_400), &[]);
        h.provider.set_fail_retrieve(true);

        let checkout = event(
            "evt_w09",
            "checkout.session.completed",
            T0,
            json!({
                "id": "cs_9",
                "customer": "cus_9",
                "subscription": "sub_9",
                "metadata": { "user_id": "u9", "plan": "pro", "interval": "monthly" }
            }),
        );

        let err = h
            .billing
            .webhooks
            .handle_event(checkout.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::StripeApi(_)));
        assert!(!err.is_client_error());
        assert!(h.store.get("u9").await.unwrap().is_none());
        assert_eq!(
            h.store.event_result("evt_w09").unwrap().map(|(r, _)| r),
            Some(EventResult::Error)
        );

        h.provider.set_fail_retrieve(false);
        let outcome = h.billing.webhooks.handle_event(checkout).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));

        let record = h.store.get("u9").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Trialing);
        assert_eq!(
            h.store.event_result("evt_w09").unwrap().map(|(r, _)| r),
            Some(EventResult::Success)
        );
    }

    // =========================================================================
    // BILL-W10: Checkout user comes from the reference field, then stored ids
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_user_resolution_order() {
        let h = harness(10);

        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w10a",
                "checkout.session.completed",
                T0,
                json!({
                    "id": "cs_10a",
                    "customer": "cus_10",
                    "client_reference_id": "u10",
                    "metadata": { "plan": "starter" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                user_id: "u10".to_string(),
                founder_claimed: false
            }
        );

        // Neither metadata nor reference: the stored customer id identifies u10
        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w10b",
                "checkout.session.completed",
                T0 + 10,
                json!({
                    "id": "cs_10b",
                    "customer": "cus_10",
                    "metadata": { "tier": "elite_annual" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                user_id: "u10".to_string(),
                founder_claimed: false
            }
        );
        assert_eq!(h.store.get("u10").await.unwrap().unwrap().plan, Plan::Elite);

        // Nothing at all to go on
        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w10c",
                "checkout.session.completed",
                T0,
                json!({ "id": "cs_10c", "metadata": {} }),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored(IgnoreReason::MissingUser));
    }

    // =========================================================================
    // BILL-W11: Checkout without a subscription grants open-ended access
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_without_subscription() {
        let h = harness(10);

        h.billing
            .webhooks
            .handle_event(event(
                "evt_w11",
                "checkout.session.completed",
                T0,
                json!({
                    "id": "cs_11",
                    "customer": "cus_11",
                    "subscription": null,
                    "metadata": { "user_id": "u11", "tier": "studio_annual" }
                }),
            ))
            .await
            .unwrap();

        let record = h.store.get("u11").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.current_period_end, None);
        assert!(h.provider.retrieve_calls.lock().unwrap().is_empty());

        let view = h.billing.subscriptions.get_view("u11").await.unwrap();
        assert!(view.is_entitled(OffsetDateTime::now_utc()));
    }

    // =========================================================================
    // BILL-W12: Signature is checked before anything is parsed or written
    // =========================================================================
    #[tokio::test]
    async fn test_verify_event_signature_gate() {
        let h = harness(10);
        let payload = json!({
            "id": "evt_w12",
            "type": "customer.subscription.updated",
            "created": T0,
            "data": { "object": { "id": "sub_12", "status": "active", "metadata": { "user_id": "u12" } } }
        })
        .to_string();

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", now, payload).as_bytes());
        let header = format!("t={},v1={}", now, hex::encode(mac.finalize().into_bytes()));

        let err = h
            .billing
            .webhooks
            .verify_event(payload.as_bytes(), &format!("t={},v1=00ff", now))
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        // Garbage body with a bad signature is an authenticity failure, not a parse error
        let err = h
            .billing
            .webhooks
            .verify_event(b"not json", "t=1,v1=00")
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        let event = h
            .billing
            .webhooks
            .verify_event(payload.as_bytes(), &header)
            .unwrap();
        assert_eq!(event.id, "evt_w12");
        assert!(h.store.get("u12").await.unwrap().is_none());
    }

    // =========================================================================
    // BILL-W13: A returning founder does not get a second seat
    // =========================================================================
    #[tokio::test]
    async fn test_resubscribe_after_cancel_keeps_founder_cleared() {
        let h = harness(10);
        let founder_update = |id: &str, created: i64| {
            event(
                id,
                "customer.subscription.updated",
                created,
                json!({
                    "id": "sub_13",
                    "customer": "cus_13",
                    "status": "active",
                    "metadata": { "user_id": "u13", "tier": "founder_annual" }
                }),
            )
        };

        h.billing
            .webhooks
            .handle_event(founder_update("evt_w13a", T0))
            .await
            .unwrap();
        h.billing
            .webhooks
            .handle_event(event(
                "evt_w13b",
                "customer.subscription.deleted",
                T0 + 10,
                json!({ "id": "sub_13", "customer": "cus_13", "status": "canceled", "metadata": {} }),
            ))
            .await
            .unwrap();
        let outcome = h
            .billing
            .webhooks
            .handle_event(founder_update("evt_w13c", T0 + 20))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                user_id: "u13".to_string(),
                founder_claimed: false
            }
        );
        let record = h.store.get("u13").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert!(!record.is_founder_annual);
        assert_eq!(h.store.founder_counts().unwrap(), (1, 10));
    }

    // =========================================================================
    // BILL-W14: Malformed objects and unknown statuses are payload errors
    // =========================================================================
    #[tokio::test]
    async fn test_malformed_object_is_client_error() {
        let h = harness(10);

        let err = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w14a",
                "customer.subscription.updated",
                T0,
                json!({ "customer": "cus_14" }),
            ))
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        let err = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_w14b",
                "customer.subscription.updated",
                T0,
                json!({ "id": "sub_14", "status": "exploded", "metadata": { "user_id": "u14" } }),
            ))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(h.store.get("u14").await.unwrap().is_none());
    }

    // =========================================================================
    // BILL-W15: Partial subscription metadata refines, never resets, the plan
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_partial_subscription_metadata_keeps_session_plan() {
        let h = harness(10);
        h.provider.add_subscription(
            "sub_15",
            "cus_15",
            "active",
            Some(T0 + 2_592_000),
            &[("interval", "monthly")],
        );

        h.billing
            .webhooks
            .handle_event(event(
                "evt_w15",
                "checkout.session.completed",
                T0,
                json!({
                    "id": "cs_15",
                    "customer": "cus_15",
                    "subscription": "sub_15",
                    "metadata": { "user_id": "u15", "tier": "pro_monthly" }
                }),
            ))
            .await
            .unwrap();

        let record = h.store.get("u15").await.unwrap().unwrap();
        assert_eq!(record.plan, Plan::Pro);
        assert_eq!(record.interval, BillingInterval::Monthly);
    }

    // =========================================================================
    // BILL-W16: An update to canceled is as terminal as a deletion
    // =========================================================================
    #[tokio::test]
    async fn test_update_to_canceled_clears_period_and_founder() {
        let h = harness(10);
        h.billing
            .webhooks
            .handle_event(event(
                "evt_w16a",
                "customer.subscription.created",
                T0,
                json!({
                    "id": "sub_16",
                    "customer": "cus_16",
                    "status": "active",
                    "current_period_end": T0 + 31_536_000,
                    "metadata": { "user_id": "u16", "tier": "founder_annual" }
                }),
            ))
            .await
            .unwrap();
        assert!(h.store.get("u16").await.unwrap().unwrap().is_founder_annual);

        h.billing
            .webhooks
            .handle_event(event(
                "evt_w16b",
                "customer.subscription.updated",
                T0 + 10,
                json!({
                    "id": "sub_16",
                    "customer": "cus_16",
                    "status": "canceled",
                    "current_period_end": T0 + 31_536_000,
                    "metadata": { "user_id": "u16", "tier": "founder_annual" }
                }),
            ))
            .await
            .unwrap();

        let record = h.store.get("u16").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(record.current_period_end, None);
        assert!(!record.is_founder_annual);
        assert_eq!(record.founder_claimed_at, None);
    }

    // =========================================================================
    // BILL-W17: A canceled update in the same second as the deletion
    // =========================================================================
    #[tokio::test]
    async fn test_deleted_then_canceled_update_same_second() {
        let h = harness(10);
        let mut seeded = record("u17");
        seeded.stripe_subscription_id = Some("sub_17".to_string());
        seeded.current_period_end = Some(datetime!(2030-01-01 00:00 UTC));
        h.store.insert_record(seeded).unwrap();

        h.billing
            .webhooks
            .handle_event(event(
                "evt_w17a",
                "customer.subscription.deleted",
                T0,
                json!({ "id": "sub_17", "customer": "cus_17", "status": "canceled", "metadata": {} }),
            ))
            .await
            .unwrap();
        h.billing
            .webhooks
            .handle_event(event(
                "evt_w17b",
                "customer.subscription.updated",
                T0,
                json!({
                    "id": "sub_17",
                    "customer": "cus_17",
                    "status": "canceled",
                    "current_period_end": T0 + 31_536_000,
                    "metadata": { "user_id": "u17" }
                }),
            ))
            .await
            .unwrap();

        let record = h.store.get("u17").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(record.current_period_end, None);
        assert!(!record.is_founder_annual);
    }
}

#[cfg(test)]
mod founder_tests {
    use std::sync::Arc;

    use serde_json::json;
    use time::OffsetDateTime;
    use tokio::sync::Barrier;

    use super::support::*;
    use crate::plans::{Plan, SubscriptionStatus};
    use crate::store::{FounderSlots, InMemoryBillingStore, SubscriptionStore};
    use crate::webhooks::WebhookOutcome;

    // =========================================================================
    // BILL-F01: Two users racing for the last seat, exactly one wins
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_claims_respect_limit() {
        let store = Arc::new(InMemoryBillingStore::new(1));
        store.insert_record(record("ua")).unwrap();
        store.insert_record(record("ub")).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];

        for user in ["ua", "ub"] {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                store.try_claim(user, OffsetDateTime::now_utc()).await.unwrap()
            }));
        }

        let mut results = vec![];
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|claimed| **claimed).count(), 1);
        assert_eq!(results.iter().filter(|claimed| !**claimed).count(), 1);
        assert_eq!(store.founder_counts().unwrap(), (1, 1));
    }

    // =========================================================================
    // BILL-F02: Repeated claims for the same user consume one seat
    // =========================================================================
    #[tokio::test]
    async fn test_claim_is_idempotent_per_user() {
        let store = InMemoryBillingStore::new(5);
        store.insert_record(record("u1")).unwrap();

        assert!(store.try_claim("u1", OffsetDateTime::now_utc()).await.unwrap());
        assert!(!store.try_claim("u1", OffsetDateTime::now_utc()).await.unwrap());
        assert!(!store.try_claim("u1", OffsetDateTime::now_utc()).await.unwrap());

        assert_eq!(store.founder_counts().unwrap(), (1, 5));
        let record = store.get("u1").await.unwrap().unwrap();
        assert!(record.is_founder_annual);
        assert!(record.founder_claimed_at.is_some());
    }

    // =========================================================================
    // BILL-F03: An exhausted pool leaves the founder plan without the flag
    // =========================================================================
    #[tokio::test]
    async fn test_exhausted_pool() {
        let h = harness(0);

        let outcome = h
            .billing
            .webhooks
            .handle_event(event(
                "evt_f03",
                "customer.subscription.created",
                1_730_000_000,
                json!({
                    "id": "sub_f03",
                    "customer": "cus_f03",
                    "status": "active",
                    "metadata": { "user_id": "u_late", "tier": "founder_annual" }
                }),
            ))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                user_id: "u_late".to_string(),
                founder_claimed: false
            }
        );
        let record = h.store.get("u_late").await.unwrap().unwrap();
        assert_eq!(record.plan, Plan::Founder);
        assert!(!record.is_founder_annual);
        assert_eq!(h.store.founder_counts().unwrap(), (0, 0));
    }

    // =========================================================================
    // BILL-F04: Only active or trialing founder subscriptions claim
    // =========================================================================
    #[tokio::test]
    async fn test_past_due_founder_does_not_claim() {
        let h = harness(3);

        h.billing
            .webhooks
            .handle_event(event(
                "evt_f04",
                "customer.subscription.created",
                1_730_000_000,
                json!({
                    "id": "sub_f04",
                    "customer": "cus_f04",
                    "status": "incomplete",
                    "metadata": { "user_id": "u_f04", "tier": "founder_annual" }
                }),
            ))
            .await
            .unwrap();

        let record = h.store.get("u_f04").await.unwrap().unwrap();
        assert_eq!(record.status, SubscriptionStatus::Incomplete);
        assert!(!record.is_founder_annual);
        assert_eq!(h.store.founder_counts().unwrap(), (0, 3));
    }

    // =========================================================================
    // BILL-F05: Many concurrent founder checkouts never overrun the pool
    // =========================================================================
    #[tokio::test]
    async fn test_many_concurrent_founder_events() {
        let h = harness(3);
        let webhooks = Arc::new(h.billing.webhooks.clone());
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];

        for i in 0..8 {
            let webhooks = Arc::clone(&webhooks);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                webhooks
                    .handle_event(event(
                        &format!("evt_f05_{}", i),
                        "customer.subscription.created",
                        1_730_000_000,
                        json!({
                            "id": format!("sub_f05_{}", i),
                            "customer": format!("cus_f05_{}", i),
                            "status": "active",
                            "metadata": { "user_id": format!("u_f05_{}", i), "tier": "founder_annual" }
                        }),
                    ))
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if let WebhookOutcome::Processed {
                founder_claimed: true,
                ..
            } = handle.await.unwrap()
            {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(h.store.founder_counts().unwrap(), (3, 3));
    }
}

#[cfg(test)]
mod portal_tests {
    use std::sync::atomic::Ordering;

    use super::support::*;
    use crate::error::BillingError;
    use crate::portal::{PortalOutcome, DEFAULT_RETURN_PATH};
    use crate::store::SubscriptionStore;

    fn seeded(h: &Harness, customer: Option<&str>, subscription: Option<&str>) {
        let mut rec = record("u_portal");
        rec.stripe_customer_id = customer.map(str::to_string);
        rec.stripe_subscription_id = subscription.map(str::to_string);
        h.store.insert_record(rec).unwrap();
    }

    // =========================================================================
    // BILL-P01: Stale customer id is repaired from the live subscription
    // =========================================================================
    #[tokio::test]
    async fn test_stale_customer_repaired() {
        let h = harness(0);
        seeded(&h, Some("cus_old"), Some("sub_1"));
        h.provider
            .add_subscription("sub_1", "cus_new", "active", None, &[]);
        h.provider.add_customer("cus_new");

        let outcome = h
            .billing
            .portal
            .create_portal_session("u_portal", Some("/settings/billing"))
            .await
            .unwrap();

        match outcome {
            PortalOutcome::Session(session) => assert!(session.url.ends_with("cus_new")),
            other => panic!("expected a session, got {:?}", other),
        }

        let record = h.store.get("u_portal").await.unwrap().unwrap();
        assert_eq!(record.stripe_customer_id.as_deref(), Some("cus_new"));

        let calls = h.provider.portal_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "cus_old");
        assert_eq!(calls[1].0, "cus_new");
        assert_eq!(calls[1].1, format!("{}/settings/billing", APP_BASE_URL));
    }

    // =========================================================================
    // BILL-P02: No subscription on file clears the customer id
    // =========================================================================
    #[tokio::test]
    async fn test_unrepairable_without_subscription() {
        let h = harness(0);
        seeded(&h, Some("cus_old"), None);

        let outcome = h
            .billing
            .portal
            .create_portal_session("u_portal", None)
            .await
            .unwrap();

        assert_eq!(outcome, PortalOutcome::NoBillingCustomer);
        let record = h.store.get("u_portal").await.unwrap().unwrap();
        assert_eq!(record.stripe_customer_id, None);
    }

    // =========================================================================
    // BILL-P03: Failed re-fetch clears the customer id
    // =========================================================================
    #[tokio::test]
    async fn test_unrepairable_when_refetch_fails() {
        let h = harness(0);
        seeded(&h, Some("cus_old"), Some("sub_gone"));
        h.provider.set_fail_retrieve(true);

        let outcome = h
            .billing
            .portal
            .create_portal_session("u_portal", None)
            .await
            .unwrap();

        assert_eq!(outcome, PortalOutcome::NoBillingCustomer);
        assert_eq!(
            h.store.get("u_portal").await.unwrap().unwrap().stripe_customer_id,
            None
        );
    }

    // =========================================================================
    // BILL-P04: Users without a record need a checkout
    // =========================================================================
    #[tokio::test]
    async fn test_no_record() {
        let h = harness(0);

        let outcome = h
            .billing
            .portal
            .create_portal_session("u_nobody", None)
            .await
            .unwrap();

        assert_eq!(outcome, PortalOutcome::NoBillingCustomer);
        assert!(h.provider.portal_calls.lock().unwrap().is_empty());
    }

    // =========================================================================
    // BILL-P05: Valid customer opens directly; unsafe return paths are replaced
    // =========================================================================
    #[tokio::test]
    async fn test_valid_customer_and_return_path() {
        let h = harness(0);
        seeded(&h, Some("cus_ok"), Some("sub_ok"));
        h.provider.add_customer("cus_ok");

        let outcome = h
            .billing
            .portal
            .create_portal_session("u_portal", Some("https://evil.example/phish"))
            .await
            .unwrap();

        assert!(matches!(outcome, PortalOutcome::Session(_)));
        let calls = h.provider.portal_calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, format!("{}{}", APP_BASE_URL, DEFAULT_RETURN_PATH));
        assert!(h.provider.retrieve_calls.lock().unwrap().is_empty());
    }

    // =========================================================================
    // BILL-P06: Transient provider errors are not mistaken for a missing customer
    // =========================================================================
    #[tokio::test]
    async fn test_transient_portal_error_propagates() {
        let h = harness(0);
        seeded(&h, Some("cus_ok"), Some("sub_ok"));
        h.provider.add_customer("cus_ok");
        h.provider.fail_portal.store(true, Ordering::SeqCst);

        let err = h
            .billing
            .portal
            .create_portal_session("u_portal", None)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::StripeApi(_)));
        assert_eq!(
            h.store.get("u_portal").await.unwrap().unwrap().stripe_customer_id.as_deref(),
            Some("cus_ok")
        );
    }
}
