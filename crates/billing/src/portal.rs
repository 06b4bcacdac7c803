//! Stripe Billing Portal
//!
//! Opening the portal needs a customer id the provider still recognizes.
//! Customer ids written before the test-to-live key migration are unknown to
//! the live account, so a rejected id is repaired from the live subscription
//! and the portal call is retried once.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::{SubscriptionRecord, SubscriptionStore};

/// Where the portal sends the user back to when no path is requested
pub const DEFAULT_RETURN_PATH: &str = "/dashboard/billing";

/// Result of a portal request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalOutcome {
    Session(PortalResponse),
    /// The user has no usable billing customer and needs a fresh checkout
    NoBillingCustomer,
}

/// Response for creating a portal session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

/// Portal service for Stripe billing portal sessions
#[derive(Clone)]
pub struct PortalService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
    app_base_url: String,
}

impl PortalService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
        app_base_url: String,
    ) -> Self {
        Self {
            store,
            provider,
            app_base_url,
        }
    }

    /// Create a billing portal session for a user
    pub async fn create_portal_session(
        &self,
        user_id: &str,
        return_path: Option<&str>,
    ) -> BillingResult<PortalOutcome> {
        let Some(record) = self.store.get(user_id).await? else {
            return Ok(PortalOutcome::NoBillingCustomer);
        };

        let return_url = self.return_url(return_path);

        if let Some(customer_id) = record.stripe_customer_id.as_deref() {
            match self.provider.create_portal_session(customer_id, &return_url).await {
                Ok(url) => {
                    tracing::info!(
                        user_id = %user_id,
                        customer_id = %customer_id,
                        "Created billing portal session"
                    );
                    return Ok(PortalOutcome::Session(PortalResponse { url }));
                }
                Err(BillingError::CustomerMissing(_)) => {
                    tracing::warn!(
                        user_id = %user_id,
                        customer_id = %customer_id,
                        "Stored Stripe customer rejected, attempting repair"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.repair_and_retry(&record, &return_url).await
    }

    /// Recover the live customer id from the subscription and retry once
    async fn repair_and_retry(
        &self,
        record: &SubscriptionRecord,
        return_url: &str,
    ) -> BillingResult<PortalOutcome> {
        let Some(subscription_id) = record.stripe_subscription_id.as_deref() else {
            return self.give_up(record, "no subscription on file").await;
        };

        let live_customer = match self.provider.retrieve_subscription(subscription_id).await {
            Ok(subscription) => subscription.customer_id().map(str::to_string),
            Err(e) => {
                tracing::warn!(
                    user_id = %record.user_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Could not re-fetch subscription for customer repair"
                );
                None
            }
        };

        let Some(live_customer) = live_customer else {
            return self.give_up(record, "subscription has no live customer").await;
        };

        match self
            .provider
            .create_portal_session(&live_customer, return_url)
            .await
        {
            Ok(url) => {
                self.store
                    .set_customer_id(&record.user_id, Some(&live_customer))
                    .await?;
                tracing::info!(
                    user_id = %record.user_id,
                    old_customer_id = ?record.stripe_customer_id,
                    new_customer_id = %live_customer,
                    "Repaired Stripe customer id"
                );
                Ok(PortalOutcome::Session(PortalResponse { url }))
            }
            Err(BillingError::CustomerMissing(_)) => {
                self.give_up(record, "live customer rejected").await
            }
            Err(e) => Err(e),
        }
    }

    async fn give_up(&self, record: &SubscriptionRecord, reason: &str) -> BillingResult<PortalOutcome> {
        if record.stripe_customer_id.is_some() {
            self.store.set_customer_id(&record.user_id, None).await?;
        }
        tracing::info!(
            user_id = %record.user_id,
            reason = %reason,
            "No usable Stripe customer, user needs a fresh checkout"
        );
        Ok(PortalOutcome::NoBillingCustomer)
    }

    fn return_url(&self, return_path: Option<&str>) -> String {
        format!(
            "{}{}",
            self.app_base_url.trim_end_matches('/'),
            sanitize_return_path(return_path)
        )
    }
}

/// Only same-site absolute paths are accepted as return targets
pub fn sanitize_return_path(path: Option<&str>) -> &str {
    match path {
        Some(p) if p.starts_with('/') && !p.starts_with("//") && !p.contains('\\') => p,
        _ => DEFAULT_RETURN_PATH,
    }
}
