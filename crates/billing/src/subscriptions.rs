//! Subscription records
//!
//! Writes reconciled subscription state and serves the entitlement view the
//! dashboard reads.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::plans::{BillingInterval, Plan, SubscriptionStatus};
use crate::store::{SubscriptionRecord, SubscriptionStore, SubscriptionWrite, UpsertOutcome};

/// Read model of a user's subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    /// `None` when the user has never had a subscription record
    pub status: Option<SubscriptionStatus>,
    pub plan: Plan,
    pub interval: Option<BillingInterval>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub is_founder_annual: bool,
}

impl SubscriptionView {
    /// View for a user with no record at all
    pub fn inactive() -> Self {
        Self {
            status: None,
            plan: Plan::Free,
            interval: None,
            current_period_end: None,
            is_founder_annual: false,
        }
    }

    /// Whether paid features are unlocked at `now`.
    ///
    /// Only `active` grants access. A missing period end means access is not
    /// time-bounded.
    pub fn is_entitled(&self, now: OffsetDateTime) -> bool {
        self.status == Some(SubscriptionStatus::Active)
            && self.current_period_end.map_or(true, |end| end > now)
    }
}

impl From<&SubscriptionRecord> for SubscriptionView {
    fn from(record: &SubscriptionRecord) -> Self {
        Self {
            status: Some(record.status),
            plan: record.plan,
            interval: Some(record.interval),
            current_period_end: record.current_period_end,
            is_founder_annual: record.is_founder_annual,
        }
    }
}

/// Subscription record service
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Write the desired state for a user, creating the record if needed
    pub async fn upsert(&self, write: &SubscriptionWrite) -> BillingResult<UpsertOutcome> {
        let outcome = self.store.upsert(write).await?;

        match &outcome {
            UpsertOutcome::Applied(record) => tracing::info!(
                user_id = %record.user_id,
                plan = %record.plan,
                interval = %record.interval,
                status = %record.status,
                subscription_id = ?record.stripe_subscription_id,
                "Subscription record synced"
            ),
            UpsertOutcome::Stale => tracing::info!(
                user_id = %write.user_id,
                event_at = %write.event_at,
                "Skipped subscription write older than stored state"
            ),
        }

        Ok(outcome)
    }

    /// Mark the user's subscription canceled; `None` when no record exists
    pub async fn cancel(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        event_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = self
            .store
            .mark_canceled(user_id, subscription_id, event_at)
            .await?;

        if record.is_some() {
            tracing::info!(
                user_id = %user_id,
                subscription_id = ?subscription_id,
                "Subscription canceled, founder status cleared"
            );
        }

        Ok(record)
    }

    /// Entitlement view for the dashboard
    pub async fn get_view(&self, user_id: &str) -> BillingResult<SubscriptionView> {
        Ok(self
            .store
            .get(user_id)
            .await?
            .as_ref()
            .map(SubscriptionView::from)
            .unwrap_or_else(SubscriptionView::inactive))
    }
}
