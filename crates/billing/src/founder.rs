//! Founder offer
//!
//! A fixed number of annual founder seats exist. A seat is taken the first
//! time a founder-plan subscription is seen active or trialing, and it is
//! never taken twice for the same user.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::plans::Plan;
use crate::store::{FounderSlots, SubscriptionRecord};

#[derive(Clone)]
pub struct FounderService {
    slots: Arc<dyn FounderSlots>,
}

impl FounderService {
    pub fn new(slots: Arc<dyn FounderSlots>) -> Self {
        Self { slots }
    }

    /// Whether a freshly written record should try to take a seat
    pub fn is_eligible(record: &SubscriptionRecord) -> bool {
        record.plan == Plan::Founder
            && record.status.allows_founder_claim()
            && !record.is_founder_annual
    }

    /// Claim a seat for the record's user if eligible.
    ///
    /// Returns `true` only when a seat was taken by this call. An exhausted
    /// pool leaves the subscription as it is.
    pub async fn claim_if_eligible(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        if !Self::is_eligible(record) {
            return Ok(false);
        }

        let claimed_at = OffsetDateTime::now_utc();
        if !self.slots.try_claim(&record.user_id, claimed_at).await? {
            tracing::info!(
                user_id = %record.user_id,
                "Founder seat not granted (pool exhausted or already claimed)"
            );
            return Ok(false);
        }

        tracing::info!(user_id = %record.user_id, "Founder seat claimed");
        Ok(true)
    }
}
