//! Identity resolution
//!
//! Maps provider identifiers back to an application user when the event
//! itself does not say who it belongs to.

use std::sync::Arc;

use crate::error::BillingResult;
use crate::store::SubscriptionStore;

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn SubscriptionStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Look the user up by subscription id or customer id in one query. When
    /// several records match, the most recently updated one wins.
    ///
    /// `None` means no stored record references either id; callers treat that
    /// as "ignore the event", never as an error.
    pub async fn resolve(
        &self,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> BillingResult<Option<String>> {
        if subscription_id.is_none() && customer_id.is_none() {
            return Ok(None);
        }

        let user_id = self
            .store
            .find_user_by_billing_ids(subscription_id, customer_id)
            .await?;

        match &user_id {
            Some(user_id) => tracing::debug!(
                user_id = %user_id,
                subscription_id = ?subscription_id,
                customer_id = ?customer_id,
                "Resolved user from stored billing ids"
            ),
            None => tracing::debug!(
                subscription_id = ?subscription_id,
                customer_id = ?customer_id,
                "No stored record references these billing ids"
            ),
        }

        Ok(user_id)
    }
}
