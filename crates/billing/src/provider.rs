//! Payment provider seam
//!
//! The reconciler only needs two calls from the provider. Keeping them behind
//! a trait lets the webhook and portal flows run against a scripted provider
//! in tests.

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::payloads::SubscriptionObject;

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch the current state of a subscription
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionObject>;

    /// Create a self-service billing portal session and return its URL.
    ///
    /// Returns [`BillingError::CustomerMissing`](crate::BillingError::CustomerMissing)
    /// when the provider no longer knows the customer.
    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> BillingResult<String>;
}
