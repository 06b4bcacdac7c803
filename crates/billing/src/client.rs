//! Stripe client wrapper

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CreateBillingPortalSession, CustomerId, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus,
};

use crate::error::{BillingError, BillingResult};
use crate::payloads::{ExpandableId, SubscriptionObject};
use crate::provider::BillingProvider;

/// Default webhook timestamp tolerance in seconds
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Base URL of the dashboard, used to build portal return URLs
    pub app_base_url: String,
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let app_base_url = std::env::var("APP_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());
        let webhook_tolerance_secs = match std::env::var("WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse::<i64>().map_err(|_| {
                BillingError::Config(format!("WEBHOOK_TOLERANCE_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET is empty".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            app_base_url,
            webhook_tolerance_secs,
        })
    }
}

/// Stripe client with configuration
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(&config.secret_key);
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionObject> {
        let parsed_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))?;

        let subscription = Subscription::retrieve(self.inner(), &parsed_id, &[]).await?;
        Ok(subscription_object(&subscription))
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> BillingResult<String> {
        // A malformed stored id can never open a portal; treat it like a deleted customer
        let parsed_id = customer_id
            .parse::<CustomerId>()
            .map_err(|_| BillingError::CustomerMissing(customer_id.to_string()))?;

        let mut params = CreateBillingPortalSession::new(parsed_id);
        params.return_url = Some(return_url);

        match BillingPortalSession::create(self.inner(), params).await {
            Ok(session) => Ok(session.url),
            Err(stripe::StripeError::Stripe(request_error))
                if is_missing_customer(&request_error) =>
            {
                Err(BillingError::CustomerMissing(customer_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn is_missing_customer(err: &stripe::RequestError) -> bool {
    matches!(err.code, Some(stripe::ErrorCode::ResourceMissing))
        || err
            .message
            .as_deref()
            .map(|m| m.contains("No such customer"))
            .unwrap_or(false)
}

fn subscription_object(subscription: &Subscription) -> SubscriptionObject {
    let status = match subscription.status {
        StripeSubStatus::Active => "active",
        StripeSubStatus::Trialing => "trialing",
        StripeSubStatus::PastDue => "past_due",
        StripeSubStatus::Canceled => "canceled",
        StripeSubStatus::Unpaid => "unpaid",
        StripeSubStatus::Incomplete => "incomplete",
        StripeSubStatus::IncompleteExpired => "incomplete_expired",
        StripeSubStatus::Paused => "paused",
    };

    let metadata: HashMap<String, String> = subscription.metadata.clone();

    SubscriptionObject {
        id: subscription.id.to_string(),
        customer: Some(ExpandableId::Id(subscription.customer.id().to_string())),
        status: status.to_string(),
        current_period_end: Some(subscription.current_period_end),
        metadata,
        tier: None,
        items: None,
    }
}
