// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Handler wiring takes every collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Glowdesk Billing Module
//!
//! Keeps each studio's subscription record in step with what Stripe reports.
//!
//! ## Features
//!
//! - **Webhooks**: Verify, deduplicate and apply subscription lifecycle events
//! - **Normalization**: Read plan and interval from old and new metadata shapes
//! - **Identity Recovery**: Find the owning user from stored Stripe ids
//! - **Founder Offer**: Grant the limited annual founder seats exactly once per user
//! - **Billing Portal**: Open the Stripe portal, repairing stale customer ids
//! - **Invariants**: Read-only consistency checks over stored billing state

pub mod client;
pub mod error;
pub mod founder;
pub mod identity;
pub mod invariants;
pub mod normalize;
pub mod payloads;
pub mod plans;
pub mod portal;
pub mod postgres;
pub mod provider;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Founder
pub use founder::FounderService;

// Identity
pub use identity::IdentityResolver;

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Normalization
pub use normalize::{normalize, IntentSource, Metadata, NormalizedIntent};

// Plans
pub use plans::{BillingInterval, Plan, SubscriptionStatus, Tier};

// Portal
pub use portal::{PortalOutcome, PortalResponse, PortalService};

// Storage
pub use postgres::PgBillingStore;
pub use provider::BillingProvider;
pub use store::{
    BillingStore, FounderSlots, InMemoryBillingStore, SubscriptionRecord, SubscriptionStore,
    WebhookLedger,
};

// Subscriptions
pub use subscriptions::{SubscriptionService, SubscriptionView};

// Webhooks
pub use webhooks::{IgnoreReason, WebhookHandler, WebhookOutcome};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub portal: PortalService,
}

impl BillingService {
    /// Create a new billing service backed by Postgres and Stripe
    pub fn postgres(config: &StripeConfig, store: Arc<PgBillingStore>) -> Self {
        let stripe = StripeClient::new(config.clone());
        Self::new(config, store, Arc::new(stripe))
    }

    /// Wire the billing services over any store and provider
    pub fn new<S>(config: &StripeConfig, store: Arc<S>, provider: Arc<dyn BillingProvider>) -> Self
    where
        S: BillingStore + 'static,
    {
        let records: Arc<dyn SubscriptionStore> = store.clone();
        let slots: Arc<dyn FounderSlots> = store.clone();
        let ledger: Arc<dyn WebhookLedger> = store;

        let subscriptions = SubscriptionService::new(records.clone());
        let webhooks = WebhookHandler::new(
            subscriptions.clone(),
            IdentityResolver::new(records.clone()),
            FounderService::new(slots),
            provider.clone(),
            ledger,
            config.webhook_secret.clone(),
            config.webhook_tolerance_secs,
        );
        let portal = PortalService::new(records, provider, config.app_base_url.clone());

        Self {
            subscriptions,
            webhooks,
            portal,
        }
    }
}
