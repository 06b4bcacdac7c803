//! Stripe webhook handling
//!
//! Verifies inbound events, suppresses duplicate deliveries, and dispatches
//! subscription lifecycle events onto the stored subscription records.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::founder::FounderService;
use crate::identity::IdentityResolver;
use crate::normalize::normalize;
use crate::payloads::{CheckoutSessionObject, EventKind, SubscriptionObject, WebhookEvent};
use crate::plans::SubscriptionStatus;
use crate::provider::BillingProvider;
use crate::store::{EventClaim, EventResult, SubscriptionWrite, UpsertOutcome, WebhookLedger, WriteOrdering};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Why an authentic event was acknowledged without changing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No user could be tied to the event
    MissingUser,
    /// The stored record already reflects a newer event
    StaleEvent,
    /// Cancellation for a user without a record
    NoRecord,
    /// Already processed, or being processed by another request
    Duplicate,
    UnhandledEventType(String),
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::MissingUser => "missing_user",
            IgnoreReason::StaleEvent => "stale_event",
            IgnoreReason::NoRecord => "no_record",
            IgnoreReason::Duplicate => "duplicate",
            IgnoreReason::UnhandledEventType(_) => "unhandled_event_type",
        }
    }
}

/// Outcome of handling one authentic event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed { user_id: String, founder_claimed: bool },
    Ignored(IgnoreReason),
}

impl WebhookOutcome {
    fn ledger_result(&self) -> EventResult {
        match self {
            WebhookOutcome::Processed { .. } => EventResult::Success,
            WebhookOutcome::Ignored(_) => EventResult::Ignored,
        }
    }
}

/// Verify a `Stripe-Signature` style header against the raw payload.
///
/// The header is `t=<unix seconds>,v1=<hex hmac>[,v1=...]`. The signed
/// message is `"{t}.{payload}"`, keyed with the full webhook secret. Any one
/// matching `v1` entry is accepted so secrets can be rolled.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let drift = now.abs_diff(timestamp);
    if drift > tolerance_secs.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = drift,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    subscriptions: SubscriptionService,
    identity: IdentityResolver,
    founder: FounderService,
    provider: Arc<dyn BillingProvider>,
    ledger: Arc<dyn WebhookLedger>,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(
        subscriptions: SubscriptionService,
        identity: IdentityResolver,
        founder: FounderService,
        provider: Arc<dyn BillingProvider>,
        ledger: Arc<dyn WebhookLedger>,
        webhook_secret: String,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            subscriptions,
            identity,
            founder,
            provider,
            ledger,
            webhook_secret,
            tolerance_secs,
        }
    }

    /// Verify the signature and parse the event envelope.
    ///
    /// Nothing is parsed before the signature checks out.
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            self.tolerance_secs,
            now,
        )?;

        let event: WebhookEvent = serde_json::from_slice(payload)?;
        Ok(event)
    }

    /// Handle a verified event exactly once.
    ///
    /// Redeliveries of an event that already succeeded or was ignored are
    /// acknowledged without reprocessing. Errors are recorded and returned so
    /// the provider redelivers.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let event_at = event_timestamp(&event);

        match self
            .ledger
            .claim_event(&event.id, &event.event_type, event_at)
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::AlreadySeen(previous) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    previous_result = %previous.as_str(),
                    "Duplicate webhook event, skipping"
                );
                return Ok(WebhookOutcome::Ignored(IgnoreReason::Duplicate));
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.dispatch(&event).await;

        let (ledger_result, error_message) = match &result {
            Ok(outcome) => (outcome.ledger_result(), None),
            Err(e) => (EventResult::Error, Some(e.to_string())),
        };

        // A failed ledger update leaves the row in `processing`, which the
        // stale-claim recovery picks up later; the event outcome still stands.
        if let Err(e) = self
            .ledger
            .finish_event(&event.id, ledger_result, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook processing failed"
            );
        }

        result
    }

    /// Route an event to its lifecycle handler without ledger bookkeeping
    pub async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event.kind() {
            EventKind::CheckoutSessionCompleted => {
                let session: CheckoutSessionObject = parse_object(event)?;
                self.handle_checkout_completed(event, &session).await
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                let subscription: SubscriptionObject = parse_object(event)?;
                self.handle_subscription_changed(event, &subscription).await
            }
            EventKind::SubscriptionDeleted => {
                let subscription: SubscriptionObject = parse_object(event)?;
                self.handle_subscription_deleted(event, &subscription).await
            }
            EventKind::Other(event_type) => {
                tracing::info!(event_type = %event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored(IgnoreReason::UnhandledEventType(
                    event_type,
                )))
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        event: &WebhookEvent,
        session: &CheckoutSessionObject,
    ) -> BillingResult<WebhookOutcome> {
        let intent = normalize(&session.metadata, None);

        let user_id = match intent.user_id.clone().or_else(|| {
            session
                .client_reference_id
                .clone()
                .filter(|r| !r.trim().is_empty())
        }) {
            Some(user_id) => Some(user_id),
            None => {
                self.identity
                    .resolve(session.subscription_id(), session.customer_id())
                    .await?
            }
        };

        let Some(user_id) = user_id else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout completed without a resolvable user, ignoring"
            );
            return Ok(WebhookOutcome::Ignored(IgnoreReason::MissingUser));
        };

        // Session payloads lack live status and period end; the subscription
        // itself is the source of truth for both.
        let (intent, status, period_end, customer_id) = match session.subscription_id() {
            Some(subscription_id) => {
                let live = self.provider.retrieve_subscription(subscription_id).await?;
                let status = parse_status(&live.status)?;
                let customer_id = session
                    .customer_id()
                    .or_else(|| live.customer_id())
                    .map(str::to_string);
                let refined = intent.refined_by(normalize(&live.metadata, live.tier.as_deref()));
                (refined, status, live.period_end(), customer_id)
            }
            None => (
                intent,
                SubscriptionStatus::Active,
                None,
                session.customer_id().map(str::to_string),
            ),
        };

        let write = SubscriptionWrite {
            user_id: user_id.clone(),
            stripe_customer_id: customer_id,
            stripe_subscription_id: session.subscription_id().map(str::to_string),
            plan: intent.plan,
            interval: intent.interval,
            status,
            current_period_end: period_end.map(from_unix),
            event_at: event_timestamp(event),
            ordering: WriteOrdering::Authoritative,
        };

        self.apply(write).await
    }

    async fn handle_subscription_changed(
        &self,
        event: &WebhookEvent,
        subscription: &SubscriptionObject,
    ) -> BillingResult<WebhookOutcome> {
        let intent = normalize(&subscription.metadata, subscription.tier.as_deref());

        let user_id = match intent.user_id.clone() {
            Some(user_id) => Some(user_id),
            None => {
                self.identity
                    .resolve(Some(&subscription.id), subscription.customer_id())
                    .await?
            }
        };

        let Some(user_id) = user_id else {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription event for unknown user, ignoring"
            );
            return Ok(WebhookOutcome::Ignored(IgnoreReason::MissingUser));
        };

        let write = SubscriptionWrite {
            user_id,
            stripe_customer_id: subscription.customer_id().map(str::to_string),
            stripe_subscription_id: Some(subscription.id.clone()),
            plan: intent.plan,
            interval: intent.interval,
            status: parse_status(&subscription.status)?,
            current_period_end: subscription.period_end().map(from_unix),
            event_at: event_timestamp(event),
            ordering: WriteOrdering::Guarded,
        };

        self.apply(write).await
    }

    async fn handle_subscription_deleted(
        &self,
        event: &WebhookEvent,
        subscription: &SubscriptionObject,
    ) -> BillingResult<WebhookOutcome> {
        let intent = normalize(&subscription.metadata, subscription.tier.as_deref());

        let user_id = match intent.user_id {
            Some(user_id) => Some(user_id),
            None => {
                self.identity
                    .resolve(Some(&subscription.id), subscription.customer_id())
                    .await?
            }
        };

        let Some(user_id) = user_id else {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription deleted for unknown user, ignoring"
            );
            return Ok(WebhookOutcome::Ignored(IgnoreReason::MissingUser));
        };

        match self
            .subscriptions
            .cancel(&user_id, Some(&subscription.id), event_timestamp(event))
            .await?
        {
            Some(_) => Ok(WebhookOutcome::Processed {
                user_id,
                founder_claimed: false,
            }),
            None => {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    "Subscription deleted for user without a record, ignoring"
                );
                Ok(WebhookOutcome::Ignored(IgnoreReason::NoRecord))
            }
        }
    }

    /// Upsert, then attempt the founder claim on the written record
    async fn apply(&self, write: SubscriptionWrite) -> BillingResult<WebhookOutcome> {
        let record = match self.subscriptions.upsert(&write).await? {
            UpsertOutcome::Applied(record) => record,
            UpsertOutcome::Stale => return Ok(WebhookOutcome::Ignored(IgnoreReason::StaleEvent)),
        };

        let founder_claimed = self.founder.claim_if_eligible(&record).await?;

        Ok(WebhookOutcome::Processed {
            user_id: record.user_id,
            founder_claimed,
        })
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        BillingError::WebhookPayloadInvalid(format!(
            "{} object did not match expected shape: {}",
            event.event_type, e
        ))
    })
}

fn parse_status(status: &str) -> BillingResult<SubscriptionStatus> {
    SubscriptionStatus::parse(status).ok_or_else(|| {
        BillingError::WebhookPayloadInvalid(format!("unknown subscription status: {}", status))
    })
}

fn event_timestamp(event: &WebhookEvent) -> OffsetDateTime {
    from_unix(event.created)
}

fn from_unix(secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(secs).unwrap_or_else(|_| OffsetDateTime::now_utc())
}
