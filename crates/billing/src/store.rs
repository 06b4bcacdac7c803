//! Storage seams for billing state
//!
//! Three small traits cover everything the reconciler persists: the per-user
//! subscription record, the founder seat pool, and the webhook delivery
//! ledger. [`PgBillingStore`](crate::postgres::PgBillingStore) backs them in
//! production; [`InMemoryBillingStore`] backs them in tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::plans::{BillingInterval, Plan, SubscriptionStatus};

/// Persisted subscription state for one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub plan: Plan,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub is_founder_annual: bool,
    pub founder_claimed_at: Option<OffsetDateTime>,
    /// Provider creation time of the newest event applied to this record
    pub last_event_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// How an upsert treats events older than the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrdering {
    /// Skip the write when the record already reflects a newer event
    Guarded,
    /// Always apply (the state was fetched fresh from the provider)
    Authoritative,
}

/// Desired subscription state produced from one event
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub user_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub plan: Plan,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub event_at: OffsetDateTime,
    pub ordering: WriteOrdering,
}

impl SubscriptionWrite {
    /// A canceled subscription never keeps a period end, whatever the event said
    pub fn period_end_to_store(&self) -> Option<OffsetDateTime> {
        match self.status {
            SubscriptionStatus::Canceled => None,
            _ => self.current_period_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied(SubscriptionRecord),
    /// A newer event was already applied; nothing was written
    Stale,
}

/// Result of trying to claim a webhook event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClaim {
    Claimed,
    /// Already processed or being processed; carries the stored result
    AlreadySeen(EventResult),
}

/// Processing result recorded in the webhook ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    Processing,
    Success,
    Ignored,
    Error,
}

impl EventResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventResult::Processing => "processing",
            EventResult::Success => "success",
            EventResult::Ignored => "ignored",
            EventResult::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(EventResult::Processing),
            "success" => Some(EventResult::Success),
            "ignored" => Some(EventResult::Ignored),
            "error" => Some(EventResult::Error),
            _ => None,
        }
    }
}

/// Events stuck in `processing` longer than this are assumed abandoned
pub const STALE_PROCESSING_AFTER: Duration = Duration::minutes(30);

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    /// Find the user whose record references either id. When several
    /// records match, the most recently updated wins.
    async fn find_user_by_billing_ids(
        &self,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> BillingResult<Option<String>>;

    /// Insert or update the record keyed by `write.user_id`.
    ///
    /// Provider ids already stored are never replaced by `None`. Founder
    /// fields are left untouched.
    async fn upsert(&self, write: &SubscriptionWrite) -> BillingResult<UpsertOutcome>;

    /// Mark an existing record canceled, drop its period end and clear
    /// founder status. Returns `None` when the user has no record.
    async fn mark_canceled(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        event_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Replace (or clear, with `None`) the stored customer id
    async fn set_customer_id(&self, user_id: &str, customer_id: Option<&str>) -> BillingResult<()>;
}

#[async_trait]
pub trait FounderSlots: Send + Sync {
    /// Atomically take one founder seat for `user_id` and flag their record
    /// with `claimed_at` in the same step.
    ///
    /// Returns `false` when the pool is exhausted or the user already took a
    /// seat at some point. Never takes more than one seat per user.
    async fn try_claim(&self, user_id: &str, claimed_at: OffsetDateTime) -> BillingResult<bool>;
}

#[async_trait]
pub trait WebhookLedger: Send + Sync {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}

/// Any backend able to hold all billing state
pub trait BillingStore: SubscriptionStore + FounderSlots + WebhookLedger {}

impl<T: SubscriptionStore + FounderSlots + WebhookLedger> BillingStore for T {}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Debug)]
struct LedgerEntry {
    result: EventResult,
    started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Debug, Default)]
struct FounderPool {
    max_spots: u32,
    claimed_spots: u32,
    claimants: HashSet<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: HashMap<String, SubscriptionRecord>,
    founder: FounderPool,
    events: HashMap<String, LedgerEntry>,
}

/// Mutex-guarded store used by tests and local tooling
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    state: Mutex<MemoryState>,
}

impl InMemoryBillingStore {
    pub fn new(founder_max_spots: u32) -> Self {
        let store = Self::default();
        if let Ok(mut state) = store.state.lock() {
            state.founder.max_spots = founder_max_spots;
        }
        store
    }

    fn lock(&self) -> BillingResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Internal("billing store lock poisoned".to_string()))
    }

    /// Returns (claimed, max) founder seats
    pub fn founder_counts(&self) -> BillingResult<(u32, u32)> {
        let state = self.lock()?;
        Ok((state.founder.claimed_spots, state.founder.max_spots))
    }

    /// Stored ledger result and error message for an event
    pub fn event_result(&self, event_id: &str) -> BillingResult<Option<(EventResult, Option<String>)>> {
        let state = self.lock()?;
        Ok(state
            .events
            .get(event_id)
            .map(|e| (e.result, e.error_message.clone())))
    }

    /// Seed a record directly, bypassing event ordering
    pub fn insert_record(&self, record: SubscriptionRecord) -> BillingResult<()> {
        let mut state = self.lock()?;
        state.subscriptions.insert(record.user_id.clone(), record);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn get(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.lock()?.subscriptions.get(user_id).cloned())
    }

    async fn find_user_by_billing_ids(
        &self,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> BillingResult<Option<String>> {
        let state = self.lock()?;

        if subscription_id.is_none() && customer_id.is_none() {
            return Ok(None);
        }

        let matches = |r: &SubscriptionRecord| {
            (subscription_id.is_some() && r.stripe_subscription_id.as_deref() == subscription_id)
                || (customer_id.is_some() && r.stripe_customer_id.as_deref() == customer_id)
        };

        Ok(state
            .subscriptions
            .values()
            .filter(|r| matches(r))
            .max_by_key(|r| r.updated_at)
            .map(|r| r.user_id.clone()))
    }

    async fn upsert(&self, write: &SubscriptionWrite) -> BillingResult<UpsertOutcome> {
        let mut state = self.lock()?;
        let now = OffsetDateTime::now_utc();

        let record = match state.subscriptions.get_mut(&write.user_id) {
            Some(existing) => {
                if write.ordering == WriteOrdering::Guarded
                    && existing.last_event_at.is_some_and(|seen| seen > write.event_at)
                {
                    return Ok(UpsertOutcome::Stale);
                }
                if write.stripe_customer_id.is_some() {
                    existing.stripe_customer_id = write.stripe_customer_id.clone();
                }
                if write.stripe_subscription_id.is_some() {
                    existing.stripe_subscription_id = write.stripe_subscription_id.clone();
                }
                existing.plan = write.plan;
                existing.interval = write.interval;
                existing.status = write.status;
                existing.current_period_end = write.period_end_to_store();
                if write.status == SubscriptionStatus::Canceled {
                    existing.is_founder_annual = false;
                    existing.founder_claimed_at = None;
                }
                existing.last_event_at = Some(
                    existing
                        .last_event_at
                        .map_or(write.event_at, |seen| seen.max(write.event_at)),
                );
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = SubscriptionRecord {
                    user_id: write.user_id.clone(),
                    stripe_customer_id: write.stripe_customer_id.clone(),
                    stripe_subscription_id: write.stripe_subscription_id.clone(),
                    plan: write.plan,
                    interval: write.interval,
                    status: write.status,
                    current_period_end: write.period_end_to_store(),
                    is_founder_annual: false,
                    founder_claimed_at: None,
                    last_event_at: Some(write.event_at),
                    updated_at: now,
                };
                state
                    .subscriptions
                    .insert(write.user_id.clone(), record.clone());
                record
            }
        };

        Ok(UpsertOutcome::Applied(record))
    }

    async fn mark_canceled(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        event_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut state = self.lock()?;
        let Some(record) = state.subscriptions.get_mut(user_id) else {
            return Ok(None);
        };

        record.status = SubscriptionStatus::Canceled;
        record.current_period_end = None;
        record.is_founder_annual = false;
        record.founder_claimed_at = None;
        if let Some(sub_id) = subscription_id {
            record.stripe_subscription_id = Some(sub_id.to_string());
        }
        record.last_event_at = Some(record.last_event_at.map_or(event_at, |seen| seen.max(event_at)));
        record.updated_at = OffsetDateTime::now_utc();
        Ok(Some(record.clone()))
    }

    async fn set_customer_id(&self, user_id: &str, customer_id: Option<&str>) -> BillingResult<()> {
        let mut state = self.lock()?;
        if let Some(record) = state.subscriptions.get_mut(user_id) {
            record.stripe_customer_id = customer_id.map(str::to_string);
            record.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}

#[async_trait]
impl FounderSlots for InMemoryBillingStore {
    async fn try_claim(&self, user_id: &str, claimed_at: OffsetDateTime) -> BillingResult<bool> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        if state.founder.claimants.contains(user_id)
            || state.founder.claimed_spots >= state.founder.max_spots
        {
            return Ok(false);
        }

        let record = state
            .subscriptions
            .get_mut(user_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))?;
        record.is_founder_annual = true;
        record.founder_claimed_at = Some(claimed_at);
        record.updated_at = OffsetDateTime::now_utc();

        state.founder.claimed_spots += 1;
        state.founder.claimants.insert(user_id.to_string());
        Ok(true)
    }
}

#[async_trait]
impl WebhookLedger for InMemoryBillingStore {
    async fn claim_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let mut state = self.lock()?;
        let now = OffsetDateTime::now_utc();

        if let Some(entry) = state.events.get_mut(event_id) {
            let abandoned = entry.result == EventResult::Processing
                && entry.started_at < now - STALE_PROCESSING_AFTER;
            if !(abandoned || entry.result == EventResult::Error) {
                return Ok(EventClaim::AlreadySeen(entry.result));
            }
            entry.result = EventResult::Processing;
            entry.started_at = now;
            entry.error_message = None;
            return Ok(EventClaim::Claimed);
        }

        state.events.insert(
            event_id.to_string(),
            LedgerEntry {
                result: EventResult::Processing,
                started_at: now,
                error_message: None,
            },
        );
        Ok(EventClaim::Claimed)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut state = self.lock()?;
        if let Some(entry) = state.events.get_mut(event_id) {
            entry.result = result;
            entry.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }
}
