//! PostgreSQL billing store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::{BillingInterval, Plan, SubscriptionStatus};
use crate::store::{
    EventClaim, EventResult, FounderSlots, SubscriptionRecord, SubscriptionStore,
    SubscriptionWrite, UpsertOutcome, WebhookLedger, WriteOrdering, STALE_PROCESSING_AFTER,
};

const SUBSCRIPTION_COLUMNS: &str = "user_id, stripe_customer_id, stripe_subscription_id, plan, \
     billing_interval, status, current_period_end, is_founder_annual, founder_claimed_at, \
     last_event_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    plan: String,
    billing_interval: String,
    status: String,
    current_period_end: Option<OffsetDateTime>,
    is_founder_annual: bool,
    founder_claimed_at: Option<OffsetDateTime>,
    last_event_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let plan = Plan::parse(&row.plan)
            .ok_or_else(|| BillingError::Internal(format!("unknown stored plan: {}", row.plan)))?;
        let interval = BillingInterval::parse(&row.billing_interval).ok_or_else(|| {
            BillingError::Internal(format!(
                "unknown stored billing interval: {}",
                row.billing_interval
            ))
        })?;
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Internal(format!("unknown stored status: {}", row.status))
        })?;

        Ok(SubscriptionRecord {
            user_id: row.user_id,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            plan,
            interval,
            status,
            current_period_end: row.current_period_end,
            is_founder_annual: row.is_founder_annual,
            founder_claimed_at: row.founder_claimed_at,
            last_event_at: row.last_event_at,
            updated_at: row.updated_at,
        })
    }
}

/// Billing state stored in PostgreSQL
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the founder pool row if it does not exist yet.
    ///
    /// An existing pool keeps its size; changing the limit later is a
    /// deliberate data migration.
    pub async fn ensure_founder_pool(&self, max_spots: i32) -> BillingResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO founder_offer (id, max_spots, claimed_spots)
            VALUES (1, $1, 0)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(max_spots)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::info!(max_spots = max_spots, "Founder pool initialized");
        }
        Ok(())
    }

    /// Returns (claimed, max) founder seats, if the pool exists
    pub async fn founder_counts(&self) -> BillingResult<Option<(i32, i32)>> {
        let counts: Option<(i32, i32)> =
            sqlx::query_as("SELECT claimed_spots, max_spots FROM founder_offer WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(counts)
    }

    async fn update_event_result(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn find_user_by_billing_ids(
        &self,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
    ) -> BillingResult<Option<String>> {
        if subscription_id.is_none() && customer_id.is_none() {
            return Ok(None);
        }

        let user: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM subscriptions
            WHERE ($1::TEXT IS NOT NULL AND stripe_subscription_id = $1)
               OR ($2::TEXT IS NOT NULL AND stripe_customer_id = $2)
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user.map(|(user_id,)| user_id))
    }

    async fn upsert(&self, write: &SubscriptionWrite) -> BillingResult<UpsertOutcome> {
        let guarded = write.ordering == WriteOrdering::Guarded;

        // $9 toggles the ordering guard so one statement serves both modes
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                user_id, stripe_customer_id, stripe_subscription_id, plan, billing_interval,
                status, current_period_end, last_event_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id, subscriptions.stripe_subscription_id),
                plan = EXCLUDED.plan,
                billing_interval = EXCLUDED.billing_interval,
                status = EXCLUDED.status,
                current_period_end = EXCLUDED.current_period_end,
                is_founder_annual = CASE WHEN EXCLUDED.status = 'canceled'
                    THEN FALSE ELSE subscriptions.is_founder_annual END,
                founder_claimed_at = CASE WHEN EXCLUDED.status = 'canceled'
                    THEN NULL ELSE subscriptions.founder_claimed_at END,
                last_event_at = GREATEST(subscriptions.last_event_at, EXCLUDED.last_event_at),
                updated_at = NOW()
            WHERE NOT $9
               OR subscriptions.last_event_at IS NULL
               OR subscriptions.last_event_at <= EXCLUDED.last_event_at
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(&write.user_id)
        .bind(&write.stripe_customer_id)
        .bind(&write.stripe_subscription_id)
        .bind(write.plan.as_str())
        .bind(write.interval.as_str())
        .bind(write.status.as_str())
        .bind(write.period_end_to_store())
        .bind(write.event_at)
        .bind(guarded)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(UpsertOutcome::Applied(row.try_into()?)),
            None => Ok(UpsertOutcome::Stale),
        }
    }

    async fn mark_canceled(
        &self,
        user_id: &str,
        subscription_id: Option<&str>,
        event_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                status = 'canceled',
                current_period_end = NULL,
                is_founder_annual = FALSE,
                founder_claimed_at = NULL,
                stripe_subscription_id = COALESCE($2, stripe_subscription_id),
                last_event_at = GREATEST(last_event_at, $3),
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .bind(subscription_id)
        .bind(event_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn set_customer_id(&self, user_id: &str, customer_id: Option<&str>) -> BillingResult<()> {
        sqlx::query(
            "UPDATE subscriptions SET stripe_customer_id = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FounderSlots for PgBillingStore {
    async fn try_claim(&self, user_id: &str, claimed_at: OffsetDateTime) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Concurrent claims for the same user serialize on the primary key
        let ledger: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO founder_claims (user_id, claimed_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(user_id)
        .bind(claimed_at)
        .fetch_optional(&mut *tx)
        .await?;

        if ledger.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        // The row lock on the counter serializes claims across users
        let taken: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE founder_offer
            SET claimed_spots = claimed_spots + 1, updated_at = NOW()
            WHERE id = 1 AND claimed_spots < max_spots
            RETURNING claimed_spots
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some((claimed,)) = taken else {
            tx.rollback().await?;
            return Ok(false);
        };

        let flagged = sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_founder_annual = TRUE, founder_claimed_at = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(claimed_at)
        .execute(&mut *tx)
        .await?;

        if flagged.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(BillingError::NotFound(format!(
                "subscription for user {}",
                user_id
            )));
        }

        tx.commit().await?;
        tracing::debug!(user_id = %user_id, claimed = claimed, "Founder seat taken");
        Ok(true)
    }
}

#[async_trait]
impl WebhookLedger for PgBillingStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let stale_before = OffsetDateTime::now_utc() - STALE_PROCESSING_AFTER;

        // Errored rows and rows stuck in processing may be claimed again
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < $4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_at)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let result = existing
            .and_then(|(status,)| EventResult::parse(&status))
            .unwrap_or(EventResult::Processing);
        Ok(EventClaim::AlreadySeen(result))
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        if let Err(e) = self.update_event_result(event_id, result, error_message).await {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to update webhook event failed, retrying..."
            );

            if let Err(retry_err) = self.update_event_result(event_id, result, error_message).await {
                tracing::error!(
                    event_id = %event_id,
                    processing_result = %result.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to update webhook ledger after retry; event may stay in 'processing'"
                );
                return Err(retry_err.into());
            }
        }
        Ok(())
    }
}
