//! Billing Invariants Module
//!
//! Read-only consistency checks over the stored subscription state. They can
//! be run after a webhook replay or a manual data fix to confirm the records,
//! the founder pool and the webhook ledger still agree with each other.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<String>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access granted or seats consumed incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Usually transient, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FounderWithoutClaimRow {
    user_id: String,
    founder_claimed_at: Option<OffsetDateTime>,
    has_ledger_row: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct FounderPoolRow {
    max_spots: i32,
    claimed_spots: i32,
    ledger_rows: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledLeftoverRow {
    user_id: String,
    current_period_end: Option<OffsetDateTime>,
    is_founder_annual: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct FounderPlanMismatchRow {
    user_id: String,
    plan: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    user_id: String,
    plan: String,
    status: String,
    stripe_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_result: String,
    error_message: Option<String>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_founder_flag_has_claim().await?);
        violations.extend(self.check_founder_pool_consistent().await?);
        violations.extend(self.check_canceled_is_terminal().await?);
        violations.extend(self.check_founder_flag_plan().await?);
        violations.extend(self.check_entitled_has_customer().await?);
        violations.extend(self.check_webhook_events_settled().await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// Invariant 1: Every founder flag is backed by a claim
    async fn check_founder_flag_has_claim(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FounderWithoutClaimRow> = sqlx::query_as(
            r#"
            SELECT
                s.user_id,
                s.founder_claimed_at,
                EXISTS (SELECT 1 FROM founder_claims c WHERE c.user_id = s.user_id) AS has_ledger_row
            FROM subscriptions s
            WHERE s.is_founder_annual = TRUE
              AND (
                  s.founder_claimed_at IS NULL
                  OR NOT EXISTS (SELECT 1 FROM founder_claims c WHERE c.user_id = s.user_id)
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "founder_flag_has_claim".to_string(),
                description: format!(
                    "User '{}' is flagged founder without a recorded seat claim",
                    row.user_id
                ),
                context: serde_json::json!({
                    "founder_claimed_at": row.founder_claimed_at,
                    "has_ledger_row": row.has_ledger_row,
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: The seat counter matches the claim ledger and its limit
    async fn check_founder_pool_consistent(&self) -> BillingResult<Vec<InvariantViolation>> {
        let row: Option<FounderPoolRow> = sqlx::query_as(
            r#"
            SELECT
                o.max_spots,
                o.claimed_spots,
                (SELECT COUNT(*) FROM founder_claims) AS ledger_rows
            FROM founder_offer o
            WHERE o.id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(vec![]);
        };

        if row.claimed_spots <= row.max_spots && i64::from(row.claimed_spots) == row.ledger_rows {
            return Ok(vec![]);
        }

        Ok(vec![InvariantViolation {
            invariant: "founder_pool_consistent".to_string(),
            user_ids: vec![],
            description: format!(
                "Founder pool reports {} of {} seats claimed but the ledger holds {} claims",
                row.claimed_spots, row.max_spots, row.ledger_rows
            ),
            context: serde_json::json!({
                "max_spots": row.max_spots,
                "claimed_spots": row.claimed_spots,
                "ledger_rows": row.ledger_rows,
            }),
            severity: ViolationSeverity::Critical,
        }])
    }

    /// Invariant 3: Canceled records carry no period end or founder flag
    ///
    /// A `customer.subscription.updated` to `canceled` may precede the
    /// deletion event, so a short-lived violation is expected.
    async fn check_canceled_is_terminal(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledLeftoverRow> = sqlx::query_as(
            r#"
            SELECT user_id, current_period_end, is_founder_annual
            FROM subscriptions
            WHERE status = 'canceled'
              AND (current_period_end IS NOT NULL OR is_founder_annual = TRUE)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_is_terminal".to_string(),
                description: format!(
                    "Canceled subscription for '{}' still carries period end or founder status",
                    row.user_id
                ),
                context: serde_json::json!({
                    "current_period_end": row.current_period_end,
                    "is_founder_annual": row.is_founder_annual,
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Invariant 4: Founder flags only sit on founder-plan records
    async fn check_founder_flag_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FounderPlanMismatchRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan
            FROM subscriptions
            WHERE is_founder_annual = TRUE
              AND plan <> 'founder'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "founder_flag_plan".to_string(),
                description: format!(
                    "User '{}' keeps founder status on plan '{}'",
                    row.user_id, row.plan
                ),
                context: serde_json::json!({ "plan": row.plan }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: Paying users can reach the billing portal
    ///
    /// A missing customer id is repaired on the next portal visit when a
    /// subscription id is on file; without one the user is stuck.
    async fn check_entitled_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan, status, stripe_subscription_id
            FROM subscriptions
            WHERE status IN ('active', 'trialing', 'past_due')
              AND plan <> 'free'
              AND stripe_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let severity = if row.stripe_subscription_id.is_some() {
                    ViolationSeverity::Medium
                } else {
                    ViolationSeverity::High
                };
                InvariantViolation {
                    invariant: "entitled_has_customer".to_string(),
                    description: format!(
                        "User '{}' on plan '{}' ({}) has no Stripe customer",
                        row.user_id, row.plan, row.status
                    ),
                    context: serde_json::json!({
                        "plan": row.plan,
                        "status": row.status,
                        "stripe_subscription_id": row.stripe_subscription_id,
                    }),
                    user_ids: vec![row.user_id],
                    severity,
                }
            })
            .collect())
    }

    /// Invariant 6: No webhook event is stuck or left failed
    async fn check_webhook_events_settled(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_result, error_message
            FROM stripe_webhook_events
            WHERE processing_result = 'error'
               OR (processing_result = 'processing'
                   AND processing_started_at < NOW() - INTERVAL '30 minutes')
            ORDER BY created_at DESC
            LIMIT 100
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "webhook_events_settled".to_string(),
                user_ids: vec![],
                description: format!(
                    "Webhook event {} ({}) is '{}'",
                    row.stripe_event_id, row.event_type, row.processing_result
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "error_message": row.error_message,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "founder_flag_has_claim" => self.check_founder_flag_has_claim().await,
            "founder_pool_consistent" => self.check_founder_pool_consistent().await,
            "canceled_is_terminal" => self.check_canceled_is_terminal().await,
            "founder_flag_plan" => self.check_founder_flag_plan().await,
            "entitled_has_customer" => self.check_entitled_has_customer().await,
            "webhook_events_settled" => self.check_webhook_events_settled().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "founder_flag_has_claim",
            "founder_pool_consistent",
            "canceled_is_terminal",
            "founder_flag_plan",
            "entitled_has_customer",
            "webhook_events_settled",
        ]
    }
}
