//! Billing Consistency Verification
//!
//! Runs the stored-state invariant checks, then compares every live
//! subscription record against what Stripe currently reports.
//!
//! ## Usage
//! ```bash
//! cargo run --bin verify_billing_consistency > drift_report.csv
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - STRIPE_SECRET_KEY: Stripe API key (production or test mode)
//! - STRIPE_WEBHOOK_SECRET: required by the shared Stripe config loader
//!
//! ## Output
//! Progress on stderr, CSV drift report on stdout with columns:
//! user_id, issue_type, db_value, stripe_value, recommendation

use anyhow::Context;
use glowdesk_billing::{
    BillingProvider, InvariantChecker, SubscriptionStatus, StripeClient,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, sqlx::FromRow)]
struct LiveRecordRow {
    user_id: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: String,
    status: String,
}

struct DriftRow {
    user_id: String,
    issue_type: &'static str,
    db_value: String,
    stripe_value: String,
    recommendation: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = glowdesk_shared::create_pool(&database_url).await?;
    let stripe = StripeClient::from_env()?;

    eprintln!("Glowdesk Billing Consistency Verification");
    eprintln!("=========================================\n");

    // ========================================================================
    // Stored-state invariants
    // ========================================================================
    let summary = InvariantChecker::new(pool.clone()).run_all_checks().await?;
    eprintln!(
        "Invariants: {}/{} checks passed",
        summary.checks_passed, summary.checks_run
    );
    for violation in &summary.violations {
        eprintln!(
            "  [{}] {}: {}",
            violation.severity, violation.invariant, violation.description
        );
    }

    // ========================================================================
    // Stripe drift
    // ========================================================================
    eprintln!("\nComparing live subscriptions with Stripe...");

    let rows: Vec<LiveRecordRow> = sqlx::query_as(
        r#"
        SELECT user_id, stripe_customer_id, stripe_subscription_id, status
        FROM subscriptions
        WHERE stripe_subscription_id IS NOT NULL
          AND status <> 'canceled'
        ORDER BY updated_at DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut drift = Vec::new();
    for row in rows {
        let live = match stripe.retrieve_subscription(&row.stripe_subscription_id).await {
            Ok(live) => live,
            Err(e) => {
                drift.push(DriftRow {
                    user_id: row.user_id,
                    issue_type: "subscription_unreachable",
                    db_value: row.stripe_subscription_id,
                    stripe_value: e.to_string(),
                    recommendation: "Check for test/live key mismatch",
                });
                continue;
            }
        };

        let live_status = SubscriptionStatus::parse(&live.status)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| live.status.clone());
        if live_status != row.status {
            drift.push(DriftRow {
                user_id: row.user_id.clone(),
                issue_type: "status_mismatch",
                db_value: row.status.clone(),
                stripe_value: live_status,
                recommendation: "Replay the latest customer.subscription.updated event",
            });
        }

        let live_customer = live.customer_id().map(str::to_string);
        if live_customer.is_some() && live_customer != row.stripe_customer_id {
            drift.push(DriftRow {
                user_id: row.user_id,
                issue_type: "customer_mismatch",
                db_value: row.stripe_customer_id.unwrap_or_default(),
                stripe_value: live_customer.unwrap_or_default(),
                recommendation: "Repaired automatically on next billing portal visit",
            });
        }
    }

    println!("user_id,issue_type,db_value,stripe_value,recommendation");
    for row in &drift {
        println!(
            "{},{},{},{},{}",
            csv_field(&row.user_id),
            row.issue_type,
            csv_field(&row.db_value),
            csv_field(&row.stripe_value),
            csv_field(row.recommendation)
        );
    }

    eprintln!(
        "\nDone: {} invariant violations, {} drift rows",
        summary.violations.len(),
        drift.len()
    );

    if !summary.healthy || !drift.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
