//! Stripe webhook endpoint

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use glowdesk_billing::{BillingError, WebhookOutcome};
use serde::Serialize;

use crate::{error::ApiResult, state::AppState};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Acknowledgement returned to Stripe for every authentic event
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<&WebhookOutcome> for WebhookAck {
    fn from(outcome: &WebhookOutcome) -> Self {
        match outcome {
            WebhookOutcome::Processed { .. } => Self {
                received: true,
                outcome: "processed",
                reason: None,
            },
            WebhookOutcome::Ignored(reason) => Self {
                received: true,
                outcome: "ignored",
                reason: Some(reason.as_str()),
            },
        }
    }
}

/// POST /webhooks/stripe
///
/// The body is taken as raw bytes; the signature covers the exact payload.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook without signature header");
            BillingError::WebhookSignatureInvalid
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .inspect_err(|e| tracing::warn!(error = %e, "Rejected Stripe webhook"))?;

    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        "Received Stripe webhook"
    );

    let outcome = state.billing.webhooks.handle_event(event).await?;
    Ok(Json(WebhookAck::from(&outcome)))
}
