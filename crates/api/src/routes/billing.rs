//! Billing routes for the dashboard

use axum::{
    extract::{Extension, State},
    Json,
};
use glowdesk_billing::{BillingInterval, Plan, PortalOutcome, PortalResponse, SubscriptionView};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct PortalRequest {
    pub return_path: Option<String>,
}

/// POST /api/v1/billing/portal
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<PortalRequest>>,
) -> ApiResult<Json<PortalResponse>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    match state
        .billing
        .portal
        .create_portal_session(&auth_user.user_id, request.return_path.as_deref())
        .await?
    {
        PortalOutcome::Session(response) => Ok(Json(response)),
        PortalOutcome::NoBillingCustomer => Err(ApiError::NoStripeCustomer),
    }
}

/// Entitlement view of the caller's subscription
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    /// Stored status, or `inactive` when the user never subscribed
    pub status: String,
    pub plan: Plan,
    pub interval: Option<BillingInterval>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub is_founder_annual: bool,
    pub entitled: bool,
}

impl SubscriptionResponse {
    fn from_view(view: SubscriptionView, now: OffsetDateTime) -> Self {
        let entitled = view.is_entitled(now);
        Self {
            status: view
                .status
                .map_or_else(|| "inactive".to_string(), |s| s.as_str().to_string()),
            plan: view.plan,
            interval: view.interval,
            current_period_end: view.current_period_end,
            is_founder_annual: view.is_founder_annual,
            entitled,
        }
    }
}

/// GET /api/v1/billing/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let view = state
        .billing
        .subscriptions
        .get_view(&auth_user.user_id)
        .await?;

    Ok(Json(SubscriptionResponse::from_view(
        view,
        OffsetDateTime::now_utc(),
    )))
}
