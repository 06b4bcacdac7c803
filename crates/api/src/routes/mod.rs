//! HTTP routes

mod billing;
mod webhooks;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::require_auth,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/api/v1/billing/portal", post(billing::create_portal_session))
        .route("/api/v1/billing/subscription", get(billing::get_subscription))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        // Stripe authenticates itself with the signature header
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(authenticated)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Health check query failed");
            ApiError::Internal
        })?;

    Ok(Json(json!({ "status": "ok" })))
}
