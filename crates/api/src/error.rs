//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use glowdesk_billing::BillingError;
use serde_json::json;

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No billing customer on file, start a new checkout")]
    NoStripeCustomer,

    #[error("Internal server error")]
    Internal,

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NoStripeCustomer => StatusCode::NOT_FOUND,
            Self::Billing(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Internal | Self::Billing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NoStripeCustomer => "no_stripe_customer",
            Self::Billing(BillingError::WebhookSignatureInvalid) => "invalid_signature",
            Self::Billing(BillingError::WebhookPayloadInvalid(_)) => "invalid_payload",
            Self::Internal | Self::Billing(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal details stay in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = ?self, "Internal API error");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": self.error_code(),
            "message": message,
        }));

        (status, body).into_response()
    }
}
