//! API error taxonomy
//!
//! Every route error converts into a JSON body of the form
//! `{"success": false, "error": ...}` with the matching HTTP status.
//! Checkout rejections additionally expose their stable machine code so the
//! storefront client can switch on it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use nnaudio_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(format!("Database error: {}", e))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Billing(e) => match e {
                // Business rejections are client errors, not server faults.
                BillingError::LifetimeAlreadyPurchased
                | BillingError::ActiveSubscriptionExists { .. }
                | BillingError::InvalidPlan(_)
                | BillingError::CustomerRequired => StatusCode::BAD_REQUEST,
                BillingError::WebhookSignatureInvalid => StatusCode::BAD_REQUEST,
                BillingError::CustomerNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        let body = match &self {
            ApiError::Billing(e) => match e.code() {
                Some(code) => json!({
                    "success": false,
                    "error": code,
                    "message": e.to_string(),
                }),
                None => json!({ "success": false, "error": e.to_string() }),
            },
            other => json!({ "success": false, "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_rejections_are_bad_requests() {
        assert_eq!(
            ApiError::Billing(BillingError::LifetimeAlreadyPurchased).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Billing(BillingError::ActiveSubscriptionExists {
                subscription_ids: vec!["sub_1".into()]
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn stripe_failures_are_server_errors() {
        assert_eq!(
            ApiError::Billing(BillingError::StripeApi("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Internal("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
