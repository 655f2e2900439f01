//! API error taxonomy and its HTTP mapping

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chorequest_billing::{BillingError, SubscriptionRequired};
use chorequest_shared::RateLimited;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Account is inactive")]
    AccountInactive,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("Too many attempts. Try again in {retry_after_secs} seconds.")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    SubscriptionRequired(#[from] SubscriptionRequired),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Billing provider error")]
    BillingUpstream(String),

    #[error("Database error")]
    Database(String),

    #[error("Internal error")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::AccountInactive => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SubscriptionRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BillingUpstream(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable tag carried in the `error` field
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AccountInactive => "account_inactive",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::SubscriptionRequired(_) => "subscription_required",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::BillingUpstream(_) => "billing_unavailable",
            Self::Database(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        match &self {
            Self::Database(detail) | Self::Internal(detail) | Self::BillingUpstream(detail) => {
                tracing::error!(error = %detail, "Internal API error");
            }
            _ => {}
        }

        if let Self::SubscriptionRequired(required) = &self {
            let body = Json(json!({
                "error": code,
                "message": required.message,
                "child_count": required.child_count,
                "free_limit": required.free_limit,
            }));
            return (status, body).into_response();
        }

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
            "code": status.as_u16(),
        }));

        let mut response = (status, body).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs),
            );
        }
        response
    }
}

impl From<RateLimited> for ApiError {
    fn from(limited: RateLimited) -> Self {
        ApiError::RateLimited {
            retry_after_secs: limited.retry_after_secs,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid | BillingError::InvalidPayload(_) => {
                ApiError::BadRequest("Webhook processing failed".to_string())
            }
            BillingError::NotAvailable => {
                ApiError::NotFound("Billing is not available in this deployment".to_string())
            }
            BillingError::FamilyNotFound(_) => ApiError::NotFound("Family not found".to_string()),
            BillingError::StripeApi(detail) => ApiError::BillingUpstream(detail),
            BillingError::Database(detail) => ApiError::Database(detail),
        }
    }
}
