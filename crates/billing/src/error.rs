//! Billing error types

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook payload invalid: {0}")]
    InvalidPayload(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Billing is not available in this deployment mode")]
    NotAvailable,

    #[error("Family not found: {0}")]
    FamilyNotFound(Uuid),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request) => BillingError::StripeApi(
                request
                    .message
                    .unwrap_or_else(|| format!("Stripe returned status {}", request.http_status)),
            ),
            other => BillingError::StripeApi(other.to_string()),
        }
    }
}
