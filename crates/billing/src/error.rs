//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid plan type: {0}")]
    InvalidPlan(String),

    #[error("Customer ID is required for checkout")]
    CustomerRequired,

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    /// Duplicate lifetime purchase blocked at checkout time.
    #[error("Customer already owns a lifetime license")]
    LifetimeAlreadyPurchased,

    /// Duplicate subscription blocked at checkout time.
    #[error("Customer already has an active subscription")]
    ActiveSubscriptionExists { subscription_ids: Vec<String> },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Stable machine-readable code for checkout rejections, matching what
    /// the storefront client switches on.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            BillingError::LifetimeAlreadyPurchased => Some("LIFETIME_ALREADY_PURCHASED"),
            BillingError::ActiveSubscriptionExists { .. } => Some("ACTIVE_SUBSCRIPTION_EXISTS"),
            _ => None,
        }
    }
}
