// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NNAudio Billing Module
//!
//! Handles Stripe integration for the storefront and customer accounts.
//!
//! ## Features
//!
//! - **Customer Resolution**: Find-or-create Stripe customers by email with
//!   idempotent creation and stale-id repair
//! - **Checkout**: Plan and cart checkout sessions with duplicate-purchase
//!   guards and automatic promotions
//! - **Reconciliation**: Resolve owned products from payment history across
//!   three independent Stripe sources
//! - **Order History**: Account-page order projections with receipt links
//! - **Webhooks**: Verified, idempotent handling of Stripe events

pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod orders;
pub mod reconcile;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CartCheckoutRequest, CheckoutService, PlanCheckoutRequest};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Customer
pub use customer::{CustomerService, ResolvedCustomer};

// Error
pub use error::{BillingError, BillingResult};

// Orders
pub use orders::{Order, OrderMetadata, OrderService};

// Reconciliation
pub use reconcile::{
    PaymentRecord, PurchasedProducts, PurchaserIdentity, ReconciliationService, SourceKind,
    SourceReport, SourceStatus,
};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub customer: CustomerService,
    pub orders: OrderService,
    pub reconciliation: ReconciliationService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool, site_url: &str) -> BillingResult<Self> {
        Ok(Self::with_client(StripeClient::from_env()?, pool, site_url))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool, site_url: &str) -> Self {
        Self::with_client(StripeClient::new(config), pool, site_url)
    }

    fn with_client(stripe: StripeClient, pool: PgPool, site_url: &str) -> Self {
        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone(), site_url),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            orders: OrderService::new(stripe.clone()),
            reconciliation: ReconciliationService::new(stripe.clone()),
            webhooks: WebhookHandler::new(stripe, pool),
        }
    }
}
