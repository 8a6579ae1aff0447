//! Customer resolution
//!
//! Finds or creates the Stripe customer for an email address, and repairs
//! profiles that point at a customer Stripe no longer knows about.
//!
//! Customer creation is guarded by an hour-bucketed idempotency key so that
//! rapid duplicate signups (double clicks, retried requests) within the same
//! UTC hour collapse onto one Stripe customer. The create-then-recheck loops
//! below cover the remaining race where two processes pass the lookup before
//! either has created the customer.

use sqlx::PgPool;
use std::time::Duration;
use stripe::{CreateCustomer, Customer, CustomerId, ListCustomers};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// How a checkout customer was resolved.
#[derive(Debug, Clone)]
pub struct ResolvedCustomer {
    pub customer_id: String,
    /// True when the stored customer_id was stale and replaced via email.
    pub repaired: bool,
}

pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Find an existing Stripe customer for this email or create one.
    pub async fn find_or_create(&self, email: &str) -> BillingResult<String> {
        let normalized = normalize_email(email);

        let mut list_params = ListCustomers::new();
        list_params.email = Some(&normalized);
        list_params.limit = Some(10);

        let existing = Customer::list(self.stripe.inner(), &list_params).await?;
        if let Some(customer) = existing.data.first() {
            if existing.data.len() > 1 {
                tracing::warn!(
                    email = %normalized,
                    count = existing.data.len(),
                    "Multiple Stripe customers share this email, using the most recent"
                );
            }
            return Ok(customer.id.to_string());
        }

        let idempotency_key = idempotency_key_for_email(&normalized, OffsetDateTime::now_utc());
        let client = self.stripe.with_idempotency_key(&idempotency_key);

        let mut create_params = CreateCustomer::new();
        create_params.email = Some(&normalized);

        match Customer::create(&client, create_params).await {
            Ok(customer) => Ok(customer.id.to_string()),
            Err(create_err) => {
                // Another request may have created the customer between our
                // lookup and the create call. Re-check before giving up.
                tokio::time::sleep(Duration::from_millis(100)).await;
                if let Some(id) = self.lookup_one(&normalized).await? {
                    tracing::info!(
                        email = %normalized,
                        customer_id = %id,
                        "Customer found on retry after creation error"
                    );
                    return Ok(id);
                }

                let err_str = create_err.to_string();
                if err_str.contains("idempotency") {
                    // Key collision means a concurrent create is in flight;
                    // give it a little longer to land.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    if let Some(id) = self.lookup_one(&normalized).await? {
                        return Ok(id);
                    }
                }

                tracing::error!(email = %normalized, error = %err_str, "Failed to create customer");
                Err(create_err.into())
            }
        }
    }

    /// Resolve the customer for a checkout request.
    ///
    /// A stored `customer_id` is validated against Stripe; if Stripe no
    /// longer knows it and an email is available, the customer is re-resolved
    /// by email and the stale `profiles.customer_id` is repaired (best
    /// effort, checkout proceeds even if the repair fails).
    pub async fn resolve(
        &self,
        customer_id: Option<&str>,
        email: Option<&str>,
    ) -> BillingResult<ResolvedCustomer> {
        match (customer_id, email) {
            (Some(id), _) => {
                let parsed: CustomerId = id
                    .parse()
                    .map_err(|_| BillingError::CustomerNotFound(id.to_string()))?;

                match Customer::retrieve(self.stripe.inner(), &parsed, &[]).await {
                    Ok(customer) if !customer.deleted => Ok(ResolvedCustomer {
                        customer_id: id.to_string(),
                        repaired: false,
                    }),
                    Ok(_) | Err(_) => {
                        tracing::warn!(
                            customer_id = %id,
                            "Customer not found in Stripe, attempting to re-resolve by email"
                        );
                        let Some(email) = email else {
                            return Err(BillingError::CustomerNotFound(id.to_string()));
                        };
                        let replacement = self.find_or_create(email).await?;
                        self.repair_profile_customer_id(id, &replacement).await;
                        Ok(ResolvedCustomer {
                            customer_id: replacement,
                            repaired: true,
                        })
                    }
                }
            }
            (None, Some(email)) => Ok(ResolvedCustomer {
                customer_id: self.find_or_create(email).await?,
                repaired: false,
            }),
            (None, None) => Err(BillingError::CustomerRequired),
        }
    }

    async fn lookup_one(&self, normalized_email: &str) -> BillingResult<Option<String>> {
        let mut list_params = ListCustomers::new();
        list_params.email = Some(normalized_email);
        list_params.limit = Some(1);

        let found = Customer::list(self.stripe.inner(), &list_params).await?;
        Ok(found.data.first().map(|c| c.id.to_string()))
    }

    /// Replace a stale customer_id on whatever profile still carries it.
    /// Failures are logged and swallowed; the checkout must not be blocked.
    async fn repair_profile_customer_id(&self, stale_id: &str, new_id: &str) {
        let result = sqlx::query("UPDATE profiles SET customer_id = $1 WHERE customer_id = $2")
            .bind(new_id)
            .bind(stale_id)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) if done.rows_affected() > 0 => {
                tracing::info!(
                    stale_id = %stale_id,
                    new_id = %new_id,
                    "Repaired stale customer_id on profile"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to repair customer_id in database");
            }
        }
    }
}

/// Lowercase and trim an email so case differences cannot mint duplicate
/// Stripe customers.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Idempotency key for customer creation: the sanitized email plus the
/// current UTC hour, so all signups within the hour share one key and a
/// failed attempt becomes retryable once the hour rolls over. Stripe caps
/// keys at 255 characters.
pub fn idempotency_key_for_email(normalized_email: &str, now: OffsetDateTime) -> String {
    let sanitized: String = normalized_email
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '_'
            }
        })
        .collect();

    let hour_key = format!(
        "{:04}{:02}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour()
    );

    let mut key = format!("cust_{}_{}", sanitized, hour_key);
    key.truncate(255);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  User@Example.COM "), "user@example.com");
    }

    #[test]
    fn idempotency_key_is_stable_within_hour() {
        let a = idempotency_key_for_email("user@example.com", datetime!(2025-03-01 14:05 UTC));
        let b = idempotency_key_for_email("user@example.com", datetime!(2025-03-01 14:59 UTC));
        assert_eq!(a, b);
        assert_eq!(a, "cust_user_example_com_2025030114");
    }

    #[test]
    fn idempotency_key_changes_across_hours() {
        let a = idempotency_key_for_email("user@example.com", datetime!(2025-03-01 14:59 UTC));
        let b = idempotency_key_for_email("user@example.com", datetime!(2025-03-01 15:00 UTC));
        assert_ne!(a, b);
    }

    #[test]
    fn idempotency_key_is_capped_at_stripe_limit() {
        let long_email = format!("{}@example.com", "a".repeat(300));
        let key = idempotency_key_for_email(&normalize_email(&long_email), datetime!(2025-03-01 14:00 UTC));
        assert!(key.len() <= 255);
    }
}
