//! Stripe client and configuration
//!
//! Thin wrapper over the async-stripe client plus the price-id table that
//! maps storefront plans to Stripe prices.

use std::sync::Arc;

use stripe::RequestStrategy;

use crate::error::{BillingError, BillingResult};
use nnaudio_shared::SubscriptionPlan;

/// Stripe price IDs for the three storefront plans.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub monthly: String,
    pub annual: String,
    pub lifetime: String,
}

/// Stripe configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = require_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();

        let price_ids = PriceIds {
            monthly: require_env("STRIPE_PRICE_ID_MONTHLY")?,
            annual: require_env("STRIPE_PRICE_ID_ANNUAL")?,
            lifetime: require_env("STRIPE_PRICE_ID_LIFETIME")?,
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids,
        })
    }

    /// Price ID for a plan. `None` for the "none" plan, which has no price.
    pub fn price_id_for_plan(&self, plan: SubscriptionPlan) -> Option<&str> {
        match plan {
            SubscriptionPlan::Monthly => Some(&self.price_ids.monthly),
            SubscriptionPlan::Annual => Some(&self.price_ids.annual),
            SubscriptionPlan::Lifetime => Some(&self.price_ids.lifetime),
            SubscriptionPlan::None => None,
        }
    }

    /// Reverse lookup: which plan does this Stripe price belong to?
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<SubscriptionPlan> {
        if price_id == self.price_ids.monthly {
            Some(SubscriptionPlan::Monthly)
        } else if price_id == self.price_ids.annual {
            Some(SubscriptionPlan::Annual)
        } else if price_id == self.price_ids.lifetime {
            Some(SubscriptionPlan::Lifetime)
        } else {
            None
        }
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} not configured", name)))
}

/// Shared Stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Client that sends the given idempotency key with its requests.
    /// Used to collapse concurrent customer-creation calls.
    pub fn with_idempotency_key(&self, key: &str) -> stripe::Client {
        self.inner
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }

    /// Client pointed at a local mock server instead of api.stripe.com.
    #[cfg(test)]
    pub(crate) fn with_base_url(config: StripeConfig, base_url: &str) -> Self {
        Self {
            inner: stripe::Client::from_url(base_url, config.secret_key.clone()),
            config: Arc::new(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".into(),
            webhook_secret: "whsec_test".into(),
            price_ids: PriceIds {
                monthly: "price_monthly".into(),
                annual: "price_annual".into(),
                lifetime: "price_lifetime".into(),
            },
        }
    }

    #[test]
    fn price_lookup_round_trips() {
        let config = test_config();
        for plan in [
            SubscriptionPlan::Monthly,
            SubscriptionPlan::Annual,
            SubscriptionPlan::Lifetime,
        ] {
            let price_id = config.price_id_for_plan(plan).unwrap();
            assert_eq!(config.plan_for_price_id(price_id), Some(plan));
        }
    }

    #[test]
    fn none_plan_has_no_price() {
        let config = test_config();
        assert!(config.price_id_for_plan(SubscriptionPlan::None).is_none());
        assert!(config.plan_for_price_id("price_unknown").is_none());
    }
}
