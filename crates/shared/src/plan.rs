//! Subscription plan enum
//!
//! Mirrors the `profiles.subscription` column. "none" is a real state,
//! not an absence: webhook handlers write it back when a subscription ends.

use serde::{Deserialize, Serialize};

/// Plan a customer can hold. At most one lifetime purchase and at most one
/// active subscription per customer (enforced best-effort at checkout time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SubscriptionPlan {
    None,
    Monthly,
    Annual,
    Lifetime,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::None => "none",
            SubscriptionPlan::Monthly => "monthly",
            SubscriptionPlan::Annual => "annual",
            SubscriptionPlan::Lifetime => "lifetime",
        }
    }

    /// Parse the column value. Unknown strings map to `None` so a bad row
    /// degrades to "no access" instead of failing the request.
    pub fn parse(s: &str) -> Self {
        match s {
            "monthly" => SubscriptionPlan::Monthly,
            "annual" => SubscriptionPlan::Annual,
            "lifetime" => SubscriptionPlan::Lifetime,
            _ => SubscriptionPlan::None,
        }
    }

    /// Whether this plan grants access to the full catalog.
    pub fn grants_all_products(&self) -> bool {
        !matches!(self, SubscriptionPlan::None)
    }

    /// Whether checkout for this plan is a one-time payment rather than a
    /// recurring subscription.
    pub fn is_one_time(&self) -> bool {
        matches!(self, SubscriptionPlan::Lifetime)
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_plans() {
        assert_eq!(SubscriptionPlan::parse("monthly"), SubscriptionPlan::Monthly);
        assert_eq!(SubscriptionPlan::parse("annual"), SubscriptionPlan::Annual);
        assert_eq!(
            SubscriptionPlan::parse("lifetime"),
            SubscriptionPlan::Lifetime
        );
        assert_eq!(SubscriptionPlan::parse("none"), SubscriptionPlan::None);
    }

    #[test]
    fn unknown_plan_degrades_to_none() {
        assert_eq!(SubscriptionPlan::parse("platinum"), SubscriptionPlan::None);
        assert_eq!(SubscriptionPlan::parse(""), SubscriptionPlan::None);
    }

    #[test]
    fn access_rules() {
        assert!(!SubscriptionPlan::None.grants_all_products());
        assert!(SubscriptionPlan::Monthly.grants_all_products());
        assert!(SubscriptionPlan::Lifetime.grants_all_products());
        assert!(SubscriptionPlan::Lifetime.is_one_time());
        assert!(!SubscriptionPlan::Annual.is_one_time());
    }
}
