//! Checkout session construction
//!
//! Builds Stripe Checkout sessions for the storefront's two purchase shapes:
//! subscription plans (monthly, annual, or the one-time lifetime license) and
//! cart purchases of individual products.
//!
//! Plan checkout enforces two business guards before touching Stripe
//! Checkout. A customer who already owns a lifetime license must not be sold
//! another, and a customer with a live subscription must not stack a second
//! one unless the request is an explicit plan change. Both guards fail open
//! on lookup errors and timeouts; blocking a legitimate sale is worse than
//! occasionally re-checking at webhook time.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CheckoutSessionPaymentMethodCollection, Charge, Coupon,
    CouponId, CreateCheckoutSession, CreateCheckoutSessionDiscounts,
    CreateCheckoutSessionInvoiceCreation, CreateCheckoutSessionInvoiceCreationInvoiceData,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, CreateCheckoutSessionPaymentIntentData,
    Currency, CustomerId, ListCharges, ListInvoices, ListPaymentIntents, ListSubscriptions,
    PaymentIntent, Price, PriceId, SubscriptionStatus, SubscriptionStatusFilter,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use nnaudio_shared::{CartItem, SubscriptionPlan};

/// Bound on each guard signal so a slow Stripe list cannot stall checkout.
const GUARD_TIMEOUT: Duration = Duration::from_secs(5);

/// A plan checkout request, after route-level validation.
#[derive(Debug, Clone)]
pub struct PlanCheckoutRequest {
    pub plan: SubscriptionPlan,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub user_id: Option<Uuid>,
    /// When false the session uses `payment_method_collection: if_required`
    /// (free-trial style flows).
    pub collect_payment_method: bool,
    /// Plan changes skip the active-subscription guard; the old subscription
    /// is swapped out after the new one is paid.
    pub is_plan_change: bool,
}

/// A cart checkout request: ad-hoc line items priced from the cart.
#[derive(Debug, Clone)]
pub struct CartCheckoutRequest {
    pub email: String,
    pub user_id: Option<Uuid>,
    pub items: Vec<CartItem>,
}

pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
    customers: CustomerService,
    site_url: String,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool, site_url: impl Into<String>) -> Self {
        let customers = CustomerService::new(stripe.clone(), pool.clone());
        Self {
            stripe,
            pool,
            customers,
            site_url: site_url.into(),
        }
    }

    /// Build a checkout session for a subscription plan or lifetime license.
    /// Returns the hosted checkout URL.
    pub async fn create_plan_session(&self, request: PlanCheckoutRequest) -> BillingResult<String> {
        let price_id = self
            .stripe
            .config()
            .price_id_for_plan(request.plan)
            .ok_or_else(|| BillingError::InvalidPlan(request.plan.to_string()))?
            .to_string();

        let resolved = self
            .customers
            .resolve(request.customer_id.as_deref(), request.email.as_deref())
            .await?;
        let customer_id: CustomerId = resolved
            .customer_id
            .parse()
            .map_err(|_| BillingError::CustomerNotFound(resolved.customer_id.clone()))?;

        if request.plan == SubscriptionPlan::Lifetime {
            if self.has_lifetime_purchase(&customer_id).await {
                return Err(BillingError::LifetimeAlreadyPurchased);
            }
        } else if !request.is_plan_change {
            self.ensure_no_active_subscription(&customer_id).await?;
        }

        let plan_str = request.plan.as_str();
        let plan_name = self.plan_display_name(request.plan, &price_id).await;
        let coupon = self.active_promotion_coupon(plan_str).await;

        let mut metadata: HashMap<String, String> = HashMap::new();
        metadata.insert("plan_type".into(), plan_str.to_string());
        metadata.insert("plan_name".into(), plan_name);
        metadata.insert("customer_id".into(), customer_id.to_string());
        // Random id so webhook handlers can dedup re-delivered sessions.
        metadata.insert("event_id".into(), Uuid::new_v4().to_string());
        if let Some(user_id) = request.user_id {
            metadata.insert("user_id".into(), user_id.to_string());
        }
        if let Some(email) = &request.email {
            metadata.insert("email".into(), email.clone());
        }

        let success_url = format!(
            "{}/thank-you?session_id={{CHECKOUT_SESSION_ID}}",
            self.site_url
        );
        let cancel_url = format!("{}/pricing", self.site_url);

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id.clone());
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.payment_method_collection = Some(if request.collect_payment_method {
            CheckoutSessionPaymentMethodCollection::Always
        } else {
            CheckoutSessionPaymentMethodCollection::IfRequired
        });

        if request.plan.is_one_time() {
            params.mode = Some(CheckoutSessionMode::Payment);

            let mut purchase_meta: HashMap<String, String> = HashMap::new();
            purchase_meta.insert("purchase_type".into(), "lifetime".to_string());
            if let Some(user_id) = request.user_id {
                purchase_meta.insert("user_id".into(), user_id.to_string());
            }

            // Tag the payment intent and generated invoice so the lifetime
            // guard can recognize this purchase later.
            params.payment_intent_data = Some(CreateCheckoutSessionPaymentIntentData {
                metadata: Some(purchase_meta.clone()),
                ..Default::default()
            });
            params.invoice_creation = Some(CreateCheckoutSessionInvoiceCreation {
                enabled: true,
                invoice_data: Some(CreateCheckoutSessionInvoiceCreationInvoiceData {
                    metadata: Some(purchase_meta),
                    ..Default::default()
                }),
            });
        } else {
            params.mode = Some(CheckoutSessionMode::Subscription);
        }

        match coupon {
            Some(code) => {
                params.discounts = Some(vec![CreateCheckoutSessionDiscounts {
                    coupon: Some(code),
                    ..Default::default()
                }]);
            }
            // Stripe rejects sessions that set both discounts and
            // allow_promotion_codes, so manual codes only when no
            // promotion applied automatically.
            None => params.allow_promotion_codes = Some(true),
        }

        params.metadata = Some(metadata);

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        session
            .url
            .ok_or_else(|| BillingError::Internal("checkout session has no URL".into()))
    }

    /// Build a one-time payment session for a cart of products.
    pub async fn create_cart_session(&self, request: CartCheckoutRequest) -> BillingResult<String> {
        if request.items.is_empty() {
            return Err(BillingError::Internal("cart is empty".into()));
        }

        let customer_id_str = self.customers.find_or_create(&request.email).await?;
        let customer_id: CustomerId = customer_id_str
            .parse()
            .map_err(|_| BillingError::CustomerNotFound(customer_id_str.clone()))?;

        let line_items: Vec<CreateCheckoutSessionLineItems> = request
            .items
            .iter()
            .map(|item| CreateCheckoutSessionLineItems {
                price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                    currency: Currency::USD,
                    unit_amount: Some(dollars_to_cents(item.unit_price())),
                    product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                        name: item.name.clone().unwrap_or_else(|| item.id.clone()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                quantity: Some(u64::from(item.quantity)),
                ..Default::default()
            })
            .collect();

        let total: f64 = request.items.iter().map(CartItem::line_total).sum();
        let metadata = cart_metadata(&request, total);

        let success_url = format!(
            "{}/thank-you?session_id={{CHECKOUT_SESSION_ID}}",
            self.site_url
        );
        let cancel_url = format!("{}/cart", self.site_url);

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.mode = Some(CheckoutSessionMode::Payment);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.line_items = Some(line_items);
        params.metadata = Some(metadata);

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        session
            .url
            .ok_or_else(|| BillingError::Internal("checkout session has no URL".into()))
    }

    /// Whether the customer already owns a lifetime license.
    ///
    /// Four independent signals; any one is enough to block the sale, and
    /// each degrades to "no" on its own failure so a flaky lookup cannot
    /// block checkout outright.
    async fn has_lifetime_purchase(&self, customer_id: &CustomerId) -> bool {
        if self.lifetime_charge_exists(customer_id).await {
            return true;
        }
        if self.lifetime_payment_intent_exists(customer_id).await {
            return true;
        }
        if self.profile_marked_lifetime(customer_id.as_str()).await {
            return true;
        }
        if self.lifetime_invoice_exists(customer_id).await {
            return true;
        }
        false
    }

    async fn lifetime_charge_exists(&self, customer_id: &CustomerId) -> bool {
        let mut params = ListCharges::new();
        params.customer = Some(customer_id.clone());
        params.limit = Some(100);

        let listed = tokio::time::timeout(GUARD_TIMEOUT, Charge::list(self.stripe.inner(), &params)).await;
        match listed {
            Ok(Ok(charges)) => charges.data.iter().any(|charge| {
                charge.paid
                    && (charge.metadata.get("purchase_type").map(String::as_str)
                        == Some("lifetime")
                        || charge
                            .description
                            .as_deref()
                            .is_some_and(|d| d.to_lowercase().contains("lifetime")))
            }),
            Ok(Err(e)) => {
                tracing::warn!(customer_id = %customer_id, error = %e, "Lifetime charge check failed");
                false
            }
            Err(_) => {
                tracing::warn!(customer_id = %customer_id, "Lifetime charge check timed out");
                false
            }
        }
    }

    async fn lifetime_payment_intent_exists(&self, customer_id: &CustomerId) -> bool {
        let mut params = ListPaymentIntents::new();
        params.customer = Some(customer_id.clone());
        params.limit = Some(100);

        let listed =
            tokio::time::timeout(GUARD_TIMEOUT, PaymentIntent::list(self.stripe.inner(), &params))
                .await;
        match listed {
            Ok(Ok(intents)) => intents.data.iter().any(|pi| {
                pi.status == stripe::PaymentIntentStatus::Succeeded
                    && pi.metadata.get("purchase_type").map(String::as_str) == Some("lifetime")
            }),
            Ok(Err(e)) => {
                tracing::warn!(customer_id = %customer_id, error = %e, "Lifetime payment intent check failed");
                false
            }
            Err(_) => {
                tracing::warn!(customer_id = %customer_id, "Lifetime payment intent check timed out");
                false
            }
        }
    }

    async fn profile_marked_lifetime(&self, customer_id: &str) -> bool {
        let result: Result<Option<bool>, sqlx::Error> = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM profiles WHERE customer_id = $1 AND subscription = 'lifetime')",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(exists) => exists.unwrap_or(false),
            Err(e) => {
                tracing::warn!(customer_id = %customer_id, error = %e, "Lifetime profile check failed");
                false
            }
        }
    }

    async fn lifetime_invoice_exists(&self, customer_id: &CustomerId) -> bool {
        let lifetime_price = &self.stripe.config().price_ids.lifetime;

        let mut params = ListInvoices::new();
        params.customer = Some(customer_id.clone());
        params.limit = Some(100);

        let listed =
            tokio::time::timeout(GUARD_TIMEOUT, stripe::Invoice::list(self.stripe.inner(), &params))
                .await;
        match listed {
            Ok(Ok(invoices)) => invoices
                .data
                .iter()
                .filter(|invoice| invoice.status == Some(stripe::InvoiceStatus::Paid))
                .any(|invoice| {
                    invoice.lines.as_ref().is_some_and(|lines| {
                        lines.data.iter().any(|line| {
                            line.price
                                .as_ref()
                                .is_some_and(|price| price.id.as_str() == lifetime_price)
                        })
                    })
                }),
            Ok(Err(e)) => {
                tracing::warn!(customer_id = %customer_id, error = %e, "Lifetime invoice check failed");
                false
            }
            Err(_) => {
                tracing::warn!(customer_id = %customer_id, "Lifetime invoice check timed out");
                false
            }
        }
    }

    /// Reject when the customer already has a live subscription. Like the
    /// lifetime guard this fails open: a failed or slow list call lets the
    /// checkout proceed rather than blocking a legitimate purchase.
    async fn ensure_no_active_subscription(&self, customer_id: &CustomerId) -> BillingResult<()> {
        let mut params = ListSubscriptions::new();
        params.customer = Some(customer_id.clone());
        params.status = Some(SubscriptionStatusFilter::All);
        params.limit = Some(100);

        let listed = tokio::time::timeout(
            GUARD_TIMEOUT,
            stripe::Subscription::list(self.stripe.inner(), &params),
        )
        .await;
        let subscriptions = match listed {
            Ok(Ok(subscriptions)) => subscriptions,
            Ok(Err(e)) => {
                tracing::warn!(customer_id = %customer_id, error = %e, "Active subscription check failed, allowing checkout");
                return Ok(());
            }
            Err(_) => {
                tracing::warn!(customer_id = %customer_id, "Active subscription check timed out, allowing checkout");
                return Ok(());
            }
        };

        let blocking: Vec<String> = subscriptions
            .data
            .iter()
            .filter(|sub| subscription_blocks_checkout(sub.status))
            .map(|sub| sub.id.to_string())
            .collect();

        if blocking.is_empty() {
            Ok(())
        } else {
            Err(BillingError::ActiveSubscriptionExists {
                subscription_ids: blocking,
            })
        }
    }

    /// Human-readable plan name for session metadata, derived from the live
    /// Stripe price. Falls back to `<plan>_unknown` if the price lookup
    /// fails; the name is informational only.
    async fn plan_display_name(&self, plan: SubscriptionPlan, price_id: &str) -> String {
        let parsed: Result<PriceId, _> = price_id.parse();
        let unit_amount = match parsed {
            Ok(id) => match Price::retrieve(self.stripe.inner(), &id, &[]).await {
                Ok(price) => price.unit_amount,
                Err(e) => {
                    tracing::warn!(price_id = %price_id, error = %e, "Price lookup for plan name failed");
                    None
                }
            },
            Err(_) => None,
        };
        plan_name(plan.as_str(), unit_amount)
    }

    /// Highest-priority active promotion for the plan, verified against
    /// Stripe. A stale or invalid promotions row is "no promotion", never an
    /// error.
    async fn active_promotion_coupon(&self, plan: &str) -> Option<String> {
        let row: Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
            "SELECT stripe_coupon_code FROM promotions \
             WHERE active = true \
               AND $1 = ANY(applicable_plans) \
               AND (start_date IS NULL OR start_date <= NOW()) \
               AND (end_date IS NULL OR end_date >= NOW()) \
             ORDER BY priority DESC \
             LIMIT 1",
        )
        .bind(plan)
        .fetch_optional(&self.pool)
        .await;

        let code = match row {
            Ok(Some(code)) if !code.is_empty() => code,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(plan = %plan, error = %e, "Promotion lookup failed");
                return None;
            }
        };

        let coupon_id: CouponId = match code.parse() {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!(coupon = %code, "Promotion row carries a malformed coupon code");
                return None;
            }
        };

        match Coupon::retrieve(self.stripe.inner(), &coupon_id, &[]).await {
            Ok(coupon) if !coupon.deleted => Some(code),
            Ok(_) => {
                tracing::warn!(coupon = %code, "Promotion coupon was deleted in Stripe, skipping");
                None
            }
            Err(e) => {
                tracing::warn!(coupon = %code, error = %e, "Promotion coupon not found in Stripe, skipping");
                None
            }
        }
    }
}

/// Subscription statuses that block a new plan checkout.
pub fn subscription_blocks_checkout(status: SubscriptionStatus) -> bool {
    matches!(
        status,
        SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
    )
}

/// `<plan>_<dollars>` from the price's unit amount, keeping cents when the
/// price is not a whole dollar amount (`monthly_6.99`, `annual_99`).
/// `<plan>_unknown` when the amount is unavailable.
pub fn plan_name(plan: &str, unit_amount: Option<i64>) -> String {
    match unit_amount {
        Some(cents) => format!("{}_{}", plan, cents as f64 / 100.0),
        None => format!("{}_unknown", plan),
    }
}

/// Dollars to integer cents, rounded to the nearest cent.
pub fn dollars_to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

fn cart_metadata(request: &CartCheckoutRequest, total: f64) -> HashMap<String, String> {
    let summary: Vec<serde_json::Value> = request
        .items
        .iter()
        .map(|item| {
            serde_json::json!({
                "id": item.id,
                "name": item.name.clone().unwrap_or_else(|| item.id.clone()),
                "quantity": item.quantity,
            })
        })
        .collect();

    let mut metadata: HashMap<String, String> = HashMap::new();
    metadata.insert(
        "cart_items".into(),
        serde_json::Value::Array(summary).to_string(),
    );
    metadata.insert("total_amount".into(), format!("{:.2}", total));
    metadata.insert("email".into(), request.email.clone());
    metadata.insert("event_id".into(), Uuid::new_v4().to_string());
    if let Some(user_id) = request.user_id {
        metadata.insert("user_id".into(), user_id.to_string());
    }
    metadata
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::client::{PriceIds, StripeConfig};

    #[test]
    fn plan_name_keeps_cents_for_fractional_prices() {
        assert_eq!(plan_name("monthly", Some(699)), "monthly_6.99");
        assert_eq!(plan_name("monthly", Some(999)), "monthly_9.99");
    }

    #[test]
    fn plan_name_drops_cents_for_whole_dollar_prices() {
        assert_eq!(plan_name("annual", Some(9900)), "annual_99");
        assert_eq!(plan_name("lifetime", Some(39900)), "lifetime_399");
    }

    #[test]
    fn plan_name_falls_back_when_price_unavailable() {
        assert_eq!(plan_name("monthly", None), "monthly_unknown");
    }

    #[test]
    fn active_trialing_and_past_due_block_checkout() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
        ] {
            assert!(subscription_blocks_checkout(status));
        }
        for status in [
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Unpaid,
        ] {
            assert!(!subscription_blocks_checkout(status));
        }
    }

    #[tokio::test]
    async fn subscription_guard_allows_checkout_when_stripe_errors() {
        let mut server = mockito::Server::new_async().await;
        let _list = server
            .mock("GET", "/v1/subscriptions")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body(r#"{"error":{"type":"api_error"}}"#)
            .create_async()
            .await;

        let stripe = StripeClient::with_base_url(
            StripeConfig {
                secret_key: "sk_test_123".into(),
                webhook_secret: "whsec_test".into(),
                price_ids: PriceIds {
                    monthly: "price_monthly".into(),
                    annual: "price_annual".into(),
                    lifetime: "price_lifetime".into(),
                },
            },
            &server.url(),
        );
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost/postgres")
            .unwrap();
        let service = CheckoutService::new(stripe, pool, "https://store.test");

        let customer_id: CustomerId = "cus_test123".parse().unwrap();
        let result = service.ensure_no_active_subscription(&customer_id).await;
        assert!(result.is_ok());
    }

    #[test]
    fn cents_conversion_rounds() {
        assert_eq!(dollars_to_cents(49.99), 4999);
        assert_eq!(dollars_to_cents(10.0), 1000);
        assert_eq!(dollars_to_cents(0.005), 1);
    }

    #[test]
    fn cart_metadata_carries_items_and_total() {
        let request = CartCheckoutRequest {
            email: "user@example.com".into(),
            user_id: Some(Uuid::nil()),
            items: vec![
                CartItem {
                    id: "prod_a".into(),
                    name: Some("Analog Keys".into()),
                    price: Some(49.0),
                    sale_price: Some(29.0),
                    quantity: 1,
                },
                CartItem {
                    id: "prod_b".into(),
                    name: Some("Drum Pack".into()),
                    price: Some(19.0),
                    sale_price: None,
                    quantity: 2,
                },
            ],
        };
        let total: f64 = request.items.iter().map(CartItem::line_total).sum();
        let metadata = cart_metadata(&request, total);

        assert_eq!(metadata.get("total_amount").map(String::as_str), Some("67.00"));
        assert_eq!(
            metadata.get("email").map(String::as_str),
            Some("user@example.com")
        );
        assert!(metadata.contains_key("event_id"));

        let items: serde_json::Value =
            serde_json::from_str(metadata.get("cart_items").unwrap()).unwrap();
        assert_eq!(items[0]["id"], "prod_a");
        assert_eq!(items[1]["quantity"], 2);
    }
}
