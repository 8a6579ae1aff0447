//! Purchase reconciliation
//!
//! Resolves the set of product ids a user has paid for by querying Stripe
//! through three independent sources:
//!
//! 1. payment intents listed by the profile's `customer_id`
//! 2. payment intent search on `metadata['user_id']`
//! 3. payment intents of every customer matching the profile's email
//!
//! Results are merged by payment-intent id, filtered to succeeded and
//! non-refunded payments, and their `cart_items` metadata is unioned into a
//! product-id set. A source that fails or times out degrades the result
//! instead of failing the request; each source reports its outcome so
//! callers (and tests) can see exactly which branches contributed.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use stripe::{Charge, ChargeId, Customer, ListCustomers, ListPaymentIntents, PaymentIntent};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;
use nnaudio_shared::models::parse_cart_items;

/// Bound on each dependent Stripe call so one slow source cannot stall the
/// whole access check.
const SOURCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Who we are reconciling purchases for. Any subset of the fields may be
/// present; absent fields skip their source.
#[derive(Debug, Clone, Default)]
pub struct PurchaserIdentity {
    pub customer_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

impl PurchaserIdentity {
    pub fn is_empty(&self) -> bool {
        self.customer_id.is_none() && self.user_id.is_none() && self.email.is_none()
    }
}

/// The three reconciliation sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    CustomerLookup,
    MetadataSearch,
    EmailLookup,
}

/// Outcome of one source. Failures carry the error text for diagnostics but
/// never propagate; the product set just degrades.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum SourceStatus {
    Succeeded { found: usize },
    Failed(String),
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceReport {
    pub source: SourceKind,
    pub outcome: SourceStatus,
}

/// The slice of a Stripe payment intent that reconciliation and order
/// history need. Normalized here because the metadata-search endpoint is not
/// covered by the SDK and comes back as raw JSON.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub created: i64,
    pub metadata: HashMap<String, String>,
    pub latest_charge: Option<String>,
    pub invoice: Option<String>,
}

impl PaymentRecord {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    pub fn cart_item_product_ids(&self) -> Vec<String> {
        self.metadata
            .get("cart_items")
            .map(|raw| parse_cart_items(raw).into_iter().map(|i| i.id).collect())
            .unwrap_or_default()
    }
}

impl From<PaymentIntent> for PaymentRecord {
    fn from(pi: PaymentIntent) -> Self {
        PaymentRecord {
            id: pi.id.to_string(),
            status: pi.status.as_str().to_string(),
            amount: pi.amount,
            currency: pi.currency.to_string(),
            created: pi.created,
            metadata: pi.metadata,
            latest_charge: pi.latest_charge.map(|c| c.id().to_string()),
            invoice: pi.invoice.map(|i| i.id().to_string()),
        }
    }
}

/// Parse a payment intent out of a raw search-API response entry.
/// Expandable fields arrive either as an id string or a nested object.
pub fn record_from_json(value: &Value) -> Option<PaymentRecord> {
    let id = value["id"].as_str()?.to_string();

    let metadata = value["metadata"]
        .as_object()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Some(PaymentRecord {
        id,
        status: value["status"].as_str().unwrap_or_default().to_string(),
        amount: value["amount"].as_i64().unwrap_or(0),
        currency: value["currency"].as_str().unwrap_or("usd").to_string(),
        created: value["created"].as_i64().unwrap_or(0),
        metadata,
        latest_charge: expandable_id(&value["latest_charge"]),
        invoice: expandable_id(&value["invoice"]),
    })
}

fn expandable_id(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::to_string)
        .or_else(|| value["id"].as_str().map(str::to_string))
}

/// Merge payment batches into one list, deduplicated by payment-intent id.
/// The first occurrence wins, so a payment found via both the customer-id
/// lookup and the email-derived lookup appears exactly once.
pub fn merge_payment_records(
    batches: impl IntoIterator<Item = Vec<PaymentRecord>>,
) -> Vec<PaymentRecord> {
    let mut by_id: HashMap<String, PaymentRecord> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for batch in batches {
        for record in batch {
            if !by_id.contains_key(&record.id) {
                order.push(record.id.clone());
                by_id.insert(record.id.clone(), record);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

/// Result of reconciliation: the product set plus per-source outcomes and
/// the surviving (succeeded, non-refunded) payments.
#[derive(Debug, Clone)]
pub struct PurchasedProducts {
    pub product_ids: HashSet<String>,
    pub payments: Vec<PaymentRecord>,
    pub sources: Vec<SourceReport>,
}

pub struct ReconciliationService {
    stripe: StripeClient,
    http: reqwest::Client,
}

impl ReconciliationService {
    pub fn new(stripe: StripeClient) -> Self {
        Self {
            stripe,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve everything the identity has paid for.
    pub async fn resolve_purchased_products(
        &self,
        identity: &PurchaserIdentity,
    ) -> BillingResult<PurchasedProducts> {
        let (merged, sources) = self.collect_payments(identity).await;

        let mut product_ids = HashSet::new();
        let mut payments = Vec::new();

        for record in merged {
            if !record.is_succeeded() {
                continue;
            }
            if self.is_fully_refunded(&record).await {
                continue;
            }
            for product_id in record.cart_item_product_ids() {
                product_ids.insert(product_id);
            }
            payments.push(record);
        }

        tracing::debug!(
            products = product_ids.len(),
            payments = payments.len(),
            sources = ?sources,
            "Reconciled purchases"
        );

        Ok(PurchasedProducts {
            product_ids,
            payments,
            sources,
        })
    }

    /// Succeeded, non-refunded payments for the identity, deduplicated.
    /// Used by order history, which needs the payments rather than the
    /// product set.
    pub async fn resolve_payments(
        &self,
        identity: &PurchaserIdentity,
    ) -> BillingResult<Vec<PaymentRecord>> {
        Ok(self.resolve_purchased_products(identity).await?.payments)
    }

    async fn collect_payments(
        &self,
        identity: &PurchaserIdentity,
    ) -> (Vec<PaymentRecord>, Vec<SourceReport>) {
        let mut batches: Vec<Vec<PaymentRecord>> = Vec::new();
        let mut sources = Vec::new();

        // Source 1: direct customer-id lookup
        let customer_outcome = match &identity.customer_id {
            Some(customer_id) => {
                match tokio::time::timeout(SOURCE_TIMEOUT, self.list_by_customer(customer_id))
                    .await
                {
                    Ok(Ok(records)) => {
                        let found = records.len();
                        batches.push(records);
                        SourceStatus::Succeeded { found }
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(customer_id = %customer_id, error = %e, "Customer payment lookup failed");
                        SourceStatus::Failed(e.to_string())
                    }
                    Err(_) => {
                        tracing::warn!(customer_id = %customer_id, "Customer payment lookup timed out");
                        SourceStatus::TimedOut
                    }
                }
            }
            None => SourceStatus::Skipped,
        };
        sources.push(SourceReport {
            source: SourceKind::CustomerLookup,
            outcome: customer_outcome,
        });

        // Source 2: metadata search by user_id
        let search_outcome = match &identity.user_id {
            Some(user_id) => {
                match tokio::time::timeout(SOURCE_TIMEOUT, self.search_by_user_id(*user_id)).await
                {
                    Ok(Ok(records)) => {
                        let found = records.len();
                        batches.push(records);
                        SourceStatus::Succeeded { found }
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Payment intent search failed");
                        SourceStatus::Failed(e.to_string())
                    }
                    Err(_) => {
                        tracing::warn!(user_id = %user_id, "Payment intent search timed out");
                        SourceStatus::TimedOut
                    }
                }
            }
            None => SourceStatus::Skipped,
        };
        sources.push(SourceReport {
            source: SourceKind::MetadataSearch,
            outcome: search_outcome,
        });

        // Source 3: customers matching the email, then each one's payments
        let email_outcome = match &identity.email {
            Some(email) => match self.list_by_email(email).await {
                Ok(records) => {
                    let found = records.len();
                    batches.push(records);
                    SourceStatus::Succeeded { found }
                }
                Err(e) => {
                    tracing::warn!(email = %email, error = %e, "Email-derived payment lookup failed");
                    SourceStatus::Failed(e.to_string())
                }
            },
            None => SourceStatus::Skipped,
        };
        sources.push(SourceReport {
            source: SourceKind::EmailLookup,
            outcome: email_outcome,
        });

        (merge_payment_records(batches), sources)
    }

    /// Payments for one customer, no refund filtering. Used by the order
    /// count endpoint, which only needs succeeded intents.
    pub async fn payments_for_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<PaymentRecord>> {
        self.list_by_customer(customer_id).await
    }

    async fn list_by_customer(&self, customer_id: &str) -> BillingResult<Vec<PaymentRecord>> {
        let parsed: stripe::CustomerId = customer_id
            .parse()
            .map_err(|_| crate::error::BillingError::CustomerNotFound(customer_id.to_string()))?;

        let mut params = ListPaymentIntents::new();
        params.customer = Some(parsed);
        params.limit = Some(100);

        let intents = PaymentIntent::list(self.stripe.inner(), &params).await?;
        Ok(intents.data.into_iter().map(PaymentRecord::from).collect())
    }

    /// Search payment intents by `metadata['user_id']`. The SDK does not
    /// cover the search endpoint, so this goes straight to the REST API.
    async fn search_by_user_id(&self, user_id: Uuid) -> BillingResult<Vec<PaymentRecord>> {
        let query = format!("metadata['user_id']:'{}'", user_id);

        let response = self
            .http
            .get("https://api.stripe.com/v1/payment_intents/search")
            .bearer_auth(&self.stripe.config().secret_key)
            .query(&[("query", query.as_str()), ("limit", "100")])
            .send()
            .await
            .map_err(|e| crate::error::BillingError::StripeApi(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(crate::error::BillingError::StripeApi(format!(
                "payment_intents/search failed ({}): {}",
                status, body
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| crate::error::BillingError::StripeApi(e.to_string()))?;

        let records = payload["data"]
            .as_array()
            .map(|entries| entries.iter().filter_map(record_from_json).collect())
            .unwrap_or_default();

        Ok(records)
    }

    async fn list_by_email(&self, email: &str) -> BillingResult<Vec<PaymentRecord>> {
        let normalized = crate::customer::normalize_email(email);

        let mut list_params = ListCustomers::new();
        list_params.email = Some(&normalized);
        list_params.limit = Some(10);

        let customers = Customer::list(self.stripe.inner(), &list_params).await?;

        let mut records = Vec::new();
        for customer in customers.data {
            // One bad customer must not sink the rest of the email branch.
            match self.list_by_customer(customer.id.as_str()).await {
                Ok(batch) => records.extend(batch),
                Err(e) => {
                    tracing::warn!(
                        customer_id = %customer.id,
                        error = %e,
                        "Failed to list payments for email-matched customer"
                    );
                }
            }
        }

        Ok(records)
    }

    /// Whether the payment's latest charge was fully refunded. Lookup
    /// failures count as not refunded so a Stripe hiccup cannot revoke
    /// access the user paid for.
    async fn is_fully_refunded(&self, record: &PaymentRecord) -> bool {
        let Some(charge_id) = &record.latest_charge else {
            return false;
        };
        let Ok(parsed) = charge_id.parse::<ChargeId>() else {
            return false;
        };

        match Charge::retrieve(self.stripe.inner(), &parsed, &[]).await {
            Ok(charge) => charge.refunded || charge.amount_refunded == charge.amount,
            Err(e) => {
                tracing::warn!(charge_id = %charge_id, error = %e, "Refund check failed, assuming not refunded");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: &str, cart_items: Option<&str>) -> PaymentRecord {
        let mut metadata = HashMap::new();
        if let Some(items) = cart_items {
            metadata.insert("cart_items".to_string(), items.to_string());
        }
        PaymentRecord {
            id: id.to_string(),
            status: status.to_string(),
            amount: 4900,
            currency: "usd".to_string(),
            created: 1_700_000_000,
            metadata,
            latest_charge: None,
            invoice: None,
        }
    }

    #[test]
    fn merge_deduplicates_across_sources() {
        let by_customer = vec![record("pi_1", "succeeded", None), record("pi_2", "succeeded", None)];
        let by_email = vec![record("pi_2", "succeeded", None), record("pi_3", "succeeded", None)];

        let merged = merge_payment_records([by_customer, by_email]);
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["pi_1", "pi_2", "pi_3"]);
    }

    #[test]
    fn merge_keeps_first_occurrence() {
        let mut a = record("pi_1", "succeeded", None);
        a.amount = 100;
        let mut b = record("pi_1", "succeeded", None);
        b.amount = 200;

        let merged = merge_payment_records([vec![a], vec![b]]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].amount, 100);
    }

    #[test]
    fn cart_item_ids_extracted_from_metadata() {
        let record = record(
            "pi_1",
            "succeeded",
            Some(r#"[{"id":"prod_a","quantity":1},{"id":"prod_b","quantity":2}]"#),
        );
        assert_eq!(record.cart_item_product_ids(), vec!["prod_a", "prod_b"]);
    }

    #[test]
    fn malformed_cart_items_yield_no_products() {
        let record = record("pi_1", "succeeded", Some("{broken"));
        assert!(record.cart_item_product_ids().is_empty());
    }

    #[test]
    fn record_from_json_handles_expandable_forms() {
        let as_string: Value = serde_json::json!({
            "id": "pi_x",
            "status": "succeeded",
            "amount": 990,
            "currency": "usd",
            "created": 1700000000,
            "metadata": {"user_id": "u1"},
            "latest_charge": "ch_1",
            "invoice": null,
        });
        let parsed = record_from_json(&as_string).unwrap();
        assert_eq!(parsed.latest_charge.as_deref(), Some("ch_1"));
        assert!(parsed.invoice.is_none());

        let as_object: Value = serde_json::json!({
            "id": "pi_y",
            "status": "succeeded",
            "amount": 990,
            "currency": "usd",
            "created": 1700000000,
            "metadata": {},
            "latest_charge": {"id": "ch_2", "amount": 990},
        });
        let parsed = record_from_json(&as_object).unwrap();
        assert_eq!(parsed.latest_charge.as_deref(), Some("ch_2"));
    }

    #[test]
    fn record_from_json_requires_id() {
        assert!(record_from_json(&serde_json::json!({"status": "succeeded"})).is_none());
    }
}
