//! Order history
//!
//! Projects reconciled payment intents into the order objects the account
//! page renders. Receipt URLs come from the latest charge, falling back to
//! the hosted invoice; either lookup failing just leaves the link off the
//! order.

use serde::Serialize;
use stripe::{Charge, ChargeId, Invoice, InvoiceId};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::reconcile::{PaymentRecord, PurchaserIdentity, ReconciliationService};
use nnaudio_shared::models::parse_cart_items;
use nnaudio_shared::CartItem;

/// One order, shaped exactly as the account page has always consumed it:
/// camelCase top-level keys with checkout metadata nested under `metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    #[serde(rename = "orderNumber")]
    pub order_number: String,
    pub date: String,
    pub status: String,
    pub amount: f64,
    pub currency: String,
    pub items: Vec<CartItem>,
    pub metadata: OrderMetadata,
    #[serde(rename = "receiptUrl")]
    pub receipt_url: Option<String>,
    #[serde(rename = "invoiceId")]
    pub invoice_id: Option<String>,
}

/// Checkout metadata passed through from the payment intent.
#[derive(Debug, Clone, Serialize)]
pub struct OrderMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion_code: Option<String>,
}

pub struct OrderService {
    stripe: StripeClient,
    reconciliation: ReconciliationService,
}

impl OrderService {
    pub fn new(stripe: StripeClient) -> Self {
        let reconciliation = ReconciliationService::new(stripe.clone());
        Self {
            stripe,
            reconciliation,
        }
    }

    /// All orders for the identity, newest first.
    pub async fn list_orders(&self, identity: &PurchaserIdentity) -> BillingResult<Vec<Order>> {
        let mut payments = self.reconciliation.resolve_payments(identity).await?;
        payments.sort_by(|a, b| b.created.cmp(&a.created));

        let mut orders = Vec::with_capacity(payments.len());
        for record in payments {
            let receipt_url = self.receipt_url(&record).await;
            orders.push(order_from_record(&record, receipt_url));
        }
        Ok(orders)
    }

    /// Number of succeeded payments for a customer. Cheaper than the full
    /// order projection; the storefront shows it as a badge.
    pub async fn count_orders(&self, customer_id: &str) -> BillingResult<usize> {
        let payments = self
            .reconciliation
            .payments_for_customer(customer_id)
            .await?;
        Ok(payments.iter().filter(|p| p.is_succeeded()).count())
    }

    /// Charge receipt URL, falling back to the hosted invoice page.
    async fn receipt_url(&self, record: &PaymentRecord) -> Option<String> {
        if let Some(charge_id) = &record.latest_charge {
            if let Ok(parsed) = charge_id.parse::<ChargeId>() {
                match Charge::retrieve(self.stripe.inner(), &parsed, &[]).await {
                    Ok(charge) => {
                        if charge.receipt_url.is_some() {
                            return charge.receipt_url;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(charge_id = %charge_id, error = %e, "Receipt lookup failed");
                    }
                }
            }
        }

        if let Some(invoice_id) = &record.invoice {
            if let Ok(parsed) = invoice_id.parse::<InvoiceId>() {
                match Invoice::retrieve(self.stripe.inner(), &parsed, &[]).await {
                    Ok(invoice) => return invoice.hosted_invoice_url,
                    Err(e) => {
                        tracing::warn!(invoice_id = %invoice_id, error = %e, "Invoice lookup failed");
                    }
                }
            }
        }

        None
    }
}

/// Project one payment record into an order. Pure so the shaping rules are
/// testable without Stripe.
pub fn order_from_record(record: &PaymentRecord, receipt_url: Option<String>) -> Order {
    let items = record
        .metadata
        .get("cart_items")
        .map(|raw| parse_cart_items(raw))
        .unwrap_or_default();

    Order {
        id: record.id.clone(),
        order_number: order_number(&record.id),
        date: rfc3339_date(record.created),
        status: record.status.clone(),
        amount: record.amount as f64 / 100.0,
        currency: record.currency.to_uppercase(),
        items,
        metadata: OrderMetadata {
            original_total: record.metadata.get("original_total").cloned(),
            discount_amount: record.metadata.get("discount_amount").cloned(),
            total_amount: record.metadata.get("total_amount").cloned(),
            promotion_code: record.metadata.get("promotion_code").cloned(),
        },
        receipt_url,
        invoice_id: record.invoice.clone(),
    }
}

/// Customer-facing order number: eight characters of the payment-intent id
/// after the `pi_` prefix, uppercased.
pub fn order_number(payment_intent_id: &str) -> String {
    payment_intent_id
        .chars()
        .skip(3)
        .take(8)
        .collect::<String>()
        .to_uppercase()
}

fn rfc3339_date(unix_seconds: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix_seconds)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn record() -> PaymentRecord {
        let mut metadata = HashMap::new();
        metadata.insert(
            "cart_items".to_string(),
            r#"[{"id":"prod_a","name":"Analog Keys","quantity":1}]"#.to_string(),
        );
        metadata.insert("total_amount".to_string(), "49.00".to_string());
        metadata.insert("promotion_code".to_string(), "SPRING25".to_string());
        PaymentRecord {
            id: "pi_3ABCdef12345".to_string(),
            status: "succeeded".to_string(),
            amount: 4900,
            currency: "usd".to_string(),
            created: 1_700_000_000,
            metadata,
            latest_charge: Some("ch_1".to_string()),
            invoice: Some("in_1".to_string()),
        }
    }

    #[test]
    fn order_number_is_uppercased_id_slice() {
        assert_eq!(order_number("pi_3ABCdef12345"), "3ABCDEF1");
        assert_eq!(order_number("pi_x"), "X");
    }

    #[test]
    fn order_amount_is_decimal_dollars_with_uppercase_currency() {
        let order = order_from_record(&record(), None);
        assert_eq!(order.amount, 49.0);
        assert_eq!(order.currency, "USD");
    }

    #[test]
    fn order_carries_items_and_metadata_passthrough() {
        let order = order_from_record(&record(), Some("https://stripe.test/receipt".into()));
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].id, "prod_a");
        assert_eq!(order.metadata.total_amount.as_deref(), Some("49.00"));
        assert_eq!(order.metadata.promotion_code.as_deref(), Some("SPRING25"));
        assert_eq!(order.receipt_url.as_deref(), Some("https://stripe.test/receipt"));
        assert_eq!(order.invoice_id.as_deref(), Some("in_1"));
        assert!(order.metadata.original_total.is_none());
    }

    #[test]
    fn order_serializes_with_legacy_account_page_keys() {
        let order = order_from_record(&record(), Some("https://stripe.test/receipt".into()));
        let json = serde_json::to_value(&order).unwrap();

        assert_eq!(json["orderNumber"], "3ABCDEF1");
        assert_eq!(json["receiptUrl"], "https://stripe.test/receipt");
        assert_eq!(json["invoiceId"], "in_1");
        assert_eq!(json["metadata"]["total_amount"], "49.00");
        assert_eq!(json["metadata"]["promotion_code"], "SPRING25");
        // Never-set metadata keys are omitted, matching the old payload.
        assert!(json["metadata"].get("original_total").is_none());
        assert!(json.get("order_number").is_none());
    }

    #[test]
    fn order_date_is_rfc3339() {
        let order = order_from_record(&record(), None);
        assert_eq!(order.date, "2023-11-14T22:13:20Z");
    }
}
