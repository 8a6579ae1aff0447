// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing
//!
//! Boundary conditions that cut across modules:
//! - Customer idempotency keys
//! - Reconciliation merging and refund-era record shapes
//! - Order projection
//! - Webhook signature tolerance
//! - Checkout metadata

#[cfg(test)]
mod idempotency_key_tests {
    use crate::customer::{idempotency_key_for_email, normalize_email};
    use time::macros::datetime;

    #[test]
    fn plus_addressing_sanitizes_to_underscore() {
        let key = idempotency_key_for_email(
            &normalize_email("First.Last+tag@Example.com"),
            datetime!(2025-06-15 09:00 UTC),
        );
        assert_eq!(key, "cust_first_last_tag_example_com_2025061509");
    }

    #[test]
    fn midnight_rollover_changes_key() {
        let before = idempotency_key_for_email("a@b.co", datetime!(2025-06-14 23:59:59 UTC));
        let after = idempotency_key_for_email("a@b.co", datetime!(2025-06-15 00:00:00 UTC));
        assert_ne!(before, after);
        assert!(after.ends_with("2025061500"));
    }

    #[test]
    fn unicode_emails_sanitize_without_panicking() {
        let key = idempotency_key_for_email(
            &normalize_email("müller@exämple.de"),
            datetime!(2025-06-15 09:00 UTC),
        );
        assert!(key.starts_with("cust_m"));
        assert!(key.is_ascii() || key.chars().all(|c| c == '_' || c.is_alphanumeric()));
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use crate::reconcile::{merge_payment_records, record_from_json, PaymentRecord};
    use std::collections::HashMap;

    fn record(id: &str, status: &str) -> PaymentRecord {
        PaymentRecord {
            id: id.to_string(),
            status: status.to_string(),
            amount: 1000,
            currency: "usd".to_string(),
            created: 0,
            metadata: HashMap::new(),
            latest_charge: None,
            invoice: None,
        }
    }

    #[test]
    fn merge_of_empty_batches_is_empty() {
        let merged = merge_payment_records(Vec::<Vec<PaymentRecord>>::new());
        assert!(merged.is_empty());
    }

    #[test]
    fn triple_overlap_appears_once() {
        let merged = merge_payment_records([
            vec![record("pi_1", "succeeded")],
            vec![record("pi_1", "succeeded")],
            vec![record("pi_1", "succeeded")],
        ]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn non_succeeded_records_are_not_flagged_succeeded() {
        for status in ["requires_payment_method", "processing", "canceled"] {
            assert!(!record("pi_x", status).is_succeeded());
        }
        assert!(record("pi_x", "succeeded").is_succeeded());
    }

    #[test]
    fn search_response_with_non_string_metadata_values_keeps_strings_only() {
        let value = serde_json::json!({
            "id": "pi_meta",
            "status": "succeeded",
            "amount": 500,
            "currency": "usd",
            "created": 1,
            "metadata": {"user_id": "u1", "weird": 42},
        });
        let parsed = record_from_json(&value).unwrap();
        assert_eq!(parsed.metadata.get("user_id").map(String::as_str), Some("u1"));
        assert!(!parsed.metadata.contains_key("weird"));
    }

    #[test]
    fn cart_items_union_across_payments() {
        let mut a = record("pi_1", "succeeded");
        a.metadata.insert(
            "cart_items".into(),
            r#"[{"id":"prod_a"},{"id":"prod_b"}]"#.into(),
        );
        let mut b = record("pi_2", "succeeded");
        b.metadata
            .insert("cart_items".into(), r#"[{"id":"prod_b"},{"id":"prod_c"}]"#.into());

        let ids: std::collections::HashSet<String> = [a, b]
            .iter()
            .flat_map(|r| r.cart_item_product_ids())
            .collect();
        assert_eq!(ids.len(), 3);
    }
}

#[cfg(test)]
mod order_tests {
    use crate::orders::{order_from_record, order_number};
    use crate::reconcile::PaymentRecord;
    use std::collections::HashMap;

    #[test]
    fn short_payment_intent_ids_do_not_panic() {
        assert_eq!(order_number(""), "");
        assert_eq!(order_number("pi_"), "");
        assert_eq!(order_number("pi_ab"), "AB");
    }

    #[test]
    fn zero_amount_order_is_zero_dollars() {
        let record = PaymentRecord {
            id: "pi_free1234".into(),
            status: "succeeded".into(),
            amount: 0,
            currency: "eur".into(),
            created: 1_700_000_000,
            metadata: HashMap::new(),
            latest_charge: None,
            invoice: None,
        };
        let order = order_from_record(&record, None);
        assert_eq!(order.amount, 0.0);
        assert_eq!(order.currency, "EUR");
        assert!(order.items.is_empty());
        assert!(order.receipt_url.is_none());
    }

    #[test]
    fn odd_cent_amounts_survive_division() {
        let record = PaymentRecord {
            id: "pi_oddcents".into(),
            status: "succeeded".into(),
            amount: 4999,
            currency: "usd".into(),
            created: 0,
            metadata: HashMap::new(),
            latest_charge: None,
            invoice: None,
        };
        assert_eq!(order_from_record(&record, None).amount, 49.99);
    }
}

#[cfg(test)]
mod webhook_signature_tests {
    use crate::error::BillingError;
    use crate::webhooks::verify_signature_manually;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn timestamp_exactly_at_tolerance_is_accepted() {
        let payload = "{}";
        let secret = "whsec_x";
        let signed_at = 1_700_000_000;
        let header = sign(payload, secret, signed_at);

        // 300 seconds is the boundary; 300 passes, 301 fails.
        assert!(verify_signature_manually(payload, &header, secret, signed_at + 300).is_ok());
        assert!(verify_signature_manually(payload, &header, secret, signed_at + 301).is_err());
    }

    #[test]
    fn future_timestamps_beyond_tolerance_are_rejected() {
        let payload = "{}";
        let secret = "whsec_x";
        let signed_at = 1_700_000_000;
        let header = sign(payload, secret, signed_at);

        assert!(verify_signature_manually(payload, &header, secret, signed_at - 301).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = "whsec_x";
        let now = 1_700_000_000;
        let header = sign(r#"{"amount":100}"#, secret, now);

        let result = verify_signature_manually(r#"{"amount":999}"#, &header, secret, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }
}

#[cfg(test)]
mod checkout_edge_tests {
    use crate::checkout::{dollars_to_cents, plan_name};

    #[test]
    fn plan_name_with_zero_amount() {
        assert_eq!(plan_name("monthly", Some(0)), "monthly_0");
    }

    #[test]
    fn sub_dollar_prices_keep_their_cents() {
        assert_eq!(plan_name("monthly", Some(99)), "monthly_0.99");
        assert_eq!(plan_name("monthly", Some(199)), "monthly_1.99");
    }

    #[test]
    fn fractional_dollar_prices_keep_their_cents() {
        assert_eq!(plan_name("monthly", Some(699)), "monthly_6.99");
        assert_eq!(plan_name("monthly", Some(690)), "monthly_6.9");
    }

    #[test]
    fn float_cent_conversion_avoids_drift() {
        // 29.99 * 100 is 2998.9999... in binary; rounding must recover 2999.
        assert_eq!(dollars_to_cents(29.99), 2999);
        assert_eq!(dollars_to_cents(0.1 + 0.2), 30);
    }
}

#[cfg(test)]
mod error_code_tests {
    use crate::error::BillingError;

    #[test]
    fn checkout_rejections_carry_stable_codes() {
        assert_eq!(
            BillingError::LifetimeAlreadyPurchased.code(),
            Some("LIFETIME_ALREADY_PURCHASED")
        );
        assert_eq!(
            BillingError::ActiveSubscriptionExists {
                subscription_ids: vec!["sub_1".into()]
            }
            .code(),
            Some("ACTIVE_SUBSCRIPTION_EXISTS")
        );
    }

    #[test]
    fn other_errors_have_no_code() {
        assert!(BillingError::CustomerRequired.code().is_none());
        assert!(BillingError::WebhookSignatureInvalid.code().is_none());
    }
}
