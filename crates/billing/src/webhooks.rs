//! Stripe webhook handling
//!
//! Verifies incoming Stripe events and applies the two that matter to the
//! storefront: `checkout.session.completed` promotes the buyer's profile to
//! the purchased plan, and `customer.subscription.deleted` resets it.
//!
//! Signature verification tries the SDK first and falls back to manual HMAC
//! verification of the `Stripe-Signature` header, which keeps working when
//! Stripe sends an event shaped by a newer API version than the SDK pins.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use nnaudio_shared::SubscriptionPlan;

type HmacSha256 = Hmac<Sha256>;

/// Reject events whose signature timestamp is further than this from now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Verify and parse a Stripe webhook event.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;
        if webhook_secret.is_empty() {
            tracing::error!("STRIPE_WEBHOOK_SECRET is not configured");
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET not configured".into(),
            ));
        }

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature_manually(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );
        Ok(event)
    }

    /// Handle a verified event exactly once.
    ///
    /// The INSERT...ON CONFLICT...RETURNING claim means only one concurrent
    /// delivery gets processing rights; a claim stuck in `processing` for
    /// over 30 minutes can be re-claimed so a crashed worker does not wedge
    /// the event forever.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($3 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook delivery, already claimed"
            );
            return Ok(());
        }

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE stripe_webhook_events SET processing_result = $1, error_message = $2 \
             WHERE stripe_event_id = $3",
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event).await
            }
            _ => {
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Ignoring unhandled Stripe event type"
                );
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(&self, event: &Event) -> BillingResult<()> {
        let EventObject::CheckoutSession(session) = &event.data.object else {
            return Err(BillingError::Internal(
                "checkout.session.completed without a session object".into(),
            ));
        };

        let metadata = session.metadata.clone().unwrap_or_default();

        let Some(plan) = plan_from_metadata(&metadata) else {
            // Cart checkouts carry no plan_type; they grant products through
            // reconciliation, not a profile plan.
            tracing::info!(
                session_id = %session.id,
                "Checkout session completed without plan_type, nothing to apply"
            );
            return Ok(());
        };

        let user_id = metadata.get("user_id").and_then(|v| Uuid::parse_str(v).ok());
        let customer_id = metadata
            .get("customer_id")
            .cloned()
            .or_else(|| session.customer.as_ref().map(|c| c.id().to_string()));
        let email = metadata.get("email").map(|e| e.trim().to_lowercase());

        let updated = self
            .update_profile_subscription(plan, user_id, customer_id.as_deref(), email.as_deref())
            .await?;

        if updated {
            tracing::info!(
                session_id = %session.id,
                plan = %plan,
                "Applied plan to profile after checkout"
            );
        } else {
            tracing::warn!(
                session_id = %session.id,
                plan = %plan,
                user_id = ?user_id,
                customer_id = ?customer_id,
                "Checkout completed but no matching profile found"
            );
        }
        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &Event) -> BillingResult<()> {
        let EventObject::Subscription(subscription) = &event.data.object else {
            return Err(BillingError::Internal(
                "customer.subscription.deleted without a subscription object".into(),
            ));
        };

        let customer_id = subscription.customer.id().to_string();

        let done =
            sqlx::query("UPDATE profiles SET subscription = 'none' WHERE customer_id = $1")
                .bind(&customer_id)
                .execute(&self.pool)
                .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %customer_id,
            profiles_updated = done.rows_affected(),
            "Subscription cancelled, profile reset"
        );
        Ok(())
    }

    /// Write the plan onto the buyer's profile, keyed by user id first, then
    /// the Stripe customer id, then the checkout email. Returns whether any
    /// profile matched.
    async fn update_profile_subscription(
        &self,
        plan: SubscriptionPlan,
        user_id: Option<Uuid>,
        customer_id: Option<&str>,
        email: Option<&str>,
    ) -> BillingResult<bool> {
        if let Some(user_id) = user_id {
            let done = sqlx::query("UPDATE profiles SET subscription = $1 WHERE id = $2")
                .bind(plan.as_str())
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            if done.rows_affected() > 0 {
                return Ok(true);
            }
        }

        if let Some(customer_id) = customer_id {
            let done =
                sqlx::query("UPDATE profiles SET subscription = $1 WHERE customer_id = $2")
                    .bind(plan.as_str())
                    .bind(customer_id)
                    .execute(&self.pool)
                    .await?;
            if done.rows_affected() > 0 {
                return Ok(true);
            }
        }

        if let Some(email) = email {
            let done =
                sqlx::query("UPDATE profiles SET subscription = $1 WHERE LOWER(email) = $2")
                    .bind(plan.as_str())
                    .bind(email)
                    .execute(&self.pool)
                    .await?;
            if done.rows_affected() > 0 {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

/// Plan purchased in a checkout session, from its metadata. `None` when the
/// session was not a plan checkout.
pub fn plan_from_metadata(
    metadata: &std::collections::HashMap<String, String>,
) -> Option<SubscriptionPlan> {
    let plan_type = metadata.get("plan_type")?;
    match SubscriptionPlan::parse(plan_type) {
        SubscriptionPlan::None => None,
        plan => Some(plan),
    }
}

/// Manual `Stripe-Signature` verification: parse `t=...,v1=...`, enforce the
/// timestamp tolerance, and compare the HMAC-SHA256 of `{t}.{payload}`.
pub fn verify_signature_manually(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn manual_verification_accepts_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_testsecret";
        let now = 1_700_000_000;
        let header = sign(payload, secret, now);

        assert!(verify_signature_manually(payload, &header, secret, now).is_ok());
    }

    #[test]
    fn manual_verification_rejects_wrong_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, "whsec_other", now);

        assert!(matches!(
            verify_signature_manually(payload, &header, "whsec_testsecret", now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn manual_verification_rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let secret = "whsec_testsecret";
        let signed_at = 1_700_000_000;
        let header = sign(payload, secret, signed_at);

        let now = signed_at + SIGNATURE_TOLERANCE_SECS + 1;
        assert!(verify_signature_manually(payload, &header, secret, now).is_err());
    }

    #[test]
    fn manual_verification_rejects_malformed_header() {
        assert!(verify_signature_manually("{}", "garbage", "whsec_x", 0).is_err());
        assert!(verify_signature_manually("{}", "t=notanumber,v1=ab", "whsec_x", 0).is_err());
    }

    #[test]
    fn plan_metadata_parsing() {
        let mut metadata = HashMap::new();
        metadata.insert("plan_type".to_string(), "lifetime".to_string());
        assert_eq!(plan_from_metadata(&metadata), Some(SubscriptionPlan::Lifetime));

        metadata.insert("plan_type".to_string(), "mystery".to_string());
        assert_eq!(plan_from_metadata(&metadata), None);

        assert_eq!(plan_from_metadata(&HashMap::new()), None);
    }
}
