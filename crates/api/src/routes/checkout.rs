//! Checkout routes
//!
//! Both routes work for signed-in and guest buyers. A valid bearer token
//! attaches the buyer's user id and profile customer id so webhooks and
//! reconciliation can find them later; without one the customer is resolved
//! by email alone.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use nnaudio_billing::{CartCheckoutRequest, PlanCheckoutRequest};
use nnaudio_shared::{CartItem, SubscriptionPlan};

use crate::auth::{bearer_token, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct PlanCheckoutBody {
    pub plan: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default = "default_true")]
    pub collect_payment_method: bool,
    #[serde(default)]
    pub is_plan_change: bool,
}

pub async fn plan_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PlanCheckoutBody>,
) -> ApiResult<Response> {
    let plan = match SubscriptionPlan::parse(&body.plan) {
        SubscriptionPlan::None => {
            return Err(ApiError::BadRequest(format!(
                "Invalid plan type: {}",
                body.plan
            )))
        }
        plan => plan,
    };

    let auth_user = optional_auth(&state, &headers).await;

    let mut email = body.email.clone();
    let mut customer_id = body.customer_id.clone();
    let user_id = auth_user.as_ref().map(|u| u.user_id);

    if let Some(user) = &auth_user {
        if email.is_none() {
            email = user.email.clone();
        }
        // Prefer the profile's stored customer over a client-supplied one.
        if customer_id.is_none() {
            if let Ok(Some(profile)) = state.entitlements().profile(user.user_id).await {
                customer_id = profile.customer_id;
                if email.is_none() {
                    email = profile.email;
                }
            }
        }
    }

    let request = PlanCheckoutRequest {
        plan,
        customer_id,
        email,
        user_id,
        collect_payment_method: body.collect_payment_method,
        is_plan_change: body.is_plan_change,
    };

    match state.billing.checkout.create_plan_session(request).await {
        Ok(url) => Ok(Json(json!({ "url": url })).into_response()),
        Err(e) => match e.code() {
            // Business rejections keep the url field so the client can
            // treat the response uniformly.
            Some(code) => Ok((
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({
                    "url": null,
                    "error": code,
                    "message": e.to_string(),
                })),
            )
                .into_response()),
            None => Err(e.into()),
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct CartCheckoutBody {
    #[serde(default)]
    pub email: Option<String>,
    pub items: Vec<CartItem>,
}

pub async fn cart_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CartCheckoutBody>,
) -> ApiResult<Response> {
    if body.items.is_empty() {
        return Err(ApiError::BadRequest("Cart is empty".into()));
    }

    let auth_user = optional_auth(&state, &headers).await;

    let email = auth_user
        .as_ref()
        .and_then(|u| u.email.clone())
        .or(body.email.clone())
        .ok_or_else(|| ApiError::BadRequest("Email is required for checkout".into()))?;

    let request = CartCheckoutRequest {
        email,
        user_id: auth_user.map(|u| u.user_id),
        items: body.items,
    };

    let url = state.billing.checkout.create_cart_session(request).await?;
    Ok(Json(json!({ "url": url })).into_response())
}

/// Verify the bearer token when one is present. A bad token is treated as
/// anonymous rather than rejected; checkout never requires login.
async fn optional_auth(state: &AppState, headers: &HeaderMap) -> Option<AuthUser> {
    let token = bearer_token(headers)?;
    match state.supabase_auth().verify(&token).await {
        Ok(user) => Some(user),
        Err(_) => {
            tracing::debug!("Ignoring invalid bearer token on checkout");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_payment_method_defaults_to_true() {
        let body: PlanCheckoutBody = serde_json::from_str(r#"{"plan":"monthly"}"#).unwrap();
        assert!(body.collect_payment_method);
        assert!(!body.is_plan_change);
        assert!(body.email.is_none());
    }

    #[test]
    fn cart_body_parses_items() {
        let body: CartCheckoutBody = serde_json::from_str(
            r#"{"email":"a@b.co","items":[{"id":"prod_1","name":"Keys","price":49.0,"quantity":2}]}"#,
        )
        .unwrap();
        assert_eq!(body.items.len(), 1);
        assert_eq!(body.items[0].quantity, 2);
    }
}
