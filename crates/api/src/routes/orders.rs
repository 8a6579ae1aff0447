//! Order history routes

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use nnaudio_billing::PurchaserIdentity;

use crate::auth::{bearer_token, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let user = require_auth(&state, &headers).await?;
    let identity = identity_for(&state, &user).await;

    let orders = state.billing.orders.list_orders(&identity).await?;
    Ok(Json(json!({ "success": true, "orders": orders })))
}

pub async fn count_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let user = require_auth(&state, &headers).await?;

    let profile = state.entitlements().profile(user.user_id).await?;
    let count = match profile.and_then(|p| p.customer_id) {
        Some(customer_id) => state.billing.orders.count_orders(&customer_id).await?,
        None => 0,
    };

    Ok(Json(json!({ "success": true, "count": count })))
}

pub(crate) async fn require_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<AuthUser> {
    let token = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".into()))?;
    state.supabase_auth().verify(&token).await
}

/// Identity for reconciliation: everything we know about the user. Profile
/// lookups are best effort; the token's email alone still finds purchases.
pub(crate) async fn identity_for(state: &AppState, user: &AuthUser) -> PurchaserIdentity {
    let profile = state
        .entitlements()
        .profile(user.user_id)
        .await
        .unwrap_or_default();

    PurchaserIdentity {
        customer_id: profile.as_ref().and_then(|p| p.customer_id.clone()),
        user_id: Some(user.user_id),
        email: user
            .normalized_email()
            .or_else(|| profile.as_ref().and_then(|p| p.normalized_email())),
    }
}
