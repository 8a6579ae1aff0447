//! Product library route
//!
//! `GET /api/my-products` returns everything the account owns. An NFR flag
//! or any paid plan unlocks the whole active catalog; otherwise ownership
//! comes from reconciled Stripe purchases.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use nnaudio_shared::{ProductRow, SubscriptionPlan};

use crate::error::ApiResult;
use crate::routes::orders::{identity_for, require_auth};
use crate::state::AppState;

pub async fn my_products(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let user = require_auth(&state, &headers).await?;
    let entitlements = state.entitlements();

    let profile = entitlements.profile(user.user_id).await?;
    let plan = profile
        .as_ref()
        .map(|p| p.plan())
        .unwrap_or(SubscriptionPlan::None);

    let email = user
        .normalized_email()
        .or_else(|| profile.as_ref().and_then(|p| p.normalized_email()));
    let nfr = match &email {
        Some(email) => entitlements.has_nfr(email).await,
        None => false,
    };

    if nfr || plan.grants_all_products() {
        let products = entitlements.active_products().await?;
        return Ok(Json(json!({
            "success": true,
            "source": "subscription",
            "products": products.iter().map(product_summary).collect::<Vec<_>>(),
        })));
    }

    let identity = identity_for(&state, &user).await;
    let purchased = state
        .billing
        .reconciliation
        .resolve_purchased_products(&identity)
        .await?;

    let products = entitlements.products_by_ids(&purchased.product_ids).await?;
    let source = if products.is_empty() { "none" } else { "purchases" };

    Ok(Json(json!({
        "success": true,
        "source": source,
        "products": products.iter().map(product_summary).collect::<Vec<_>>(),
    })))
}

fn product_summary(product: &ProductRow) -> Value {
    json!({
        "id": product.id,
        "name": product.name,
        "slug": product.slug,
        "featured_image_url": product.featured_image_url,
        "download_version": product.download_version,
    })
}
