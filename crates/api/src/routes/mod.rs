//! Route handlers

pub mod access;
pub mod admin;
pub mod checkout;
pub mod contact;
pub mod library;
pub mod orders;
pub mod webhook;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Stripe
        .route("/api/stripe/checkout", post(checkout::plan_checkout))
        .route("/api/stripe/cart-checkout", post(checkout::cart_checkout))
        .route("/api/stripe/webhook", post(webhook::stripe_webhook))
        // Account
        .route("/api/orders", get(orders::list_orders))
        .route("/api/orders/count", get(orders::count_orders))
        .route("/api/my-products", get(library::my_products))
        // Desktop installer (legacy form-encoded protocol)
        .route("/api/nnaudio-access/login", post(access::login))
        .route("/api/nnaudio-access/products", post(access::products))
        .route("/api/nnaudio-access/product", post(access::product))
        .route("/api/nnaudio-access/download", post(access::download))
        // Misc
        .route("/api/contact", post(contact::submit))
        .route(
            "/api/admin/product-grants",
            get(admin::list_grants)
                .post(admin::create_grant)
                .delete(admin::revoke_grant),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
