//! Desktop installer endpoints
//!
//! The NNAudio Access desktop app still speaks the old storefront protocol:
//! form-encoded POSTs, a `token` field instead of a bearer header, numeric
//! legacy product ids, and WooCommerce-era response shapes. Auth failures
//! must come back as HTTP 400 with `{"success":false,"message":"Token is
//! invalid"}` or the installer shows a generic network error.

use std::collections::HashSet;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use nnaudio_shared::{DownloadEntry, ProductRow, SubscriptionPlan};

use crate::auth::AuthUser;
use crate::entitlements::{has_access, product_access_source};
use crate::routes::orders::identity_for;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ProductForm {
    pub token: String,
    pub product_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadForm {
    pub token: String,
    pub product_id: String,
    pub path: String,
}

fn legacy_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "message": message }))).into_response()
}

pub async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    if form.email.trim().is_empty() || form.password.is_empty() {
        return legacy_error(StatusCode::BAD_REQUEST, "Email and password are required");
    }

    match state
        .supabase_auth()
        .password_grant(form.email.trim(), &form.password)
        .await
    {
        Ok(session) => Json(json!({
            "success": true,
            "token": session.access_token,
            "token_type": session.token_type,
            "expires_in": session.expires_in,
        }))
        .into_response(),
        Err(_) => legacy_error(StatusCode::BAD_REQUEST, "Invalid email or password"),
    }
}

pub async fn products(State(state): State<AppState>, Form(form): Form<TokenForm>) -> Response {
    let user = match authenticate(&state, &form.token).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let access = match resolve_access(&state, &user).await {
        Ok(access) => access,
        Err(response) => return response,
    };

    let entitlements = state.entitlements();
    let products = if access.all_products() {
        entitlements.active_products().await
    } else {
        entitlements.products_by_ids(&access.owned_ids()).await
    };

    match products {
        Ok(products) => {
            let payload: Vec<Value> = products.iter().map(legacy_product_summary).collect();
            Json(payload).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to load products for installer");
            legacy_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load products")
        }
    }
}

pub async fn product(State(state): State<AppState>, Form(form): Form<ProductForm>) -> Response {
    let user = match authenticate(&state, &form.token).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let found = match state.entitlements().find_product(&form.product_id).await {
        Ok(found) => found,
        Err(e) => {
            tracing::error!(error = %e, "Product lookup failed");
            return legacy_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load product");
        }
    };
    let Some(product) = found else {
        return legacy_error(StatusCode::NOT_FOUND, "Product not found");
    };

    let access = match resolve_access(&state, &user).await {
        Ok(access) => access,
        Err(response) => return response,
    };
    if !access.includes(&product) {
        return legacy_error(
            StatusCode::FORBIDDEN,
            "You do not have access to this product",
        );
    }

    // Mint signed URLs for stored paths; absolute URLs pass through.
    let mut downloads = Vec::new();
    for entry in product.download_entries() {
        let file = if entry.is_absolute_url() {
            entry.path.clone()
        } else {
            match state.storage().sign_download(&entry.path).await {
                Ok(signed) => signed.url,
                Err(e) => {
                    tracing::error!(path = %entry.path, error = %e, "Failed to sign download URL");
                    continue;
                }
            }
        };
        downloads.push(json!({
            "name": entry.name.clone().unwrap_or_else(|| product.name.clone()),
            "file": file,
            "version": entry.version,
            "file_size": entry.file_size,
        }));
    }

    Json(json!({
        "id": legacy_id(&product),
        "name": product.name,
        "images": product
            .featured_image_url
            .as_ref()
            .map(|src| vec![json!({ "src": src })])
            .unwrap_or_default(),
        "version": product.download_version,
        "downloads": downloads,
    }))
    .into_response()
}

pub async fn download(State(state): State<AppState>, Form(form): Form<DownloadForm>) -> Response {
    let user = match authenticate(&state, &form.token).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    let found = match state.entitlements().find_product(&form.product_id).await {
        Ok(found) => found,
        Err(e) => {
            tracing::error!(error = %e, "Product lookup failed");
            return legacy_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load product");
        }
    };
    let Some(product) = found else {
        return legacy_error(StatusCode::NOT_FOUND, "Product not found");
    };

    let access = match resolve_access(&state, &user).await {
        Ok(access) => access,
        Err(response) => return response,
    };
    if !access.includes(&product) {
        return legacy_error(
            StatusCode::FORBIDDEN,
            "You do not have access to this product",
        );
    }

    // The requested path must be one of the product's own downloads;
    // otherwise a token holder could sign arbitrary bucket paths.
    let Some(entry) = find_download(&product, &form.path) else {
        return legacy_error(StatusCode::BAD_REQUEST, "Invalid download path");
    };

    if entry.is_absolute_url() {
        return Json(json!({
            "success": true,
            "url": entry.path,
            "expires_at": null,
        }))
        .into_response();
    }

    match state.storage().sign_download(&entry.path).await {
        Ok(signed) => Json(json!({
            "success": true,
            "url": signed.url,
            "expires_at": signed.expires_at,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(path = %entry.path, error = %e, "Failed to sign download URL");
            legacy_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create download URL",
            )
        }
    }
}

async fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, Response> {
    if token.trim().is_empty() {
        return Err(legacy_error(StatusCode::BAD_REQUEST, "Token is invalid"));
    }
    state
        .supabase_auth()
        .verify(token.trim())
        .await
        .map_err(|_| legacy_error(StatusCode::BAD_REQUEST, "Token is invalid"))
}

/// What the user can reach, union of every entitlement source.
struct ResolvedAccess {
    nfr: bool,
    subscription_all: bool,
    granted: HashSet<uuid::Uuid>,
    purchased: HashSet<String>,
}

impl ResolvedAccess {
    fn all_products(&self) -> bool {
        self.nfr || self.subscription_all
    }

    fn includes(&self, product: &ProductRow) -> bool {
        has_access(product_access_source(
            product,
            self.nfr,
            self.subscription_all,
            &self.granted,
            &self.purchased,
        ))
    }

    fn owned_ids(&self) -> HashSet<String> {
        self.granted
            .iter()
            .map(|id| id.to_string())
            .chain(self.purchased.iter().cloned())
            .collect()
    }
}

async fn resolve_access(state: &AppState, user: &AuthUser) -> Result<ResolvedAccess, Response> {
    let entitlements = state.entitlements();

    let profile = entitlements.profile(user.user_id).await.unwrap_or_default();
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
        return Ok(ResolvedAccess {
            nfr,
            subscription_all: plan.grants_all_products(),
            granted: HashSet::new(),
            purchased: HashSet::new(),
        });
    }

    let granted = match &email {
        Some(email) => entitlements
            .granted_product_ids(email)
            .await
            .unwrap_or_default(),
        None => HashSet::new(),
    };

    let identity = identity_for(state, user).await;
    let purchased = match state
        .billing
        .reconciliation
        .resolve_purchased_products(&identity)
        .await
    {
        Ok(result) => result.product_ids,
        Err(e) => {
            tracing::warn!(error = %e, "Purchase reconciliation failed, grants only");
            HashSet::new()
        }
    };

    Ok(ResolvedAccess {
        nfr: false,
        subscription_all: false,
        granted,
        purchased,
    })
}

fn find_download(product: &ProductRow, path: &str) -> Option<DownloadEntry> {
    product
        .download_entries()
        .into_iter()
        .find(|entry| entry.path == path)
}

/// The installer prefers the old numeric store id when one exists.
fn legacy_id(product: &ProductRow) -> Value {
    match product.legacy_product_id {
        Some(id) => json!(id),
        None => json!(product.id.to_string()),
    }
}

fn legacy_product_summary(product: &ProductRow) -> Value {
    let download_name = product
        .download_entries()
        .first()
        .and_then(|entry| entry.name.clone())
        .unwrap_or_else(|| product.name.clone());

    json!({
        "product_id": legacy_id(product),
        "product_name": product.name,
        "download_name": download_name,
        "image_url": product.featured_image_url,
    })
}
