//! Product entitlements
//!
//! A user can hold a product four different ways: an NFR license flag, an
//! explicit grant row, an all-access subscription, or a reconciled Stripe
//! purchase. The access endpoints take the union; one source is enough.

use std::collections::HashSet;

use sqlx::PgPool;
use uuid::Uuid;

use nnaudio_shared::{ProductRow, Profile};

use crate::error::ApiResult;

/// Why access was granted. Reported by the library endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Nfr,
    Grant,
    Subscription,
    Purchases,
    None,
}

#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
}

impl EntitlementService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn profile(&self, user_id: Uuid) -> ApiResult<Option<Profile>> {
        let profile = sqlx::query_as::<_, Profile>(
            "SELECT id, email, customer_id, subscription FROM profiles WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile)
    }

    /// NFR (not-for-resale) flag: everything is unlocked for press and
    /// partner accounts. Lookup failures degrade to "no".
    pub async fn has_nfr(&self, email: &str) -> bool {
        let result: Result<Option<bool>, sqlx::Error> = sqlx::query_scalar(
            "SELECT pro FROM user_management WHERE LOWER(user_email) = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => {
                tracing::warn!(email = %email, error = %e, "NFR lookup failed");
                false
            }
        }
    }

    /// Product ids explicitly granted to this email.
    pub async fn granted_product_ids(&self, email: &str) -> ApiResult<HashSet<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT product_id FROM product_grants WHERE LOWER(user_email) = $1",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn is_admin(&self, user_id: Uuid) -> ApiResult<bool> {
        let exists: Option<bool> = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM admins WHERE "user" = $1)"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.unwrap_or(false))
    }

    /// Look up a product by UUID or by its legacy numeric store id. The
    /// desktop installer still sends the numeric ids from the old store.
    pub async fn find_product(&self, identifier: &str) -> ApiResult<Option<ProductRow>> {
        match classify_product_identifier(identifier) {
            ProductIdentifier::Uuid(uuid) => {
                let product = sqlx::query_as::<_, ProductRow>(
                    "SELECT id, legacy_product_id, name, slug, status, featured_image_url, \
                            download_version, downloads \
                     FROM products WHERE id = $1",
                )
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
                Ok(product)
            }
            ProductIdentifier::Legacy(legacy_id) => {
                let product = sqlx::query_as::<_, ProductRow>(
                    "SELECT id, legacy_product_id, name, slug, status, featured_image_url, \
                            download_version, downloads \
                     FROM products WHERE legacy_product_id = $1",
                )
                .bind(legacy_id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(product)
            }
            ProductIdentifier::Unrecognized => Ok(None),
        }
    }

    pub async fn active_products(&self) -> ApiResult<Vec<ProductRow>> {
        let products = sqlx::query_as::<_, ProductRow>(
            "SELECT id, legacy_product_id, name, slug, status, featured_image_url, \
                    download_version, downloads \
             FROM products WHERE status = 'active' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }

    /// Products matching a set of reconciled id strings. Non-UUID entries
    /// (malformed metadata) are skipped.
    pub async fn products_by_ids(&self, ids: &HashSet<String>) -> ApiResult<Vec<ProductRow>> {
        let uuids: Vec<Uuid> = ids.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect();
        if uuids.is_empty() {
            return Ok(Vec::new());
        }

        let products = sqlx::query_as::<_, ProductRow>(
            "SELECT id, legacy_product_id, name, slug, status, featured_image_url, \
                    download_version, downloads \
             FROM products WHERE id = ANY($1) ORDER BY name",
        )
        .bind(&uuids)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }
}

/// What kind of product identifier a client sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductIdentifier {
    Uuid(Uuid),
    /// Numeric id from the old e-commerce store.
    Legacy(i64),
    Unrecognized,
}

/// UUIDs win over numeric parsing; anything else is unrecognized and will
/// never match a product.
pub fn classify_product_identifier(identifier: &str) -> ProductIdentifier {
    if let Ok(uuid) = Uuid::parse_str(identifier) {
        return ProductIdentifier::Uuid(uuid);
    }
    if let Ok(legacy_id) = identifier.parse::<i64>() {
        return ProductIdentifier::Legacy(legacy_id);
    }
    ProductIdentifier::Unrecognized
}

/// Union access decision for a single product. Sources are checked in the
/// order they short-circuit cheapest.
pub fn product_access_source(
    product: &ProductRow,
    nfr: bool,
    subscription_grants_all: bool,
    granted: &HashSet<Uuid>,
    purchased: &HashSet<String>,
) -> AccessSource {
    if nfr {
        return AccessSource::Nfr;
    }
    if granted.contains(&product.id) {
        return AccessSource::Grant;
    }
    if subscription_grants_all {
        return AccessSource::Subscription;
    }
    if purchased.contains(&product.id.to_string()) {
        return AccessSource::Purchases;
    }
    AccessSource::None
}

pub fn has_access(source: AccessSource) -> bool {
    source != AccessSource::None
}
