//! Row models shared between the API server and billing services

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::SubscriptionPlan;

/// A user profile row. Created on signup; `customer_id` is resolved or
/// repaired by the checkout flow, `subscription` is written by webhooks.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub email: Option<String>,
    pub customer_id: Option<String>,
    pub subscription: Option<String>,
}

impl Profile {
    pub fn plan(&self) -> SubscriptionPlan {
        self.subscription
            .as_deref()
            .map(SubscriptionPlan::parse)
            .unwrap_or(SubscriptionPlan::None)
    }

    /// Lowercased email, the form used for grant and NFR lookups.
    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().map(|e| e.trim().to_lowercase())
    }
}

/// One entry of a product's `downloads` jsonb array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEntry {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

impl DownloadEntry {
    /// Paths already stored as absolute URLs are served as-is; everything
    /// else needs a signed storage URL.
    pub fn is_absolute_url(&self) -> bool {
        self.path.starts_with("http://") || self.path.starts_with("https://")
    }
}

/// A product row as the access endpoints read it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductRow {
    pub id: Uuid,
    pub legacy_product_id: Option<i64>,
    pub name: String,
    pub slug: Option<String>,
    pub status: Option<String>,
    pub featured_image_url: Option<String>,
    pub download_version: Option<String>,
    pub downloads: Option<serde_json::Value>,
}

impl ProductRow {
    pub fn download_entries(&self) -> Vec<DownloadEntry> {
        self.downloads
            .as_ref()
            .and_then(|v| serde_json::from_value::<Vec<DownloadEntry>>(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// A cart item as embedded in payment-intent metadata (`cart_items`, a
/// JSON-encoded array stored as a string inside the metadata bag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl CartItem {
    /// Effective unit price: sale price wins when set.
    pub fn unit_price(&self) -> f64 {
        self.sale_price.or(self.price).unwrap_or(0.0)
    }

    pub fn line_total(&self) -> f64 {
        self.unit_price() * f64::from(self.quantity)
    }
}

/// Parse the `cart_items` metadata value. Malformed JSON yields an empty
/// list; a missing item id drops just that item.
pub fn parse_cart_items(raw: &str) -> Vec<CartItem> {
    match serde_json::from_str::<Vec<CartItem>>(raw) {
        Ok(items) => items.into_iter().filter(|i| !i.id.is_empty()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse cart_items metadata");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_item_sale_price_wins() {
        let item = CartItem {
            id: "prod_1".into(),
            name: Some("Vintage Keys".into()),
            price: Some(49.0),
            sale_price: Some(29.0),
            quantity: 2,
        };
        assert_eq!(item.unit_price(), 29.0);
        assert_eq!(item.line_total(), 58.0);
    }

    #[test]
    fn parse_cart_items_drops_malformed() {
        assert!(parse_cart_items("not json").is_empty());
        let items = parse_cart_items(r#"[{"id":"a","quantity":1},{"id":"","name":"x"}]"#);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a");
    }

    #[test]
    fn parse_cart_items_defaults_quantity() {
        let items = parse_cart_items(r#"[{"id":"a"}]"#);
        assert_eq!(items[0].quantity, 1);
    }

    #[test]
    fn download_entry_absolute_url_detection() {
        let signed = DownloadEntry {
            path: "plugins/foo-1.2.zip".into(),
            name: None,
            kind: None,
            version: None,
            file_size: None,
        };
        assert!(!signed.is_absolute_url());

        let absolute = DownloadEntry {
            path: "https://cdn.example.com/foo.zip".into(),
            ..signed.clone()
        };
        assert!(absolute.is_absolute_url());
    }

    #[test]
    fn profile_plan_parsing() {
        let profile = Profile {
            id: Uuid::new_v4(),
            email: Some("  User@Example.COM ".into()),
            customer_id: None,
            subscription: Some("annual".into()),
        };
        assert_eq!(profile.plan(), SubscriptionPlan::Annual);
        assert_eq!(
            profile.normalized_email().as_deref(),
            Some("user@example.com")
        );
    }
}
