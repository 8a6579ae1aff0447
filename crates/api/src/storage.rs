//! Supabase storage signed URLs
//!
//! Product downloads live in a private storage bucket; customers get
//! short-lived signed URLs minted with the service-role key.

use reqwest::Client;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::error::{ApiError, ApiResult};

/// Bucket holding product download artifacts.
const DOWNLOAD_BUCKET: &str = "product-downloads";

/// Signed URLs stay valid for one hour.
pub const SIGNED_URL_EXPIRY_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct SignedDownload {
    pub url: String,
    pub expires_at: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

/// Client for the Supabase storage sign endpoint.
#[derive(Clone)]
pub struct SupabaseStorage {
    base_url: String,
    service_role_key: String,
    client: Client,
}

impl SupabaseStorage {
    pub fn new(
        base_url: impl Into<String>,
        service_role_key: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            service_role_key: service_role_key.into(),
            client,
        }
    }

    /// Mint a one-hour signed URL for a path in the downloads bucket.
    pub async fn sign_download(&self, path: &str) -> ApiResult<SignedDownload> {
        if self.service_role_key.is_empty() {
            return Err(ApiError::Internal(
                "Storage signing is not configured".into(),
            ));
        }

        let trimmed = path.trim_start_matches('/');
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url, DOWNLOAD_BUCKET, trimmed
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_role_key)
            .json(&serde_json::json!({ "expiresIn": SIGNED_URL_EXPIRY_SECS }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(path = %trimmed, error = %e, "Storage sign request failed");
                ApiError::Internal("Failed to create download URL".into())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(path = %trimmed, status = %status, "Storage sign rejected");
            return Err(ApiError::Internal("Failed to create download URL".into()));
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|_| ApiError::Internal("Failed to create download URL".into()))?;

        let expires_at = (OffsetDateTime::now_utc() + Duration::seconds(SIGNED_URL_EXPIRY_SECS))
            .format(&Rfc3339)
            .unwrap_or_default();

        Ok(SignedDownload {
            url: absolute_signed_url(&self.base_url, &signed.signed_url),
            expires_at,
        })
    }
}

/// Supabase returns the signed URL relative to the storage API root.
fn absolute_signed_url(base_url: &str, signed_url: &str) -> String {
    if signed_url.starts_with("http://") || signed_url.starts_with("https://") {
        signed_url.to_string()
    } else {
        format!(
            "{}/storage/v1/{}",
            base_url,
            signed_url.trim_start_matches('/')
        )
    }
}
