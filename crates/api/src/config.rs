//! Server configuration loaded from the environment

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Public storefront base URL, used for checkout success/cancel links.
    pub site_url: String,

    pub supabase_url: String,
    pub supabase_anon_key: String,
    /// Service-role key, required for minting signed storage URLs.
    pub supabase_service_role_key: String,

    pub resend_api_key: String,
    pub contact_recipient: String,
    pub contact_sender: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let supabase_url = required("SUPABASE_URL")?;
        let supabase_anon_key = required("SUPABASE_ANON_KEY")?;
        let supabase_service_role_key =
            std::env::var("SUPABASE_SERVICE_ROLE_KEY").unwrap_or_default();

        if supabase_service_role_key.is_empty() {
            tracing::warn!(
                "SUPABASE_SERVICE_ROLE_KEY not set - signed download URLs will be unavailable"
            );
        }

        let resend_api_key = std::env::var("RESEND_API_KEY").unwrap_or_default();
        if resend_api_key.is_empty() {
            tracing::warn!("RESEND_API_KEY not set - contact form delivery disabled");
        }

        Ok(Self {
            database_url,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            site_url: std::env::var("SITE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            supabase_url: supabase_url.trim_end_matches('/').to_string(),
            supabase_anon_key,
            supabase_service_role_key,
            resend_api_key,
            contact_recipient: std::env::var("CONTACT_EMAIL")
                .unwrap_or_else(|_| "support@nnaudio.com".to_string()),
            contact_sender: std::env::var("CONTACT_FROM")
                .unwrap_or_else(|_| "NNAudio Contact <noreply@nnaudio.com>".to_string()),
        })
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{} must be set", name))
}
