//! Application state

use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

use nnaudio_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
    /// HTTP client for Supabase auth/storage calls and outbound email.
    pub http_client: Client,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone(), &config.site_url)?;
        tracing::info!("Stripe billing service initialized");

        Ok(Self {
            pool,
            config,
            billing: Arc::new(billing),
            http_client: Client::new(),
        })
    }

    pub fn supabase_auth(&self) -> crate::auth::SupabaseAuth {
        crate::auth::SupabaseAuth::new(
            self.config.supabase_url.clone(),
            self.config.supabase_anon_key.clone(),
            self.http_client.clone(),
        )
    }

    pub fn storage(&self) -> crate::storage::SupabaseStorage {
        crate::storage::SupabaseStorage::new(
            self.config.supabase_url.clone(),
            self.config.supabase_service_role_key.clone(),
            self.http_client.clone(),
        )
    }

    pub fn contact_email(&self) -> crate::email::ContactEmailService {
        crate::email::ContactEmailService::new(
            self.config.resend_api_key.clone(),
            self.config.contact_recipient.clone(),
            self.config.contact_sender.clone(),
            self.http_client.clone(),
        )
    }

    pub fn entitlements(&self) -> crate::entitlements::EntitlementService {
        crate::entitlements::EntitlementService::new(self.pool.clone())
    }
}
