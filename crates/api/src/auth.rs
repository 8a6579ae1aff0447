//! Supabase token authentication
//!
//! Account routes authenticate with a Supabase access token, either as a
//! bearer header or (for the desktop installer's form-encoded endpoints) a
//! `token` form field. Tokens are verified against Supabase's
//! `/auth/v1/user` endpoint; we never decode them locally.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Authenticated user identity as Supabase reports it.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

impl AuthUser {
    /// Lowercased email, the form grant and NFR lookups use.
    pub fn normalized_email(&self) -> Option<String> {
        self.email.as_deref().map(|e| e.trim().to_lowercase())
    }
}

/// Response from Supabase /auth/v1/user
#[derive(Debug, Deserialize)]
struct SupabaseUserResponse {
    id: String,
    email: Option<String>,
}

/// Response from the Supabase password grant
#[derive(Debug, Deserialize)]
pub struct SupabaseSession {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Thin client over the Supabase auth REST surface.
#[derive(Clone)]
pub struct SupabaseAuth {
    base_url: String,
    anon_key: String,
    client: Client,
}

impl SupabaseAuth {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            client,
        }
    }

    /// Verify an access token, returning who it belongs to.
    pub async fn verify(&self, token: &str) -> ApiResult<AuthUser> {
        let url = format!("{}/auth/v1/user", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.anon_key)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Supabase token verification request failed");
                ApiError::Unauthorized("Token verification failed".into())
            })?;

        if !response.status().is_success() {
            tracing::debug!(
                status = %response.status(),
                "Supabase rejected access token"
            );
            return Err(ApiError::Unauthorized("Invalid or expired token".into()));
        }

        let user: SupabaseUserResponse = response
            .json()
            .await
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))?;

        let user_id = Uuid::parse_str(&user.id)
            .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))?;

        Ok(AuthUser {
            user_id,
            email: user.email,
        })
    }

    /// Exchange email/password for a session via the password grant. Used by
    /// the desktop-installer login proxy.
    pub async fn password_grant(&self, email: &str, password: &str) -> ApiResult<SupabaseSession> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Supabase password grant request failed");
                ApiError::Internal("Login request failed".into())
            })?;

        if !response.status().is_success() {
            return Err(ApiError::Unauthorized("Invalid email or password".into()));
        }

        response
            .json()
            .await
            .map_err(|_| ApiError::Internal("Login response was malformed".into()))
    }
}

/// Extract a bearer token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_or_malformed_bearer_is_none() {
        assert!(bearer_token(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_none());
    }

    #[tokio::test]
    async fn verify_accepts_valid_supabase_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/auth/v1/user")
            .match_header("apikey", "anon")
            .with_status(200)
            .with_body(r#"{"id":"00000000-0000-0000-0000-000000000001","email":"user@example.com"}"#)
            .create_async()
            .await;

        let auth = SupabaseAuth::new(server.url(), "anon", Client::new());
        let user = auth.verify("token").await.unwrap();

        assert_eq!(user.email.as_deref(), Some("user@example.com"));
        assert_eq!(
            user.user_id.to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn verify_rejects_failed_supabase_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/auth/v1/user")
            .with_status(401)
            .with_body(r#"{"message":"invalid token"}"#)
            .create_async()
            .await;

        let auth = SupabaseAuth::new(server.url(), "anon", Client::new());
        assert!(matches!(
            auth.verify("bad").await,
            Err(ApiError::Unauthorized(_))
        ));
    }
}
