//! Contact form email delivery via the Resend HTTP API

use reqwest::Client;

use crate::error::{ApiError, ApiResult};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Clone)]
pub struct ContactEmailService {
    api_key: String,
    recipient: String,
    sender: String,
    client: Client,
}

impl ContactEmailService {
    pub fn new(
        api_key: impl Into<String>,
        recipient: impl Into<String>,
        sender: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            recipient: recipient.into(),
            sender: sender.into(),
            client,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Forward a contact-form submission to the support inbox. The visitor's
    /// address goes in reply-to so support can answer directly.
    pub async fn send_contact(
        &self,
        name: &str,
        reply_to: &str,
        subject: &str,
        message: &str,
    ) -> ApiResult<()> {
        if !self.is_enabled() {
            return Err(ApiError::Internal("Email delivery is not configured".into()));
        }

        let body = serde_json::json!({
            "from": self.sender,
            "to": [self.recipient],
            "reply_to": reply_to,
            "subject": format!("[Contact] {}", subject),
            "text": format!("From: {} <{}>\n\n{}", name, reply_to, message),
        });

        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Resend request failed");
                ApiError::Internal("Failed to send message".into())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, detail = %detail, "Resend rejected contact email");
            return Err(ApiError::Internal(format!(
                "Failed to send message: {}",
                detail
            )));
        }

        Ok(())
    }
}

/// Minimal shape check for the contact form. Deliverability is Resend's
/// problem; this just rejects obvious garbage.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_addresses() {
        assert!(is_valid_email("user@example.com"));
        assert!(is_valid_email("first.last+tag@sub.example.co.uk"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("user@"));
        assert!(!is_valid_email("user@nodot"));
        assert!(!is_valid_email("user@.com"));
        assert!(!is_valid_email("user@example.com."));
        assert!(!is_valid_email("user name@example.com"));
    }
}
