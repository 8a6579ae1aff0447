//! Contact form route

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::email::is_valid_email;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ContactBody {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
}

pub async fn submit(
    State(state): State<AppState>,
    Json(body): Json<ContactBody>,
) -> ApiResult<Json<Value>> {
    let name = body.name.trim();
    let email = body.email.trim();
    let subject = body.subject.trim();
    let message = body.message.trim();

    if name.is_empty() || email.is_empty() || subject.is_empty() || message.is_empty() {
        return Err(ApiError::BadRequest("All fields are required".into()));
    }
    if !is_valid_email(email) {
        return Err(ApiError::BadRequest("Invalid email address".into()));
    }

    state
        .contact_email()
        .send_contact(name, email, subject, message)
        .await?;

    tracing::info!(from = %email, "Contact form submitted");
    Ok(Json(json!({ "success": true })))
}
