//! Admin product-grant routes
//!
//! All three handlers require a valid bearer token whose user id appears in
//! the admins table. Non-admins get a 403 regardless of what they ask for.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::routes::orders::require_auth;
use crate::state::AppState;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct GrantRow {
    pub id: Uuid,
    pub user_email: String,
    pub product_id: Uuid,
    pub granted_by: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct CreateGrantBody {
    pub user_email: String,
    pub product_id: Uuid,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeParams {
    pub id: Uuid,
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<crate::auth::AuthUser> {
    let user = require_auth(state, headers).await?;
    if !state.entitlements().is_admin(user.user_id).await? {
        return Err(ApiError::Forbidden("Admin access required".into()));
    }
    Ok(user)
}

pub async fn list_grants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;

    let grants: Vec<GrantRow> = sqlx::query_as(
        "SELECT id, user_email, product_id, granted_by, notes, granted_at \
         FROM product_grants ORDER BY granted_at DESC",
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(json!({ "success": true, "grants": grants })))
}

pub async fn create_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateGrantBody>,
) -> ApiResult<Json<Value>> {
    let admin = require_admin(&state, &headers).await?;

    let email = body.user_email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::BadRequest("user_email is required".into()));
    }

    let result = sqlx::query(
        "INSERT INTO product_grants (user_email, product_id, granted_by, notes) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_email, product_id) DO NOTHING",
    )
    .bind(&email)
    .bind(body.product_id)
    .bind(admin.email.as_deref())
    .bind(body.notes.as_deref())
    .execute(&state.pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::BadRequest(
            "Grant already exists for this user and product".into(),
        ));
    }

    tracing::info!(user_email = %email, product_id = %body.product_id, "Product grant created");
    Ok(Json(json!({ "success": true })))
}

pub async fn revoke_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RevokeParams>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;

    let result = sqlx::query("DELETE FROM product_grants WHERE id = $1")
        .bind(params.id)
        .execute(&state.pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::NotFound("Grant not found".into()));
    }

    tracing::info!(grant_id = %params.id, "Product grant revoked");
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_row_serializes_rfc3339() {
        let row = GrantRow {
            id: Uuid::nil(),
            user_email: "artist@example.com".into(),
            product_id: Uuid::nil(),
            granted_by: Some("admin@nnaudio.com".into()),
            notes: None,
            granted_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["granted_at"], "2023-11-14T22:13:20Z");
        assert_eq!(value["user_email"], "artist@example.com");
    }

    #[test]
    fn create_body_accepts_missing_notes() {
        let body: CreateGrantBody = serde_json::from_str(
            r#"{"user_email":"a@b.co","product_id":"00000000-0000-0000-0000-000000000000"}"#,
        )
        .unwrap();
        assert!(body.notes.is_none());
    }
}
