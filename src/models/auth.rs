use crate::models::token::TokenType;
use crate::service::auth::{RefreshedAccess, TokenGrant};
use chrono::{DateTime, Utc};
use rocket::serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate, JsonSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1))]
    pub refresh_token: String,
}

/// Tokens handed to a device once it holds a trusted session.
#[derive(Debug, Serialize, JsonSchema)]
pub struct SessionTokensResponse {
    pub session_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

impl From<&TokenGrant> for SessionTokensResponse {
    fn from(grant: &TokenGrant) -> Self {
        Self {
            session_id: grant.session_id,
            access_token: grant.access.token.clone(),
            refresh_token: grant.refresh.token.clone(),
            access_token_expires_at: grant.access.claims.expires_at(),
            refresh_token_expires_at: grant.refresh.claims.expires_at(),
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginResponse {
    Authenticated { message: String, data: SessionTokensResponse },
    /// The account already uses all of its trusted device slots; the owner
    /// received an email to approve or reject this device.
    PendingApproval { message: String },
}

#[derive(Debug, Serialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfirmResponse {
    Confirmed { message: String, data: SessionTokensResponse },
    Rejected { message: String },
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct RefreshResponse {
    pub session_id: Uuid,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
}

impl From<&RefreshedAccess> for RefreshResponse {
    fn from(refreshed: &RefreshedAccess) -> Self {
        Self {
            session_id: refreshed.session_id,
            access_token: refreshed.access.token.clone(),
            access_token_expires_at: refreshed.access.claims.expires_at(),
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct MeResponse {
    pub email: String,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
}
