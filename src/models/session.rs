use crate::error::app_error::AppError;
use crate::models::token::IssuedToken;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Refresh credential held by a trusted device, with its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshGrant {
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&IssuedToken> for RefreshGrant {
    fn from(token: &IssuedToken) -> Self {
        Self {
            refresh_token: token.token.clone(),
            issued_at: token.claims.issued_at(),
            expires_at: token.claims.expires_at(),
        }
    }
}

impl RefreshGrant {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Lifecycle of a device session.
///
/// `Pending` waits for the account owner to answer the approval email and never
/// holds a refresh token. `Trusted` occupies one of the account's device slots.
/// `Revoked` stays around as a record but holds no credential at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Pending { approval_token: String },
    Trusted(RefreshGrant),
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub account_id: Uuid,
    pub device_id: String,
    pub state: SessionState,
}

impl Session {
    pub fn is_trusted(&self) -> bool {
        matches!(self.state, SessionState::Trusted(_))
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.state, SessionState::Revoked)
    }

    pub fn refresh_grant(&self) -> Option<&RefreshGrant> {
        match &self.state {
            SessionState::Trusted(grant) => Some(grant),
            _ => None,
        }
    }

    pub fn approval_token(&self) -> Option<&str> {
        match &self.state {
            SessionState::Pending { approval_token } => Some(approval_token),
            _ => None,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.refresh_grant().map(|grant| grant.issued_at)
    }
}

/// Write payload for the (account, device) upsert.
#[derive(Debug, Clone)]
pub struct SessionUpsert {
    pub account_id: Uuid,
    pub device_id: String,
    pub state: SessionState,
}

/// Column values a [`SessionState`] is stored as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionColumns {
    pub refresh_token: String,
    pub approved_token: String,
    pub is_revoked: bool,
    pub trusted_device: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&SessionState> for SessionColumns {
    fn from(state: &SessionState) -> Self {
        match state {
            SessionState::Pending { approval_token } => Self {
                refresh_token: String::new(),
                approved_token: approval_token.clone(),
                is_revoked: false,
                trusted_device: false,
                created_at: None,
                expires_at: None,
            },
            SessionState::Trusted(grant) => Self {
                refresh_token: grant.refresh_token.clone(),
                approved_token: String::new(),
                is_revoked: false,
                trusted_device: true,
                created_at: Some(grant.issued_at),
                expires_at: Some(grant.expires_at),
            },
            SessionState::Revoked => Self {
                refresh_token: String::new(),
                approved_token: String::new(),
                is_revoked: true,
                trusted_device: false,
                created_at: None,
                expires_at: None,
            },
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub device_id: String,
    pub refresh_token: String,
    pub approved_token: String,
    pub is_revoked: bool,
    pub trusted_device: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let state = match (row.trusted_device, row.is_revoked, row.created_at, row.expires_at) {
            (true, false, Some(issued_at), Some(expires_at)) if !row.refresh_token.is_empty() => SessionState::Trusted(RefreshGrant {
                refresh_token: row.refresh_token,
                issued_at,
                expires_at,
            }),
            (false, false, _, _) if !row.approved_token.is_empty() => SessionState::Pending {
                approval_token: row.approved_token,
            },
            (false, true, _, _) => SessionState::Revoked,
            _ => return Err(AppError::internal(format!("session {} is in an inconsistent state", row.id))),
        };

        Ok(Session {
            id: row.id,
            account_id: row.account_id,
            device_id: row.device_id,
            state,
        })
    }
}

/// Typed predicate over sessions. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub device_id: Option<String>,
    pub exclude_device_id: Option<String>,
    pub approval_token: Option<String>,
    pub refresh_token: Option<String>,
    pub trusted: Option<bool>,
}

impl SessionFilter {
    pub fn by_account_device(account_id: Uuid, device_id: &str) -> Self {
        Self {
            account_id: Some(account_id),
            device_id: Some(device_id.to_string()),
            ..Self::default()
        }
    }

    pub fn by_approval_token(token: &str) -> Self {
        Self {
            approval_token: Some(token.to_string()),
            ..Self::default()
        }
    }

    pub fn by_refresh_token(token: &str) -> Self {
        Self {
            refresh_token: Some(token.to_string()),
            ..Self::default()
        }
    }

    /// Trusted sessions of the account held by any device except `device_id`.
    pub fn other_trusted(account_id: Uuid, device_id: &str) -> Self {
        Self {
            account_id: Some(account_id),
            exclude_device_id: Some(device_id.to_string()),
            trusted: Some(true),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.id.is_none_or(|id| session.id == id)
            && self.account_id.is_none_or(|account_id| session.account_id == account_id)
            && self.device_id.as_deref().is_none_or(|device_id| session.device_id == device_id)
            && self.exclude_device_id.as_deref().is_none_or(|device_id| session.device_id != device_id)
            && self.approval_token.as_deref().is_none_or(|token| session.approval_token() == Some(token))
            && self
                .refresh_token
                .as_deref()
                .is_none_or(|token| session.refresh_grant().is_some_and(|grant| grant.refresh_token == token))
            && self.trusted.is_none_or(|trusted| session.is_trusted() == trusted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionSort {
    /// Oldest trusted session first; this is eviction order.
    #[default]
    CreatedAtAsc,
}

/// Result of resolving a pending approval with `confirm = true`.
#[derive(Debug, Clone)]
pub struct Promotion {
    pub session: Session,
    pub evicted: Vec<Session>,
}
