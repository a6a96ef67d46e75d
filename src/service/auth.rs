use crate::Config;
use crate::database::account::{AccountRepository, dummy_verify, verify_password};
use crate::database::session::SessionStore;
use crate::error::app_error::AppError;
use crate::models::account::Account;
use crate::models::session::{RefreshGrant, Session, SessionFilter, SessionSort};
use crate::models::token::{IssuedToken, TokenType};
use crate::service::email::{DeviceAlertNotifier, NewDeviceAlert};
use crate::service::service_util::bounded;
use crate::service::token::TokenService;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Knobs of the login and approval flows, resolved from [`Config`] once.
#[derive(Debug, Clone)]
pub struct DeviceTrustSettings {
    pub max_trusted_devices: u32,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub approval_token_ttl_seconds: i64,
    pub approval_url: String,
    pub store_timeout: Duration,
}

impl DeviceTrustSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_trusted_devices: config.device_trust.max_trusted_devices,
            access_token_ttl_seconds: config.jwt.access_token_ttl_seconds,
            refresh_token_ttl_seconds: config.jwt.refresh_token_ttl_seconds,
            approval_token_ttl_seconds: config.jwt.approval_token_ttl_seconds,
            approval_url: config.device_trust.approval_url.clone(),
            store_timeout: config.service.store_timeout(),
        }
    }
}

/// Access and refresh tokens handed to a newly trusted device.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub session_id: Uuid,
    pub access: IssuedToken,
    pub refresh: IssuedToken,
}

#[derive(Debug, Clone)]
pub struct RefreshedAccess {
    pub session_id: Uuid,
    pub access: IssuedToken,
}

/// What happened during a login attempt.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// The device holds a trusted session now.
    Granted(TokenGrant),
    /// Credentials were valid but the account has no free device slot; the
    /// owner was asked by email to approve the device.
    PendingApproval { session_id: Uuid },
}

pub struct DeviceTrustService {
    pub(crate) accounts: Arc<dyn AccountRepository>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) notifier: Arc<dyn DeviceAlertNotifier>,
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) settings: DeviceTrustSettings,
}

impl DeviceTrustService {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        sessions: Arc<dyn SessionStore>,
        notifier: Arc<dyn DeviceAlertNotifier>,
        tokens: Arc<TokenService>,
        settings: DeviceTrustSettings,
    ) -> Self {
        Self {
            accounts,
            sessions,
            notifier,
            tokens,
            settings,
        }
    }

    pub(crate) async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        bounded(self.settings.store_timeout, operation, call).await
    }

    pub async fn login(&self, email: &str, password: &str, device_id: &str) -> Result<LoginOutcome, AppError> {
        let account = self.authenticate(email, password).await?;

        let others = self
            .bounded(
                "find trusted sessions",
                self.sessions.find_many(&SessionFilter::other_trusted(account.id, device_id), SessionSort::CreatedAtAsc),
            )
            .await?;

        if others.len() >= self.settings.max_trusted_devices as usize {
            return self.request_approval(&account, device_id).await;
        }

        match self.claim_slot(&account, device_id).await? {
            Some(grant) => Ok(LoginOutcome::Granted(grant)),
            // Another device took the last slot between the count and the write.
            None => self.request_approval(&account, device_id).await,
        }
    }

    /// Mint fresh tokens and store them on the device's session if the
    /// account still has a free slot for it.
    async fn claim_slot(&self, account: &Account, device_id: &str) -> Result<Option<TokenGrant>, AppError> {
        let refresh = self.tokens.issue(&account.email, TokenType::Refresh, self.settings.refresh_token_ttl_seconds)?;
        let access = self.tokens.issue(&account.email, TokenType::Access, self.settings.access_token_ttl_seconds)?;

        let claimed = self
            .bounded(
                "claim trusted slot",
                self.sessions
                    .claim_trusted_slot(account.id, device_id, &RefreshGrant::from(&refresh), self.settings.max_trusted_devices),
            )
            .await?;

        Ok(claimed.map(|session| {
            info!(account_id = %account.id, session_id = %session.id, device_id, "trusted session granted");
            TokenGrant {
                session_id: session.id,
                access,
                refresh,
            }
        }))
    }

    async fn authenticate(&self, email: &str, password: &str) -> Result<Account, AppError> {
        let Some(account) = self.bounded("find account", self.accounts.find_by_email(email)).await? else {
            dummy_verify(password);
            return Err(AppError::InvalidCredentials);
        };

        if !verify_password(&account, password)? {
            return Err(AppError::InvalidCredentials);
        }

        Ok(account)
    }

    async fn request_approval(&self, account: &Account, device_id: &str) -> Result<LoginOutcome, AppError> {
        let approval = self
            .tokens
            .issue(&account.email, TokenType::Approval, self.settings.approval_token_ttl_seconds)?;

        let parked = self
            .bounded(
                "park pending session",
                self.sessions.park_pending(account.id, device_id, &approval.token),
            )
            .await?;

        let Some(session) = parked else {
            // The owner confirmed this device while the login was in flight.
            return match self.claim_slot(account, device_id).await? {
                Some(grant) => Ok(LoginOutcome::Granted(grant)),
                None => Err(AppError::internal("trusted device lost its slot during login")),
            };
        };

        let alert = NewDeviceAlert {
            recipient: account.email.clone(),
            device_id: device_id.to_string(),
            requested_at: approval.claims.issued_at(),
            confirm_url: self.approval_link(true, &approval.token),
            reject_url: self.approval_link(false, &approval.token),
        };

        // The pending row already exists; the owner can still be re-alerted by
        // logging in again, so a mail failure must not fail the login.
        if let Err(e) = self.bounded("send new device alert", self.notifier.send_new_device_alert(&alert)).await {
            error!(error = ?e, account_id = %account.id, session_id = %session.id, device_id, "failed to send new device alert");
        }

        info!(account_id = %account.id, session_id = %session.id, device_id, "device awaiting approval");
        Ok(LoginOutcome::PendingApproval { session_id: session.id })
    }

    pub(crate) fn approval_link(&self, confirm: bool, token: &str) -> String {
        let separator = if self.settings.approval_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}confirm={}&approved_token={}",
            self.settings.approval_url,
            separator,
            confirm,
            urlencoding::encode(token)
        )
    }

    /// Exchange a live refresh token of a trusted, non-revoked session for a
    /// new access token. Any mismatch is reported as `Unauthorized`.
    pub async fn refresh(&self, refresh_token: &str, device_id: &str) -> Result<RefreshedAccess, AppError> {
        let claims = self.tokens.verify_typed(refresh_token, TokenType::Refresh)?;

        let session = match self
            .bounded("find session", self.sessions.find_by_filter(&SessionFilter::by_refresh_token(refresh_token)))
            .await
        {
            Ok(session) => session,
            Err(AppError::NotFound(_)) => return Err(AppError::Unauthorized),
            Err(e) => return Err(e),
        };

        let live = session.refresh_grant().is_some_and(|grant| grant.is_live(Utc::now()));
        if !live || session.device_id != device_id {
            return Err(AppError::Unauthorized);
        }

        let access = self.tokens.issue(&claims.sub, TokenType::Access, self.settings.access_token_ttl_seconds)?;
        Ok(RefreshedAccess {
            session_id: session.id,
            access,
        })
    }

    /// Revoke the caller's session on `device_id`, freeing its device slot.
    pub async fn logout(&self, email: &str, device_id: &str) -> Result<Session, AppError> {
        let account = self
            .bounded("find account", self.accounts.find_by_email(email))
            .await?
            .ok_or(AppError::Unauthorized)?;

        let session = self.bounded("revoke session", self.sessions.revoke(account.id, device_id)).await?;
        info!(account_id = %account.id, session_id = %session.id, device_id, "session revoked");
        Ok(session)
    }
}
