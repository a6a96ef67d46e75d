use crate::error::app_error::AppError;
use crate::models::session::{RefreshGrant, SessionFilter};
use crate::models::token::TokenType;
use crate::service::auth::{DeviceTrustService, TokenGrant};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// The pending device is trusted now and the oldest devices were signed out.
    Confirmed(TokenGrant),
    /// The pending device was removed.
    Rejected { session_id: Uuid },
}

impl DeviceTrustService {
    /// Resolve the pending session behind `approval_token`.
    ///
    /// Whichever resolution reaches the store first consumes the token; any
    /// later attempt with the same token sees `NotFound`.
    pub async fn resolve_approval(&self, confirm: bool, approval_token: &str) -> Result<ApprovalOutcome, AppError> {
        let claims = self.tokens.verify_typed(approval_token, TokenType::Approval)?;

        let pending = self
            .bounded("find pending session", self.sessions.find_by_filter(&SessionFilter::by_approval_token(approval_token)))
            .await?;

        if !confirm {
            let session = self.bounded("reject pending session", self.sessions.reject_pending(approval_token)).await?;
            info!(
                account_id = %session.account_id,
                session_id = %session.id,
                device_id = %session.device_id,
                "pending device rejected"
            );
            return Ok(ApprovalOutcome::Rejected { session_id: session.id });
        }

        let refresh = self.tokens.issue(&claims.sub, TokenType::Refresh, self.settings.refresh_token_ttl_seconds)?;
        let access = self.tokens.issue(&claims.sub, TokenType::Access, self.settings.access_token_ttl_seconds)?;

        let promotion = self
            .bounded(
                "promote pending session",
                self.sessions
                    .promote_pending(approval_token, &RefreshGrant::from(&refresh), self.settings.max_trusted_devices),
            )
            .await?;

        for evicted in &promotion.evicted {
            info!(
                account_id = %evicted.account_id,
                session_id = %evicted.id,
                device_id = %evicted.device_id,
                replaced_by = %pending.device_id,
                "trusted device evicted"
            );
        }

        Ok(ApprovalOutcome::Confirmed(TokenGrant {
            session_id: promotion.session.id,
            access,
            refresh,
        }))
    }
}
