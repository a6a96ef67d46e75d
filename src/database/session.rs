use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::session::{Promotion, RefreshGrant, Session, SessionColumns, SessionFilter, SessionRow, SessionSort, SessionState, SessionUpsert};
use sqlx::{PgConnection, PgExecutor, Postgres, QueryBuilder};
use tracing::{info, warn};
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, account_id, device_id, refresh_token, approved_token, is_revoked, trusted_device, created_at, expires_at";

/// Durable per (account, device) session records.
///
/// Every write that spans more than one row runs in a single transaction; the
/// confirmation path additionally serialises on a per-account advisory lock so
/// concurrent confirmations re-count trusted sessions after each other.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// First session matching `filter`, `NotFound` if there is none.
    async fn find_by_filter(&self, filter: &SessionFilter) -> Result<Session, AppError>;

    async fn find_many(&self, filter: &SessionFilter, sort: SessionSort) -> Result<Vec<Session>, AppError>;

    /// Insert or overwrite the row keyed on (account_id, device_id).
    async fn upsert_by_account_device(&self, upsert: &SessionUpsert) -> Result<Session, AppError>;

    /// Upsert the (account, device) session as trusted, but only while fewer
    /// than `quota` other devices of the account are trusted. `None` means the
    /// slot was taken in the meantime and nothing was written.
    async fn claim_trusted_slot(&self, account_id: Uuid, device_id: &str, grant: &RefreshGrant, quota: u32) -> Result<Option<Session>, AppError>;

    /// Under the account lock, mark the (account, device) session pending on
    /// `approval_token`. A session that is already trusted is left untouched
    /// and `None` is returned.
    async fn park_pending(&self, account_id: Uuid, device_id: &str, approval_token: &str) -> Result<Option<Session>, AppError>;

    /// Delete every matching session and return how many went away.
    async fn delete_by_filter(&self, filter: &SessionFilter) -> Result<u64, AppError>;

    /// Delete the pending session holding `approval_token` and return it.
    async fn reject_pending(&self, approval_token: &str) -> Result<Session, AppError>;

    /// Mark the (account, device) session revoked, releasing its device slot.
    async fn revoke(&self, account_id: Uuid, device_id: &str) -> Result<Session, AppError>;

    /// Promote the pending session holding `approval_token` to trusted and evict
    /// the account's oldest trusted sessions until at most `quota` remain.
    async fn promote_pending(&self, approval_token: &str, grant: &RefreshGrant, quota: u32) -> Result<Promotion, AppError>;

    /// Evict the oldest trusted sessions of every account above `quota`.
    async fn enforce_quota(&self, quota: u32) -> Result<u64, AppError>;
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &SessionFilter) {
    builder.push(" WHERE TRUE");
    if let Some(id) = filter.id {
        builder.push(" AND id = ").push_bind(id);
    }
    if let Some(account_id) = filter.account_id {
        builder.push(" AND account_id = ").push_bind(account_id);
    }
    if let Some(device_id) = &filter.device_id {
        builder.push(" AND device_id = ").push_bind(device_id.clone());
    }
    if let Some(device_id) = &filter.exclude_device_id {
        builder.push(" AND device_id <> ").push_bind(device_id.clone());
    }
    if let Some(token) = &filter.approval_token {
        builder
            .push(" AND approved_token = ")
            .push_bind(token.clone())
            .push(" AND approved_token <> '' AND trusted_device = FALSE AND is_revoked = FALSE");
    }
    if let Some(token) = &filter.refresh_token {
        builder
            .push(" AND refresh_token = ")
            .push_bind(token.clone())
            .push(" AND refresh_token <> '' AND trusted_device = TRUE");
    }
    if let Some(trusted) = filter.trusted {
        builder.push(" AND trusted_device = ").push_bind(trusted);
    }
}

fn push_sort(builder: &mut QueryBuilder<'_, Postgres>, sort: SessionSort) {
    match sort {
        SessionSort::CreatedAtAsc => builder.push(" ORDER BY created_at ASC NULLS LAST, id ASC"),
    };
}

async fn lock_account(connection: &mut PgConnection, account_id: Uuid) -> Result<(), AppError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(account_id.to_string())
        .execute(connection)
        .await?;
    Ok(())
}

fn into_sessions(rows: Vec<SessionRow>) -> Result<Vec<Session>, AppError> {
    rows.into_iter().map(Session::try_from).collect()
}

async fn upsert_with<'e, E>(executor: E, upsert: &SessionUpsert) -> Result<Session, AppError>
where
    E: PgExecutor<'e>,
{
    let columns = SessionColumns::from(&upsert.state);
    let row = sqlx::query_as::<_, SessionRow>(&format!(
        r#"
        INSERT INTO device_sessions (
            account_id, device_id, refresh_token, approved_token,
            is_revoked, trusted_device, created_at, expires_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (account_id, device_id)
        DO UPDATE SET
            refresh_token = EXCLUDED.refresh_token,
            approved_token = EXCLUDED.approved_token,
            is_revoked = EXCLUDED.is_revoked,
            trusted_device = EXCLUDED.trusted_device,
            created_at = EXCLUDED.created_at,
            expires_at = EXCLUDED.expires_at,
            updated_at = now()
        RETURNING {SESSION_COLUMNS}
        "#
    ))
    .bind(upsert.account_id)
    .bind(&upsert.device_id)
    .bind(&columns.refresh_token)
    .bind(&columns.approved_token)
    .bind(columns.is_revoked)
    .bind(columns.trusted_device)
    .bind(columns.created_at)
    .bind(columns.expires_at)
    .fetch_one(executor)
    .await?;

    Session::try_from(row)
}

#[async_trait::async_trait]
impl SessionStore for PostgresRepository {
    async fn find_by_filter(&self, filter: &SessionFilter) -> Result<Session, AppError> {
        let mut builder = QueryBuilder::new(format!("SELECT {SESSION_COLUMNS} FROM device_sessions"));
        push_filter(&mut builder, filter);
        push_sort(&mut builder, SessionSort::default());
        builder.push(" LIMIT 1");

        let row = builder
            .build_query_as::<SessionRow>()
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;

        Session::try_from(row)
    }

    async fn find_many(&self, filter: &SessionFilter, sort: SessionSort) -> Result<Vec<Session>, AppError> {
        let mut builder = QueryBuilder::new(format!("SELECT {SESSION_COLUMNS} FROM device_sessions"));
        push_filter(&mut builder, filter);
        push_sort(&mut builder, sort);

        let rows = builder.build_query_as::<SessionRow>().fetch_all(&self.pool).await?;
        into_sessions(rows)
    }

    async fn upsert_by_account_device(&self, upsert: &SessionUpsert) -> Result<Session, AppError> {
        upsert_with(&self.pool, upsert).await
    }

    async fn claim_trusted_slot(&self, account_id: Uuid, device_id: &str, grant: &RefreshGrant, quota: u32) -> Result<Option<Session>, AppError> {
        let mut tx = self.pool.begin().await?;
        lock_account(&mut tx, account_id).await?;

        let others = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM device_sessions
            WHERE account_id = $1
              AND device_id <> $2
              AND trusted_device = TRUE
            "#,
        )
        .bind(account_id)
        .bind(device_id)
        .fetch_one(&mut *tx)
        .await?;

        if others >= i64::from(quota) {
            tx.rollback().await?;
            return Ok(None);
        }

        let session = upsert_with(
            &mut *tx,
            &SessionUpsert {
                account_id,
                device_id: device_id.to_string(),
                state: SessionState::Trusted(grant.clone()),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(Some(session))
    }

    async fn park_pending(&self, account_id: Uuid, device_id: &str, approval_token: &str) -> Result<Option<Session>, AppError> {
        let mut tx = self.pool.begin().await?;
        lock_account(&mut tx, account_id).await?;

        let trusted = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT trusted_device
            FROM device_sessions
            WHERE account_id = $1
              AND device_id = $2
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .bind(device_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(false);

        if trusted {
            tx.rollback().await?;
            return Ok(None);
        }

        let session = upsert_with(
            &mut *tx,
            &SessionUpsert {
                account_id,
                device_id: device_id.to_string(),
                state: SessionState::Pending {
                    approval_token: approval_token.to_string(),
                },
            },
        )
        .await?;

        tx.commit().await?;
        Ok(Some(session))
    }

    async fn delete_by_filter(&self, filter: &SessionFilter) -> Result<u64, AppError> {
        if filter.is_empty() {
            return Err(AppError::BadRequest("Refusing to delete sessions without a filter".to_string()));
        }

        let mut builder = QueryBuilder::new("DELETE FROM device_sessions");
        push_filter(&mut builder, filter);

        let deleted = builder.build().execute(&self.pool).await?.rows_affected();
        if deleted == 0 {
            return Err(AppError::NotFound("Session not found".to_string()));
        }

        Ok(deleted)
    }

    async fn reject_pending(&self, approval_token: &str) -> Result<Session, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            DELETE FROM device_sessions
            WHERE approved_token = $1
              AND approved_token <> ''
              AND trusted_device = FALSE
              AND is_revoked = FALSE
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(approval_token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Approval token does not exist".to_string()))?;

        Session::try_from(row)
    }

    async fn revoke(&self, account_id: Uuid, device_id: &str) -> Result<Session, AppError> {
        let columns = SessionColumns::from(&SessionState::Revoked);
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE device_sessions
            SET refresh_token = $3,
                approved_token = $4,
                is_revoked = $5,
                trusted_device = $6,
                created_at = NULL,
                expires_at = NULL,
                updated_at = now()
            WHERE account_id = $1
              AND device_id = $2
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(device_id)
        .bind(&columns.refresh_token)
        .bind(&columns.approved_token)
        .bind(columns.is_revoked)
        .bind(columns.trusted_device)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;

        Session::try_from(row)
    }

    async fn promote_pending(&self, approval_token: &str, grant: &RefreshGrant, quota: u32) -> Result<Promotion, AppError> {
        let pending_query = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM device_sessions
            WHERE approved_token = $1
              AND approved_token <> ''
              AND trusted_device = FALSE
              AND is_revoked = FALSE
            "#
        );

        let mut tx = self.pool.begin().await?;

        let account_id = sqlx::query_as::<_, SessionRow>(&pending_query)
            .bind(approval_token)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("Approval token does not exist".to_string()))?
            .account_id;

        lock_account(&mut tx, account_id).await?;

        // Re-read under the lock: a concurrent rejection may have won.
        let pending = sqlx::query_as::<_, SessionRow>(&format!("{pending_query} FOR UPDATE"))
            .bind(approval_token)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound("Approval token does not exist".to_string()))?;

        let others = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM device_sessions
            WHERE account_id = $1
              AND device_id <> $2
              AND trusted_device = TRUE
            ORDER BY created_at ASC, id ASC
            FOR UPDATE
            "#
        ))
        .bind(pending.account_id)
        .bind(&pending.device_id)
        .fetch_all(&mut *tx)
        .await?;
        let others = into_sessions(others)?;

        if others.is_empty() {
            return Err(AppError::internal(format!(
                "pending session {} has no trusted session to replace",
                pending.id
            )));
        }

        let session = upsert_with(
            &mut *tx,
            &SessionUpsert {
                account_id: pending.account_id,
                device_id: pending.device_id.clone(),
                state: SessionState::Trusted(grant.clone()),
            },
        )
        .await?;

        let excess = (others.len() + 1).saturating_sub(quota as usize);
        let evicted: Vec<Session> = others.into_iter().take(excess).collect();
        if !evicted.is_empty() {
            let ids: Vec<Uuid> = evicted.iter().map(|s| s.id).collect();
            sqlx::query("DELETE FROM device_sessions WHERE id = ANY($1)")
                .bind(ids)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(
            account_id = %session.account_id,
            session_id = %session.id,
            device_id = %session.device_id,
            evicted = evicted.len(),
            "pending session promoted"
        );

        Ok(Promotion { session, evicted })
    }

    async fn enforce_quota(&self, quota: u32) -> Result<u64, AppError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM device_sessions
            WHERE id IN (
                SELECT id
                FROM (
                    SELECT id,
                           ROW_NUMBER() OVER (
                               PARTITION BY account_id
                               ORDER BY created_at DESC, id DESC
                           ) AS slot
                    FROM device_sessions
                    WHERE trusted_device = TRUE
                ) ranked
                WHERE ranked.slot > $1
            )
            "#,
        )
        .bind(i64::from(quota))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted > 0 {
            warn!(evicted = deleted, quota, "trusted sessions above quota removed");
        }

        Ok(deleted)
    }
}
