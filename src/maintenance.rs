use crate::Config;
use crate::database::postgres_repository::PostgresRepository;
use crate::database::session::SessionStore;
use crate::db::init_pool;
use crate::error::app_error::AppError;
use crate::service::service_util::bounded;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileResult {
    pub quota: u32,
    pub sessions_evicted: u64,
}

/// Bring every account back within `max_trusted_devices`, keeping the newest
/// trusted sessions.
pub async fn reconcile(config: &Config) -> Result<ReconcileResult, AppError> {
    let pool = init_pool(&config.database)
        .await
        .map_err(|e| AppError::db("Failed to initialize database pool", e))?;

    let quota = config.device_trust.max_trusted_devices;
    let repo = PostgresRepository::new(pool.clone());
    let result = bounded(config.service.store_timeout(), "enforce device quota", repo.enforce_quota(quota)).await;

    pool.close().await;

    Ok(ReconcileResult {
        quota,
        sessions_evicted: result?,
    })
}
