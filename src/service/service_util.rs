use crate::error::app_error::AppError;
use std::future::Future;
use std::time::Duration;

/// Run a store, cache or mail call with an upper bound on its latency.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout { operation }),
    }
}
