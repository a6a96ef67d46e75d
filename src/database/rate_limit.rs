use crate::error::app_error::AppError;
use crate::models::rate_limit::{BucketPolicy, RateLimitDecision};
use redis::Script;
use redis::aio::ConnectionManager;

/// Refill-and-take on a hash `{tokens, last_refill}` in one server-side step.
/// Mirrors `BucketState::refill_and_take`.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_seconds = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed / refill_seconds)
if tokens < 1 then
    return {0, tostring(tokens)}
end

tokens = tokens - 1
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill', tostring(now))
if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
end
return {1, tostring(tokens)}
"#;

/// Shared storage for token buckets. `take` must refill, consume and persist
/// atomically with respect to other callers of the same key.
#[async_trait::async_trait]
pub trait BucketStore: Send + Sync {
    async fn take(&self, key: &str, policy: &BucketPolicy, now: i64) -> Result<RateLimitDecision, AppError>;
}

#[derive(Clone)]
pub struct RedisBucketStore {
    connection: ConnectionManager,
    script: Script,
    key_ttl_seconds: u64,
}

impl RedisBucketStore {
    pub fn new(connection: ConnectionManager, key_ttl_seconds: u64) -> Self {
        Self {
            connection,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            key_ttl_seconds,
        }
    }
}

#[async_trait::async_trait]
impl BucketStore for RedisBucketStore {
    async fn take(&self, key: &str, policy: &BucketPolicy, now: i64) -> Result<RateLimitDecision, AppError> {
        let mut connection = self.connection.clone();
        let (allowed, tokens): (i64, String) = self
            .script
            .key(key)
            .arg(policy.capacity)
            .arg(policy.refill_interval.as_secs_f64())
            .arg(now)
            .arg(self.key_ttl_seconds)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| AppError::redis("Token bucket script failed", e))?;

        let tokens: f64 = tokens
            .parse()
            .map_err(|_| AppError::internal(format!("token bucket returned a non-numeric balance: {tokens}")))?;

        Ok(if allowed == 1 {
            RateLimitDecision::Allow { remaining: tokens }
        } else {
            RateLimitDecision::Limited {
                retry_after: policy.retry_after(tokens),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rate_limit::BucketState;
    use crate::models::rate_limit::vectors::bucket_vectors;
    use redis::AsyncCommands;
    use std::time::Duration;
    use uuid::Uuid;

    async fn store() -> RedisBucketStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url).expect("valid redis url");
        let connection = ConnectionManager::new(client).await.expect("redis reachable");
        RedisBucketStore::new(connection, 60)
    }

    #[tokio::test]
    #[ignore = "requires redis"]
    async fn sixth_request_in_the_same_second_is_limited() {
        let store = store().await;
        let key = format!("rate_limit_test_{}", Uuid::new_v4());
        let policy = BucketPolicy::new(5, Duration::from_secs(1));
        let now = 1_700_000_000;

        for _ in 0..5 {
            assert!(store.take(&key, &policy, now).await.unwrap().is_allowed());
        }
        let decision = store.take(&key, &policy, now).await.unwrap();
        assert_eq!(
            decision,
            RateLimitDecision::Limited {
                retry_after: Duration::from_secs(1)
            }
        );

        assert!(store.take(&key, &policy, now + 1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    #[ignore = "requires redis"]
    async fn script_agrees_with_shared_bucket_vectors() {
        let store = store().await;
        let mut connection = store.connection.clone();

        for vector in bucket_vectors() {
            let key = format!("rate_limit_test_{}", Uuid::new_v4());
            if let Some(start) = vector.start {
                let _: () = connection
                    .hset_multiple(&key, &[("tokens", start.tokens.to_string()), ("last_refill", start.last_refill.to_string())])
                    .await
                    .unwrap();
            }

            let decision = store.take(&key, &vector.policy, vector.now).await.unwrap();
            assert_eq!(decision, vector.decision, "{}", vector.name);

            let (tokens, last_refill): (Option<String>, Option<i64>) =
                redis::cmd("HMGET").arg(&key).arg("tokens").arg("last_refill").query_async(&mut connection).await.unwrap();
            let stored = tokens.zip(last_refill).map(|(tokens, last_refill)| BucketState {
                tokens: tokens.parse().unwrap(),
                last_refill,
            });
            assert_eq!(stored, vector.stored, "{}", vector.name);

            let _: () = connection.del(&key).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires redis"]
    async fn concurrent_takes_never_exceed_capacity() {
        let store = store().await;
        let key = format!("rate_limit_test_{}", Uuid::new_v4());
        let policy = BucketPolicy::new(5, Duration::from_secs(1));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.take(&key, &policy, 1_700_000_000).await.unwrap() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
