use crate::config::RateLimitConfig;
use crate::database::rate_limit::BucketStore;
use crate::error::app_error::AppError;
use crate::models::rate_limit::{BucketPolicy, RateLimitDecision};
use crate::service::service_util::bounded;
use chrono::Utc;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse, Responses};
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const MISSING_IP_KEY: &str = "missing-ip";

/// Token-bucket gate keyed by client address, backed by a shared [`BucketStore`].
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    policy: BucketPolicy,
    key_prefix: String,
    require_client_ip: bool,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: &RateLimitConfig, timeout: Duration) -> Self {
        Self {
            store,
            policy: BucketPolicy::new(config.capacity, config.refill_interval()),
            key_prefix: config.key_prefix.clone(),
            require_client_ip: config.require_client_ip,
            timeout,
        }
    }

    pub async fn check(&self, client: &str) -> Result<RateLimitDecision, AppError> {
        self.check_at(client, Utc::now().timestamp()).await
    }

    pub async fn check_at(&self, client: &str, now: i64) -> Result<RateLimitDecision, AppError> {
        let key = format!("{}{}", self.key_prefix, client);
        bounded(self.timeout, "rate limit check", self.store.take(&key, &self.policy, now)).await
    }
}

/// Guard for the login endpoint: consumes one token of the caller's bucket.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoginRateLimit;

/// Seconds until the limited caller may retry, for the 429 catcher.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RateLimitRetryAfter(pub u64);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for LoginRateLimit {
    type Error = AppError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(limiter) = request.rocket().state::<Arc<RateLimiter>>() else {
            return Outcome::Error((Status::InternalServerError, AppError::internal("rate limiter is not managed")));
        };

        let request_id = request
            .local_cache(|| None::<crate::middleware::RequestId>)
            .as_ref()
            .map(|r| r.0.as_str())
            .unwrap_or("unknown");

        let client = match request.client_ip() {
            Some(ip) => ip.to_string(),
            None if limiter.require_client_ip => {
                warn!(request_id = %request_id, uri = %request.uri(), "client ip unavailable for rate limiting");
                return Outcome::Error((Status::BadRequest, AppError::BadRequest("Client address is unavailable".to_string())));
            }
            None => MISSING_IP_KEY.to_string(),
        };

        match limiter.check(&client).await {
            Ok(RateLimitDecision::Allow { .. }) => Outcome::Success(LoginRateLimit),
            Ok(RateLimitDecision::Limited { retry_after }) => {
                let retry_after_secs = retry_after.as_secs().max(1);
                request.local_cache(|| Some(RateLimitRetryAfter(retry_after_secs)));
                warn!(
                    request_id = %request_id,
                    client = %client,
                    uri = %request.uri(),
                    retry_after_secs,
                    "rate limit exceeded"
                );
                Outcome::Error((Status::TooManyRequests, AppError::RateLimited { retry_after }))
            }
            Err(err) => {
                error!(request_id = %request_id, error = ?err, "rate limit store unavailable");
                Outcome::Error((Status::InternalServerError, err))
            }
        }
    }
}

impl<'a> OpenApiFromRequest<'a> for LoginRateLimit {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let mut responses = Responses::default();
        responses.responses.insert(
            "429".to_string(),
            RefOr::Object(OpenApiResponse {
                description: "Too Many Requests".to_string(),
                ..Default::default()
            }),
        );
        Ok(responses)
    }
}
