use crate::AppState;
use crate::config::Config;
use crate::database::account::AccountRepository;
use crate::database::rate_limit::BucketStore;
use crate::database::session::SessionStore;
use crate::error::app_error::AppError;
use crate::middleware::rate_limit::RateLimiter;
use crate::models::account::Account;
use crate::models::rate_limit::{BucketPolicy, BucketState, RateLimitDecision};
use crate::models::session::{Promotion, RefreshGrant, Session, SessionFilter, SessionSort, SessionState, SessionUpsert};
use crate::service::auth::{DeviceTrustService, DeviceTrustSettings};
use crate::service::email::{DeviceAlertNotifier, NewDeviceAlert};
use crate::service::token::TokenService;
use argon2::{Algorithm, Argon2, Params, Version};
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHasher, SaltString};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const ALICE: &str = "alice@example.com";
pub const PASSWORD: &str = "correct horse battery staple";

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.jwt.secret = "test-signing-secret".to_string();
    config
}

/// Argon2 hash with minimal cost so tests stay fast.
pub fn cheap_hash(password: &str) -> String {
    let params = Params::new(8, 1, 1, None).expect("valid argon2 params");
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .expect("hashing succeeds")
        .to_string()
}

pub struct InMemoryAccounts {
    accounts: Vec<Account>,
}

impl InMemoryAccounts {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }
}

#[async_trait::async_trait]
impl AccountRepository for InMemoryAccounts {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, AppError> {
        Ok(self.accounts.iter().find(|a| a.email == email).cloned())
    }
}

/// Session store that applies every operation atomically under one lock.
/// Rows keep insertion order, which breaks `created_at` ties.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<Vec<Session>>,
    delay: Mutex<Option<Duration>>,
}

fn sorted(mut sessions: Vec<Session>, sort: SessionSort) -> Vec<Session> {
    // stable sort; sessions without a timestamp go last
    match sort {
        SessionSort::CreatedAtAsc => sessions.sort_by(|a, b| match (a.created_at(), b.created_at()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }),
    }
    sessions
}

fn upsert_locked(sessions: &mut Vec<Session>, upsert: &SessionUpsert) -> Session {
    if let Some(existing) = sessions
        .iter_mut()
        .find(|s| s.account_id == upsert.account_id && s.device_id == upsert.device_id)
    {
        existing.state = upsert.state.clone();
        return existing.clone();
    }

    let session = Session {
        id: Uuid::new_v4(),
        account_id: upsert.account_id,
        device_id: upsert.device_id.clone(),
        state: upsert.state.clone(),
    };
    sessions.push(session.clone());
    session
}

fn other_trusted(sessions: &[Session], account_id: Uuid, device_id: &str) -> Vec<Session> {
    let filter = SessionFilter::other_trusted(account_id, device_id);
    sorted(sessions.iter().filter(|s| filter.matches(s)).cloned().collect(), SessionSort::CreatedAtAsc)
}

impl InMemorySessionStore {
    pub async fn all(&self) -> Vec<Session> {
        self.sessions.lock().await.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.lock().await.iter().find(|s| s.id == id).cloned()
    }

    pub async fn trusted_count(&self, account_id: Uuid) -> usize {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|s| s.account_id == account_id && s.is_trusted())
            .count()
    }

    /// Make every subsequent call sleep first, to exercise timeouts.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn find_by_filter(&self, filter: &SessionFilter) -> Result<Session, AppError> {
        self.find_many(filter, SessionSort::default())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))
    }

    async fn find_many(&self, filter: &SessionFilter, sort: SessionSort) -> Result<Vec<Session>, AppError> {
        self.pause().await;
        let sessions = self.sessions.lock().await;
        Ok(sorted(sessions.iter().filter(|s| filter.matches(s)).cloned().collect(), sort))
    }

    async fn upsert_by_account_device(&self, upsert: &SessionUpsert) -> Result<Session, AppError> {
        self.pause().await;
        Ok(upsert_locked(&mut *self.sessions.lock().await, upsert))
    }

    async fn claim_trusted_slot(&self, account_id: Uuid, device_id: &str, grant: &RefreshGrant, quota: u32) -> Result<Option<Session>, AppError> {
        self.pause().await;
        let mut sessions = self.sessions.lock().await;
        if other_trusted(&sessions, account_id, device_id).len() >= quota as usize {
            return Ok(None);
        }

        Ok(Some(upsert_locked(
            &mut sessions,
            &SessionUpsert {
                account_id,
                device_id: device_id.to_string(),
                state: SessionState::Trusted(grant.clone()),
            },
        )))
    }

    async fn park_pending(&self, account_id: Uuid, device_id: &str, approval_token: &str) -> Result<Option<Session>, AppError> {
        self.pause().await;
        let mut sessions = self.sessions.lock().await;
        let trusted = sessions
            .iter()
            .any(|s| s.account_id == account_id && s.device_id == device_id && s.is_trusted());
        if trusted {
            return Ok(None);
        }

        Ok(Some(upsert_locked(
            &mut sessions,
            &SessionUpsert {
                account_id,
                device_id: device_id.to_string(),
                state: SessionState::Pending {
                    approval_token: approval_token.to_string(),
                },
            },
        )))
    }

    async fn delete_by_filter(&self, filter: &SessionFilter) -> Result<u64, AppError> {
        if filter.is_empty() {
            return Err(AppError::BadRequest("Refusing to delete sessions without a filter".to_string()));
        }
        self.pause().await;
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|s| !filter.matches(s));
        let deleted = (before - sessions.len()) as u64;
        if deleted == 0 {
            return Err(AppError::NotFound("Session not found".to_string()));
        }
        Ok(deleted)
    }

    async fn reject_pending(&self, approval_token: &str) -> Result<Session, AppError> {
        self.pause().await;
        let mut sessions = self.sessions.lock().await;
        let index = sessions
            .iter()
            .position(|s| s.approval_token() == Some(approval_token))
            .ok_or_else(|| AppError::NotFound("Approval token does not exist".to_string()))?;
        Ok(sessions.remove(index))
    }

    async fn revoke(&self, account_id: Uuid, device_id: &str) -> Result<Session, AppError> {
        self.pause().await;
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .iter_mut()
            .find(|s| s.account_id == account_id && s.device_id == device_id)
            .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;
        session.state = SessionState::Revoked;
        Ok(session.clone())
    }

    async fn promote_pending(&self, approval_token: &str, grant: &RefreshGrant, quota: u32) -> Result<Promotion, AppError> {
        self.pause().await;
        let mut sessions = self.sessions.lock().await;
        let pending = sessions
            .iter()
            .find(|s| s.approval_token() == Some(approval_token))
            .cloned()
            .ok_or_else(|| AppError::NotFound("Approval token does not exist".to_string()))?;

        let others = other_trusted(&sessions, pending.account_id, &pending.device_id);
        if others.is_empty() {
            return Err(AppError::internal(format!("pending session {} has no trusted session to replace", pending.id)));
        }

        let session = upsert_locked(
            &mut sessions,
            &SessionUpsert {
                account_id: pending.account_id,
                device_id: pending.device_id.clone(),
                state: SessionState::Trusted(grant.clone()),
            },
        );

        let excess = (others.len() + 1).saturating_sub(quota as usize);
        let evicted: Vec<Session> = others.into_iter().take(excess).collect();
        sessions.retain(|s| !evicted.iter().any(|e| e.id == s.id));

        Ok(Promotion { session, evicted })
    }

    async fn enforce_quota(&self, quota: u32) -> Result<u64, AppError> {
        self.pause().await;
        let mut sessions = self.sessions.lock().await;
        let mut trusted = sorted(sessions.iter().filter(|s| s.is_trusted()).cloned().collect(), SessionSort::CreatedAtAsc);
        trusted.reverse();

        let mut kept: HashMap<Uuid, usize> = HashMap::new();
        let mut evicted = Vec::new();
        for session in trusted {
            let slot = kept.entry(session.account_id).or_default();
            *slot += 1;
            if *slot > quota as usize {
                evicted.push(session.id);
            }
        }

        sessions.retain(|s| !evicted.contains(&s.id));
        Ok(evicted.len() as u64)
    }
}

#[derive(Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, BucketState>>,
}

#[async_trait::async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn take(&self, key: &str, policy: &BucketPolicy, now: i64) -> Result<RateLimitDecision, AppError> {
        let mut buckets = self.buckets.lock().await;
        let (decision, next) = BucketState::refill_and_take(buckets.get(key).copied(), policy, now);
        if let Some(next) = next {
            buckets.insert(key.to_string(), next);
        }
        Ok(decision)
    }
}

/// Notifier that keeps alerts in memory and can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<NewDeviceAlert>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub async fn alerts(&self) -> Vec<NewDeviceAlert> {
        self.alerts.lock().await.clone()
    }

    pub fn fail_deliveries(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl DeviceAlertNotifier for RecordingNotifier {
    async fn send_new_device_alert(&self, alert: &NewDeviceAlert) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::email("SMTP relay unavailable"));
        }
        self.alerts.lock().await.push(alert.clone());
        Ok(())
    }
}

/// One account (`ALICE` / `PASSWORD`) wired to in-memory stores.
pub struct TestHarness {
    pub config: Config,
    pub alice: Account,
    pub accounts: Arc<InMemoryAccounts>,
    pub sessions: Arc<InMemorySessionStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub buckets: Arc<InMemoryBucketStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_quota(max_trusted_devices: u32) -> Self {
        let mut config = test_config();
        config.device_trust.max_trusted_devices = max_trusted_devices;
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let alice = Account {
            id: Uuid::new_v4(),
            email: ALICE.to_string(),
            password_hash: cheap_hash(PASSWORD),
        };

        Self {
            config,
            accounts: Arc::new(InMemoryAccounts::new(vec![alice.clone()])),
            alice,
            sessions: Arc::new(InMemorySessionStore::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            buckets: Arc::new(InMemoryBucketStore::default()),
        }
    }

    pub fn tokens(&self) -> TokenService {
        TokenService::new(&self.config.jwt)
    }

    pub fn service(&self) -> DeviceTrustService {
        DeviceTrustService::new(
            self.accounts.clone(),
            self.sessions.clone(),
            self.notifier.clone(),
            Arc::new(self.tokens()),
            DeviceTrustSettings::from_config(&self.config),
        )
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            device_trust: Arc::new(self.service()),
            tokens: Arc::new(self.tokens()),
            rate_limiter: Arc::new(RateLimiter::new(
                self.buckets.clone(),
                &self.config.rate_limit,
                self.config.service.store_timeout(),
            )),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
