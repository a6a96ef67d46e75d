use crate::error::app_error::AppError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE_PATH: &str = "/api/v1";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub cors: CorsConfig,
    pub api: ApiConfig,
    pub jwt: JwtConfig,
    pub device_trust: DeviceTrustConfig,
    pub rate_limit: RateLimitConfig,
    pub email: EmailConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub address: String,
    /// Header carrying the client address, set by a reverse proxy in front of
    /// the service. Unset means the socket peer address is used.
    pub trusted_ip_header: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    pub base_path: String,
    pub enable_swagger: bool,
}

/// Signing material and lifetimes for the three token kinds.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub approval_token_ttl_seconds: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceTrustConfig {
    /// Maximum number of concurrently trusted devices per account.
    pub max_trusted_devices: u32,
    /// Public URL of the confirmation endpoint, embedded in new-device emails.
    pub approval_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    /// Time it takes to refill a single token.
    pub refill_interval_ms: u64,
    pub key_prefix: String,
    /// Idle buckets expire after this many seconds; 0 keeps them forever.
    pub key_ttl_seconds: u64,
    pub require_client_ip: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_address: String,
    pub from_name: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Upper bound for every call into Postgres, Redis or SMTP.
    pub store_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/device_trust".to_string(),
            max_connections: 16,
            min_connections: 2,
            acquire_timeout: 5,
            run_migrations: true,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            address: "127.0.0.1".to_string(),
            trusted_ip_header: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_credentials: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_API_BASE_PATH.to_string(),
            enable_swagger: true,
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "device-trust".to_string(),
            access_token_ttl_seconds: 15 * 60,
            refresh_token_ttl_seconds: 7 * 24 * 60 * 60,
            approval_token_ttl_seconds: 15 * 60,
        }
    }
}

impl Default for DeviceTrustConfig {
    fn default() -> Self {
        Self {
            max_trusted_devices: 1,
            approval_url: "http://127.0.0.1:8000/api/v1/auth/sessions/confirm".to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_interval_ms: 1000,
            key_prefix: "rate_limit_".to_string(),
            key_ttl_seconds: 3600,
            require_client_ip: false,
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            from_address: "no-reply@localhost".to_string(),
            from_name: "Account Security".to_string(),
            enabled: false,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { store_timeout_ms: 5000 }
    }
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

impl ServiceConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources in priority order:
    /// 1. Built-in defaults
    /// 2. DeviceTrust.toml (if present)
    /// 3. Environment variables prefixed with DEVICE_TRUST_, nested with `__`
    ///    (e.g. DEVICE_TRUST_JWT__SECRET)
    /// 4. DATABASE_URL / REDIS_URL
    pub fn load() -> Result<Self, figment::Error> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("DeviceTrust.toml").nested())
            .merge(Env::prefixed("DEVICE_TRUST_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()))
            .merge(Env::raw().only(&["REDIS_URL"]).map(|_| "redis.url".into()));

        figment.extract()
    }

    /// Reject settings that would make the service silently insecure or inert.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.jwt.secret.trim().is_empty() {
            return Err(AppError::InvalidConfiguration("jwt.secret must be set".to_string()));
        }
        if self.jwt.access_token_ttl_seconds <= 0 || self.jwt.refresh_token_ttl_seconds <= 0 || self.jwt.approval_token_ttl_seconds <= 0 {
            return Err(AppError::InvalidConfiguration("token lifetimes must be positive".to_string()));
        }
        if self.device_trust.max_trusted_devices == 0 {
            return Err(AppError::InvalidConfiguration("device_trust.max_trusted_devices must be at least 1".to_string()));
        }
        if self.server.trusted_ip_header.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(AppError::InvalidConfiguration("server.trusted_ip_header must not be empty".to_string()));
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.refill_interval_ms == 0 {
            return Err(AppError::InvalidConfiguration(
                "rate_limit.capacity and rate_limit.refill_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.jwt.secret = "unit-test-secret".to_string();
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.device_trust.max_trusted_devices, 1);
        assert_eq!(config.rate_limit.capacity, 5);
        assert_eq!(config.rate_limit.refill_interval(), Duration::from_secs(1));
        assert_eq!(config.api.base_path, DEFAULT_API_BASE_PATH);
    }

    #[test]
    fn validate_requires_secret() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(AppError::InvalidConfiguration(_))));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_quota_and_capacity() {
        let mut config = valid_config();
        config.device_trust.max_trusted_devices = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.rate_limit.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.rate_limit.refill_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn trusted_ip_header_is_off_by_default_and_never_blank() {
        assert!(Config::default().server.trusted_ip_header.is_none());

        let mut config = valid_config();
        config.server.trusted_ip_header = Some("  ".to_string());
        assert!(matches!(config.validate(), Err(AppError::InvalidConfiguration(_))));

        config.server.trusted_ip_header = Some("X-Forwarded-For".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reads_nested_environment_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DEVICE_TRUST_JWT__SECRET", "from-env");
            jail.set_env("DEVICE_TRUST_DEVICE_TRUST__MAX_TRUSTED_DEVICES", "3");
            jail.set_env("REDIS_URL", "redis://cache:6379");

            let config = Config::load()?;
            assert_eq!(config.jwt.secret, "from-env");
            assert_eq!(config.device_trust.max_trusted_devices, 3);
            assert_eq!(config.redis.url, "redis://cache:6379");
            Ok(())
        });
    }
}
