use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::account::Account;
use argon2::Argon2;
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use std::sync::LazyLock;

/// A real Argon2 hash generated once, used as a timing decoy so that logins
/// for unknown emails cost as much as logins for existing accounts.
static DUMMY_HASH: LazyLock<Option<String>> = LazyLock::new(|| {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(b"dummy-never-matches", &salt)
        .ok()
        .map(|hash| hash.to_string())
});

#[async_trait::async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, AppError>;
}

#[async_trait::async_trait]
impl AccountRepository for PostgresRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, email, password_hash
            FROM accounts
            WHERE email = $1
              AND deleted_at IS NULL
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }
}

/// Check `password` against the account's stored Argon2 hash.
pub fn verify_password(account: &Account, password: &str) -> Result<bool, AppError> {
    let hash = PasswordHash::new(&account.password_hash).map_err(|e| AppError::password_hash("Failed to parse stored password hash", e))?;
    Ok(Argon2::default().verify_password(password.as_bytes(), &hash).is_ok())
}

/// Throwaway verification for logins whose email matched no account.
pub fn dummy_verify(password: &str) {
    if let Some(hash) = DUMMY_HASH.as_deref().and_then(|hash| PasswordHash::new(hash).ok()) {
        let _ = Argon2::default().verify_password(password.as_bytes(), &hash);
    }
}
