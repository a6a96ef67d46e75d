use uuid::Uuid;

/// The slice of an account the login flow needs. Accounts are owned by the
/// account-management service; this crate only reads them.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
}
