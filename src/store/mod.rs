/// Persistence layer
///
/// `UserStore` owns account records and `RefreshTokenStore` owns issued
/// refresh tokens. Both are object-safe async traits so the session core can
/// run against Postgres in production and an in-memory map in tests.

mod memory;
mod postgres;

pub use memory::{InMemoryRefreshTokenStore, InMemoryUserStore};
pub use postgres::{PgRefreshTokenStore, PgUserStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;

/// Account record
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    /// Normalised (trimmed, lower-cased) address
    pub email: String,
    pub password_hash: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, password_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            password_hash,
            is_active: true,
            is_superuser: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One issued refresh credential
///
/// Only the SHA-256 fingerprint of the secret is kept. `revoked` only ever
/// moves from false to true.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub client_origin: Option<String>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    /// The token this one replaced during rotation
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user; a taken email surfaces as a unique-constraint violation
    async fn insert(&self, user: &User) -> Result<(), AppError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError>;

    /// Replace the password hash; returns false if no such user exists
    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Insert a record; a fingerprint collision surfaces as a unique-constraint violation
    async fn put(&self, record: &RefreshToken) -> Result<(), AppError>;

    async fn find_by_fingerprint(&self, token_hash: &str) -> Result<Option<RefreshToken>, AppError>;

    /// Flip `revoked` if it is still false; returns whether this call flipped it
    async fn mark_revoked(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError>;

    /// Revoke `old_id` and insert `successor` as one atomic step
    ///
    /// Returns false, writing nothing, when `old_id` was already revoked.
    async fn rotate(
        &self,
        old_id: Uuid,
        successor: &RefreshToken,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Revoke every live token of `user_id`; returns how many were flipped
    async fn revoke_all_for_owner(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<u64, AppError>;
}
