/// In-memory stores
///
/// Same contracts as the Postgres stores, with one mutex per store standing in
/// for the database's row locks and unique indexes. Used by tests and for
/// running the service without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{RefreshToken, RefreshTokenStore, User, UserStore};
use crate::error::{AppError, DatabaseError};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, AppError> {
    mutex
        .lock()
        .map_err(|_| AppError::Database(DatabaseError::UnexpectedError("store lock poisoned".to_string())))
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the active flag, for account administration and tests
    pub fn set_active(&self, id: Uuid, active: bool) -> Result<bool, AppError> {
        let mut users = lock(&self.users)?;
        match users.get_mut(&id) {
            Some(user) => {
                user.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert(&self, user: &User) -> Result<(), AppError> {
        let mut users = lock(&self.users)?;
        if users.values().any(|existing| existing.email == user.email) {
            return Err(AppError::Database(DatabaseError::UniqueConstraintViolation(
                "users_email_key".to_string(),
            )));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let users = lock(&self.users)?;
        Ok(users.values().find(|user| user.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        let users = lock(&self.users)?;
        Ok(users.get(&id).cloned())
    }

    async fn update_password(
        &self,
        id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut users = lock(&self.users)?;
        match users.get_mut(&id) {
            Some(user) => {
                user.password_hash = password_hash.to_string();
                user.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Default)]
struct TokenTable {
    records: HashMap<Uuid, RefreshToken>,
    by_fingerprint: HashMap<String, Uuid>,
}

impl TokenTable {
    fn insert(&mut self, record: &RefreshToken) -> Result<(), AppError> {
        if self.by_fingerprint.contains_key(&record.token_hash) || self.records.contains_key(&record.id) {
            return Err(AppError::Database(DatabaseError::UniqueConstraintViolation(
                "refresh_tokens_token_hash_key".to_string(),
            )));
        }
        self.by_fingerprint.insert(record.token_hash.clone(), record.id);
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    fn revoke(&mut self, id: Uuid, at: DateTime<Utc>) -> bool {
        match self.records.get_mut(&id) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                record.revoked_at = Some(at);
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    table: Mutex<TokenTable>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of one owner, oldest first
    pub fn records_for_owner(&self, user_id: Uuid) -> Result<Vec<RefreshToken>, AppError> {
        let table = lock(&self.table)?;
        let mut records: Vec<RefreshToken> = table
            .records
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn put(&self, record: &RefreshToken) -> Result<(), AppError> {
        lock(&self.table)?.insert(record)
    }

    async fn find_by_fingerprint(&self, token_hash: &str) -> Result<Option<RefreshToken>, AppError> {
        let table = lock(&self.table)?;
        Ok(table
            .by_fingerprint
            .get(token_hash)
            .and_then(|id| table.records.get(id))
            .cloned())
    }

    async fn mark_revoked(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(lock(&self.table)?.revoke(id, at))
    }

    async fn rotate(
        &self,
        old_id: Uuid,
        successor: &RefreshToken,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut table = lock(&self.table)?;

        match table.records.get(&old_id) {
            Some(record) if !record.revoked => {}
            _ => return Ok(false),
        }
        // insert first so a collision leaves the old record untouched
        table.insert(successor)?;
        table.revoke(old_id, at);
        Ok(true)
    }

    async fn revoke_all_for_owner(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<u64, AppError> {
        let mut table = lock(&self.table)?;
        let mut flipped = 0;
        for record in table.records.values_mut() {
            if record.user_id == user_id && !record.revoked {
                record.revoked = true;
                record.revoked_at = Some(at);
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}
