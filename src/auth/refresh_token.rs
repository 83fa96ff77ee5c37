/// Refresh Token Rotation
///
/// Refresh tokens are:
/// - Cryptographically secure random 64-character alphanumeric strings
/// - Hashed with SHA-256 before storage (never store plaintext)
/// - Single-use: every refresh revokes the presented token and issues a successor
/// - Active until revoked (terminal) or past `expires_at` (terminal, derived)
///
/// Presenting a revoked token is treated as a sign of theft or replay. A
/// replay arriving within the reuse grace window after the revocation is still
/// rejected, but the token family is left alone: that is the signature of a
/// client racing itself, and the winner's successor must stay usable.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{AppError, AuthError, NotFoundError};
use crate::store::{RefreshToken, RefreshTokenStore};

const REFRESH_TOKEN_LENGTH: usize = 64;

/// A freshly issued refresh token
///
/// `plaintext` is handed to the client once and is not recoverable afterwards.
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub plaintext: String,
    pub record: RefreshToken,
}

/// Generate a new cryptographically secure refresh token
///
/// 64 characters drawn from 62 symbols carry about 381 bits of entropy.
pub fn generate_refresh_token() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFRESH_TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// SHA-256 fingerprint of a refresh token, hex encoded
pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct RotationEngine {
    store: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    revoke_family_on_reuse: bool,
    reuse_grace: Duration,
}

impl RotationEngine {
    pub fn new(
        store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        revoke_family_on_reuse: bool,
        reuse_grace: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            revoke_family_on_reuse,
            reuse_grace,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn new_record(
        &self,
        user_id: Uuid,
        client_origin: Option<String>,
        parent_id: Option<Uuid>,
    ) -> IssuedRefreshToken {
        let plaintext = generate_refresh_token();
        let now = self.clock.now();
        let record = RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: fingerprint(&plaintext),
            client_origin,
            revoked: false,
            revoked_at: None,
            parent_id,
            created_at: now,
            expires_at: now + self.ttl,
        };

        IssuedRefreshToken { plaintext, record }
    }

    /// Issue the first refresh token of a session (login)
    ///
    /// # Errors
    /// Returns a storage error if the record cannot be written
    pub async fn issue_initial(
        &self,
        user_id: Uuid,
        client_origin: Option<String>,
    ) -> Result<IssuedRefreshToken, AppError> {
        let issued = self.new_record(user_id, client_origin, None);
        self.store.put(&issued.record).await?;

        tracing::debug!(
            user_id = %user_id,
            token_id = %issued.record.id,
            expires_at = %issued.record.expires_at,
            "Refresh token issued"
        );
        Ok(issued)
    }

    /// Exchange a refresh token for its successor
    ///
    /// # Errors
    /// - `UnknownRefreshToken` if no record has this fingerprint
    /// - `TokenReused` if the token was already revoked, or lost a concurrent rotation
    /// - `TokenExpired` if the token is past `expires_at`
    pub async fn rotate(
        &self,
        presented: &str,
        client_origin: Option<String>,
    ) -> Result<IssuedRefreshToken, AppError> {
        let token_hash = fingerprint(presented);

        let record = match self.store.find_by_fingerprint(&token_hash).await? {
            Some(record) => record,
            None => {
                tracing::warn!("Refresh token not found");
                return Err(AppError::Auth(AuthError::UnknownRefreshToken));
            }
        };

        let now = self.clock.now();
        if record.revoked {
            if self.within_reuse_grace(&record, now) {
                // a duplicate of a rotation that has only just completed
                tracing::warn!(
                    target: "security",
                    user_id = %record.user_id,
                    token_id = %record.id,
                    "Refresh token presented again right after revocation"
                );
            } else {
                self.handle_reuse(&record).await?;
            }
            return Err(AppError::Auth(AuthError::TokenReused));
        }

        if record.is_expired(now) {
            tracing::info!(user_id = %record.user_id, token_id = %record.id, "Refresh token expired");
            return Err(AppError::Auth(AuthError::TokenExpired));
        }

        let successor = self.new_record(record.user_id, client_origin, Some(record.id));
        if !self.store.rotate(record.id, &successor.record, now).await? {
            // Lost a concurrent rotation of a token that was live when read.
            // The winner's successor stays valid, so no family revocation here.
            tracing::warn!(
                target: "security",
                user_id = %record.user_id,
                token_id = %record.id,
                "Concurrent rotation of the same refresh token rejected"
            );
            return Err(AppError::Auth(AuthError::TokenReused));
        }

        tracing::info!(
            user_id = %record.user_id,
            revoked_token_id = %record.id,
            token_id = %successor.record.id,
            "Refresh token rotated"
        );
        Ok(successor)
    }

    /// Revoke a refresh token (logout)
    ///
    /// Revoking an already revoked token succeeds without effect.
    ///
    /// # Errors
    /// Returns `NotFound` if no record has this fingerprint
    pub async fn revoke(&self, presented: &str) -> Result<(), AppError> {
        let token_hash = fingerprint(presented);

        let record = self
            .store
            .find_by_fingerprint(&token_hash)
            .await?
            .ok_or(AppError::NotFound(NotFoundError::RefreshToken))?;

        if self.store.mark_revoked(record.id, self.clock.now()).await? {
            tracing::info!(user_id = %record.user_id, token_id = %record.id, "Refresh token revoked");
        }
        Ok(())
    }

    /// Revoke every live refresh token of a user
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, AppError> {
        let revoked = self.store.revoke_all_for_owner(user_id, self.clock.now()).await?;
        tracing::info!(user_id = %user_id, revoked, "All refresh tokens revoked for user");
        Ok(revoked)
    }

    fn within_reuse_grace(&self, record: &RefreshToken, now: DateTime<Utc>) -> bool {
        record
            .revoked_at
            .map_or(false, |revoked_at| now - revoked_at <= self.reuse_grace)
    }

    async fn handle_reuse(&self, record: &RefreshToken) -> Result<(), AppError> {
        tracing::warn!(
            target: "security",
            user_id = %record.user_id,
            token_id = %record.id,
            revoked_at = ?record.revoked_at,
            "Revoked refresh token presented again; possible token theft"
        );

        if self.revoke_family_on_reuse {
            let revoked = self
                .store
                .revoke_all_for_owner(record.user_id, self.clock.now())
                .await?;
            tracing::warn!(
                target: "security",
                user_id = %record.user_id,
                revoked,
                "Revoked all refresh tokens of user after reuse"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryRefreshTokenStore;

    const REUSE_GRACE_SECONDS: i64 = 5;

    struct Harness {
        engine: Arc<RotationEngine>,
        store: Arc<InMemoryRefreshTokenStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(revoke_family_on_reuse: bool) -> Harness {
        let store = Arc::new(InMemoryRefreshTokenStore::new());
        let clock = Arc::new(ManualClock::default());
        let engine = Arc::new(RotationEngine::new(
            store.clone(),
            clock.clone(),
            Duration::days(7),
            revoke_family_on_reuse,
            Duration::seconds(REUSE_GRACE_SECONDS),
        ));
        Harness { engine, store, clock }
    }

    #[test]
    fn test_generate_refresh_token() {
        let token = generate_refresh_token();

        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_refresh_token());
    }

    #[test]
    fn test_token_hashing() {
        let token = generate_refresh_token();
        let hash1 = fingerprint(&token);
        let hash2 = fingerprint(&token);

        assert_eq!(hash1, hash2);
        assert_ne!(token, hash1);
        assert_eq!(hash1.len(), 64);
        assert_ne!(hash1, fingerprint(&generate_refresh_token()));
    }

    #[tokio::test]
    async fn test_issue_initial_stores_only_fingerprint() {
        let h = harness(true);
        let owner = Uuid::new_v4();

        let issued = h.engine.issue_initial(owner, Some("10.0.0.1".to_string())).await.unwrap();

        assert_eq!(issued.record.user_id, owner);
        assert_eq!(issued.record.token_hash, fingerprint(&issued.plaintext));
        assert_ne!(issued.record.token_hash, issued.plaintext);
        assert!(issued.record.expires_at > issued.record.created_at);
        assert_eq!(issued.record.expires_at - issued.record.created_at, Duration::days(7));
        assert_eq!(issued.record.client_origin.as_deref(), Some("10.0.0.1"));

        let stored = h.store.find_by_fingerprint(&issued.record.token_hash).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_rotate_issues_successor_and_revokes_parent() {
        let h = harness(true);
        let owner = Uuid::new_v4();
        let first = h.engine.issue_initial(owner, None).await.unwrap();

        h.clock.advance(Duration::hours(1));
        let second = h.engine.rotate(&first.plaintext, None).await.unwrap();

        assert_ne!(second.plaintext, first.plaintext);
        assert_eq!(second.record.user_id, owner);
        assert_eq!(second.record.parent_id, Some(first.record.id));
        assert_eq!(second.record.expires_at, h.clock.now() + Duration::days(7));

        let records = h.store.records_for_owner(owner).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].revoked);
        assert!(!records[1].revoked);
    }

    #[tokio::test]
    async fn test_rotate_twice_is_reuse() {
        let h = harness(false);
        let first = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();

        h.engine.rotate(&first.plaintext, None).await.unwrap();
        let replay = h.engine.rotate(&first.plaintext, None).await;

        assert!(matches!(replay, Err(AppError::Auth(AuthError::TokenReused))));
    }

    #[tokio::test]
    async fn test_reuse_revokes_family() {
        let h = harness(true);
        let owner = Uuid::new_v4();
        let first = h.engine.issue_initial(owner, None).await.unwrap();
        let second = h.engine.rotate(&first.plaintext, None).await.unwrap();
        let other_device = h.engine.issue_initial(owner, None).await.unwrap();

        h.clock.advance(Duration::seconds(REUSE_GRACE_SECONDS + 1));
        let replay = h.engine.rotate(&first.plaintext, None).await;
        assert!(matches!(replay, Err(AppError::Auth(AuthError::TokenReused))));

        assert!(matches!(
            h.engine.rotate(&second.plaintext, None).await,
            Err(AppError::Auth(AuthError::TokenReused))
        ));
        assert!(matches!(
            h.engine.rotate(&other_device.plaintext, None).await,
            Err(AppError::Auth(AuthError::TokenReused))
        ));
    }

    #[tokio::test]
    async fn test_replay_within_grace_keeps_family() {
        let h = harness(true);
        let first = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();
        let second = h.engine.rotate(&first.plaintext, None).await.unwrap();

        h.clock.advance(Duration::seconds(REUSE_GRACE_SECONDS));
        let replay = h.engine.rotate(&first.plaintext, None).await;

        assert!(matches!(replay, Err(AppError::Auth(AuthError::TokenReused))));
        assert!(h.engine.rotate(&second.plaintext, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_reuse_without_family_revocation_keeps_successor() {
        let h = harness(false);
        let first = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();
        let second = h.engine.rotate(&first.plaintext, None).await.unwrap();

        assert!(h.engine.rotate(&first.plaintext, None).await.is_err());
        assert!(h.engine.rotate(&second.plaintext, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let h = harness(true);

        let result = h.engine.rotate("never-issued", None).await;
        assert!(matches!(result, Err(AppError::Auth(AuthError::UnknownRefreshToken))));
    }

    #[tokio::test]
    async fn test_expired_token_rejected_even_if_unused() {
        let h = harness(true);
        let issued = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();

        h.clock.advance(Duration::days(7) + Duration::seconds(1));
        let result = h.engine.rotate(&issued.plaintext, None).await;

        assert!(matches!(result, Err(AppError::Auth(AuthError::TokenExpired))));
        // expiry does not revoke
        let stored = h.store.find_by_fingerprint(&issued.record.token_hash).await.unwrap().unwrap();
        assert!(!stored.revoked);
    }

    #[tokio::test]
    async fn test_token_valid_until_expiry_instant() {
        let h = harness(true);
        let issued = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();

        h.clock.advance(Duration::days(7));
        assert!(h.engine.rotate(&issued.plaintext, None).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotation_has_single_winner() {
        for _ in 0..20 {
            let h = harness(false);
            let issued = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();

            let mut handles = Vec::new();
            for _ in 0..2 {
                let engine = h.engine.clone();
                let plaintext = issued.plaintext.clone();
                handles.push(tokio::spawn(async move { engine.rotate(&plaintext, None).await }));
            }

            let mut successes = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => successes += 1,
                    Err(e) => assert!(e.is_refresh_rejection(), "unexpected error: {:?}", e),
                }
            }
            assert_eq!(successes, 1);
            assert_eq!(h.store.records_for_owner(issued.record.user_id).unwrap().len(), 2);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotation_winner_stays_valid_with_family_revocation() {
        for _ in 0..20 {
            let h = harness(true);
            let issued = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();

            let mut handles = Vec::new();
            for _ in 0..2 {
                let engine = h.engine.clone();
                let plaintext = issued.plaintext.clone();
                handles.push(tokio::spawn(async move { engine.rotate(&plaintext, None).await }));
            }

            let mut winners = Vec::new();
            for handle in handles {
                if let Ok(successor) = handle.await.unwrap() {
                    winners.push(successor);
                }
            }
            assert_eq!(winners.len(), 1);

            let next = h.engine.rotate(&winners[0].plaintext, None).await;
            assert!(next.is_ok(), "winner's token was revoked: {:?}", next.err());
        }
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let h = harness(true);
        let issued = h.engine.issue_initial(Uuid::new_v4(), None).await.unwrap();

        assert!(h.engine.revoke(&issued.plaintext).await.is_ok());
        assert!(h.engine.revoke(&issued.plaintext).await.is_ok());
        assert!(h.engine.rotate(&issued.plaintext, None).await.is_err());
    }

    #[tokio::test]
    async fn test_revoke_unknown_token() {
        let h = harness(true);

        let result = h.engine.revoke("never-issued").await;
        assert!(matches!(result, Err(AppError::NotFound(NotFoundError::RefreshToken))));
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let h = harness(true);
        let owner = Uuid::new_v4();
        let a = h.engine.issue_initial(owner, None).await.unwrap();
        let b = h.engine.issue_initial(owner, None).await.unwrap();

        assert_eq!(h.engine.revoke_all(owner).await.unwrap(), 2);
        assert!(h.engine.rotate(&a.plaintext, None).await.is_err());
        assert!(h.engine.rotate(&b.plaintext, None).await.is_err());
    }
}
