/// Session Service
///
/// Orchestrates registration, login, refresh, logout and password reset by
/// composing the credential hasher, the token codecs and the rotation engine.
/// Every flow returns `AppError` variants that the HTTP layer maps to
/// responses; nothing here knows about HTTP.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{
    fingerprint, Claims, CredentialHasher, RotationEngine, TokenCodec, TokenError, TokenPurpose,
};
use crate::clock::Clock;
use crate::configuration::{PasswordSettings, Settings};
use crate::error::{AppError, AuthError, ConflictError, DatabaseError, NotFoundError};
use crate::store::{RefreshTokenStore, User, UserStore};
use crate::validators::{normalize_email, validate_password};

/// Credentials handed to the client after login or refresh
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub user_id: Uuid,
    pub access_token: String,
    /// Seconds until the access token expires
    pub access_expires_in: i64,
    /// Refresh token plaintext; only ever leaves the service once
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}

pub struct SessionService {
    users: Arc<dyn UserStore>,
    rotation: RotationEngine,
    access_tokens: TokenCodec,
    reset_tokens: TokenCodec,
    hasher: CredentialHasher,
    password_policy: PasswordSettings,
    clock: Arc<dyn Clock>,
}

impl SessionService {
    pub fn new(
        users: Arc<dyn UserStore>,
        rotation: RotationEngine,
        access_tokens: TokenCodec,
        reset_tokens: TokenCodec,
        hasher: CredentialHasher,
        password_policy: PasswordSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            rotation,
            access_tokens,
            reset_tokens,
            hasher,
            password_policy,
            clock,
        }
    }

    /// Wire every component from validated settings
    ///
    /// # Errors
    /// Returns a config error if the settings are inconsistent
    pub fn from_settings(
        settings: &Settings,
        users: Arc<dyn UserStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        settings.validate()?;
        let algorithm = settings.jwt.signing_algorithm()?;

        let access_tokens = TokenCodec::new(
            &settings.jwt.access_secret,
            algorithm,
            settings.jwt.issuer.clone(),
            TokenPurpose::Access,
            Duration::minutes(settings.jwt.access_token_expiry_minutes),
            clock.clone(),
        );
        let reset_tokens = TokenCodec::new(
            &settings.jwt.reset_secret,
            algorithm,
            settings.jwt.issuer.clone(),
            TokenPurpose::PasswordReset,
            Duration::seconds(settings.jwt.reset_token_expiry_seconds),
            clock.clone(),
        );
        let rotation = RotationEngine::new(
            refresh_tokens,
            clock.clone(),
            Duration::days(settings.refresh.expiry_days),
            settings.refresh.revoke_family_on_reuse,
            Duration::seconds(settings.refresh.reuse_grace_seconds),
        );
        let hasher = CredentialHasher::new(&settings.password)?;

        Ok(Self::new(
            users,
            rotation,
            access_tokens,
            reset_tokens,
            hasher,
            settings.password.clone(),
            clock,
        ))
    }

    /// Lifetime of issued refresh tokens
    pub fn refresh_ttl(&self) -> Duration {
        self.rotation.ttl()
    }

    /// Create an account
    ///
    /// # Errors
    /// - `Validation` for a malformed email or a password outside policy
    /// - `Conflict(EmailExists)` if the normalised email is taken
    #[tracing::instrument(name = "register", skip_all)]
    pub async fn register(&self, email: &str, password: &str) -> Result<User, AppError> {
        let email = normalize_email(email)?;
        validate_password(password, &self.password_policy)?;

        if self.users.find_by_email(&email).await?.is_some() {
            return Err(AppError::Conflict(ConflictError::EmailExists));
        }

        let password_hash = self.hasher.hash_async(password.to_string()).await?;
        let user = User::new(email, password_hash, self.clock.now());

        match self.users.insert(&user).await {
            Ok(()) => {}
            // lost a race with a concurrent registration of the same address
            Err(AppError::Database(DatabaseError::UniqueConstraintViolation(_))) => {
                return Err(AppError::Conflict(ConflictError::EmailExists));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    /// Verify credentials and open a session
    ///
    /// Unknown email and wrong password produce the same error.
    #[tracing::instrument(name = "login", skip_all)]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client_origin: Option<String>,
    ) -> Result<SessionTokens, AppError> {
        let email = normalize_email(email).map_err(|_| AppError::Auth(AuthError::InvalidCredentials))?;

        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or(AppError::Auth(AuthError::InvalidCredentials))?;

        let password_valid = self
            .hasher
            .verify_async(password.to_string(), user.password_hash.clone())
            .await?;
        if !password_valid {
            return Err(AppError::Auth(AuthError::InvalidCredentials));
        }

        if !user.is_active {
            return Err(AppError::Auth(AuthError::AccountInactive));
        }

        let refresh = self.rotation.issue_initial(user.id, client_origin).await?;
        let tokens = self.session_tokens(user.id, refresh.plaintext, refresh.record.expires_at)?;

        tracing::info!(user_id = %user.id, "User logged in");
        Ok(tokens)
    }

    /// Rotate a refresh token and mint a new access token for its owner
    #[tracing::instrument(name = "refresh", skip_all)]
    pub async fn refresh(
        &self,
        presented: &str,
        client_origin: Option<String>,
    ) -> Result<SessionTokens, AppError> {
        let rotated = self.rotation.rotate(presented, client_origin).await?;
        let user_id = rotated.record.user_id;

        match self.users.find_by_id(user_id).await? {
            Some(user) if user.is_active => {}
            Some(_) => {
                self.rotation.revoke(&rotated.plaintext).await?;
                return Err(AppError::Auth(AuthError::AccountInactive));
            }
            None => {
                self.rotation.revoke(&rotated.plaintext).await?;
                return Err(AppError::Auth(AuthError::UnknownRefreshToken));
            }
        }

        self.session_tokens(user_id, rotated.plaintext, rotated.record.expires_at)
    }

    /// End a session
    ///
    /// Unknown or already revoked tokens are not reported to the caller.
    #[tracing::instrument(name = "logout", skip_all)]
    pub async fn logout(&self, presented: &str) -> Result<(), AppError> {
        match self.rotation.revoke(presented).await {
            Ok(()) => Ok(()),
            Err(AppError::NotFound(NotFoundError::RefreshToken)) => {
                tracing::debug!("Logout with unknown refresh token");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Issue a password-reset token for the account behind `email`
    ///
    /// # Errors
    /// Returns `NotFound(User)` if no account uses this email
    #[tracing::instrument(name = "request_password_reset", skip_all)]
    pub async fn request_password_reset(&self, email: &str) -> Result<(User, String), AppError> {
        let email = normalize_email(email)?;

        let user = self
            .users
            .find_by_email(&email)
            .await?
            .ok_or(AppError::NotFound(NotFoundError::User))?;

        let token = self
            .reset_tokens
            .issue_bound(user.id, fingerprint(&user.password_hash))?;
        tracing::info!(user_id = %user.id, "Password reset token issued");
        Ok((user, token))
    }

    /// Set a new password using a reset token
    ///
    /// All refresh tokens of the user are revoked on success. The token is
    /// bound to the password it was issued against, so it is single-use.
    ///
    /// # Errors
    /// - `Auth(InvalidOrExpiredResetToken)` for a bad, stale or already redeemed token
    /// - `NotFound(User)` if the subject no longer exists
    /// - `Validation` if the new password is outside policy
    #[tracing::instrument(name = "complete_password_reset", skip_all)]
    pub async fn complete_password_reset(
        &self,
        reset_token: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        let claims = self.reset_tokens.verify(reset_token).map_err(|e| {
            match e {
                TokenError::Expired => tracing::info!("Expired password reset token presented"),
                TokenError::Invalid => tracing::warn!("Invalid password reset token presented"),
            }
            AppError::Auth(AuthError::InvalidOrExpiredResetToken)
        })?;
        let user_id = claims
            .user_id()
            .map_err(|_| AppError::Auth(AuthError::InvalidOrExpiredResetToken))?;

        validate_password(new_password, &self.password_policy)?;

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AppError::NotFound(NotFoundError::User))?;
        if !claims.is_bound_to(&fingerprint(&user.password_hash)) {
            tracing::warn!(
                target: "security",
                user_id = %user_id,
                "Password reset token no longer matches the account's password"
            );
            return Err(AppError::Auth(AuthError::InvalidOrExpiredResetToken));
        }

        let password_hash = self.hasher.hash_async(new_password.to_string()).await?;
        if !self
            .users
            .update_password(user_id, &password_hash, self.clock.now())
            .await?
        {
            return Err(AppError::NotFound(NotFoundError::User));
        }

        self.rotation.revoke_all(user_id).await?;
        tracing::info!(user_id = %user_id, "Password changed via reset token");
        Ok(())
    }

    /// Validate a bearer access token
    pub fn authenticate(&self, access_token: &str) -> Result<Claims, AppError> {
        self.access_tokens.verify(access_token).map_err(|e| match e {
            TokenError::Expired => AppError::Auth(AuthError::TokenExpired),
            TokenError::Invalid => AppError::Auth(AuthError::TokenInvalid),
        })
    }

    /// Load the active account behind an authenticated subject
    pub async fn current_user(&self, user_id: Uuid) -> Result<User, AppError> {
        match self.users.find_by_id(user_id).await? {
            Some(user) if user.is_active => Ok(user),
            Some(_) => Err(AppError::Auth(AuthError::AccountInactive)),
            None => Err(AppError::NotFound(NotFoundError::User)),
        }
    }

    fn session_tokens(
        &self,
        user_id: Uuid,
        refresh_token: String,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<SessionTokens, AppError> {
        Ok(SessionTokens {
            user_id,
            access_token: self.access_tokens.issue_default(user_id)?,
            access_expires_in: self.access_tokens.ttl().num_seconds(),
            refresh_token,
            refresh_expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::configuration::{
        ApplicationSettings, DatabaseSettings, JwtSettings, RefreshTokenSettings,
    };
    use crate::store::{InMemoryRefreshTokenStore, InMemoryUserStore};

    struct Harness {
        service: SessionService,
        users: Arc<InMemoryUserStore>,
        tokens: Arc<InMemoryRefreshTokenStore>,
        clock: Arc<ManualClock>,
    }

    fn settings() -> Settings {
        Settings {
            database: DatabaseSettings {
                url: Some("postgres://unused".to_string()),
                username: String::new(),
                password: String::new(),
                port: 5432,
                host: "localhost".to_string(),
                database_name: String::new(),
                max_connections: 1,
            },
            application: ApplicationSettings {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            jwt: JwtSettings {
                access_secret: "access-secret-key-at-least-32-characters".to_string(),
                reset_secret: "reset-secret-key-at-least-32-characters!".to_string(),
                algorithm: "HS256".to_string(),
                issuer: "authcore-test".to_string(),
                access_token_expiry_minutes: 15,
                reset_token_expiry_seconds: 900,
            },
            refresh: RefreshTokenSettings {
                expiry_days: 7,
                cookie_name: "refresh_token".to_string(),
                cookie_path: "/auth".to_string(),
                cookie_secure: false,
                revoke_family_on_reuse: true,
                reuse_grace_seconds: 5,
            },
            password: PasswordSettings {
                min_length: 3,
                require_character_classes: false,
                memory_kib: 1024,
                iterations: 1,
                ..PasswordSettings::default()
            },
            email_client: None,
        }
    }

    fn harness() -> Harness {
        let users = Arc::new(InMemoryUserStore::new());
        let tokens = Arc::new(InMemoryRefreshTokenStore::new());
        let clock = Arc::new(ManualClock::default());
        let service =
            SessionService::from_settings(&settings(), users.clone(), tokens.clone(), clock.clone())
                .expect("Failed to build session service");
        Harness {
            service,
            users,
            tokens,
            clock,
        }
    }

    #[tokio::test]
    async fn test_register_duplicate_email() {
        let h = harness();

        assert!(h.service.register("a@x.com", "pw1").await.is_ok());
        let duplicate = h.service.register("a@x.com", "pw2").await;

        assert!(matches!(duplicate, Err(AppError::Conflict(ConflictError::EmailExists))));
    }

    #[tokio::test]
    async fn test_register_email_is_case_insensitive() {
        let h = harness();

        let user = h.service.register("Alice@Example.com", "pw1").await.unwrap();
        assert_eq!(user.email, "alice@example.com");

        let duplicate = h.service.register("ALICE@example.COM", "pw2").await;
        assert!(matches!(duplicate, Err(AppError::Conflict(ConflictError::EmailExists))));
    }

    #[tokio::test]
    async fn test_register_rejects_policy_violations() {
        let h = harness();

        assert!(matches!(
            h.service.register("not-an-email", "pw1").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.service.register("a@x.com", "pw").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_register_stores_hash_not_password() {
        let h = harness();

        let user = h.service.register("a@x.com", "pw1").await.unwrap();
        assert_ne!(user.password_hash, "pw1");
        assert!(user.is_active);
        assert!(!user.is_superuser);
    }

    #[tokio::test]
    async fn test_login_does_not_distinguish_unknown_email() {
        let h = harness();
        h.service.register("a@x.com", "pw1").await.unwrap();

        let wrong_password = h.service.login("a@x.com", "nope", None).await;
        let unknown_email = h.service.login("b@x.com", "pw1", None).await;

        assert!(matches!(wrong_password, Err(AppError::Auth(AuthError::InvalidCredentials))));
        assert!(matches!(unknown_email, Err(AppError::Auth(AuthError::InvalidCredentials))));
    }

    #[tokio::test]
    async fn test_login_refresh_then_replay() {
        let h = harness();
        let user = h.service.register("a@x.com", "pw1").await.unwrap();

        let first = h.service.login("A@X.com", "pw1", Some("127.0.0.1".to_string())).await.unwrap();
        assert_eq!(first.user_id, user.id);
        assert_eq!(first.access_expires_in, 15 * 60);

        let second = h.service.refresh(&first.refresh_token, None).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);
        let claims = h.service.authenticate(&second.access_token).unwrap();
        assert_eq!(claims.user_id().unwrap(), user.id);

        let replay = h.service.refresh(&first.refresh_token, None).await;
        assert!(matches!(replay, Err(AppError::Auth(AuthError::TokenReused))));
    }

    #[tokio::test]
    async fn test_refresh_after_expiry() {
        let h = harness();
        h.service.register("a@x.com", "pw1").await.unwrap();
        let session = h.service.login("a@x.com", "pw1", None).await.unwrap();

        h.clock.advance(Duration::days(8));
        let result = h.service.refresh(&session.refresh_token, None).await;

        assert!(matches!(result, Err(AppError::Auth(AuthError::TokenExpired))));
    }

    #[tokio::test]
    async fn test_refresh_for_inactive_user_revokes_successor() {
        let h = harness();
        let user = h.service.register("a@x.com", "pw1").await.unwrap();
        let session = h.service.login("a@x.com", "pw1", None).await.unwrap();
        h.users.set_active(user.id, false).unwrap();

        let result = h.service.refresh(&session.refresh_token, None).await;
        assert!(matches!(result, Err(AppError::Auth(AuthError::AccountInactive))));

        let records = h.tokens.records_for_owner(user.id).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.revoked));
    }

    #[tokio::test]
    async fn test_inactive_user_cannot_login() {
        let h = harness();
        let user = h.service.register("a@x.com", "pw1").await.unwrap();
        h.users.set_active(user.id, false).unwrap();

        let result = h.service.login("a@x.com", "pw1", None).await;
        assert!(matches!(result, Err(AppError::Auth(AuthError::AccountInactive))));
    }

    #[tokio::test]
    async fn test_logout_twice_succeeds() {
        let h = harness();
        h.service.register("a@x.com", "pw1").await.unwrap();
        let session = h.service.login("a@x.com", "pw1", None).await.unwrap();

        assert!(h.service.logout(&session.refresh_token).await.is_ok());
        assert!(h.service.logout(&session.refresh_token).await.is_ok());
        assert!(h.service.logout("never-issued").await.is_ok());

        assert!(h.service.refresh(&session.refresh_token, None).await.is_err());
    }

    #[tokio::test]
    async fn test_password_reset_flow() {
        let h = harness();
        let user = h.service.register("a@x.com", "pw1").await.unwrap();
        let session = h.service.login("a@x.com", "pw1", None).await.unwrap();

        let (reset_user, token) = h.service.request_password_reset("a@x.com").await.unwrap();
        assert_eq!(reset_user.id, user.id);

        h.service.complete_password_reset(&token, "pw-new").await.unwrap();

        assert!(h.service.login("a@x.com", "pw1", None).await.is_err());
        assert!(h.service.login("a@x.com", "pw-new", None).await.is_ok());
        // sessions opened with the old password are gone
        assert!(h.service.refresh(&session.refresh_token, None).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_token_is_single_use() {
        let h = harness();
        h.service.register("a@x.com", "pw1").await.unwrap();
        let (_, token) = h.service.request_password_reset("a@x.com").await.unwrap();

        h.service.complete_password_reset(&token, "pw-new").await.unwrap();
        let second_use = h.service.complete_password_reset(&token, "pw-other").await;

        assert!(matches!(
            second_use,
            Err(AppError::Auth(AuthError::InvalidOrExpiredResetToken))
        ));
        assert!(h.service.login("a@x.com", "pw-new", None).await.is_ok());
        assert!(h.service.login("a@x.com", "pw-other", None).await.is_err());
    }

    #[tokio::test]
    async fn test_unbound_reset_token_rejected() {
        let h = harness();
        let user = h.service.register("a@x.com", "pw1").await.unwrap();
        let unbound = h.service.reset_tokens.issue_default(user.id).unwrap();

        let result = h.service.complete_password_reset(&unbound, "pw-new").await;
        assert!(matches!(
            result,
            Err(AppError::Auth(AuthError::InvalidOrExpiredResetToken))
        ));
    }

    #[tokio::test]
    async fn test_password_reset_unknown_email() {
        let h = harness();

        let result = h.service.request_password_reset("ghost@x.com").await;
        assert!(matches!(result, Err(AppError::NotFound(NotFoundError::User))));
    }

    #[tokio::test]
    async fn test_password_reset_token_expires() {
        let h = harness();
        h.service.register("a@x.com", "pw1").await.unwrap();
        let (_, token) = h.service.request_password_reset("a@x.com").await.unwrap();

        h.clock.advance(Duration::seconds(901));
        let result = h.service.complete_password_reset(&token, "pw-new").await;

        assert!(matches!(
            result,
            Err(AppError::Auth(AuthError::InvalidOrExpiredResetToken))
        ));
    }

    #[tokio::test]
    async fn test_access_token_cannot_reset_password() {
        let h = harness();
        h.service.register("a@x.com", "pw1").await.unwrap();
        let session = h.service.login("a@x.com", "pw1", None).await.unwrap();

        let result = h.service.complete_password_reset(&session.access_token, "pw-new").await;
        assert!(matches!(
            result,
            Err(AppError::Auth(AuthError::InvalidOrExpiredResetToken))
        ));
    }

    #[tokio::test]
    async fn test_reset_for_deleted_user() {
        let h = harness();
        let stray = h.service.reset_tokens.issue_default(Uuid::new_v4()).unwrap();

        let result = h.service.complete_password_reset(&stray, "pw-new").await;
        assert!(matches!(result, Err(AppError::NotFound(NotFoundError::User))));
    }

    #[tokio::test]
    async fn test_current_user() {
        let h = harness();
        let user = h.service.register("a@x.com", "pw1").await.unwrap();

        assert_eq!(h.service.current_user(user.id).await.unwrap().email, "a@x.com");
        assert!(matches!(
            h.service.current_user(Uuid::new_v4()).await,
            Err(AppError::NotFound(NotFoundError::User))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_rejects_expired_access_token() {
        let h = harness();
        h.service.register("a@x.com", "pw1").await.unwrap();
        let session = h.service.login("a@x.com", "pw1", None).await.unwrap();

        h.clock.advance(Duration::minutes(16));
        assert!(matches!(
            h.service.authenticate(&session.access_token),
            Err(AppError::Auth(AuthError::TokenExpired))
        ));
    }
}
