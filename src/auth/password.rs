/// Password Hashing and Verification
///
/// Argon2id with a tunable work factor. Hashing is CPU and memory heavy, so the
/// async entry points run on the blocking pool and share a fixed number of
/// permits.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::configuration::PasswordSettings;
use crate::error::{AppError, ConfigError};

#[derive(Clone)]
pub struct CredentialHasher {
    params: Params,
    permits: Arc<Semaphore>,
}

impl CredentialHasher {
    /// Build a hasher from the configured work factor
    ///
    /// # Errors
    /// Returns a config error if argon2 rejects the parameters
    pub fn new(settings: &PasswordSettings) -> Result<Self, AppError> {
        let params = Params::new(
            settings.memory_kib,
            settings.iterations,
            settings.parallelism,
            None,
        )
        .map_err(|e| AppError::Config(ConfigError::InvalidValue(format!("argon2 params: {}", e))))?;

        Ok(Self {
            params,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_hashes)),
        })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password into a PHC string with a fresh random salt
    pub fn hash(&self, plaintext: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))
    }

    /// Verify a password against a stored digest
    ///
    /// A digest that does not parse is treated as a mismatch.
    pub fn verify(&self, plaintext: &str, digest: &str) -> bool {
        match PasswordHash::new(digest) {
            Ok(parsed) => self
                .argon2()
                .verify_password(plaintext.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Stored password digest is malformed");
                false
            }
        }
    }

    /// `hash` on the blocking pool, bounded by the permit count
    pub async fn hash_async(&self, plaintext: String) -> Result<String, AppError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("Hash permits closed: {}", e)))?;
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext)).await?
    }

    /// `verify` on the blocking pool, bounded by the permit count
    pub async fn verify_async(&self, plaintext: String, digest: String) -> Result<bool, AppError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("Hash permits closed: {}", e)))?;
        let hasher = self.clone();
        Ok(tokio::task::spawn_blocking(move || hasher.verify(&plaintext, &digest)).await?)
    }
}
