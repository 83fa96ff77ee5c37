/// Token Codec
///
/// Issues and verifies HMAC-signed JWTs carrying a subject, an absolute expiry
/// and a purpose. Expiry is checked against the injected clock instead of the
/// library's wall-clock check, and reported separately from tampering.

use chrono::Duration;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::claims::{Claims, TokenPurpose};
use crate::clock::Clock;
use crate::error::AppError;

/// Why a presented token was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Malformed, tampered, wrong issuer, wrong algorithm or wrong purpose
    Invalid,
    /// Well-formed and correctly signed, but past its `exp`
    Expired,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::Invalid => write!(f, "invalid token"),
            TokenError::Expired => write!(f, "expired token"),
        }
    }
}

impl std::error::Error for TokenError {}

#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    purpose: TokenPurpose,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(
        secret: &str,
        algorithm: Algorithm,
        issuer: impl Into<String>,
        purpose: TokenPurpose,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            issuer: issuer.into(),
            purpose,
            ttl,
            clock,
        }
    }

    /// Default lifetime of tokens issued by this codec
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `subject` with the codec's default lifetime
    pub fn issue_default(&self, subject: Uuid) -> Result<String, AppError> {
        self.issue(subject, self.ttl)
    }

    /// Issue a token for `subject` that expires `ttl` from now
    ///
    /// # Errors
    /// Returns an internal error if signing fails
    pub fn issue(&self, subject: Uuid, ttl: Duration) -> Result<String, AppError> {
        self.sign(&self.claims_for(subject, ttl))
    }

    /// Issue a default-lifetime token bound to a credential fingerprint
    pub fn issue_bound(
        &self,
        subject: Uuid,
        credential_fingerprint: String,
    ) -> Result<String, AppError> {
        self.sign(&self.claims_for(subject, self.ttl).bound_to(credential_fingerprint))
    }

    fn claims_for(&self, subject: Uuid, ttl: Duration) -> Claims {
        Claims::new(
            subject,
            self.clock.now().timestamp(),
            ttl.num_seconds(),
            self.issuer.clone(),
            self.purpose,
        )
    }

    fn sign(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::new(self.algorithm), claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Token generation failed: {}", e)))
    }

    /// Verify signature, algorithm, issuer, purpose and expiry
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        // expiry is judged below against the injected clock
        validation.validate_exp = false;
        validation.leeway = 0;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected during decoding");
                TokenError::Invalid
            })?;

        if claims.purpose != self.purpose {
            tracing::warn!(
                expected = ?self.purpose,
                presented = ?claims.purpose,
                "Token presented for the wrong purpose"
            );
            return Err(TokenError::Invalid);
        }

        if claims.is_expired_at(self.clock.now().timestamp()) {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}
