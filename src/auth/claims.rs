/// JWT Claims structure
///
/// Payload of the signed tokens: the subject, standard time claims (RFC 7519)
/// and a purpose claim so an access token can never stand in for a
/// password-reset token or the other way round.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AuthError};

/// What a signed token may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    Access,
    PasswordReset,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Issuer
    pub iss: String,
    pub purpose: TokenPurpose,
    /// Fingerprint of the credential the token was issued against; reset
    /// tokens carry it so they stop working once the password changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwh: Option<String>,
}

impl Claims {
    pub fn new(subject: Uuid, issued_at: i64, ttl_seconds: i64, issuer: String, purpose: TokenPurpose) -> Self {
        Self {
            sub: subject.to_string(),
            exp: issued_at + ttl_seconds,
            iat: issued_at,
            iss: issuer,
            purpose,
            pwh: None,
        }
    }

    /// Bind the token to a credential fingerprint
    pub fn bound_to(mut self, credential_fingerprint: String) -> Self {
        self.pwh = Some(credential_fingerprint);
        self
    }

    /// Whether the token was issued against this credential fingerprint
    pub fn is_bound_to(&self, credential_fingerprint: &str) -> bool {
        self.pwh.as_deref() == Some(credential_fingerprint)
    }

    /// Extract user ID from claims
    ///
    /// # Errors
    /// Returns `TokenInvalid` if the subject is not a UUID
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::Auth(AuthError::TokenInvalid))
    }

    /// A token is expired from its `exp` second onwards
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }
}
