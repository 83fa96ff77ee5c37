/// Authentication module
///
/// Password hashing, signed token issuance/validation, and the refresh token
/// rotation engine.

mod claims;
mod jwt;
mod password;
mod refresh_token;

pub use claims::{Claims, TokenPurpose};
pub use jwt::{TokenCodec, TokenError};
pub use password::CredentialHasher;
pub use refresh_token::{fingerprint, generate_refresh_token, IssuedRefreshToken, RotationEngine};
