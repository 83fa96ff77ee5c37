/// Input validators
///
/// Boundary checks applied before any request reaches the session core:
/// 1. Email format and length, normalised for case-insensitive uniqueness
/// 2. Password length bounds (also caps argon2 input size)
/// 3. Optional password character-class rule

use lazy_static::lazy_static;
use regex::Regex;

use crate::configuration::PasswordSettings;
use crate::error::ValidationError;

const MAX_EMAIL_LENGTH: usize = 254; // RFC 5321
const MIN_EMAIL_LENGTH: usize = 5;
const MAX_LOCAL_PART_LENGTH: usize = 64;

lazy_static! {
    // RFC 5322 simplified email regex (practical validation)
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    ).unwrap();
}

/// Validate an email address and return its normalised form
///
/// Normalisation trims surrounding whitespace and lower-cases the whole
/// address, so `A@X.com` and `a@x.com` identify the same account.
pub fn normalize_email(email: &str) -> Result<String, ValidationError> {
    let trimmed = email.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("email".to_string()));
    }

    if trimmed.len() < MIN_EMAIL_LENGTH {
        return Err(ValidationError::TooShort("email".to_string(), MIN_EMAIL_LENGTH));
    }

    if trimmed.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::TooLong("email".to_string(), MAX_EMAIL_LENGTH));
    }

    if !EMAIL_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("email".to_string()));
    }

    if has_suspicious_email_patterns(trimmed) {
        return Err(ValidationError::SuspiciousContent("email".to_string()));
    }

    Ok(trimmed.to_lowercase())
}

fn has_suspicious_email_patterns(email: &str) -> bool {
    if let Some(at_pos) = email.find('@') {
        if at_pos > MAX_LOCAL_PART_LENGTH {
            return true;
        }
    }

    email.matches('@').count() != 1 || email.contains('\0')
}

/// Check a candidate password against the configured policy
///
/// Lengths are counted in characters. The upper bound keeps hashing cost
/// bounded per request.
pub fn validate_password(password: &str, policy: &PasswordSettings) -> Result<(), ValidationError> {
    let length = password.chars().count();

    if length == 0 {
        return Err(ValidationError::EmptyField("password".to_string()));
    }

    if length < policy.min_length {
        return Err(ValidationError::TooShort("password".to_string(), policy.min_length));
    }

    if length > policy.max_length {
        return Err(ValidationError::TooLong("password".to_string(), policy.max_length));
    }

    if password.contains('\0') {
        return Err(ValidationError::SuspiciousContent("password".to_string()));
    }

    if policy.require_character_classes {
        let has_digit = password.chars().any(|c| c.is_numeric());
        let has_lowercase = password.chars().any(|c| c.is_lowercase());
        let has_uppercase = password.chars().any(|c| c.is_uppercase());

        if !has_digit || !has_lowercase || !has_uppercase {
            return Err(ValidationError::InvalidFormat(
                "password must contain at least one digit, one lowercase letter, and one uppercase letter"
                    .to_string(),
            ));
        }
    }

    Ok(())
}
