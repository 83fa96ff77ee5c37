use jsonwebtoken::Algorithm;
use std::str::FromStr;

use crate::error::ConfigError;

const MIN_SECRET_LENGTH: usize = 32;
const MAX_ACCESS_TOKEN_MINUTES: i64 = 24 * 60;
const MAX_RESET_TOKEN_SECONDS: i64 = 24 * 60 * 60;
const MAX_REFRESH_DAYS: i64 = 365;
const MAX_REUSE_GRACE_SECONDS: i64 = 60;

#[derive(serde::Deserialize, Clone, Debug)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub jwt: JwtSettings,
    pub refresh: RefreshTokenSettings,
    #[serde(default)]
    pub password: PasswordSettings,
    #[serde(default)]
    pub email_client: Option<EmailClientSettings>,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct ApplicationSettings {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct DatabaseSettings {
    /// Full connection string; takes precedence over the discrete parts
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub database_name: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => self.connection_string_for(&self.database_name),
        }
    }

    /// Connection string for another database on the same server
    pub fn connection_string_for(&self, database_name: &str) -> String {
        match &self.url {
            Some(url) => {
                let base = url.split('?').next().unwrap_or(url);
                match base.rfind('/') {
                    Some(idx) if idx >= "postgres://".len() => {
                        format!("{}/{}", &base[..idx], database_name)
                    }
                    _ => format!("{}/{}", base, database_name),
                }
            }
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, database_name
            ),
        }
    }
}

/// Signing settings for access and password-reset tokens
#[derive(serde::Deserialize, Clone, Debug)]
pub struct JwtSettings {
    /// Session secret, signs access tokens
    pub access_secret: String,
    /// Token secret, signs password-reset tokens; must differ from `access_secret`
    pub reset_secret: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    pub issuer: String,
    #[serde(default = "default_access_expiry")]
    pub access_token_expiry_minutes: i64,
    #[serde(default = "default_reset_expiry")]
    pub reset_token_expiry_seconds: i64,
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_access_expiry() -> i64 {
    30
}

fn default_reset_expiry() -> i64 {
    900
}

impl JwtSettings {
    /// Parse the configured algorithm, accepting only the HMAC family
    pub fn signing_algorithm(&self) -> Result<Algorithm, ConfigError> {
        let algorithm = Algorithm::from_str(&self.algorithm)
            .map_err(|_| ConfigError::InvalidValue(format!("jwt.algorithm: {}", self.algorithm)))?;

        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(algorithm),
            _ => Err(ConfigError::InvalidValue(format!(
                "jwt.algorithm: {} is not an HMAC algorithm",
                self.algorithm
            ))),
        }
    }
}

/// Refresh token lifetime and cookie scope
#[derive(serde::Deserialize, Clone, Debug)]
pub struct RefreshTokenSettings {
    #[serde(default = "default_refresh_expiry")]
    pub expiry_days: i64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
    /// Revoke every live token of the owner when a revoked token is replayed
    #[serde(default = "default_true")]
    pub revoke_family_on_reuse: bool,
    /// Replays this soon after a revocation are rejected without revoking the family
    #[serde(default = "default_reuse_grace")]
    pub reuse_grace_seconds: i64,
}

fn default_reuse_grace() -> i64 {
    5
}

fn default_refresh_expiry() -> i64 {
    7
}

fn default_cookie_name() -> String {
    "refresh_token".to_string()
}

fn default_cookie_path() -> String {
    "/auth".to_string()
}

fn default_true() -> bool {
    true
}

/// Password policy and argon2 work factor
#[derive(serde::Deserialize, Clone, Debug)]
pub struct PasswordSettings {
    #[serde(default = "default_min_password")]
    pub min_length: usize,
    #[serde(default = "default_max_password")]
    pub max_length: usize,
    /// Require at least one digit, one lowercase and one uppercase letter
    #[serde(default = "default_true")]
    pub require_character_classes: bool,
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default = "default_hash_permits")]
    pub max_concurrent_hashes: usize,
}

fn default_min_password() -> usize {
    8
}

fn default_max_password() -> usize {
    128
}

fn default_memory_kib() -> u32 {
    19 * 1024
}

fn default_iterations() -> u32 {
    2
}

fn default_parallelism() -> u32 {
    1
}

fn default_hash_permits() -> usize {
    4
}

impl Default for PasswordSettings {
    fn default() -> Self {
        Self {
            min_length: default_min_password(),
            max_length: default_max_password(),
            require_character_classes: true,
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
            max_concurrent_hashes: default_hash_permits(),
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct EmailClientSettings {
    pub base_url: String,
    pub sender_email: String,
    /// Link template for the reset mail; `{token}` is replaced with the reset token
    pub reset_link_template: String,
    #[serde(default = "default_email_timeout")]
    pub timeout_milliseconds: u64,
}

fn default_email_timeout() -> u64 {
    10_000
}

impl Settings {
    /// Reject settings that would break token or storage invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        let jwt = &self.jwt;
        if jwt.access_secret.len() < MIN_SECRET_LENGTH {
            return Err(ConfigError::InvalidValue(format!(
                "jwt.access_secret must be at least {} bytes",
                MIN_SECRET_LENGTH
            )));
        }
        if jwt.reset_secret.len() < MIN_SECRET_LENGTH {
            return Err(ConfigError::InvalidValue(format!(
                "jwt.reset_secret must be at least {} bytes",
                MIN_SECRET_LENGTH
            )));
        }
        if jwt.access_secret == jwt.reset_secret {
            return Err(ConfigError::InvalidValue(
                "jwt.access_secret and jwt.reset_secret must differ".to_string(),
            ));
        }
        jwt.signing_algorithm()?;
        if jwt.issuer.trim().is_empty() {
            return Err(ConfigError::MissingRequired("jwt.issuer".to_string()));
        }
        if !(1..=MAX_ACCESS_TOKEN_MINUTES).contains(&jwt.access_token_expiry_minutes) {
            return Err(ConfigError::InvalidValue(format!(
                "jwt.access_token_expiry_minutes must be between 1 and {}",
                MAX_ACCESS_TOKEN_MINUTES
            )));
        }
        if !(1..=MAX_RESET_TOKEN_SECONDS).contains(&jwt.reset_token_expiry_seconds) {
            return Err(ConfigError::InvalidValue(format!(
                "jwt.reset_token_expiry_seconds must be between 1 and {}",
                MAX_RESET_TOKEN_SECONDS
            )));
        }

        if !(1..=MAX_REFRESH_DAYS).contains(&self.refresh.expiry_days) {
            return Err(ConfigError::InvalidValue(format!(
                "refresh.expiry_days must be between 1 and {}",
                MAX_REFRESH_DAYS
            )));
        }
        if !(0..=MAX_REUSE_GRACE_SECONDS).contains(&self.refresh.reuse_grace_seconds) {
            return Err(ConfigError::InvalidValue(format!(
                "refresh.reuse_grace_seconds must be between 0 and {}",
                MAX_REUSE_GRACE_SECONDS
            )));
        }
        if !self.refresh.cookie_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(
                "refresh.cookie_path must be absolute".to_string(),
            ));
        }

        let password = &self.password;
        if password.min_length == 0 || password.min_length > password.max_length {
            return Err(ConfigError::InvalidValue(
                "password length bounds are inverted or zero".to_string(),
            ));
        }
        if password.max_concurrent_hashes == 0 {
            return Err(ConfigError::InvalidValue(
                "password.max_concurrent_hashes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Load settings from an optional `configuration` file overlaid by `APP__*`
/// environment variables, e.g. `APP__JWT__ACCESS_SECRET`.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("configuration").required(false))
        .add_source(
            config::Environment::with_prefix("APP")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let settings = settings.try_deserialize::<Settings>()?;
    settings.validate()?;
    Ok(settings)
}
