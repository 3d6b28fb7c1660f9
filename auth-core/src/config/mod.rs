use std::collections::HashSet;

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;

use crate::services::policy::PasswordPolicy;
use crate::utils::password::WorkFactor;

/// Config file looked up (without extension) when loading from the environment.
pub const CONFIG_FILE: &str = "auth-core";
/// Environment prefix, e.g. `AUTH__JWT__ACCESS_TOKEN_EXPIRY_MINUTES=10`.
pub const ENV_PREFIX: &str = "AUTH";

/// HS256 keys shorter than this are refused.
const MIN_SECRET_BYTES: usize = 32;
/// Access credentials must stay short-lived.
const MAX_ACCESS_TOKEN_MINUTES: i64 = 60;
/// Upper bound on the refresh family lifetime.
const MAX_REFRESH_TOKEN_DAYS: i64 = 365;
/// OWASP floor for argon2id memory cost in production.
const PROD_MIN_MEMORY_KIB: u32 = 19456;

/// Process-wide configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub password: PasswordConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Key id used for signing new access credentials.
    pub active_key_id: String,
    pub keys: Vec<SigningKeyConfig>,
    #[serde(default = "default_access_expiry")]
    pub access_token_expiry_minutes: i64,
    #[serde(default = "default_refresh_expiry")]
    pub refresh_token_expiry_days: i64,
}

/// One HMAC signing key. Retired keys verify but never sign.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningKeyConfig {
    pub kid: String,
    pub secret: Secret<String>,
    #[serde(default)]
    pub retired: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    /// Argon2id memory cost in KiB.
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    /// Argon2id time cost.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub policy: PasswordPolicy,
}

impl PasswordConfig {
    pub fn work_factor(&self) -> WorkFactor {
        WorkFactor {
            memory_kib: self.memory_kib,
            iterations: self.iterations,
        }
    }
}

impl Default for PasswordConfig {
    fn default() -> Self {
        let work = WorkFactor::default();
        Self {
            memory_kib: work.memory_kib,
            iterations: work.iterations,
            policy: PasswordPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_service_name() -> String {
    "auth-core".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_issuer() -> String {
    "auth-core".to_string()
}

fn default_access_expiry() -> i64 {
    15
}

fn default_refresh_expiry() -> i64 {
    7
}

fn default_memory_kib() -> u32 {
    WorkFactor::default().memory_kib
}

fn default_iterations() -> u32 {
    WorkFactor::default().iterations
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_channel_capacity() -> usize {
    1024
}

impl CoreConfig {
    /// Load from `auth-core.{toml,yaml,json}` and `AUTH__*` variables.
    pub fn load() -> Result<Self, AppError> {
        Self::load_from(CONFIG_FILE, ENV_PREFIX)
    }

    pub fn load_from(file: &str, env_prefix: &str) -> Result<Self, AppError> {
        let config: CoreConfig = core_config::load_section(file, env_prefix)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(config_error("jwt.access_token_expiry_minutes must be positive"));
        }

        if self.jwt.access_token_expiry_minutes > MAX_ACCESS_TOKEN_MINUTES {
            return Err(config_error(format!(
                "jwt.access_token_expiry_minutes must not exceed {}",
                MAX_ACCESS_TOKEN_MINUTES
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(config_error("jwt.refresh_token_expiry_days must be positive"));
        }

        if self.jwt.refresh_token_expiry_days > MAX_REFRESH_TOKEN_DAYS {
            return Err(config_error(format!(
                "jwt.refresh_token_expiry_days must not exceed {}",
                MAX_REFRESH_TOKEN_DAYS
            )));
        }

        let mut seen = HashSet::new();
        for key in &self.jwt.keys {
            if !seen.insert(key.kid.as_str()) {
                return Err(config_error(format!("Duplicate signing key id: {}", key.kid)));
            }
            if key.secret.expose_secret().len() < MIN_SECRET_BYTES {
                return Err(config_error(format!(
                    "Signing key {} must be at least {} bytes",
                    key.kid, MIN_SECRET_BYTES
                )));
            }
        }

        match self.jwt.keys.iter().find(|k| k.kid == self.jwt.active_key_id) {
            None => {
                return Err(config_error(format!(
                    "Active signing key {} is not configured",
                    self.jwt.active_key_id
                )))
            }
            Some(key) if key.retired => {
                return Err(config_error(format!(
                    "Active signing key {} is retired",
                    key.kid
                )))
            }
            Some(_) => {}
        }

        let work = self.password.work_factor();
        argon2::Params::new(work.memory_kib, work.iterations, 1, None)
            .map_err(|e| config_error(format!("Invalid argon2 parameters: {}", e)))?;

        if self.audit.channel_capacity == 0 {
            return Err(config_error("audit.channel_capacity must be positive"));
        }

        if self.environment == Environment::Prod {
            if work.memory_kib < PROD_MIN_MEMORY_KIB {
                return Err(config_error(format!(
                    "password.memory_kib must be at least {} in production",
                    PROD_MIN_MEMORY_KIB
                )));
            }

            if self.password.policy.min_length < 8 {
                tracing::error!("Password policy allows passwords shorter than 8 characters in production");
            }
        }

        Ok(())
    }
}

fn config_error(msg: impl Into<String>) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(msg.into()))
}
