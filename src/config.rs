//! Service configuration.
//!
//! Settings come from the process environment with sane development
//! defaults. Validation runs once at startup; an invalid value aborts the
//! process with a non-zero exit code rather than limping along.

use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::signing_key_from_b64;
use crate::token::ALGORITHM;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub audit_wal_path: PathBuf,
    pub admin_api_key: String,
    /// base64 Ed25519 seed; generated at startup when absent
    pub jwt_private_key: Option<String>,
    pub jwt_algorithm: String,
    pub jwt_agent_expire_seconds: u64,
    pub jwt_admin_expire_seconds: u64,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_storage_uri: String,
    pub cors_origins: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub request_timeout: u64,
    pub host: String,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any string lookup; tests supply a closure over a
    /// map instead of mutating the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let settings = Settings {
            database_url: get_or(&get, "DATABASE_URL", "memory://"),
            audit_wal_path: PathBuf::from(get_or(&get, "AUDIT_WAL_PATH", "data/audit.wal")),
            admin_api_key: get_or(&get, "ADMIN_API_KEY", "admin-secret-key-change-in-production"),
            jwt_private_key: get("JWT_PRIVATE_KEY").filter(|v| !v.trim().is_empty()),
            jwt_algorithm: get_or(&get, "JWT_ALGORITHM", ALGORITHM),
            jwt_agent_expire_seconds: parse_u64(&get, "JWT_AGENT_EXPIRE_SECONDS", 3600)?,
            jwt_admin_expire_seconds: parse_u64(&get, "JWT_ADMIN_EXPIRE_SECONDS", 28800)?,
            webhook_url: get("WEBHOOK_URL").filter(|v| !v.trim().is_empty()),
            webhook_secret: get("WEBHOOK_SECRET").filter(|v| !v.trim().is_empty()),
            rate_limit_enabled: parse_bool(&get, "RATE_LIMIT_ENABLED", true)?,
            rate_limit_storage_uri: get_or(&get, "RATE_LIMIT_STORAGE_URI", "memory://"),
            cors_origins: get_or(&get, "CORS_ORIGINS", "http://localhost:3000"),
            log_level: get_or(&get, "LOG_LEVEL", "info"),
            log_format: match get_or(&get, "LOG_FORMAT", "text").as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => return Err(invalid("LOG_FORMAT", other, "expected text or json")),
            },
            request_timeout: parse_u64(&get, "REQUEST_TIMEOUT", 30)?,
            host: get_or(&get, "HOST", "0.0.0.0"),
            port: parse_port(&get)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_algorithm != ALGORITHM {
            return Err(invalid(
                "JWT_ALGORITHM",
                &self.jwt_algorithm,
                format!("only {ALGORITHM} is supported"),
            ));
        }
        if !self.database_url.starts_with("memory://") {
            return Err(invalid(
                "DATABASE_URL",
                &self.database_url,
                "only the in-process memory:// store is realized",
            ));
        }
        if !self.rate_limit_storage_uri.starts_with("memory://") {
            return Err(invalid(
                "RATE_LIMIT_STORAGE_URI",
                &self.rate_limit_storage_uri,
                "only the in-process memory:// counter store is realized",
            ));
        }
        if let Some(seed) = &self.jwt_private_key {
            signing_key_from_b64(seed).map_err(|e| {
                invalid("JWT_PRIVATE_KEY", "<redacted>", format!("not a base64 Ed25519 seed: {e}"))
            })?;
        }
        if self.request_timeout == 0 {
            return Err(invalid("REQUEST_TIMEOUT", "0", "must be positive"));
        }
        Ok(())
    }

    pub fn cors_origins_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }
}

fn get_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    get(key).filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_u64(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(key, &raw, "expected an unsigned integer")),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        },
    }
}

fn parse_port(get: &impl Fn(&str) -> Option<String>) -> Result<u16, ConfigError> {
    match get("PORT") {
        None => Ok(8000),
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| invalid("PORT", &raw, "expected a port number")),
    }
}
