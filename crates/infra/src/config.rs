//! Configuration loaded from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | unset (in-memory stores) |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `DATABASE_ACQUIRE_TIMEOUT_SECS` | `30` |
//! | `INVOICE_NUMBER_SEQUENCE` | `invoice_numbers` |
//! | `INVOICE_NUMBER_INITIAL` | `1000000` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_INVOICE_NUMBER_SEQUENCE: &str = "invoice_numbers";
pub const DEFAULT_INVOICE_NUMBER_INITIAL: i64 = 1_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Where invoice numbers come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberingConfig {
    pub sequence_name: String,
    /// First number handed out when the sequence does not exist yet.
    pub initial_value: i64,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            sequence_name: DEFAULT_INVOICE_NUMBER_SEQUENCE.to_string(),
            initial_value: DEFAULT_INVOICE_NUMBER_INITIAL,
        }
    }
}

/// Postgres connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl core::fmt::Debug for DatabaseConfig {
    // The URL usually carries credentials.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfraConfig {
    /// `None` selects the in-memory stores.
    pub database: Option<DatabaseConfig>,
    pub numbering: NumberingConfig,
}

impl InfraConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (env, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database = match lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10u32)?,
                acquire_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "DATABASE_ACQUIRE_TIMEOUT_SECS",
                    30u64,
                )?),
            }),
            None => None,
        };

        let sequence_name = lookup("INVOICE_NUMBER_SEQUENCE")
            .unwrap_or_else(|| DEFAULT_INVOICE_NUMBER_SEQUENCE.to_string());
        let initial_value = parse_or(
            &lookup,
            "INVOICE_NUMBER_INITIAL",
            DEFAULT_INVOICE_NUMBER_INITIAL,
        )?;
        if initial_value < 0 {
            return Err(ConfigError::Invalid {
                key: "INVOICE_NUMBER_INITIAL",
                value: initial_value.to_string(),
                reason: "must not be negative".to_string(),
            });
        }

        Ok(Self {
            database,
            numbering: NumberingConfig {
                sequence_name,
                initial_value,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
