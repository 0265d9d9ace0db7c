//! Tracing/logging initialization.
//!
//! `RUST_LOG` selects the filter (default `info`); `LOG_FORMAT` selects
//! `json` (default) or `pretty` output.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Multi-line, human-readable output for local runs.
    Pretty,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown log format '{0}' (expected 'json' or 'pretty')")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(ParseLogFormatError(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filter: String,
    pub format: LogFormat,
    /// Set when `LOG_FORMAT` held something unusable; reported once logging is up.
    pub rejected_format: Option<ParseLogFormatError>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            rejected_format: None,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let filter = lookup("RUST_LOG")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let (format, rejected_format) = match lookup("LOG_FORMAT") {
            None => (LogFormat::default(), None),
            Some(raw) => match raw.parse() {
                Ok(format) => (format, None),
                Err(e) => (LogFormat::default(), Some(e)),
            },
        };

        Self {
            filter,
            format,
            rejected_format,
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, in which case the
/// existing one is left in place.
pub fn init(config: LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .try_init()
            .is_ok(),
    };

    if installed {
        if let Some(err) = &config.rejected_format {
            ::tracing::warn!(error = %err, "falling back to JSON logs");
        }
        ::tracing::debug!(format = %config.format, filter = %config.filter, "logging initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_json_at_info() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn reads_filter_and_format() {
        let config = LogConfig::from_lookup(lookup(&[
            ("RUST_LOG", "leasebook_infra=debug"),
            ("LOG_FORMAT", "Pretty"),
        ]));
        assert_eq!(config.filter, "leasebook_infra=debug");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.rejected_format.is_none());
    }

    #[test]
    fn unknown_format_falls_back_to_json() {
        let config = LogConfig::from_lookup(lookup(&[("LOG_FORMAT", "xml")]));
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.rejected_format,
            Some(ParseLogFormatError("xml".to_string()))
        );
    }

    #[test]
    fn second_init_is_a_no_op() {
        let _ = init(LogConfig::default());
        assert!(!init(LogConfig::default()));
        crate::init();
    }
}
