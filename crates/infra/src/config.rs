//! Environment configuration for the brief service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::retry::RetryPolicy;
use crate::pipeline::DEFAULT_AUDIO_BITRATE_KBPS;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} is required when {1}")]
    Missing(&'static str, &'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BriefsConfig {
    pub bind_addr: SocketAddr,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub retry_policy: RetryPolicy,
    pub estimated_seconds_per_job: u64,
    pub audio_bitrate_kbps: u32,
    pub audio_dir: PathBuf,
    pub public_base_url: String,
    pub worker_poll_interval: Duration,
    pub notify_webhook_url: Option<String>,
    /// Shared secret for `/admin` routes; admin routes are refused when unset.
    pub admin_token: Option<String>,
}

impl Default for BriefsConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            redis_url: None,
            retry_policy: RetryPolicy::default(),
            estimated_seconds_per_job: crate::jobs::store::DEFAULT_ESTIMATED_SECONDS_PER_JOB,
            audio_bitrate_kbps: DEFAULT_AUDIO_BITRATE_KBPS,
            audio_dir: PathBuf::from("./data/audio"),
            public_base_url: "http://localhost:8080/audio".to_string(),
            worker_poll_interval: Duration::from_millis(500),
            notify_webhook_url: None,
            admin_token: None,
        }
    }
}

fn parse<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl BriefsConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through an arbitrary lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| non_empty(lookup(key));

        let max_retries = parse("BRIEF_MAX_RETRIES", get("BRIEF_MAX_RETRIES"), 3u32)?;
        let base_secs = parse("BRIEF_RETRY_BASE_SECS", get("BRIEF_RETRY_BASE_SECS"), 60u64)?;
        let max_secs = parse("BRIEF_RETRY_MAX_SECS", get("BRIEF_RETRY_MAX_SECS"), 3600u64)?;
        if max_secs < base_secs {
            return Err(ConfigError::Invalid {
                var: "BRIEF_RETRY_MAX_SECS",
                value: max_secs.to_string(),
                reason: format!("must be at least BRIEF_RETRY_BASE_SECS ({base_secs})"),
            });
        }

        let jitter = parse("BRIEF_RETRY_JITTER", get("BRIEF_RETRY_JITTER"), 0.0f64)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::Invalid {
                var: "BRIEF_RETRY_JITTER",
                value: jitter.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        let bitrate = parse(
            "BRIEF_AUDIO_BITRATE_KBPS",
            get("BRIEF_AUDIO_BITRATE_KBPS"),
            defaults.audio_bitrate_kbps,
        )?;
        if bitrate == 0 {
            return Err(ConfigError::Invalid {
                var: "BRIEF_AUDIO_BITRATE_KBPS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let config = Self {
            bind_addr: parse("BIND_ADDR", get("BIND_ADDR"), defaults.bind_addr)?,
            use_persistent_stores: parse(
                "USE_PERSISTENT_STORES",
                get("USE_PERSISTENT_STORES"),
                false,
            )?,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            retry_policy: RetryPolicy::exponential(
                max_retries,
                Duration::from_secs(base_secs),
                Duration::from_secs(max_secs),
            )
            .with_jitter(jitter),
            estimated_seconds_per_job: parse(
                "BRIEF_ESTIMATED_SECS_PER_JOB",
                get("BRIEF_ESTIMATED_SECS_PER_JOB"),
                defaults.estimated_seconds_per_job,
            )?,
            audio_bitrate_kbps: bitrate,
            audio_dir: get("BRIEF_AUDIO_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.audio_dir),
            public_base_url: get("BRIEF_PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            worker_poll_interval: Duration::from_millis(parse(
                "BRIEF_WORKER_POLL_MS",
                get("BRIEF_WORKER_POLL_MS"),
                500u64,
            )?),
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),
            admin_token: get("BRIEF_ADMIN_TOKEN"),
        };

        if config.use_persistent_stores && config.database_url.is_none() {
            return Err(ConfigError::Missing(
                "DATABASE_URL",
                "USE_PERSISTENT_STORES=true",
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<BriefsConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BriefsConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(from_pairs(&[]).unwrap(), BriefsConfig::default());
    }

    #[test]
    fn retry_settings_are_configurable() {
        let config = from_pairs(&[
            ("BRIEF_MAX_RETRIES", "5"),
            ("BRIEF_RETRY_BASE_SECS", "10"),
            ("BRIEF_RETRY_MAX_SECS", "30"),
        ])
        .unwrap();

        assert_eq!(config.retry_policy.max_retries, 5);
        assert_eq!(config.retry_policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.retry_policy.delay_for_attempt(3), Duration::from_secs(30));
    }

    #[test]
    fn retry_jitter_is_read_and_range_checked() {
        let config = from_pairs(&[("BRIEF_RETRY_JITTER", "0.2")]).unwrap();
        assert_eq!(config.retry_policy.jitter, 0.2);

        let err = from_pairs(&[("BRIEF_RETRY_JITTER", "1.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BRIEF_RETRY_JITTER", .. }));
    }

    #[test]
    fn admin_token_is_optional() {
        assert!(from_pairs(&[]).unwrap().admin_token.is_none());
        let config = from_pairs(&[("BRIEF_ADMIN_TOKEN", "s3cret")]).unwrap();
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = from_pairs(&[("BRIEF_MAX_RETRIES", "three")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BRIEF_MAX_RETRIES", .. }));
    }

    #[test]
    fn persistent_mode_requires_database_url() {
        let err = from_pairs(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL", "USE_PERSISTENT_STORES=true"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = from_pairs(&[("NOTIFY_WEBHOOK_URL", "  "), ("BIND_ADDR", "")]).unwrap();
        assert!(config.notify_webhook_url.is_none());
        assert_eq!(config.bind_addr, BriefsConfig::default().bind_addr);
    }
}
