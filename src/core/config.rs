use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Months, Utc};

use super::fetchable::Serie;

const ENV_PREFIX: &str = "LINKFETCH_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Bounds on how many links a feed keeps, applied while merging entries and
/// again by the cleaner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedRetention {
    pub keep_maximum: Option<usize>,
    pub keep_period_months: Option<u32>,
    pub keep_minimum: usize,
}

impl FeedRetention {
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = self.keep_period_months?;
        now.checked_sub_months(Months::new(months))
    }

    /// Whether the link ranked `rank` (0 = newest) and published at
    /// `published` survives. The maximum is a hard ceiling; the minimum only
    /// overrides the age cut.
    pub fn retains(&self, rank: usize, published: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if let Some(maximum) = self.keep_maximum {
            if rank >= maximum {
                return false;
            }
        }
        if rank < self.keep_minimum {
            return true;
        }
        match self.cutoff(now) {
            Some(cutoff) => published >= cutoff,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub cache_max_age: chrono::Duration,
    pub fetch_logs_max_age: chrono::Duration,
    pub unvalidated_users_max_age_months: u32,
    pub orphans_max_age: chrono::Duration,
    pub feeds: FeedRetention,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            cache_max_age: chrono::Duration::days(7),
            fetch_logs_max_age: chrono::Duration::days(3),
            unvalidated_users_max_age_months: 6,
            orphans_max_age: chrono::Duration::days(7),
            feeds: FeedRetention::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub cache_path: PathBuf,
    pub user_agent: String,
    pub fetch_timeout: Duration,
    pub server_ips: Vec<String>,
    pub support_email: String,
    pub demo: bool,
    pub batch_size: usize,
    pub serie: Option<Serie>,
    pub tick_interval: Duration,
    pub feed_refresh_interval: chrono::Duration,
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/linkfetch.db?mode=rwc".to_string(),
            cache_path: PathBuf::from("cache"),
            user_agent: format!("linkfetch/{}", env!("CARGO_PKG_VERSION")),
            fetch_timeout: Duration::from_secs(5),
            server_ips: Vec::new(),
            support_email: "support@localhost".to_string(),
            demo: false,
            batch_size: 25,
            serie: None,
            tick_interval: Duration::from_secs(15),
            feed_refresh_interval: chrono::Duration::minutes(60),
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let serie = match get("SERIE") {
            Some(value) => Some(Serie::parse(&value).ok_or_else(|| invalid("SERIE", &value))?),
            None => None,
        };
        let server_ips = get("SERVER_IPS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let keep_maximum: usize = parse_or("FEEDS_LINKS_KEEP_MAXIMUM", get("FEEDS_LINKS_KEEP_MAXIMUM"), 0)?;
        let keep_period: u32 = parse_or("FEEDS_LINKS_KEEP_PERIOD", get("FEEDS_LINKS_KEEP_PERIOD"), 0)?;
        let keep_minimum: usize = parse_or("FEEDS_LINKS_KEEP_MINIMUM", get("FEEDS_LINKS_KEEP_MINIMUM"), 0)?;

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            cache_path: get("CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            user_agent: get("USER_AGENT").unwrap_or(defaults.user_agent),
            fetch_timeout: Duration::from_secs(parse_or(
                "FETCH_TIMEOUT_SECS",
                get("FETCH_TIMEOUT_SECS"),
                defaults.fetch_timeout.as_secs(),
            )?),
            server_ips,
            support_email: get("SUPPORT_EMAIL").unwrap_or(defaults.support_email),
            demo: parse_bool("DEMO", get("DEMO"))?,
            batch_size: parse_or("BATCH_SIZE", get("BATCH_SIZE"), defaults.batch_size)?,
            serie,
            tick_interval: Duration::from_secs(parse_or(
                "TICK_SECS",
                get("TICK_SECS"),
                defaults.tick_interval.as_secs(),
            )?),
            feed_refresh_interval: chrono::Duration::minutes(parse_or(
                "FEED_REFRESH_MINUTES",
                get("FEED_REFRESH_MINUTES"),
                defaults.feed_refresh_interval.num_minutes(),
            )?),
            retention: RetentionPolicy {
                feeds: FeedRetention {
                    keep_maximum: (keep_maximum > 0).then_some(keep_maximum),
                    keep_period_months: (keep_period > 0).then_some(keep_period),
                    keep_minimum,
                },
                ..defaults.retention
            },
        })
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
    }
}

fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw.parse().map_err(|_| invalid(name, &raw)),
        None => Ok(default),
    }
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => Err(invalid(name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = EngineConfig::from_lookup(|_| None).expect("defaults should load");
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_size, 25);
        assert!(config.serie.is_none());
        assert!(!config.demo);
        assert_eq!(config.retention.feeds, FeedRetention::default());
        assert_eq!(config.retention.cache_max_age, chrono::Duration::days(7));
    }

    #[test]
    fn reads_prefixed_variables() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("LINKFETCH_SERIE", "2/4"),
            ("LINKFETCH_SERVER_IPS", "10.0.0.1, 10.0.0.2,"),
            ("LINKFETCH_DEMO", "true"),
            ("LINKFETCH_FEEDS_LINKS_KEEP_MAXIMUM", "50"),
            ("LINKFETCH_FEEDS_LINKS_KEEP_PERIOD", "6"),
            ("LINKFETCH_FEEDS_LINKS_KEEP_MINIMUM", "10"),
        ]))
        .expect("config should load");

        assert_eq!(config.serie, Serie::new(2, 4));
        assert_eq!(config.server_ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(config.demo);
        assert_eq!(
            config.retention.feeds,
            FeedRetention {
                keep_maximum: Some(50),
                keep_period_months: Some(6),
                keep_minimum: 10,
            }
        );
    }

    #[test]
    fn rejects_malformed_values() {
        let error = EngineConfig::from_lookup(lookup_from(&[("LINKFETCH_BATCH_SIZE", "many")]))
            .expect_err("batch size must be numeric");
        assert!(error.to_string().contains("LINKFETCH_BATCH_SIZE"));

        assert!(EngineConfig::from_lookup(lookup_from(&[("LINKFETCH_SERIE", "5/2")])).is_err());
    }

    #[test]
    fn maximum_is_a_ceiling_over_the_minimum_floor() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(400);
        let retention = FeedRetention {
            keep_maximum: Some(2),
            keep_period_months: Some(1),
            keep_minimum: 5,
        };

        assert!(retention.retains(0, old, now));
        assert!(retention.retains(1, old, now));
        assert!(!retention.retains(2, now, now));
    }

    #[test]
    fn minimum_keeps_old_links_that_the_period_would_drop() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(400);
        let retention = FeedRetention {
            keep_maximum: None,
            keep_period_months: Some(1),
            keep_minimum: 2,
        };

        assert!(retention.retains(1, old, now));
        assert!(!retention.retains(2, old, now));
        assert!(retention.retains(2, now, now));
    }
}
