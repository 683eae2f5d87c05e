//! Environment-driven configuration structures shared by all binaries.

use std::{collections::HashSet, env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::model::{EventKind, InitialCursor};

/// Horizon caps operation pages at 200 records.
pub const MAX_BATCH_SIZE: u32 = 200;

/// What the dispatcher does with an event that a consumer still rejects after
/// its retry budget is spent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryPolicy {
    /// The cursor stays before the event until every consumer acknowledges it.
    #[default]
    RequireAck,
    /// The failure is recorded and the event counts as processed.
    SkipAfterBudget,
}

/// Tuning knobs of the monitor loop. Durations are derived from the
/// millisecond/second fields recognised in the environment contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub initial_cursor: InitialCursor,
    pub dedup_ttl: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    pub consumer_timeout: Duration,
    pub consumer_retries: u32,
    pub batch_size: u32,
    pub cycle_timeout: Duration,
    pub delivery_policy: DeliveryPolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5_000),
            initial_cursor: InitialCursor::Now,
            dedup_ttl: Duration::from_secs(86_400),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(60_000),
            max_retries: 10,
            consumer_timeout: Duration::from_millis(5_000),
            consumer_retries: 2,
            batch_size: MAX_BATCH_SIZE,
            cycle_timeout: Duration::from_millis(120_000),
            delivery_policy: DeliveryPolicy::RequireAck,
        }
    }
}

impl MonitorSettings {
    /// Reads the `MONITOR_*` variables, falling back to defaults for anything
    /// unset, then validates the combination.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            poll_interval: millis_var("MONITOR_POLL_INTERVAL_MS", defaults.poll_interval)?,
            initial_cursor: parsed_var("MONITOR_INITIAL_CURSOR", defaults.initial_cursor)?,
            dedup_ttl: Duration::from_secs(int_var(
                "MONITOR_DEDUP_TTL_SECONDS",
                defaults.dedup_ttl.as_secs(),
            )?),
            min_backoff: millis_var("MONITOR_MIN_BACKOFF_MS", defaults.min_backoff)?,
            max_backoff: millis_var("MONITOR_MAX_BACKOFF_MS", defaults.max_backoff)?,
            max_retries: int_var("MONITOR_MAX_RETRIES", defaults.max_retries)?,
            consumer_timeout: millis_var("MONITOR_CONSUMER_TIMEOUT_MS", defaults.consumer_timeout)?,
            consumer_retries: int_var("MONITOR_CONSUMER_RETRIES", defaults.consumer_retries)?,
            batch_size: int_var("MONITOR_BATCH_SIZE", defaults.batch_size)?,
            cycle_timeout: millis_var("MONITOR_CYCLE_TIMEOUT_MS", defaults.cycle_timeout)?,
            delivery_policy: parsed_var("MONITOR_DELIVERY_POLICY", defaults.delivery_policy)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Longest window over which an already-fetched event may be fetched
    /// again because of fetch retries.
    pub fn retry_window(&self) -> Duration {
        self.max_backoff.saturating_mul(self.max_retries.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_BATCH_SIZE",
                reason: format!("must be within 1..={MAX_BATCH_SIZE}"),
            });
        }
        if self.min_backoff.is_zero() || self.min_backoff > self.max_backoff {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_MIN_BACKOFF_MS",
                reason: "must be positive and not exceed MONITOR_MAX_BACKOFF_MS".into(),
            });
        }
        if self.consumer_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_CONSUMER_TIMEOUT_MS",
                reason: "must be positive".into(),
            });
        }
        if self.dedup_ttl <= self.retry_window() {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_DEDUP_TTL_SECONDS",
                reason: format!(
                    "must exceed the retry window of {}s (max backoff x max retries)",
                    self.retry_window().as_secs()
                ),
            });
        }
        Ok(())
    }
}

/// Optional HTTP consumer forwarding events to another service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    url: String,
    kinds: HashSet<EventKind>,
    accounts: HashSet<String>,
}

impl WebhookConfig {
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(url) = get_optional_var("MONITOR_WEBHOOK_URL") else {
            return Ok(None);
        };
        let kinds = get_optional_var("MONITOR_WEBHOOK_KINDS")
            .map(|raw| parse_list::<EventKind>("MONITOR_WEBHOOK_KINDS", &raw))
            .transpose()?
            .unwrap_or_default();
        let accounts = get_optional_var("MONITOR_WATCH_ACCOUNTS")
            .map(|raw| parse_list::<String>("MONITOR_WATCH_ACCOUNTS", &raw))
            .transpose()?
            .unwrap_or_default();
        Ok(Some(Self {
            url,
            kinds,
            accounts,
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Empty means every kind.
    pub fn kinds(&self) -> &HashSet<EventKind> {
        &self.kinds
    }

    /// Empty means every account.
    pub fn accounts(&self) -> &HashSet<String> {
        &self.accounts
    }
}

/// Key configuration derived from `.env`/process variables so binaries can
/// share a deterministic environment contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    database_url: String,
    horizon_url: String,
    settings: MonitorSettings,
    webhook: Option<WebhookConfig>,
    resync_cursor: Option<InitialCursor>,
}

impl BootstrapConfig {
    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// required process variables. Missing or malformed entries surface as
    /// `ConfigError` so binaries can respond gracefully.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            horizon_url: get_required_var("STELLAR_HORIZON_URL")?,
            settings: MonitorSettings::from_env()?,
            webhook: WebhookConfig::from_env()?,
            resync_cursor: optional_parsed_var("MONITOR_RESYNC_CURSOR")?,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn horizon_url(&self) -> &str {
        &self.horizon_url
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn webhook(&self) -> Option<&WebhookConfig> {
        self.webhook.as_ref()
    }

    /// `MONITOR_RESYNC_CURSOR`: a cursor the standalone monitor resets to
    /// before its first cycle. Applied on every start while set, so unset it
    /// once the monitor is past the bad position.
    pub fn resync_cursor(&self) -> Option<InitialCursor> {
        self.resync_cursor
    }
}

/// Status-server configuration for the co-located API binary. Either a TCP
/// address or a unix socket path must be given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusConfig {
    bind_address: Option<String>,
    unix_socket: Option<String>,
}

impl StatusConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let bind_address = get_optional_var("STATUS_BIND_ADDRESS");
        let unix_socket = get_optional_var("STATUS_UNIX_SOCKET");
        if bind_address.is_none() && unix_socket.is_none() {
            return Err(ConfigError::MissingVar {
                key: "STATUS_BIND_ADDRESS",
            });
        }

        Ok(Self {
            bind_address,
            unix_socket,
        })
    }

    pub fn bind_address(&self) -> Option<&str> {
        self.bind_address.as_deref()
    }

    pub fn unix_socket(&self) -> Option<&str> {
        self.unix_socket.as_deref()
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(ConfigError::MissingVar { key })
            } else {
                Ok(trimmed.to_string())
            }
        }
        Err(_) => Err(ConfigError::MissingVar { key }),
    }
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn int_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match get_optional_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

fn millis_var(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    int_var(key, default_ms).map(Duration::from_millis)
}

fn parsed_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_optional_var(key) {
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn optional_parsed_var<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_optional_var(key)
        .map(|raw| {
            raw.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
                key,
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn parse_list<T>(key: &'static str, raw: &str) -> Result<HashSet<T>, ConfigError>
where
    T: FromStr + Eq + std::hash::Hash,
    T::Err: std::fmt::Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
                key,
                reason: format!("`{item}`: {err}"),
            })
        })
        .collect()
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("STELLAR_MONITOR_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid value in `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}
