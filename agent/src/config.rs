//! Configuration management for the agent.

use crate::sync::SyncConfig;
use chrono::FixedOffset;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tally_engine::{MergeStrategy, Resolution, UserId, DEFAULT_USERS};
use tracing_subscriber::EnvFilter;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the realtime database (`https://<db>.firebaseio.com`)
    pub remote_url: String,
    /// Path of the shared document below the database root
    pub remote_root: String,
    /// Access token sent as the `auth` query parameter
    pub remote_auth: Option<String>,
    /// Timeout for every remote operation
    pub remote_timeout: Duration,
    pub users: Vec<UserId>,
    /// Time zone used to decide what "today" is
    pub utc_offset: FixedOffset,
    pub debounce: Duration,
    /// Periodic sync interval, `None` when disabled
    pub auto_sync: Option<Duration>,
    /// Answer to conflict prompts in unattended runs
    pub conflict_policy: Resolution,
    /// File backing the local replica
    pub state_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let remote_url = env::var("TALLY_REMOTE_URL").map_err(|_| ConfigError::MissingRemoteUrl)?;
        let remote_root =
            env::var("TALLY_REMOTE_ROOT").unwrap_or_else(|_| "pointSystemV3".to_string());
        let remote_auth = env::var("TALLY_REMOTE_AUTH").ok().filter(|s| !s.is_empty());

        let remote_timeout = Duration::from_secs(parse_var("TALLY_REMOTE_TIMEOUT_SECS", 10)?);

        let users = match env::var("TALLY_USERS") {
            Ok(list) => parse_users(&list)?,
            Err(_) => DEFAULT_USERS.iter().map(|u| u.to_string()).collect(),
        };

        let offset_hours: i32 = parse_var("TALLY_UTC_OFFSET_HOURS", 8)?;
        let utc_offset = FixedOffset::east_opt(offset_hours * 3600).ok_or(ConfigError::Invalid {
            name: "TALLY_UTC_OFFSET_HOURS",
            value: offset_hours.to_string(),
        })?;

        let debounce = Duration::from_millis(parse_var("TALLY_DEBOUNCE_MS", 1000)?);
        let auto_sync = match parse_var("TALLY_AUTO_SYNC_SECS", 30u64)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let conflict_policy = match env::var("TALLY_CONFLICT_POLICY") {
            Ok(policy) => parse_policy(&policy)?,
            Err(_) => Resolution::Merge,
        };

        let state_path = env::var("TALLY_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tally-state.json"));

        Ok(Self {
            remote_url,
            remote_root,
            remote_auth,
            remote_timeout,
            users,
            utc_offset,
            debounce,
            auto_sync,
            conflict_policy,
            state_path,
        })
    }

    /// Coordinator settings derived from this configuration.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            debounce: self.debounce,
            remote_timeout: self.remote_timeout,
            auto_sync: self.auto_sync,
            strategy: MergeStrategy::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

fn parse_users(list: &str) -> Result<Vec<UserId>, ConfigError> {
    let users: Vec<UserId> = list
        .split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect();
    if users.is_empty() {
        return Err(ConfigError::Invalid {
            name: "TALLY_USERS",
            value: list.to_string(),
        });
    }
    Ok(users)
}

/// Log filter from `RUST_LOG`, or `default` when unset or unparsable.
///
/// Call after `dotenvy::dotenv()` so a `RUST_LOG` from `.env` is seen.
pub fn log_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Parse a conflict policy name.
pub fn parse_policy(policy: &str) -> Result<Resolution, ConfigError> {
    match policy.trim() {
        "merge" => Ok(Resolution::Merge),
        "keep-local" => Ok(Resolution::KeepLocal),
        "keep-remote" => Ok(Resolution::KeepRemote),
        "cancel" => Ok(Resolution::Cancel),
        other => Err(ConfigError::Invalid {
            name: "TALLY_CONFLICT_POLICY",
            value: other.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TALLY_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,

    #[error("Invalid {name} value: {value}")]
    Invalid { name: &'static str, value: String },
}
