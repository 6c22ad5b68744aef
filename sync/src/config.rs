//! Configuration for the sync runtime.

use drift_engine::{ConflictStrategy, RetryPolicy};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Backoff for re-establishing the change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identifies this replica in persisted snapshots
    pub node_id: String,
    /// Records requested per base sync page
    pub page_size: usize,
    /// Backoff for failed mutation sends
    pub retry: RetryPolicy,
    /// Backoff for the change subscription
    pub reconnect: ReconnectPolicy,
    /// How long `stop()` waits before aborting the runtime
    pub stop_grace: Duration,
    /// Age after which tombstones are purged
    pub tombstone_retention: Duration,
    /// Conflict strategy
    pub strategy: ConflictStrategy,
    /// Snapshot file for `FileStorage`
    pub store_path: Option<PathBuf>,
    /// Journaled commits between two full snapshots
    pub checkpoint_every: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            page_size: 100,
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            stop_grace: Duration::from_secs(5),
            tombstone_retention: Duration::from_secs(7 * 24 * 60 * 60),
            strategy: ConflictStrategy::default(),
            store_path: None,
            checkpoint_every: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_checkpoint_every(mut self, commits: usize) -> Self {
        self.checkpoint_every = commits.max(1);
        self
    }

    /// Load configuration from `DRIFT_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(node_id) = lookup("DRIFT_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(page_size) = parse(&lookup, "DRIFT_PAGE_SIZE")? {
            config = config.with_page_size(page_size);
        }
        if let Some(max_attempts) = parse(&lookup, "DRIFT_MAX_ATTEMPTS")? {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(initial) = parse(&lookup, "DRIFT_RETRY_INITIAL_MS")? {
            config.retry.initial_delay_ms = initial;
        }
        if let Some(max) = parse(&lookup, "DRIFT_RETRY_MAX_MS")? {
            config.retry.max_delay_ms = max;
        }
        if let Some(grace) = parse(&lookup, "DRIFT_STOP_GRACE_MS")? {
            config.stop_grace = Duration::from_millis(grace);
        }
        if let Some(secs) = parse(&lookup, "DRIFT_TOMBSTONE_RETENTION_SECS")? {
            config.tombstone_retention = Duration::from_secs(secs);
        }
        if let Some(strategy) = lookup("DRIFT_CONFLICT_STRATEGY") {
            config.strategy = match strategy.as_str() {
                "remote_wins" => ConflictStrategy::RemoteWins,
                "local_wins" => ConflictStrategy::LocalWins,
                _ => return Err(ConfigError::UnknownStrategy(strategy)),
            };
        }
        if let Some(path) = lookup("DRIFT_STORE_PATH") {
            config.store_path = Some(PathBuf::from(path));
        }
        if let Some(commits) = parse(&lookup, "DRIFT_CHECKPOINT_EVERY")? {
            config = config.with_checkpoint_every(commits);
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value })
        })
        .transpose()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("unknown conflict strategy {0:?} (expected remote_wins or local_wins)")]
    UnknownStrategy(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(matches!(config.strategy, ConflictStrategy::RemoteWins));
        assert!(config.store_path.is_none());
    }

    #[test]
    fn reads_every_variable() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("DRIFT_NODE_ID", "device-7"),
            ("DRIFT_PAGE_SIZE", "250"),
            ("DRIFT_MAX_ATTEMPTS", "3"),
            ("DRIFT_RETRY_INITIAL_MS", "10"),
            ("DRIFT_RETRY_MAX_MS", "80"),
            ("DRIFT_STOP_GRACE_MS", "1500"),
            ("DRIFT_TOMBSTONE_RETENTION_SECS", "60"),
            ("DRIFT_CONFLICT_STRATEGY", "local_wins"),
            ("DRIFT_STORE_PATH", "/tmp/drift.json"),
            ("DRIFT_CHECKPOINT_EVERY", "0"),
        ]))
        .unwrap();

        assert_eq!(config.node_id, "device-7");
        assert_eq!(config.page_size, 250);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 10);
        assert_eq!(config.retry.max_delay_ms, 80);
        assert_eq!(config.stop_grace, Duration::from_millis(1500));
        assert_eq!(config.tombstone_retention, Duration::from_secs(60));
        assert!(matches!(config.strategy, ConflictStrategy::LocalWins));
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/drift.json")));
        assert_eq!(config.checkpoint_every, 1);
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = SyncConfig::from_lookup(lookup(&[("DRIFT_PAGE_SIZE", "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "DRIFT_PAGE_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let err =
            SyncConfig::from_lookup(lookup(&[("DRIFT_CONFLICT_STRATEGY", "coin_flip")])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStrategy(_)));
    }

    #[test]
    fn reconnect_backoff_is_capped() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 3,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(200), Duration::from_secs(1));
    }

    #[test]
    fn page_size_never_zero() {
        assert_eq!(SyncConfig::new().with_page_size(0).page_size, 1);
    }
}
