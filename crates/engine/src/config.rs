use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use marksync_storage::DEFAULT_COLLECTION;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote collection holding the bookmarks.
    pub collection: String,
    /// Capacity of the dispatch queue between handles and the controller.
    pub command_queue: usize,
    pub feed: FeedConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub channel_capacity: usize,
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub token_ttl_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            command_queue: 64,
            feed: FeedConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            resubscribe_attempts: 5,
            resubscribe_backoff_ms: 250,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_ttl_ms: 60 * 60 * 1000,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, SyncError> {
        toml::from_str(contents).map_err(|e| SyncError::Config(format!("failed to parse config: {e}")))
    }

    /// Read a TOML file, then apply `MARKSYNC_*` environment overrides.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| {
                SyncError::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            let config = Self::from_toml_str(&contents)?;
            tracing::debug!(path = %path.display(), "loaded sync config");
            config
        } else {
            tracing::debug!(path = %path.display(), "sync config not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, SyncError> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Config(format!("failed to render config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Invalid values are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, mut lookup: F)
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("MARKSYNC_COLLECTION") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.collection = trimmed.to_string();
            }
        }
        override_parsed(&mut lookup, "MARKSYNC_COMMAND_QUEUE", &mut self.command_queue);
        override_parsed(
            &mut lookup,
            "MARKSYNC_FEED_CHANNEL_CAPACITY",
            &mut self.feed.channel_capacity,
        );
        override_parsed(
            &mut lookup,
            "MARKSYNC_FEED_RESUBSCRIBE_ATTEMPTS",
            &mut self.feed.resubscribe_attempts,
        );
        override_parsed(
            &mut lookup,
            "MARKSYNC_FEED_RESUBSCRIBE_BACKOFF_MS",
            &mut self.feed.resubscribe_backoff_ms,
        );
        override_parsed(
            &mut lookup,
            "MARKSYNC_SESSION_TOKEN_TTL_MS",
            &mut self.session.token_ttl_ms,
        );
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.feed.resubscribe_backoff_ms)
    }
}

fn override_parsed<F, T>(lookup: &mut F, key: &str, target: &mut T)
where
    F: FnMut(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    match trimmed.parse::<T>() {
        Ok(value) => *target = value,
        Err(err) => tracing::warn!("invalid {key}, ignoring: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            collection = "links"

            [feed]
            resubscribe_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.collection, "links");
        assert_eq!(config.feed.resubscribe_attempts, 2);
        assert_eq!(config.feed.channel_capacity, FeedConfig::default().channel_capacity);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = SyncConfig::from_toml_str("feed = 3").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MARKSYNC_COLLECTION", " saved "),
            ("MARKSYNC_FEED_RESUBSCRIBE_BACKOFF_MS", "10"),
            ("MARKSYNC_COMMAND_QUEUE", "not-a-number"),
        ]);
        let mut config = SyncConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.collection, "saved");
        assert_eq!(config.resubscribe_backoff(), Duration::from_millis(10));
        assert_eq!(config.command_queue, SyncConfig::default().command_queue);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.feed, FeedConfig::default());
    }

    #[test]
    fn written_config_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marksync.toml");
        let mut config = SyncConfig::default();
        config.feed.resubscribe_attempts = 9;
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = SyncConfig::from_toml_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, config);
    }
}
