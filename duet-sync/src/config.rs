//! Timing constants and limits for the synchronization core.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SyncError, SyncResult};

/// Default debounce window for batching local changes and queued operations (ms).
const DEFAULT_BATCH_WINDOW_MS: u64 = 50;
/// Default lifetime of the per-element ignore markers after a remote application (ms).
const DEFAULT_REMOTE_IGNORE_MS: u64 = 100;
/// Default self-clear delay of the re-entrancy guard (ms).
const DEFAULT_PENDING_CLEAR_MS: u64 = 1_000;
/// Default bound of the change history.
const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Default movement/resize threshold below which a visual change is noise.
const DEFAULT_VISUAL_THRESHOLD: f64 = 1.0;
/// Default synchronization queue cap.
const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default number of failures after which a queued operation is dropped.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay before a failed queue entry is retried (ms).
const DEFAULT_RETRY_DELAY_MS: u64 = 50;
/// Default delay before retrying an edge whose endpoint has not arrived (ms).
const DEFAULT_EDGE_RETRY_MS: u64 = 150;
/// Default consistency audit interval (ms).
const DEFAULT_AUDIT_INTERVAL_MS: u64 = 5_000;
/// Default cumulative issue budget before a full recovery.
const DEFAULT_ISSUE_BUDGET: usize = 10;
/// Default delay of the re-audit that follows a full recovery (ms).
const DEFAULT_REAUDIT_DELAY_MS: u64 = 1_000;

/// Configuration of every component of a collaboration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Debounce window for local change batching and queue processing (ms).
    pub batch_window_ms: u64,
    /// How long elements stay marked after a remote application (ms).
    pub remote_ignore_ms: u64,
    /// Self-clear delay of the tracker's re-entrancy guard (ms).
    pub pending_clear_ms: u64,
    /// Maximum number of change history records.
    pub history_limit: usize,
    /// Minimum geometry delta counted as a visual change.
    pub visual_threshold: f64,
    /// Maximum number of queued operations.
    pub queue_capacity: usize,
    /// Failures after which a queued operation is dropped.
    pub max_retries: u32,
    /// Delay before a failed queue entry is retried (ms).
    pub retry_delay_ms: u64,
    /// Delay before retrying an edge with a missing endpoint (ms).
    pub edge_retry_ms: u64,
    /// Consistency audit interval (ms).
    pub audit_interval_ms: u64,
    /// Cumulative issues tolerated before a full recovery.
    pub issue_budget: usize,
    /// Delay of the re-audit following a full recovery (ms).
    pub reaudit_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: DEFAULT_BATCH_WINDOW_MS,
            remote_ignore_ms: DEFAULT_REMOTE_IGNORE_MS,
            pending_clear_ms: DEFAULT_PENDING_CLEAR_MS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            visual_threshold: DEFAULT_VISUAL_THRESHOLD,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            edge_retry_ms: DEFAULT_EDGE_RETRY_MS,
            audit_interval_ms: DEFAULT_AUDIT_INTERVAL_MS,
            issue_budget: DEFAULT_ISSUE_BUDGET,
            reaudit_delay_ms: DEFAULT_REAUDIT_DELAY_MS,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    /// Create a configuration from environment variables or defaults.
    ///
    /// Environment variables:
    /// - `DUET_BATCH_WINDOW_MS` (default: 50)
    /// - `DUET_REMOTE_IGNORE_MS` (default: 100)
    /// - `DUET_PENDING_CLEAR_MS` (default: 1000)
    /// - `DUET_HISTORY_LIMIT` (default: 50)
    /// - `DUET_VISUAL_THRESHOLD` (default: 1.0)
    /// - `DUET_QUEUE_CAPACITY` (default: 100)
    /// - `DUET_MAX_RETRIES` (default: 3)
    /// - `DUET_RETRY_DELAY_MS` (default: 50)
    /// - `DUET_EDGE_RETRY_MS` (default: 150)
    /// - `DUET_AUDIT_INTERVAL_MS` (default: 5000)
    /// - `DUET_ISSUE_BUDGET` (default: 10)
    /// - `DUET_REAUDIT_DELAY_MS` (default: 1000)
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            batch_window_ms: env_or("DUET_BATCH_WINDOW_MS", d.batch_window_ms),
            remote_ignore_ms: env_or("DUET_REMOTE_IGNORE_MS", d.remote_ignore_ms),
            pending_clear_ms: env_or("DUET_PENDING_CLEAR_MS", d.pending_clear_ms),
            history_limit: env_or("DUET_HISTORY_LIMIT", d.history_limit),
            visual_threshold: env_or("DUET_VISUAL_THRESHOLD", d.visual_threshold),
            queue_capacity: env_or("DUET_QUEUE_CAPACITY", d.queue_capacity),
            max_retries: env_or("DUET_MAX_RETRIES", d.max_retries),
            retry_delay_ms: env_or("DUET_RETRY_DELAY_MS", d.retry_delay_ms),
            edge_retry_ms: env_or("DUET_EDGE_RETRY_MS", d.edge_retry_ms),
            audit_interval_ms: env_or("DUET_AUDIT_INTERVAL_MS", d.audit_interval_ms),
            issue_budget: env_or("DUET_ISSUE_BUDGET", d.issue_budget),
            reaudit_delay_ms: env_or("DUET_REAUDIT_DELAY_MS", d.reaudit_delay_ms),
        }
    }

    /// Load a configuration from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the values
    /// fail [`SyncConfig::validate`].
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidPayload(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safety bound.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidPayload`] naming the offending field.
    pub fn validate(&self) -> SyncResult<()> {
        if self.queue_capacity == 0 {
            return Err(SyncError::InvalidPayload("queue_capacity must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(SyncError::InvalidPayload("max_retries must be > 0".into()));
        }
        if self.audit_interval_ms == 0 {
            return Err(SyncError::InvalidPayload("audit_interval_ms must be > 0".into()));
        }
        if !self.visual_threshold.is_finite() || self.visual_threshold < 0.0 {
            return Err(SyncError::InvalidPayload(
                "visual_threshold must be a non-negative number".into(),
            ));
        }
        Ok(())
    }

    /// Debounce window as a duration.
    #[must_use]
    pub const fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Remote ignore marker lifetime as a duration.
    #[must_use]
    pub const fn remote_ignore(&self) -> Duration {
        Duration::from_millis(self.remote_ignore_ms)
    }

    /// Re-entrancy guard self-clear delay as a duration.
    #[must_use]
    pub const fn pending_clear(&self) -> Duration {
        Duration::from_millis(self.pending_clear_ms)
    }

    /// Queue retry delay as a duration.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Edge endpoint retry delay as a duration.
    #[must_use]
    pub const fn edge_retry(&self) -> Duration {
        Duration::from_millis(self.edge_retry_ms)
    }

    /// Audit interval as a duration.
    #[must_use]
    pub const fn audit_interval(&self) -> Duration {
        Duration::from_millis(self.audit_interval_ms)
    }

    /// Post-recovery re-audit delay as a duration.
    #[must_use]
    pub const fn reaudit_delay(&self) -> Duration {
        Duration::from_millis(self.reaudit_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_window(), Duration::from_millis(50));
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.issue_budget, 10);
        assert_eq!(config.audit_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"queue_capacity": 20, "edge_retry_ms": 300}}"#).expect("write");

        let config = SyncConfig::from_json_file(file.path()).expect("load");
        assert_eq!(config.queue_capacity, 20);
        assert_eq!(config.edge_retry_ms, 300);
        assert_eq!(config.batch_window_ms, 50);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"queue_capacity": 0}}"#).expect("write");
        let err = SyncConfig::from_json_file(file.path()).expect_err("invalid");
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(SyncConfig::from_json_file("/definitely/not/here.json").is_err());
    }
}
