//! Runtime configuration
//!
//! Defines the tunables shared by the launcher, the executor and monitors:
//! where records live, how long `stop` waits before escalating, and how
//! long finished jobs are retained.

use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::paths::RuntimePaths;

/// How the Change Watcher learns about state file changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// Filesystem notifications, degrading to polling when unavailable
    #[default]
    Auto,
    /// Fixed-interval polling only
    Poll,
}

impl FromStr for WatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "notify" => Ok(Self::Auto),
            "poll" => Ok(Self::Poll),
            other => Err(Error::Invalid(format!("unknown watch mode {other:?}"))),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub paths: RuntimePaths,

    /// Grace period between SIGTERM and SIGKILL when stopping a job
    pub stop_timeout: Duration,

    /// How long terminal job states are kept before `cleanup` prunes them
    pub retention: Duration,

    /// Time since the last state update before a job can be declared orphaned
    pub orphan_grace: Duration,

    pub watch_mode: WatchMode,

    /// Change Watcher debounce window
    pub debounce: Duration,

    /// Change Watcher polling interval in polling mode
    pub poll_interval: Duration,
}

impl RuntimeConfig {
    pub fn new(paths: RuntimePaths) -> Self {
        Self {
            paths,
            stop_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 60 * 60),
            orphan_grace: Duration::from_secs(10),
            watch_mode: WatchMode::Auto,
            debounce: Duration::from_millis(100),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - DETACH_DATA_DIR / DETACH_PID_DIR / DETACH_STATE_DIR / DETACH_LOG_DIR
    /// - DETACH_STOP_TIMEOUT (seconds, default: 30)
    /// - DETACH_RETENTION_HOURS (default: 24)
    /// - DETACH_ORPHAN_GRACE (seconds, default: 10)
    /// - DETACH_WATCH_MODE (auto | poll, default: auto)
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::new(RuntimePaths::from_vars(&lookup));

        let seconds = |key: &str| -> Result<Option<u64>, Error> {
            lookup(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| Error::Invalid(format!("{key}={raw:?}: {e}")))
                })
                .transpose()
        };

        if let Some(secs) = seconds("DETACH_STOP_TIMEOUT")? {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(hours) = seconds("DETACH_RETENTION_HOURS")? {
            config.retention = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(secs) = seconds("DETACH_ORPHAN_GRACE")? {
            config.orphan_grace = Duration::from_secs(secs);
        }
        if let Some(mode) = lookup("DETACH_WATCH_MODE") {
            config.watch_mode = mode.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.debounce.is_zero() {
            return Err(Error::Invalid("debounce must be greater than 0".to_string()));
        }

        if self.poll_interval.is_zero() {
            return Err(Error::Invalid("poll_interval must be greater than 0".to_string()));
        }

        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(RuntimePaths::default())
    }
}
