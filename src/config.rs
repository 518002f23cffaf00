//! The system's timing constants, exposed as a `serde`-deserialized
//! config struct instead of being baked in as magic numbers, the way
//! this codebase's tools load a TOML config file and let CLI flags
//! override individual fields.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Observer: interval between `poll-for-new-commit` invocations.
    pub poll_interval_secs: u64,
    /// Runner: how long without a `ping` before the liveness watcher
    /// checks in on the dispatcher.
    pub heartbeat_timeout_secs: u64,
    /// Dispatcher: interval between health-monitor sweeps.
    pub health_check_interval_secs: u64,
    /// Dispatcher: interval between redistributor sweeps.
    pub redistribute_interval_secs: u64,
    /// Dispatcher: backoff between dispatch-assignment retry rounds.
    pub dispatch_retry_backoff_secs: u64,
    /// Runner manager: interval between pool-maintenance sweeps.
    pub runner_pool_check_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            heartbeat_timeout_secs: 10,
            health_check_interval_secs: 1,
            redistribute_interval_secs: 1,
            dispatch_retry_backoff_secs: 2,
            runner_pool_check_interval_secs: 10,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("couldn't read config file {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("couldn't parse config file {:?}", path))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn redistribute_interval(&self) -> Duration {
        Duration::from_secs(self.redistribute_interval_secs)
    }

    pub fn dispatch_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.dispatch_retry_backoff_secs)
    }

    pub fn runner_pool_check_interval(&self) -> Duration {
        Duration::from_secs(self.runner_pool_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.poll_interval_secs, 5);
        assert_eq!(c.heartbeat_timeout_secs, 10);
        assert_eq!(c.health_check_interval_secs, 1);
        assert_eq!(c.redistribute_interval_secs, 1);
        assert_eq!(c.dispatch_retry_backoff_secs, 2);
        assert_eq!(c.runner_pool_check_interval_secs, 10);
    }

    #[test]
    fn loads_partial_overrides() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "poll_interval_secs = 30\n").unwrap();
        let c = Config::load(f.path()).unwrap();
        assert_eq!(c.poll_interval_secs, 30);
        assert_eq!(c.heartbeat_timeout_secs, 10);
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "bogus_field = 1\n").unwrap();
        assert!(Config::load(f.path()).is_err());
    }
}
