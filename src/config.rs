use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::lifecycle::StalePolicy;
use crate::materializer::Horizon;

/// Default config file looked up when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "recon-sched.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    /// Agents, commands, sites and scans loaded at startup.
    pub seed: Option<PathBuf>,
    pub allow_private_ips: bool,
    pub materialize_interval_secs: u64,
    /// Length of the rolling window materialized each cycle.
    pub horizon_hours: u64,
    pub stale_max_runtime_secs: u64,
    pub stale_checkin_grace_secs: u64,
    /// Move stale scans to `error` instead of only logging them.
    pub force_stale_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            seed: None,
            allow_private_ips: true,
            materialize_interval_secs: 300,
            horizon_hours: 24,
            stale_max_runtime_secs: 24 * 3600,
            stale_checkin_grace_secs: 3600,
            force_stale_errors: false,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// File (explicit path, or `recon-sched.json` if present) then `RECON_SCHED_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_file(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("RECON_SCHED_BIND") {
            self.bind = v;
        }
        if let Ok(v) = env::var("RECON_SCHED_SEED") {
            self.seed = Some(PathBuf::from(v));
        }
        if let Some(v) = env_parse("RECON_SCHED_ALLOW_PRIVATE")? {
            self.allow_private_ips = v;
        }
        if let Some(v) = env_parse("RECON_SCHED_INTERVAL_SECS")? {
            self.materialize_interval_secs = v;
        }
        if let Some(v) = env_parse("RECON_SCHED_HORIZON_HOURS")? {
            self.horizon_hours = v;
        }
        if let Some(v) = env_parse("RECON_SCHED_STALE_MAX_RUNTIME_SECS")? {
            self.stale_max_runtime_secs = v;
        }
        if let Some(v) = env_parse("RECON_SCHED_STALE_GRACE_SECS")? {
            self.stale_checkin_grace_secs = v;
        }
        if let Some(v) = env_parse("RECON_SCHED_FORCE_STALE")? {
            self.force_stale_errors = v;
        }
        Ok(())
    }

    pub fn stale_policy(&self) -> StalePolicy {
        StalePolicy {
            max_runtime: seconds(self.stale_max_runtime_secs),
            checkin_grace: seconds(self.stale_checkin_grace_secs),
        }
    }

    /// Length of the rolling materialize window, at least one hour.
    pub fn horizon_length(&self) -> Duration {
        seconds(self.horizon_hours.max(1).saturating_mul(3600))
    }

    pub fn horizon(&self, now: OffsetDateTime) -> crate::error::Result<Horizon> {
        Horizon::rolling(now, self.horizon_length())
    }

    pub fn materialize_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.materialize_interval_secs.max(1))
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {v:?}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use time::macros::datetime;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"bind": "0.0.0.0:9000", "force_stale_errors": true}}"#).unwrap();
        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert!(cfg.force_stale_errors);
        assert!(cfg.allow_private_ips);
        assert_eq!(cfg.materialize_interval_secs, 300);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn derived_policy_and_horizon() {
        let cfg = Config {
            horizon_hours: 48,
            stale_max_runtime_secs: 7200,
            ..Config::default()
        };
        assert_eq!(cfg.stale_policy().max_runtime, Duration::hours(2));
        let now = datetime!(2024-01-01 12:00 UTC);
        let horizon = cfg.horizon(now).unwrap();
        assert_eq!(horizon.start(), now);
        assert_eq!(horizon.end(), datetime!(2024-01-03 12:00 UTC));
    }

    #[test]
    fn oversized_horizon_is_rejected_not_overflowed() {
        let cfg = Config {
            horizon_hours: u64::MAX,
            ..Config::default()
        };
        assert!(matches!(
            cfg.horizon(datetime!(2024-01-01 12:00 UTC)),
            Err(crate::error::Error::InvalidHorizon(_))
        ));
    }
}
