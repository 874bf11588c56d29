//! Service configuration loaded from environment variables

use anyhow::{anyhow, Context};
use chrono::{DateTime, TimeDelta, Utc};
use engine::{ExecutionAdapter, LeanCliAdapter, RemoteServiceAdapter, SimulatedAdapter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which engine runs the backtests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Simulated,
    Lean,
    Remote,
}

impl FromStr for AdapterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simulated" => Ok(AdapterKind::Simulated),
            "lean" => Ok(AdapterKind::Lean),
            "remote" => Ok(AdapterKind::Remote),
            other => Err(anyhow!(
                "unknown adapter {other:?} (expected simulated, lean or remote)"
            )),
        }
    }
}

/// Service configuration.
///
/// | Env Var                           | Default                 |
/// |-----------------------------------|-------------------------|
/// | `LEAN_SERVICE_DB_PATH`            | unset (memory only)     |
/// | `LEAN_SERVICE_ADAPTER`            | `simulated`             |
/// | `LEAN_SERVICE_SIMULATED_DELAY_MS` | `3000`                  |
/// | `LEAN_CLI_BIN`                    | `lean`                  |
/// | `LEAN_WORKSPACE_DIR`              | `.`                     |
/// | `LEAN_REMOTE_URL`                 | `http://localhost:8000` |
/// | `LEAN_REMOTE_POLL_INTERVAL_MS`    | `5000`                  |
/// | `LEAN_REMOTE_MAX_ATTEMPTS`        | `60`                    |
/// | `LEAN_REMOTE_TIMEOUT_MS`          | `30000`                 |
/// | `LEAN_SERVICE_JOB_TIMEOUT_SECS`   | unset (no deadline)     |
/// | `LEAN_SERVICE_RETENTION_SECS`     | unset (keep forever)    |
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: Option<String>,
    pub adapter: AdapterKind,
    pub simulated_delay: Duration,
    pub lean_bin: PathBuf,
    pub workspace_dir: PathBuf,
    pub remote_url: String,
    pub remote_poll_interval: Duration,
    pub remote_max_attempts: u32,
    pub remote_request_timeout: Duration,
    pub job_timeout: Option<Duration>,
    pub retention: Option<TimeDelta>,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse = |key: &str| -> anyhow::Result<Option<u64>> {
            get(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{key} must be a non-negative integer, got {v:?}"))
                })
                .transpose()
        };

        let adapter = get("LEAN_SERVICE_ADAPTER")
            .map(|v| v.parse::<AdapterKind>())
            .transpose()?
            .unwrap_or(AdapterKind::Simulated);

        let remote_max_attempts = match parse("LEAN_REMOTE_MAX_ATTEMPTS")? {
            Some(n) => u32::try_from(n).context("LEAN_REMOTE_MAX_ATTEMPTS is too large")?,
            None => 60,
        };

        Ok(Self {
            db_path: get("LEAN_SERVICE_DB_PATH"),
            adapter,
            simulated_delay: Duration::from_millis(
                parse("LEAN_SERVICE_SIMULATED_DELAY_MS")?.unwrap_or(3000),
            ),
            lean_bin: PathBuf::from(get("LEAN_CLI_BIN").unwrap_or_else(|| "lean".to_string())),
            workspace_dir: PathBuf::from(get("LEAN_WORKSPACE_DIR").unwrap_or_else(|| ".".to_string())),
            remote_url: get("LEAN_REMOTE_URL").unwrap_or_else(|| "http://localhost:8000".to_string()),
            remote_poll_interval: Duration::from_millis(
                parse("LEAN_REMOTE_POLL_INTERVAL_MS")?.unwrap_or(5000),
            ),
            remote_max_attempts,
            remote_request_timeout: Duration::from_millis(
                parse("LEAN_REMOTE_TIMEOUT_MS")?.unwrap_or(30_000),
            ),
            job_timeout: parse("LEAN_SERVICE_JOB_TIMEOUT_SECS")?.map(Duration::from_secs),
            retention: parse("LEAN_SERVICE_RETENTION_SECS")?
                .map(|secs| retention_age(Duration::from_secs(secs)))
                .transpose()?,
        })
    }

    /// Instantiate the configured execution adapter
    pub fn build_adapter(&self) -> anyhow::Result<Arc<dyn ExecutionAdapter>> {
        let adapter: Arc<dyn ExecutionAdapter> = match self.adapter {
            AdapterKind::Simulated => Arc::new(SimulatedAdapter::new(self.simulated_delay)),
            AdapterKind::Lean => Arc::new(LeanCliAdapter::new(&self.lean_bin, &self.workspace_dir)),
            AdapterKind::Remote => Arc::new(
                RemoteServiceAdapter::new(&self.remote_url)?
                    .with_polling(self.remote_poll_interval, self.remote_max_attempts)
                    .with_request_timeout(self.remote_request_timeout)?,
            ),
        };
        Ok(adapter)
    }
}

/// Age limit usable against the current clock
fn retention_age(retention: Duration) -> anyhow::Result<TimeDelta> {
    TimeDelta::from_std(retention)
        .ok()
        .filter(|age| Utc::now().checked_sub_signed(*age).is_some())
        .ok_or_else(|| anyhow!("LEAN_SERVICE_RETENTION_SECS is too large: {}", retention.as_secs()))
}

/// `now` minus `days` whole days, or an error when that date is not representable
pub fn cleanup_cutoff(now: DateTime<Utc>, days: u32) -> anyhow::Result<DateTime<Utc>> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| anyhow!("--older-than-days {days} reaches before the earliest supported date"))
}
