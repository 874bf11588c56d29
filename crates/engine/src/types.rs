//! Types for the backtest job service

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Calendar date format accepted on the wire
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Largest accepted starting capital (one quadrillion)
pub const MAX_INITIAL_CAPITAL: Decimal = Decimal::from_parts(2764472320, 232830, 0, false, 0);

/// Lifecycle status of a backtest job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

fn default_start_date() -> String {
    "2020-01-01".to_string()
}

fn default_end_date() -> String {
    "2021-01-01".to_string()
}

fn default_initial_capital() -> Decimal {
    Decimal::from(100_000)
}

/// Backtest submission as received from a client, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBacktest {
    #[serde(alias = "backtest_id")]
    pub id: String,
    pub strategy_code: String,
    #[serde(default = "default_start_date")]
    pub start_date: String,
    #[serde(default = "default_end_date")]
    pub end_date: String,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
}

impl SubmitBacktest {
    /// Check the submission and turn it into typed inputs for an adapter
    pub fn validate(self) -> Result<BacktestRequest, LedgerError> {
        if self.id.trim().is_empty() {
            return Err(LedgerError::Validation("id must not be empty".to_string()));
        }
        if self.strategy_code.trim().is_empty() {
            return Err(LedgerError::Validation(
                "strategy_code must not be empty".to_string(),
            ));
        }

        let start_date = parse_date("start_date", &self.start_date)?;
        let end_date = parse_date("end_date", &self.end_date)?;
        if start_date > end_date {
            return Err(LedgerError::Validation(format!(
                "start_date {start_date} is after end_date {end_date}"
            )));
        }

        if self.initial_capital <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if self.initial_capital > MAX_INITIAL_CAPITAL {
            return Err(LedgerError::Validation(format!(
                "initial_capital must be at most {MAX_INITIAL_CAPITAL}, got {}",
                self.initial_capital
            )));
        }

        Ok(BacktestRequest {
            id: self.id,
            strategy_code: self.strategy_code,
            start_date,
            end_date,
            initial_capital: self.initial_capital,
        })
    }
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, LedgerError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| {
        LedgerError::Validation(format!(
            "{field} must be a YYYY-MM-DD calendar date, got {value:?}"
        ))
    })
}

/// Validated inputs handed to an execution adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub id: String,
    /// Opaque strategy source, passed to the engine verbatim
    pub strategy_code: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
}

/// Performance statistics of a finished backtest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub total_return: Decimal,
    pub sharpe_ratio: Decimal,
    pub max_drawdown: Decimal,
    pub win_rate: Decimal,
    pub final_portfolio_value: Decimal,
    pub total_trades: u32,
    pub profit_loss: Decimal,
}

/// Where a job is in its lifecycle, with the payload of terminal states
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Running,
    Completed(PerformanceReport),
    Failed(String),
}

/// One backtest submission and its tracked lifecycle
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub(crate) state: JobState,
}

impl Job {
    pub(crate) fn running(id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            finished_at: None,
            state: JobState::Running,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Running => JobStatus::Running,
            JobState::Completed(_) => JobStatus::Completed,
            JobState::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn result(&self) -> Option<&PerformanceReport> {
        match &self.state {
            JobState::Completed(report) => Some(report),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct JobBody<'a> {
    id: &'a str,
    status: JobStatus,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a PerformanceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl Serialize for Job {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        JobBody {
            id: &self.id,
            status: self.status(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            result: self.result(),
            error: self.error(),
        }
        .serialize(serializer)
    }
}
