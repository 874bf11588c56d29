//! Error types for the ledger and the execution adapters

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::JobStatus;

/// Synchronous errors returned to whoever called the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid backtest request: {0}")]
    Validation(String),

    #[error("Backtest {0} not found")]
    NotFound(String),

    #[error("Backtest {0} already exists")]
    Conflict(String),

    #[error("Backtest {id} is already {status}")]
    NotRunning { id: String, status: JobStatus },

    #[error("Ledger is shutting down and accepts no new backtests")]
    ShuttingDown,
}

/// Failures while producing a performance report.
/// These never reach the submitting client directly; they become the job's error.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job id {0:?} cannot be used as a workspace directory name")]
    InvalidJobId(String),

    #[error("Engine exited with status {code:?}: {stderr}")]
    EngineExited { code: Option<i32>, stderr: String },

    #[error("Results file not found: {}", .0.display())]
    MissingResults(PathBuf),

    #[error("Malformed results: {0}")]
    MalformedResults(String),

    #[error("Remote backtest service error: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote backtest still running after {0} polls")]
    PollingExhausted(u32),

    #[error("Backtest timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Arithmetic overflow computing {0}")]
    Overflow(String),

    #[error("Backtest execution panicked: {0}")]
    Panicked(String),

    #[error("Backtest execution was cancelled")]
    Cancelled,
}
