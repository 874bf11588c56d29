//! Conversions between ledger jobs and archived job records

use chrono::{DateTime, Utc};
use persistence::repository::BacktestJobRecord;

use crate::types::{BacktestRequest, Job, JobState, JobStatus, PerformanceReport};

/// Reason recorded for jobs that were still running when the service stopped
pub const INTERRUPTED_REASON: &str = "Backtest interrupted: service restarted before it finished";

/// Archive record for a freshly submitted job
pub fn running_record(request: &BacktestRequest, created_at: DateTime<Utc>) -> BacktestJobRecord {
    BacktestJobRecord {
        id: request.id.clone(),
        status: JobStatus::Running.as_str().to_string(),
        strategy_code: request.strategy_code.clone(),
        start_date: request.start_date.to_string(),
        end_date: request.end_date.to_string(),
        initial_capital: request.initial_capital.to_string(),
        result_json: None,
        error: None,
        created_at: created_at.timestamp_millis(),
        finished_at: None,
    }
}

/// Rebuild a ledger job from its archive record
pub fn job_from_record(record: BacktestJobRecord) -> Result<Job, String> {
    let status: JobStatus = record.status.parse()?;
    let created_at = from_millis(record.created_at)?;
    let finished_at = record.finished_at.map(from_millis).transpose()?;

    let state = match status {
        JobStatus::Running => JobState::Running,
        JobStatus::Completed => {
            let raw = record
                .result_json
                .ok_or_else(|| format!("completed job {} has no result", record.id))?;
            let report: PerformanceReport = serde_json::from_str(&raw)
                .map_err(|e| format!("job {} has an unreadable result: {e}", record.id))?;
            JobState::Completed(report)
        }
        JobStatus::Failed => JobState::Failed(
            record
                .error
                .unwrap_or_else(|| "Backtest failed".to_string()),
        ),
    };

    Ok(Job {
        id: record.id,
        created_at,
        finished_at,
        state,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("timestamp out of range: {ms}"))
}
