//! Backtest job repository: archive of submitted jobs and their outcomes

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted backtest job
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestJobRecord {
    pub id: String,
    pub status: String,
    pub strategy_code: String,
    pub start_date: String,
    pub end_date: String,
    pub initial_capital: String,
    /// Serialized performance report, only for completed jobs
    pub result_json: Option<String>,
    pub error: Option<String>,
    /// Epoch milliseconds
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// Job counts per status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatusCounts {
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Repository for archived backtest jobs
pub struct JobRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> JobRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Archive a newly submitted job. Fails on a duplicate id.
    pub async fn insert(&self, record: &BacktestJobRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backtest_jobs (
                id, status, strategy_code, start_date, end_date, initial_capital,
                result_json, error, created_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.status)
        .bind(&record.strategy_code)
        .bind(&record.start_date)
        .bind(&record.end_date)
        .bind(&record.initial_capital)
        .bind(&record.result_json)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.finished_at)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Record the terminal outcome of a running job.
    /// Returns false if no running job with this id exists.
    pub async fn mark_finished(
        &self,
        id: &str,
        status: &str,
        result_json: Option<&str>,
        error: Option<&str>,
        finished_at: i64,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backtest_jobs
               SET status = ?, result_json = ?, error = ?, finished_at = ?
             WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status)
        .bind(result_json)
        .bind(error)
        .bind(finished_at)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a job by id
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<BacktestJobRecord>> {
        let record = sqlx::query_as::<_, BacktestJobRecord>(
            r#"
            SELECT id, status, strategy_code, start_date, end_date, initial_capital,
                   result_json, error, created_at, finished_at
              FROM backtest_jobs
             WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// All archived jobs, newest first
    pub async fn get_all(&self) -> DbResult<Vec<BacktestJobRecord>> {
        let records = sqlx::query_as::<_, BacktestJobRecord>(
            r#"
            SELECT id, status, strategy_code, start_date, end_date, initial_capital,
                   result_json, error, created_at, finished_at
              FROM backtest_jobs
             ORDER BY created_at DESC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Delete finished jobs whose finished_at is before the cutoff (epoch ms).
    /// Running jobs are never deleted. Returns the number of deleted rows.
    pub async fn delete_finished_before(&self, cutoff_ms: i64) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM backtest_jobs
             WHERE status != 'running'
               AND finished_at IS NOT NULL
               AND finished_at < ?
            "#,
        )
        .bind(cutoff_ms)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Count jobs per status
    pub async fn count_by_status(&self) -> DbResult<JobStatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM backtest_jobs GROUP BY status")
                .fetch_all(self.pool)
                .await?;

        let mut counts = JobStatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "running" => counts.running = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Reclaim disk space after large deletions
    pub async fn vacuum(&self) -> DbResult<()> {
        sqlx::query("VACUUM").execute(self.pool).await?;
        Ok(())
    }
}
