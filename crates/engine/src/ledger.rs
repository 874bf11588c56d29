//! Job ledger, the authoritative record of every backtest job
//!
//! All state transitions go through this type. Submission inserts a `running` job and
//! spawns the adapter on a tracked background task; the task reports back through
//! [`JobLedger::complete`] or [`JobLedger::fail`] exactly once.

use chrono::{DateTime, Utc};
use persistence::repository::JobRepository;
use persistence::{DbResult, SqlitePool};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::adapter::ExecutionAdapter;
use crate::archive::{self, INTERRUPTED_REASON};
use crate::error::{ExecutionError, LedgerError};
use crate::types::{BacktestRequest, Job, JobState, JobStatus, PerformanceReport, SubmitBacktest};

/// Jobs held in memory plus the ids dropped by retention, which stay reserved
#[derive(Default)]
struct JobTable {
    live: HashMap<String, Job>,
    retired: HashSet<String>,
}

impl JobTable {
    fn is_taken(&self, id: &str) -> bool {
        self.live.contains_key(id) || self.retired.contains(id)
    }
}

/// In-memory job ledger with an optional SQLite archive
pub struct JobLedger {
    jobs: RwLock<JobTable>,
    adapter: Arc<dyn ExecutionAdapter>,
    tasks: TaskTracker,
    accepting: AtomicBool,
    db_pool: Option<SqlitePool>,
    job_timeout: Option<Duration>,
    retention: Option<chrono::Duration>,
}

impl JobLedger {
    pub fn new(adapter: Arc<dyn ExecutionAdapter>) -> Self {
        Self {
            jobs: RwLock::new(JobTable::default()),
            adapter,
            tasks: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            db_pool: None,
            job_timeout: None,
            retention: None,
        }
    }

    /// Archive every job in SQLite as well as in memory
    pub fn with_store(mut self, pool: SqlitePool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    /// Fail jobs whose adapter runs longer than `limit`
    pub fn with_job_timeout(mut self, limit: Duration) -> Self {
        self.job_timeout = Some(limit);
        self
    }

    /// Drop finished jobs older than `max_age` from memory when restoring.
    /// The periodic sweep calls [`JobLedger::prune_finished`] with the same age.
    pub fn with_retention(mut self, max_age: chrono::Duration) -> Self {
        self.retention = Some(max_age);
        self
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, JobTable> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, JobTable> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Client operations
    // ========================================================================

    /// Validate and accept a backtest. Returns as soon as the job is recorded;
    /// the adapter runs on a background task.
    ///
    /// An id is never reused, including ids dropped from memory by retention.
    pub fn submit(self: &Arc<Self>, submission: SubmitBacktest) -> Result<Job, LedgerError> {
        let request = submission.validate()?;
        let job = Job::running(request.id.clone(), Utc::now());

        // Held until the task is spawned so shutdown cannot slip in between
        let mut jobs = self.write_jobs();
        if !self.accepting.load(Ordering::Acquire) {
            return Err(LedgerError::ShuttingDown);
        }
        if jobs.is_taken(&request.id) {
            return Err(LedgerError::Conflict(request.id));
        }
        jobs.live.insert(request.id.clone(), job.clone());

        info!(
            job_id = %job.id,
            adapter = self.adapter.name(),
            start_date = %request.start_date,
            end_date = %request.end_date,
            initial_capital = %request.initial_capital,
            "Backtest submitted"
        );

        let ledger = Arc::clone(self);
        let created_at = job.created_at;
        self.tasks.spawn(async move {
            ledger.execute(request, created_at).await;
        });
        drop(jobs);

        Ok(job)
    }

    /// Current snapshot of a job
    pub fn get(&self, id: &str) -> Result<Job, LedgerError> {
        self.read_jobs()
            .live
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read_jobs().live.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Number of jobs per status currently held in memory
    pub fn counts(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for job in self.read_jobs().live.values() {
            *counts.entry(job.status()).or_insert(0) += 1;
        }
        counts
    }

    /// Adapter tasks still in flight
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    // ========================================================================
    // Adapter transitions
    // ========================================================================

    /// `running -> completed`. Terminal jobs are never overwritten.
    pub fn complete(&self, id: &str, report: PerformanceReport) -> Result<Job, LedgerError> {
        self.finish(id, JobState::Completed(report))
    }

    /// `running -> failed`. Terminal jobs are never overwritten.
    pub fn fail(&self, id: &str, reason: impl Into<String>) -> Result<Job, LedgerError> {
        self.finish(id, JobState::Failed(reason.into()))
    }

    fn finish(&self, id: &str, state: JobState) -> Result<Job, LedgerError> {
        let mut jobs = self.write_jobs();
        let job = jobs
            .live
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if job.is_terminal() {
            return Err(LedgerError::NotRunning {
                id: id.to_string(),
                status: job.status(),
            });
        }
        job.state = state;
        job.finished_at = Some(Utc::now());
        Ok(job.clone())
    }

    // ========================================================================
    // Background execution
    // ========================================================================

    async fn execute(self: Arc<Self>, request: BacktestRequest, created_at: DateTime<Utc>) {
        let job_id = request.id.clone();

        if let Some(pool) = &self.db_pool {
            let repo = JobRepository::new(pool);
            if let Err(e) = repo.insert(&archive::running_record(&request, created_at)).await {
                warn!(job_id = %job_id, error = %e, "Failed to archive submitted backtest");
            }
        }

        let started = Instant::now();
        let transition = match self.run_adapter(request).await {
            Ok(report) => self.complete(&job_id, report),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Backtest execution failed");
                self.fail(&job_id, e.to_string())
            }
        };

        match transition {
            Ok(job) => {
                info!(
                    job_id = %job_id,
                    status = %job.status(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backtest finished"
                );
                self.archive_outcome(&job).await;
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Dropped backtest outcome"),
        }
    }

    /// Run the adapter on its own task so a panic becomes a failure instead of
    /// leaving the job running forever.
    async fn run_adapter(&self, request: BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
        let adapter = Arc::clone(&self.adapter);
        let mut handle = tokio::spawn(async move { adapter.run(&request).await });

        let joined = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(ExecutionError::TimedOut(limit));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(ExecutionError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(ExecutionError::Cancelled),
        }
    }

    async fn archive_outcome(&self, job: &Job) {
        let Some(pool) = &self.db_pool else {
            return;
        };
        let result_json = match job.result().map(serde_json::to_string).transpose() {
            Ok(json) => json,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to serialize report for archive");
                return;
            }
        };
        let finished_at = job.finished_at.unwrap_or_else(Utc::now).timestamp_millis();

        let repo = JobRepository::new(pool);
        match repo
            .mark_finished(
                &job.id,
                job.status().as_str(),
                result_json.as_deref(),
                job.error(),
                finished_at,
            )
            .await
        {
            Ok(true) => debug!(job_id = %job.id, "Archived backtest outcome"),
            Ok(false) => warn!(job_id = %job.id, "No running archive record to update"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to archive backtest outcome"),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load archived jobs into memory. Jobs archived as running belonged to a
    /// previous process and are marked failed. Finished jobs past the retention
    /// age only reserve their id. Returns the number of jobs held in memory.
    pub async fn restore(&self) -> DbResult<usize> {
        let Some(pool) = &self.db_pool else {
            return Ok(0);
        };
        let repo = JobRepository::new(pool);
        let records = repo.get_all().await?;

        let mut restored = Vec::with_capacity(records.len());
        let mut interrupted = 0usize;
        for mut record in records {
            if record.status == JobStatus::Running.as_str() {
                let now = Utc::now().timestamp_millis();
                repo.mark_finished(
                    &record.id,
                    JobStatus::Failed.as_str(),
                    None,
                    Some(INTERRUPTED_REASON),
                    now,
                )
                .await?;
                record.status = JobStatus::Failed.as_str().to_string();
                record.error = Some(INTERRUPTED_REASON.to_string());
                record.finished_at = Some(now);
                interrupted += 1;
            }

            let id = record.id.clone();
            match archive::job_from_record(record) {
                Ok(job) => restored.push(job),
                Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable archived backtest"),
            }
        }

        let mut loaded = 0usize;
        {
            let mut jobs = self.write_jobs();
            for job in restored {
                if jobs.is_taken(&job.id) {
                    continue;
                }
                jobs.live.insert(job.id.clone(), job);
                loaded += 1;
            }
        }

        let expired = match self.retention {
            Some(max_age) => self.prune_finished(max_age),
            None => 0,
        };

        info!(loaded, interrupted, expired, "Restored archived backtests");
        Ok(loaded.saturating_sub(expired))
    }

    /// Drop finished jobs older than `max_age` from memory. Running jobs are kept.
    /// Dropped ids stay reserved.
    pub fn prune_finished(&self, max_age: chrono::Duration) -> usize {
        // An age reaching past the earliest representable time expires nothing
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let mut jobs = self.write_jobs();
        let expired: Vec<String> = jobs
            .live
            .values()
            .filter(|job| job.is_terminal() && job.finished_at.is_some_and(|at| at < cutoff))
            .map(|job| job.id.clone())
            .collect();
        let pruned = expired.len();
        for id in expired {
            jobs.live.remove(&id);
            jobs.retired.insert(id);
        }
        if pruned > 0 {
            debug!(pruned, "Pruned finished backtests");
        }
        pruned
    }

    /// Stop accepting submissions and wait for every in-flight backtest to finish
    pub async fn shutdown(&self) {
        {
            let _jobs = self.write_jobs();
            self.accepting.store(false, Ordering::Release);
            self.tasks.close();
        }
        let outstanding = self.tasks.len();
        if outstanding > 0 {
            info!(outstanding, "Waiting for in-flight backtests");
        }
        self.tasks.wait().await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SimulatedAdapter;
    use async_trait::async_trait;
    use persistence::repository::BacktestJobRecord;
    use persistence::Database;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn submission(id: &str) -> SubmitBacktest {
        SubmitBacktest {
            id: id.to_string(),
            strategy_code: "x".to_string(),
            start_date: "2020-01-01".to_string(),
            end_date: "2021-01-01".to_string(),
            initial_capital: dec!(100000),
        }
    }

    fn ledger_with(adapter: impl ExecutionAdapter + 'static) -> Arc<JobLedger> {
        Arc::new(JobLedger::new(Arc::new(adapter)))
    }

    async fn wait_terminal(ledger: &JobLedger, id: &str) -> Job {
        for _ in 0..500 {
            let job = ledger.get(id).unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    /// Adapter that blocks until released, so tests can observe the running state
    struct GatedAdapter {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ExecutionAdapter for GatedAdapter {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn run(&self, request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
            self.gate.notified().await;
            crate::adapter::simulated::simulate_report(request)
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl ExecutionAdapter for FailingAdapter {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, _request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
            Err(ExecutionError::MalformedResults("no TotalPerformance".to_string()))
        }
    }

    struct PanickingAdapter;

    #[async_trait]
    impl ExecutionAdapter for PanickingAdapter {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn run(&self, _request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
            panic!("engine exploded");
        }
    }

    struct CountingAdapter {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExecutionAdapter for CountingAdapter {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            crate::adapter::simulated::simulate_report(request)
        }
    }

    #[tokio::test]
    async fn test_submit_returns_running_immediately() {
        let gate = Arc::new(Notify::new());
        let ledger = ledger_with(GatedAdapter { gate: gate.clone() });

        let job = ledger.submit(submission("r1")).unwrap();
        assert_eq!(job.status(), JobStatus::Running);

        let polled = ledger.get("r1").unwrap();
        assert_eq!(polled.status(), JobStatus::Running);
        assert!(polled.result().is_none());
        assert!(polled.error().is_none());
        assert!(polled.finished_at.is_none());
        assert_eq!(ledger.outstanding(), 1);

        gate.notify_one();
        let done = wait_terminal(&ledger, "r1").await;
        assert_eq!(done.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_completed_job_has_consistent_report() {
        let ledger = ledger_with(SimulatedAdapter::new(Duration::from_millis(1)));
        ledger.submit(submission("t1")).unwrap();

        let job = wait_terminal(&ledger, "t1").await;
        let report = job.result().expect("completed job carries a report");
        assert!(job.error().is_none());
        assert!(job.finished_at.is_some());
        assert_eq!(
            report.final_portfolio_value,
            dec!(100000) * (Decimal::ONE + report.total_return)
        );
    }

    #[tokio::test]
    async fn test_adapter_error_fails_job() {
        let ledger = ledger_with(FailingAdapter);
        ledger.submit(submission("bad")).unwrap();

        let job = wait_terminal(&ledger, "bad").await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.result().is_none());
        assert!(job.error().unwrap().contains("no TotalPerformance"));
    }

    #[tokio::test]
    async fn test_adapter_panic_fails_job() {
        let ledger = ledger_with(PanickingAdapter);
        ledger.submit(submission("boom")).unwrap();

        let job = wait_terminal(&ledger, "boom").await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().contains("engine exploded"));
    }

    #[tokio::test]
    async fn test_job_timeout_fails_job() {
        let gate = Arc::new(Notify::new());
        let ledger = Arc::new(
            JobLedger::new(Arc::new(GatedAdapter { gate })).with_job_timeout(Duration::from_millis(20)),
        );
        ledger.submit(submission("slow")).unwrap();

        let job = wait_terminal(&ledger, "slow").await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_polling_terminal_job_is_idempotent() {
        let ledger = ledger_with(SimulatedAdapter::new(Duration::ZERO));
        ledger.submit(submission("idem")).unwrap();

        let first = wait_terminal(&ledger, "idem").await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
            assert_eq!(ledger.get("idem").unwrap(), first);
        }
    }

    #[tokio::test]
    async fn test_terminal_jobs_reject_further_transitions() {
        let ledger = ledger_with(FailingAdapter);
        ledger.submit(submission("once")).unwrap();
        let failed = wait_terminal(&ledger, "once").await;

        let err = ledger.complete("once", PerformanceReport::default()).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NotRunning { status: JobStatus::Failed, .. }
        ));
        assert!(ledger.fail("once", "again").is_err());
        assert_eq!(ledger.get("once").unwrap(), failed);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let ledger = ledger_with(FailingAdapter);
        assert!(matches!(
            ledger.get("does-not-exist"),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.complete("does-not-exist", PerformanceReport::default()),
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.fail("does-not-exist", "x"),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let gate = Arc::new(Notify::new());
        let ledger = ledger_with(GatedAdapter { gate: gate.clone() });
        let original = ledger.submit(submission("dup")).unwrap();

        let mut second = submission("dup");
        second.initial_capital = dec!(5);
        assert!(matches!(ledger.submit(second), Err(LedgerError::Conflict(_))));
        assert_eq!(ledger.get("dup").unwrap(), original);
        assert_eq!(ledger.outstanding(), 1);

        gate.notify_one();
        wait_terminal(&ledger, "dup").await;
        assert!(matches!(
            ledger.submit(submission("dup")),
            Err(LedgerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_submission_creates_no_job() {
        let ledger = ledger_with(FailingAdapter);
        let mut bad = submission("invalid");
        bad.initial_capital = Decimal::ZERO;

        assert!(matches!(ledger.submit(bad), Err(LedgerError::Validation(_))));
        assert!(ledger.get("invalid").is_err());
        assert!(ledger.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_stay_isolated() {
        let runs = Arc::new(AtomicUsize::new(0));
        let ledger = ledger_with(CountingAdapter { runs: runs.clone() });

        let mut handles = Vec::new();
        for i in 0..100 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let mut s = submission(&format!("job-{i}"));
                s.initial_capital = Decimal::from(1000 + i);
                ledger.submit(s).map(|job| job.id)
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        ledger.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 100);
        assert_eq!(ledger.list().len(), 100);

        for i in 0..100 {
            let job = ledger.get(&format!("job-{i}")).unwrap();
            let report = job.result().expect("every job completes");
            let capital = Decimal::from(1000 + i);
            assert_eq!(report.final_portfolio_value, capital * (Decimal::ONE + report.total_return));
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_and_stops_accepting() {
        let ledger = ledger_with(SimulatedAdapter::new(Duration::from_millis(20)));
        ledger.submit(submission("s1")).unwrap();
        ledger.submit(submission("s2")).unwrap();

        ledger.shutdown().await;
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.get("s1").unwrap().status(), JobStatus::Completed);
        assert_eq!(ledger.get("s2").unwrap().status(), JobStatus::Completed);
        assert!(matches!(
            ledger.submit(submission("late")),
            Err(LedgerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_counts() {
        let gate = Arc::new(Notify::new());
        let ledger = ledger_with(GatedAdapter { gate });
        ledger.submit(submission("first")).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        ledger.submit(submission("second")).unwrap();

        let ids: Vec<String> = ledger.list().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["second".to_string(), "first".to_string()]);
        assert_eq!(ledger.counts().get(&JobStatus::Running), Some(&2));
    }

    #[tokio::test]
    async fn test_prune_keeps_running_and_recent_jobs() {
        let gate = Arc::new(Notify::new());
        let ledger = ledger_with(GatedAdapter { gate: gate.clone() });
        ledger.submit(submission("finished")).unwrap();
        gate.notify_one();
        wait_terminal(&ledger, "finished").await;
        ledger.submit(submission("pending")).unwrap();

        assert_eq!(ledger.prune_finished(chrono::Duration::hours(1)), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ledger.prune_finished(chrono::Duration::zero()), 1);
        assert!(ledger.get("finished").is_err());
        assert_eq!(ledger.get("pending").unwrap().status(), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_pruned_id_stays_reserved() {
        let ledger = ledger_with(SimulatedAdapter::new(Duration::ZERO));
        ledger.submit(submission("p1")).unwrap();
        wait_terminal(&ledger, "p1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(ledger.prune_finished(chrono::Duration::zero()), 1);

        let mut again = submission("p1");
        again.initial_capital = dec!(5);
        assert!(matches!(ledger.submit(again), Err(LedgerError::Conflict(_))));
        assert!(matches!(ledger.get("p1"), Err(LedgerError::NotFound(_))));
        assert_eq!(ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_prune_with_age_beyond_calendar_expires_nothing() {
        let ledger = ledger_with(SimulatedAdapter::new(Duration::ZERO));
        ledger.submit(submission("ancient")).unwrap();
        wait_terminal(&ledger, "ancient").await;

        assert_eq!(ledger.prune_finished(chrono::Duration::days(100_000_000)), 0);
        assert!(ledger.get("ancient").is_ok());
    }

    #[tokio::test]
    async fn test_archived_outcome_survives_prune_and_restart() {
        let db = Database::in_memory().await.unwrap();
        let ledger = Arc::new(
            JobLedger::new(Arc::new(SimulatedAdapter::new(Duration::ZERO))).with_store(db.pool_clone()),
        );
        ledger.submit(submission("p1")).unwrap();
        let first = wait_terminal(&ledger, "p1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        ledger.prune_finished(chrono::Duration::zero());

        let mut again = submission("p1");
        again.initial_capital = dec!(5);
        assert!(matches!(ledger.submit(again), Err(LedgerError::Conflict(_))));
        ledger.shutdown().await;

        let restarted = JobLedger::new(Arc::new(FailingAdapter)).with_store(db.pool_clone());
        assert_eq!(restarted.restore().await.unwrap(), 1);
        assert_eq!(restarted.get("p1").unwrap().result(), first.result());
    }

    #[tokio::test]
    async fn test_restore_applies_retention() {
        let db = Database::in_memory().await.unwrap();
        let ledger = Arc::new(
            JobLedger::new(Arc::new(SimulatedAdapter::new(Duration::ZERO))).with_store(db.pool_clone()),
        );
        ledger.submit(submission("old")).unwrap();
        ledger.shutdown().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let restarted = Arc::new(
            JobLedger::new(Arc::new(FailingAdapter))
                .with_store(db.pool_clone())
                .with_retention(chrono::Duration::zero()),
        );
        assert_eq!(restarted.restore().await.unwrap(), 0);
        assert!(matches!(restarted.get("old"), Err(LedgerError::NotFound(_))));
        assert!(matches!(
            restarted.submit(submission("old")),
            Err(LedgerError::Conflict(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submissions_racing_shutdown_all_settle() {
        for round in 0..20 {
            let ledger = ledger_with(CountingAdapter {
                runs: Arc::new(AtomicUsize::new(0)),
            });

            let mut handles = Vec::new();
            for i in 0..20 {
                let ledger = ledger.clone();
                handles.push(tokio::spawn(async move {
                    let _ = ledger.submit(submission(&format!("race-{round}-{i}")));
                }));
            }
            ledger.shutdown().await;

            for job in ledger.list() {
                assert!(job.is_terminal(), "{} left running after shutdown", job.id);
            }
            for handle in handles {
                handle.await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_archive_round_trip_and_restore() {
        let db = Database::in_memory().await.unwrap();
        let ledger = Arc::new(
            JobLedger::new(Arc::new(SimulatedAdapter::new(Duration::ZERO))).with_store(db.pool_clone()),
        );
        ledger.submit(submission("kept")).unwrap();
        ledger.shutdown().await;
        let original = ledger.get("kept").unwrap();

        // A job left running by a crashed process
        let repo = JobRepository::new(db.pool());
        let orphan: BacktestJobRecord = archive::running_record(
            &submission("orphan").validate().unwrap(),
            Utc::now(),
        );
        repo.insert(&orphan).await.unwrap();

        let archived = repo.get_by_id("kept").await.unwrap().unwrap();
        assert_eq!(archived.status, "completed");
        assert!(archived.result_json.is_some());

        let restarted = JobLedger::new(Arc::new(FailingAdapter)).with_store(db.pool_clone());
        assert_eq!(restarted.restore().await.unwrap(), 2);

        let kept = restarted.get("kept").unwrap();
        assert_eq!(kept.status(), JobStatus::Completed);
        assert_eq!(kept.result(), original.result());

        let orphan = restarted.get("orphan").unwrap();
        assert_eq!(orphan.status(), JobStatus::Failed);
        assert_eq!(orphan.error(), Some(INTERRUPTED_REASON));
        let archived = repo.get_by_id("orphan").await.unwrap().unwrap();
        assert_eq!(archived.status, "failed");
    }
}
