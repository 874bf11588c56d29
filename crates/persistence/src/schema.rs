//! Database schema definitions

/// SQL to create all tables
/// NOTE: capital stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Backtest jobs archive
CREATE TABLE IF NOT EXISTS backtest_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    strategy_code TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    initial_capital TEXT NOT NULL,
    result_json TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    finished_at INTEGER
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_backtest_jobs_status ON backtest_jobs(status);
CREATE INDEX IF NOT EXISTS idx_backtest_jobs_created ON backtest_jobs(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_backtest_jobs_finished ON backtest_jobs(finished_at)
"#;
