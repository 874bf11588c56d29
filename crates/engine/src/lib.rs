//! Backtest job engine: ledger, execution adapters and job types
//!
//! Provides:
//! - The job ledger: submission, polling, and the `running -> completed | failed` lifecycle
//! - Execution adapters: simulated placeholder, LEAN CLI process, remote HTTP service
//! - Conversions to and from the SQLite job archive

pub mod adapter;
pub mod archive;
pub mod error;
pub mod ledger;
pub mod types;

// Re-exports for convenience
pub use adapter::{ExecutionAdapter, LeanCliAdapter, RemoteServiceAdapter, SimulatedAdapter};
pub use error::{ExecutionError, LedgerError};
pub use ledger::JobLedger;
pub use types::*;
