//! Execution adapters: the bridge between the ledger and a backtesting engine
//!
//! The ledger never knows how a report is produced. It hands validated inputs to an
//! adapter on a background task and records whatever comes back.

pub mod lean_cli;
pub mod remote;
pub mod simulated;

use async_trait::async_trait;

use crate::error::ExecutionError;
use crate::types::{BacktestRequest, PerformanceReport};

pub use lean_cli::LeanCliAdapter;
pub use remote::RemoteServiceAdapter;
pub use simulated::SimulatedAdapter;

/// Given job inputs, asynchronously produce a performance report or fail with a reason.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn run(&self, request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError>;
}
