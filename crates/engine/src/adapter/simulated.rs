//! Placeholder engine: a deterministic pseudo-random report per job id
//!
//! Stands in for a real engine during development. Strategy code is never executed.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use super::ExecutionAdapter;
use crate::error::ExecutionError;
use crate::types::{BacktestRequest, PerformanceReport};

const DEFAULT_DELAY: Duration = Duration::from_secs(3);

/// Adapter that sleeps for a while and fabricates a plausible report
#[derive(Debug, Clone)]
pub struct SimulatedAdapter {
    delay: Duration,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_DELAY)
    }
}

impl SimulatedAdapter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ExecutionAdapter for SimulatedAdapter {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn run(&self, request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
        debug!(job_id = %request.id, delay_ms = self.delay.as_millis() as u64, "Simulating backtest");
        tokio::time::sleep(self.delay).await;
        simulate_report(request)
    }
}

/// Seed derived from the job id so the same id always yields the same report
fn seed_for(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Build the fake report. Ratios are drawn in basis points to stay exact in Decimal.
pub fn simulate_report(request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
    let mut rng = StdRng::seed_from_u64(seed_for(&request.id));

    let total_return = Decimal::new(rng.gen_range(-2000..=4000), 4);
    let sharpe_ratio = Decimal::new(rng.gen_range(-100..=250), 2);
    let max_drawdown = Decimal::new(rng.gen_range(-3000..=-500), 4);
    let win_rate = Decimal::new(rng.gen_range(3000..=8000), 4);
    let total_trades = rng.gen_range(1..=50);

    let capital = request.initial_capital;
    let overflow = || ExecutionError::Overflow(format!("portfolio value for capital {capital}"));
    let final_portfolio_value = capital
        .checked_mul(Decimal::ONE + total_return)
        .ok_or_else(overflow)?;
    let profit_loss = capital.checked_mul(total_return).ok_or_else(overflow)?;

    Ok(PerformanceReport {
        total_return,
        sharpe_ratio,
        max_drawdown,
        win_rate,
        final_portfolio_value,
        total_trades,
        profit_loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(id: &str, capital: Decimal) -> BacktestRequest {
        BacktestRequest {
            id: id.to_string(),
            strategy_code: "x".to_string(),
            start_date: "2020-01-01".parse().unwrap(),
            end_date: "2021-01-01".parse().unwrap(),
            initial_capital: capital,
        }
    }

    #[test]
    fn test_same_id_same_report() {
        let a = simulate_report(&request("seeded", dec!(100000))).unwrap();
        let b = simulate_report(&request("seeded", dec!(100000))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_report_is_consistent_with_capital() {
        for id in ["t1", "t2", "alpha", "beta-7"] {
            let capital = dec!(12345.67);
            let report = simulate_report(&request(id, capital)).unwrap();
            assert_eq!(
                report.final_portfolio_value,
                capital * (Decimal::ONE + report.total_return)
            );
            assert_eq!(report.profit_loss, capital * report.total_return);
            assert!(report.total_return >= dec!(-0.2) && report.total_return <= dec!(0.4));
            assert!(report.max_drawdown < Decimal::ZERO);
            assert!(report.win_rate > Decimal::ZERO && report.win_rate < Decimal::ONE);
            assert!((1..=50).contains(&report.total_trades));
        }
    }

    #[test]
    fn test_huge_capital_is_an_error_not_a_panic() {
        let capital = Decimal::from_str_exact("70000000000000000000000000000").unwrap();
        for i in 0..20 {
            let outcome = simulate_report(&request(&format!("big-{i}"), capital));
            match outcome {
                Ok(report) => assert!(report.final_portfolio_value > Decimal::ZERO),
                Err(e) => assert!(matches!(e, ExecutionError::Overflow(_)), "{e}"),
            }
        }
    }

    #[test]
    fn test_seed_differs_between_ids() {
        assert_ne!(seed_for("a"), seed_for("b"));
    }

    #[tokio::test]
    async fn test_adapter_waits_then_reports() {
        let adapter = SimulatedAdapter::new(Duration::from_millis(5));
        let req = request("async", dec!(1000));
        let report = adapter.run(&req).await.unwrap();
        assert_eq!(report, simulate_report(&req).unwrap());
        assert_eq!(adapter.name(), "simulated");
    }
}
