//! LEAN command-line adapter
//!
//! Lays out a per-job project under `<workspace>/strategies/<id>`, runs
//! `lean backtest <project> --output <workspace>/results/<id>` and reads the
//! `TotalPerformance` section of `backtest-results.json`.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::process::Command;
use tracing::{debug, info};

use super::ExecutionAdapter;
use crate::error::ExecutionError;
use crate::types::{BacktestRequest, PerformanceReport};

pub const RESULTS_FILE: &str = "backtest-results.json";
const STRATEGY_FILE: &str = "main.py";
const STDERR_TAIL_BYTES: usize = 2000;

/// Runs the LEAN CLI as a child process, one project directory per job
#[derive(Debug, Clone)]
pub struct LeanCliAdapter {
    binary: PathBuf,
    workspace: PathBuf,
}

impl LeanCliAdapter {
    pub fn new(binary: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            workspace: workspace.into(),
        }
    }

    pub fn project_dir(&self, id: &str) -> PathBuf {
        self.workspace.join("strategies").join(id)
    }

    pub fn results_dir(&self, id: &str) -> PathBuf {
        self.workspace.join("results").join(id)
    }

    async fn write_project(&self, request: &BacktestRequest, dir: &Path) -> Result<(), ExecutionError> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(STRATEGY_FILE), &request.strategy_code).await?;

        let config = serde_json::json!({
            "algorithm-language": "Python",
            "parameters": {
                "start-date": request.start_date.to_string(),
                "end-date": request.end_date.to_string(),
                "cash": request.initial_capital.to_string(),
            },
        });
        tokio::fs::write(dir.join("config.json"), serde_json::to_vec_pretty(&config)?).await?;
        Ok(())
    }
}

/// Ids become directory names, so only plain path components are allowed
fn ensure_plain_component(id: &str) -> Result<(), ExecutionError> {
    let plain = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(ExecutionError::InvalidJobId(id.to_string()))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[async_trait]
impl ExecutionAdapter for LeanCliAdapter {
    fn name(&self) -> &'static str {
        "lean"
    }

    async fn run(&self, request: &BacktestRequest) -> Result<PerformanceReport, ExecutionError> {
        ensure_plain_component(&request.id)?;

        let project_dir = self.project_dir(&request.id);
        let results_dir = self.results_dir(&request.id);
        self.write_project(request, &project_dir).await?;
        tokio::fs::create_dir_all(&results_dir).await?;

        info!(
            job_id = %request.id,
            binary = %self.binary.display(),
            project = %project_dir.display(),
            "Launching LEAN backtest"
        );

        let output = Command::new(&self.binary)
            .arg("backtest")
            .arg(&project_dir)
            .arg("--output")
            .arg(&results_dir)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(ExecutionError::EngineExited {
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let path = results_dir.join(RESULTS_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecutionError::MissingResults(path));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(job_id = %request.id, bytes = raw.len(), "Parsing LEAN results");
        parse_lean_results(&raw)
    }
}

/// Map LEAN's `TotalPerformance` block into a report. Absent metrics count as zero.
pub fn parse_lean_results(raw: &[u8]) -> Result<PerformanceReport, ExecutionError> {
    let root: Value = serde_json::from_slice(raw)
        .map_err(|e| ExecutionError::MalformedResults(format!("invalid JSON: {e}")))?;
    let perf = root
        .get("TotalPerformance")
        .and_then(Value::as_object)
        .ok_or_else(|| ExecutionError::MalformedResults("missing TotalPerformance".to_string()))?;

    let metric = |key: &str| -> Result<Decimal, ExecutionError> {
        match perf.get(key) {
            None | Some(Value::Null) => Ok(Decimal::ZERO),
            Some(value) => decimal_from_value(value).ok_or_else(|| {
                ExecutionError::MalformedResults(format!("{key} is not a number: {value}"))
            }),
        }
    };

    let total_trades = match perf.get("TotalTrades") {
        None | Some(Value::Null) => 0,
        Some(value) => decimal_from_value(value)
            .filter(|d| d.fract().is_zero())
            .and_then(|d| d.to_u32())
            .ok_or_else(|| {
                ExecutionError::MalformedResults(format!("TotalTrades is not a count: {value}"))
            })?,
    };

    Ok(PerformanceReport {
        total_return: metric("TotalReturn")?,
        sharpe_ratio: metric("SharpeRatio")?,
        max_drawdown: metric("Drawdown")?,
        win_rate: metric("WinRate")?,
        final_portfolio_value: metric("PortfolioValue")?,
        total_trades,
        profit_loss: metric("TotalProfit")?,
    })
}

/// Numbers are taken as-is; strings may carry `$`, thousands separators or a `%` suffix.
fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(|f| Decimal::try_from(f).ok())
            }
        }
        Value::String(s) => {
            let s = s.trim();
            let (body, percent) = match s.strip_suffix('%') {
                Some(body) => (body, true),
                None => (s, false),
            };
            let cleaned: String = body.chars().filter(|c| *c != '$' && *c != ',').collect();
            let parsed = Decimal::from_str(cleaned.trim()).ok()?;
            Some(if percent {
                parsed / Decimal::ONE_HUNDRED
            } else {
                parsed
            })
        }
        _ => None,
    }
}
