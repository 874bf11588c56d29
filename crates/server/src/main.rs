//! LEAN Service: asynchronous backtest job service
//!
//! Usage:
//!   lean-service serve --port 8000                  — Launch the HTTP service
//!   lean-service run --strategy strategy.py         — Run one backtest from CLI
//!   lean-service cleanup --older-than-days 30       — Prune the job archive

use chrono::Utc;
use clap::{Parser, Subcommand};
use engine::{JobLedger, JobState, SubmitBacktest};
use lean_service::{cleanup_cutoff, router, ServiceConfig, APP_VERSION};
use persistence::repository::JobRepository;
use rust_decimal::Decimal;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "lean-service")]
#[command(about = "Asynchronous backtest job service for the LEAN engine", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the backtest web service
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 8000)]
        port: u16,
    },
    /// Run a single backtest from CLI (no web server)
    Run {
        /// Strategy source file
        #[arg(long)]
        strategy: PathBuf,
        /// Job id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// First day of the backtest window (YYYY-MM-DD)
        #[arg(long, default_value = "2020-01-01")]
        start_date: String,
        /// Last day of the backtest window (YYYY-MM-DD)
        #[arg(long, default_value = "2021-01-01")]
        end_date: String,
        /// Starting cash
        #[arg(long, default_value = "100000")]
        capital: Decimal,
    },
    /// Cleanup DB: delete finished jobs older than N days, then VACUUM
    Cleanup {
        /// Age in days after which finished jobs are deleted
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "debug,engine=debug,persistence=debug,lean_service=debug,tower_http=debug"
    } else {
        "info,engine=info,lean_service=info,sqlx=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
        Commands::Run {
            strategy,
            id,
            start_date,
            end_date,
            capital,
        } => {
            cmd_run(strategy, id, start_date, end_date, capital).await?;
        }
        Commands::Cleanup { older_than_days } => {
            cmd_cleanup(older_than_days).await?;
        }
    }

    Ok(())
}

/// Build the ledger described by the environment, restoring archived jobs
async fn build_ledger(config: &ServiceConfig) -> anyhow::Result<Arc<JobLedger>> {
    let mut ledger = JobLedger::new(config.build_adapter()?);

    if let Some(limit) = config.job_timeout {
        ledger = ledger.with_job_timeout(limit);
    }
    if let Some(max_age) = config.retention {
        ledger = ledger.with_retention(max_age);
    }

    if let Some(db_path) = &config.db_path {
        let db = persistence::Database::new(db_path).await.map_err(|e| {
            error!("Failed to initialize database: {}", e);
            anyhow::anyhow!("Database initialization failed: {}", e)
        })?;
        info!("Database initialized: {}", db_path);
        ledger = ledger.with_store(db.pool_clone());
    }

    let ledger = Arc::new(ledger);
    ledger
        .restore()
        .await
        .map_err(|e| anyhow::anyhow!("Restoring archived backtests failed: {}", e))?;
    Ok(ledger)
}

// ============================================================================
// Serve command — Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("LEAN Service v{} starting...", APP_VERSION);

    let config = ServiceConfig::from_env()?;
    let ledger = build_ledger(&config).await?;

    if let Some(retention) = config.retention {
        spawn_retention_sweep(Arc::clone(&ledger), retention)?;
    }

    let app = router(Arc::clone(&ledger));

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== LEAN Service v{} ===", APP_VERSION);
    println!("Backtest Job Server");
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /health             - Health check");
    println!("  POST /backtest           - Submit a backtest");
    println!("  GET  /backtest           - List backtests");
    println!("  GET  /backtest/{{id}}      - Poll a backtest");
    println!("\n  Adapter: {}", ledger.adapter_name());
    println!(
        "  Database: {}",
        config.db_path.as_deref().unwrap_or("(memory only)")
    );
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ledger.shutdown().await;
    info!("All backtests settled, exiting");
    Ok(())
}

/// Periodically drop finished jobs older than `max_age` from memory
fn spawn_retention_sweep(ledger: Arc<JobLedger>, max_age: chrono::TimeDelta) -> anyhow::Result<()> {
    let period = max_age
        .to_std()?
        .clamp(Duration::from_secs(1), Duration::from_secs(60));
    info!(retention_secs = max_age.num_seconds(), "Retention sweep enabled");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let pruned = ledger.prune_finished(max_age);
            if pruned > 0 {
                info!(pruned, "Dropped expired backtests");
            }
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl+C received, finishing in-flight backtests..."),
        () = terminate => info!("SIGTERM received, finishing in-flight backtests..."),
    }
}

// ============================================================================
// Run command — CLI mode (no web server)
// ============================================================================

async fn cmd_run(
    strategy: PathBuf,
    id: Option<String>,
    start_date: String,
    end_date: String,
    capital: Decimal,
) -> anyhow::Result<()> {
    println!("\n=== LEAN Service v{} ===", APP_VERSION);

    let strategy_code = std::fs::read_to_string(&strategy)
        .map_err(|e| anyhow::anyhow!("Cannot read strategy {}: {}", strategy.display(), e))?;
    let id = id.unwrap_or_else(|| format!("cli-{}", Utc::now().timestamp_millis()));

    let config = ServiceConfig::from_env()?;
    let ledger = build_ledger(&config).await?;

    println!("Strategy: {} | Id: {}", strategy.display(), id);
    println!(
        "Window: {} .. {} | Capital: {} | Adapter: {}",
        start_date,
        end_date,
        capital,
        ledger.adapter_name()
    );
    println!();

    ledger.submit(SubmitBacktest {
        id: id.clone(),
        strategy_code,
        start_date,
        end_date,
        initial_capital: capital,
    })?;

    // Progress display loop
    let started = Instant::now();
    let job = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let job = ledger.get(&id)?;
        if job.is_terminal() {
            println!(
                "\r  Finished in {:.1}s                              ",
                started.elapsed().as_secs_f64()
            );
            break job;
        }
        print!("\r  Running... {:.0}s elapsed   ", started.elapsed().as_secs_f64());
        std::io::stdout().flush().ok();
    };

    ledger.shutdown().await;

    match job.state() {
        JobState::Completed(report) => {
            println!("\nResults:");
            println!("  {:<24} {:>16}", "Total return", report.total_return);
            println!("  {:<24} {:>16}", "Sharpe ratio", report.sharpe_ratio);
            println!("  {:<24} {:>16}", "Max drawdown", report.max_drawdown);
            println!("  {:<24} {:>16}", "Win rate", report.win_rate);
            println!("  {:<24} {:>16}", "Total trades", report.total_trades);
            println!("  {:<24} {:>16.2}", "Final portfolio value", report.final_portfolio_value);
            println!("  {:<24} {:>+16.2}", "Profit / loss", report.profit_loss);
            Ok(())
        }
        JobState::Failed(reason) => Err(anyhow::anyhow!("Backtest {} failed: {}", id, reason)),
        JobState::Running => Err(anyhow::anyhow!("Backtest {} is still running", id)),
    }
}

// ============================================================================
// Cleanup command — delete old finished jobs from the archive
// ============================================================================

async fn cmd_cleanup(older_than_days: u32) -> anyhow::Result<()> {
    info!("LEAN Service DB cleanup: deleting finished jobs older than {} days", older_than_days);

    let config = ServiceConfig::from_env()?;
    let db_path = config
        .db_path
        .ok_or_else(|| anyhow::anyhow!("LEAN_SERVICE_DB_PATH is not set; nothing to clean up"))?;
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database opened: {}", db_path);

    let cutoff = cleanup_cutoff(Utc::now(), older_than_days)?;
    let repo = JobRepository::new(db.pool());
    let deleted = repo
        .delete_finished_before(cutoff.timestamp_millis())
        .await
        .map_err(|e| anyhow::anyhow!("Cleanup failed: {}", e))?;

    info!("Running VACUUM to reclaim disk space...");
    repo.vacuum()
        .await
        .map_err(|e| anyhow::anyhow!("VACUUM failed: {}", e))?;

    let remaining = repo
        .count_by_status()
        .await
        .map_err(|e| anyhow::anyhow!("Counting jobs failed: {}", e))?;
    info!(
        "Done! Deleted {} jobs; remaining: {} running, {} completed, {} failed.",
        deleted, remaining.running, remaining.completed, remaining.failed
    );
    Ok(())
}
