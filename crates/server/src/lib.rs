//! LEAN backtest service: HTTP surface and configuration
//!
//! The `lean-service` binary wires these together with the engine's job ledger.

pub mod config;
pub mod error;
pub mod routes;

pub use config::{cleanup_cutoff, AdapterKind, ServiceConfig};
pub use error::{AppError, AppResult};
pub use routes::{router, AppState};

pub const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));
